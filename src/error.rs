use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tokio::task::JoinError;

/// A failed request: the status plus the `{"error": ...}` body shown to the page or API client.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: HttpErrorResponse,
}

#[derive(Debug, Serialize)]
pub struct HttpErrorResponse {
    error: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        AppError {
            status,
            message: HttpErrorResponse {
                error: message.into(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("Request failed: {}", self.message.error);
        }
        let mut res = Json(self.message).into_response();
        *res.status_mut() = self.status;
        res
    }
}

/// Broken or oversized upload bodies keep the status axum assigns them. A video worker that
/// panicked or was cancelled is reported without its internals. Anything else, including
/// processor and model failures, is a 500 carrying the whole error chain.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let err = err.into();
        if let Some(multipart) = err.downcast_ref::<MultipartError>() {
            return AppError::new(multipart.status(), multipart.body_text());
        }
        if let Some(join) = err.downcast_ref::<JoinError>() {
            tracing::error!("Video worker failed: {join}");
            let message = if join.is_panic() {
                "The video worker panicked"
            } else {
                "The video worker was cancelled"
            };
            return AppError::new(StatusCode::INTERNAL_SERVER_ERROR, message);
        }
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

pub type AppResult<T, E = AppError> = Result<T, E>;

#[macro_export]
macro_rules! bail_app {
    ($status:expr, $fmt:expr $(, $arg:expr)* $(,)?) => {
        return Err($crate::error::AppError::new($status, format!($fmt $(, $arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;
    use crate::inference::processor::ProcessorError;

    fn fail(status: StatusCode) -> AppResult<()> {
        bail_app!(status, "Unknown example {}", "6.mp4");
    }

    #[tokio::test]
    async fn renders_status_and_json_body() {
        let response = fail(StatusCode::NOT_FOUND).unwrap_err().into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&body).unwrap(),
            serde_json::json!({"error": "Unknown example 6.mp4"})
        );
    }

    #[test]
    fn processor_errors_keep_their_context() {
        let err = Err::<(), _>(ProcessorError::EmptyVideo)
            .context("Failed to build model inputs")
            .unwrap_err();
        let err = AppError::from(err);
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.message.error.starts_with("Failed to build model inputs: "));
    }

    #[tokio::test]
    async fn panicked_worker_hides_the_panic() {
        let join = tokio::task::spawn_blocking(|| panic!("index out of bounds in the vision tower"))
            .await
            .unwrap_err();
        let err = AppError::from(join);
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message.error, "The video worker panicked");
    }
}
