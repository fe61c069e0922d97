use std::io::Write;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::bail_app;
use crate::error::AppResult;
use crate::inference::handler::{VideoHandler, DEFAULT_PROMPT};
use crate::inference::models::model::ModelBase;
use crate::ui::{is_example, EXAMPLES_ROUTE, MAX_NEW_TOKENS};

/// Rejects a token budget the slider cannot produce.
macro_rules! bail_budget {
    ($value:expr) => {
        bail_app!(
            StatusCode::BAD_REQUEST,
            "max_new_tokens must be between {} and {} in steps of {}, got {}",
            MAX_NEW_TOKENS.minimum,
            MAX_NEW_TOKENS.maximum,
            MAX_NEW_TOKENS.step,
            $value
        )
    };
}

/// Uploads sent to `/api/analyze` are deleted when the request ends, so API clients can only
/// name examples or files the operator placed in the upload directory.
const VIDEO_PATH_DESCRIPTION: &str = "Empty, an example such as example-videos/1.mp4, or a file \
     placed in the server's upload directory";

const VALID_VIDEO_MIME_TYPES: [&str; 2] = ["video/mp4", "application/octet-stream"];

#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<VideoHandler>,
    pub model: Arc<ModelBase>,
    /// The rendered UI page.
    pub page: Arc<String>,
    pub examples_dir: PathBuf,
    pub upload_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub output: String,
}

/// Positional arguments `(prompt_text, video_path, max_new_tokens)`.
#[derive(Debug, Deserialize)]
pub struct ProcessVideoRequest {
    pub data: (String, Option<String>, f64),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessVideoResponse {
    pub data: [String; 1],
}

pub fn router(state: AppState, max_upload_size: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/analyze", post(analyze))
        .route("/api/process_video", post(process_video))
        .route("/api/info", get(api_info))
        .route(&format!("/{EXAMPLES_ROUTE}/:name"), get(example_video))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_size))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> Html<String> {
    Html(state.page.as_ref().clone())
}

async fn health() -> &'static str {
    "OK"
}

#[axum_macros::debug_handler]
async fn analyze(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<AnalyzeResponse>> {
    let mut prompt = String::new();
    let mut max_new_tokens = MAX_NEW_TOKENS.value;
    let mut upload = None;
    let mut example = None;

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match name.as_str() {
            "prompt" => prompt = field.text().await?,
            "max_new_tokens" => {
                let value = field.text().await?;
                max_new_tokens = match value.trim().parse::<usize>() {
                    Ok(tokens) if MAX_NEW_TOKENS.accepts(tokens as f64) => tokens,
                    _ => bail_budget!(value),
                };
            }
            "video" => {
                if field
                    .content_type()
                    .map_or(false, |content| !VALID_VIDEO_MIME_TYPES.contains(&content))
                {
                    bail_app!(
                        StatusCode::BAD_REQUEST,
                        "Invalid mime type in content-type header for video field"
                    );
                }
                let bytes = field.bytes().await?;
                if !bytes.is_empty() {
                    upload = Some(store_upload(state.upload_dir.clone(), bytes).await?);
                }
            }
            "example" => {
                let value = field.text().await?;
                if !value.is_empty() {
                    if !is_example(&value) {
                        bail_app!(StatusCode::NOT_FOUND, "Unknown example {}", value);
                    }
                    example = Some(state.examples_dir.join(value));
                }
            }
            _ => bail_app!(StatusCode::BAD_REQUEST, "Unknown field {}", name),
        }
    }

    let video = match (&upload, &example) {
        (Some(file), _) => file.path().to_string_lossy().into_owned(),
        (None, Some(path)) => path.to_string_lossy().into_owned(),
        (None, None) => String::new(),
    };
    let output = run_handler(state.handler.clone(), prompt, video, max_new_tokens).await?;
    // the upload is removed once `upload` drops
    drop(upload);
    Ok(Json(AnalyzeResponse { output }))
}

#[axum_macros::debug_handler]
async fn process_video(
    State(state): State<AppState>,
    Json(req): Json<ProcessVideoRequest>,
) -> AppResult<Json<ProcessVideoResponse>> {
    let (prompt, video_path, max_new_tokens) = req.data;
    if !MAX_NEW_TOKENS.accepts(max_new_tokens) {
        bail_budget!(max_new_tokens);
    }
    let video = resolve_video_path(&state, video_path.as_deref().unwrap_or_default()).await?;
    let output = run_handler(state.handler.clone(), prompt, video, max_new_tokens as usize).await?;
    Ok(Json(ProcessVideoResponse { data: [output] }))
}

async fn api_info(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "model": state.model.as_ref(),
        "endpoints": {
            "/api/process_video": {
                "parameters": [
                    {"name": "user_text", "type": "string", "default": DEFAULT_PROMPT},
                    {
                        "name": "video_path",
                        "type": "string",
                        "default": null,
                        "description": VIDEO_PATH_DESCRIPTION,
                    },
                    {
                        "name": "max_new_tokens",
                        "type": "number",
                        "minimum": MAX_NEW_TOKENS.minimum,
                        "maximum": MAX_NEW_TOKENS.maximum,
                        "step": MAX_NEW_TOKENS.step,
                        "default": MAX_NEW_TOKENS.value,
                    },
                ],
                "returns": [{"name": "output", "type": "string"}],
            }
        }
    }))
}

async fn example_video(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<impl IntoResponse> {
    if !is_example(&name) {
        bail_app!(StatusCode::NOT_FOUND, "Unknown example {}", name);
    }
    let bytes = match tokio::fs::read(state.examples_dir.join(&name)).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            bail_app!(StatusCode::NOT_FOUND, "Example {} is missing", name)
        }
        Err(err) => return Err(err.into()),
    };
    Ok(([(header::CONTENT_TYPE, "video/mp4")], bytes))
}

/// Maps a client supplied video path to a local file. Only example assets and files inside
/// the upload directory may be read; the latter only exist there if the operator put them
/// there, e.g. through a shared volume.
async fn resolve_video_path(state: &AppState, path: &str) -> AppResult<String> {
    if path.is_empty() {
        return Ok(String::new());
    }
    let example = path
        .trim_start_matches('/')
        .strip_prefix(EXAMPLES_ROUTE)
        .and_then(|rest| rest.strip_prefix('/'));
    if let Some(name) = example {
        if !is_example(name) {
            bail_app!(StatusCode::NOT_FOUND, "Unknown example {}", name);
        }
        return Ok(state.examples_dir.join(name).to_string_lossy().into_owned());
    }

    let Ok(video) = tokio::fs::canonicalize(path).await else {
        bail_app!(StatusCode::NOT_FOUND, "Video {} not found", path);
    };
    if !is_within(&video, &state.upload_dir).await {
        bail_app!(
            StatusCode::FORBIDDEN,
            "Video {} is outside the upload directory",
            path
        );
    }
    Ok(video.to_string_lossy().into_owned())
}

async fn is_within(path: &FsPath, dir: &FsPath) -> bool {
    match tokio::fs::canonicalize(dir).await {
        Ok(dir) => path.starts_with(dir),
        Err(_) => false,
    }
}

async fn store_upload(dir: PathBuf, bytes: Bytes) -> Result<NamedTempFile> {
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dir)?;
        let mut file = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(".mp4")
            .tempfile_in(&dir)?;
        file.write_all(&bytes)?;
        file.flush()?;
        debug!("Stored {} byte upload at {:?}", bytes.len(), file.path());
        Ok::<_, anyhow::Error>(file)
    })
    .await?
}

/// Runs the blocking handler off the async runtime.
async fn run_handler(
    handler: Arc<VideoHandler>,
    prompt: String,
    video: String,
    max_new_tokens: usize,
) -> Result<String> {
    info!("Analyzing video {video:?} with up to {max_new_tokens} new tokens");
    let start = Instant::now();
    let output =
        tokio::task::spawn_blocking(move || handler.process_video(&prompt, &video, max_new_tokens))
            .await?;
    // picked up by the metrics layer when telemetry is exported
    info!(
        monotonic_counter.videos_analyzed = 1_u64,
        histogram.analysis_seconds = start.elapsed().as_secs_f64(),
        succeeded = output.is_ok(),
        "Analysis finished"
    );
    output
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::inference::handler::tests::{handler, ExtractorBehavior, MockModel};
    use crate::theme::Theme;
    use crate::ui::render_page;

    const BOUNDARY: &str = "video-reasoner-boundary";

    struct TestApp {
        router: Router,
        model: Arc<MockModel>,
        examples: TempDir,
        uploads: TempDir,
    }

    fn app() -> TestApp {
        let (handler, _, model) = handler(ExtractorBehavior::Frames);
        let examples = TempDir::new().unwrap();
        let uploads = TempDir::new().unwrap();
        let base = ModelBase::from_repo("allenai/SAGE-MM-Qwen3-VL-4B-SFT_RL", "main");
        let page = render_page(&Theme::orange_red(), &base).unwrap();
        let state = AppState {
            handler: Arc::new(handler),
            model: Arc::new(base),
            page: Arc::new(page),
            examples_dir: examples.path().to_path_buf(),
            upload_dir: uploads.path().to_path_buf(),
        };
        TestApp {
            router: router(state, 1024 * 1024),
            model,
            examples,
            uploads,
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        router.clone().oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn process_video_request(body: Value) -> Request<Body> {
        Request::post("/api/process_video")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    /// Builds a multipart body from `(name, filename, content)` parts.
    fn multipart_request(parts: &[(&str, Option<&str>, &[u8])]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, filename, content) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: video/mp4\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Request::post("/api/analyze")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = app();
        let response = send(&app.router, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn serves_the_page() {
        let app = app();
        let response = send(&app.router, Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let page = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(page.contains("Analyze Video"));
    }

    #[tokio::test]
    async fn empty_video_path_asks_for_upload() {
        let app = app();
        let response = send(
            &app.router,
            process_video_request(json!({"data": ["What happens?", "", 1024]})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({"data": ["Please upload a video."]})
        );
        assert_eq!(app.model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn null_video_path_counts_as_empty() {
        let app = app();
        let response = send(
            &app.router,
            process_video_request(json!({"data": ["", null, 128]})),
        )
        .await;
        assert_eq!(
            json_body(response).await,
            json!({"data": ["Please upload a video."]})
        );
    }

    #[tokio::test]
    async fn answers_about_an_example() {
        let app = app();
        let response = send(
            &app.router,
            process_video_request(json!({"data": ["What happens?", "example-videos/2.mp4", 4096]})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({"data": ["100 101 102 103"]})
        );
        assert_eq!(*app.model.budgets.lock().unwrap(), vec![4096]);
    }

    #[tokio::test]
    async fn rejects_unreachable_token_budgets() {
        let app = app();
        for tokens in [json!(100), json!(5000), json!(200), json!(256.5)] {
            let response = send(
                &app.router,
                process_video_request(json!({"data": ["", "example-videos/1.mp4", tokens]})),
            )
            .await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
        assert_eq!(app.model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn restricts_video_paths() {
        let app = app();
        let outside = NamedTempFile::new().unwrap();
        let response = send(
            &app.router,
            process_video_request(json!({"data": ["", outside.path(), 1024]})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = send(
            &app.router,
            process_video_request(json!({"data": ["", "/does/not/exist.mp4", 1024]})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(
            &app.router,
            process_video_request(json!({"data": ["", "example-videos/6.mp4", 1024]})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(app.model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn accepts_videos_in_the_upload_dir() {
        let app = app();
        let inside = app.uploads.path().join("clip.mp4");
        std::fs::write(&inside, b"not really a video").unwrap();
        let response = send(
            &app.router,
            process_video_request(json!({"data": ["", inside, 1024]})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(app.model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn describes_the_endpoint() {
        let app = app();
        let response = send(&app.router, Request::get("/api/info").body(Body::empty()).unwrap()).await;
        let info = json_body(response).await;
        let params = &info["endpoints"]["/api/process_video"]["parameters"];
        assert_eq!(params[0]["name"], "user_text");
        assert_eq!(params[1]["name"], "video_path");
        assert!(params[1]["description"]
            .as_str()
            .unwrap()
            .contains("example-videos/1.mp4"));
        assert_eq!(params[2]["minimum"], 128);
        assert_eq!(params[2]["maximum"], 4096);
        assert_eq!(params[2]["step"], 128);
        assert_eq!(params[2]["default"], 1024);
        assert_eq!(info["model"]["repo_id"], "allenai/SAGE-MM-Qwen3-VL-4B-SFT_RL");
    }

    #[tokio::test]
    async fn serves_only_known_examples() {
        let app = app();
        std::fs::write(app.examples.path().join("1.mp4"), b"mp4 bytes").unwrap();

        let response = send(
            &app.router,
            Request::get("/example-videos/1.mp4").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"mp4 bytes");

        for uri in ["/example-videos/2.mp4", "/example-videos/6.mp4"] {
            let response = send(&app.router, Request::get(uri).body(Body::empty()).unwrap()).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn analyzes_an_upload_and_removes_it() {
        let app = app();
        let response = send(
            &app.router,
            multipart_request(&[
                ("prompt", None, b"What is the dog doing?"),
                ("max_new_tokens", None, b"128"),
                ("video", Some("clip.mp4"), b"fake mp4"),
            ]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"output": "100 101 102 103"}));
        assert_eq!(*app.model.budgets.lock().unwrap(), vec![128]);
        assert_eq!(std::fs::read_dir(app.uploads.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn analyze_without_video_asks_for_upload() {
        let app = app();
        let response = send(&app.router, multipart_request(&[("prompt", None, b"Hi")])).await;
        assert_eq!(
            json_body(response).await,
            json!({"output": "Please upload a video."})
        );
    }

    #[tokio::test]
    async fn analyze_rejects_bad_fields() {
        let app = app();
        let response = send(&app.router, multipart_request(&[("audio", None, b"x")])).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = send(&app.router, multipart_request(&[("example", None, b"9.mp4")])).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(
            &app.router,
            multipart_request(&[("max_new_tokens", None, b"lots")]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn analyze_rejects_truncated_forms() {
        let app = app();
        let request = Request::post("/api/analyze")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"prompt\"\r\n\r\nno end"
            )))
            .unwrap();
        let response = send(&app.router, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].is_string());
        assert_eq!(app.model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn analyze_rejects_unreachable_token_budgets() {
        let app = app();
        for tokens in ["100000", "0", "200", "-128"] {
            let response = send(
                &app.router,
                multipart_request(&[
                    ("max_new_tokens", None, tokens.as_bytes()),
                    ("video", Some("clip.mp4"), b"fake mp4"),
                ]),
            )
            .await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
        assert_eq!(app.model.calls.load(Ordering::SeqCst), 0);
        assert!(app.model.budgets.lock().unwrap().is_empty());
    }
}
