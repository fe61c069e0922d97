use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::inference::processor::ModelInputs;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ModelBase {
    /// The name of the model
    pub name: String,

    /// The tasks the model is served for
    pub tasks: Vec<VideoTask>,

    /// The id of the model repository
    pub repo_id: String,

    /// The revision of the model repository
    pub repo_revision: String,
}

impl ModelBase {
    pub fn from_repo(repo_id: &str, repo_revision: &str) -> Self {
        let name = repo_id.rsplit('/').next().unwrap_or(repo_id).to_string();
        Self {
            name,
            tasks: vec![VideoTask::Describe, VideoTask::Answer],
            repo_id: repo_id.to_string(),
            repo_revision: repo_revision.to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VideoTask {
    Describe,
    Answer,
}

/// A generative model over text and video tokens.
///
/// Implementations keep no per-request state: every call to [`generate`](Self::generate)
/// allocates its own cache and sampler, so a loaded model can be shared between threads.
pub trait VisionLanguageModel: Send + Sync {
    fn device(&self) -> &Device;

    /// Returns the prompt ids followed by at most `max_new_tokens` generated ids.
    fn generate(&self, inputs: &ModelInputs, max_new_tokens: usize) -> Result<Vec<u32>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_model_after_repository() {
        let base = ModelBase::from_repo("allenai/SAGE-MM-Qwen3-VL-4B-SFT_RL", "main");
        assert_eq!(base.name, "SAGE-MM-Qwen3-VL-4B-SFT_RL");
        assert_eq!(
            serde_json::to_value(&base.tasks).unwrap(),
            serde_json::json!(["describe", "answer"])
        );
    }
}
