use anyhow::Result;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use hf_hub::api::sync::ApiRepo;
use rand::random;
use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Many(Vec<u32>),
}

/// Decoding settings shipped with a checkpoint as `generation_config.json`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub seed: Option<u64>,
    pub do_sample: bool,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    #[serde(rename = "repetition_penalty")]
    pub repeat_penalty: f32,
    pub repeat_context_size: usize,
    pub eos_token_id: Option<TokenIds>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            seed: None,
            do_sample: false,
            temperature: Some(1.0),
            top_p: None,
            top_k: None,
            repeat_penalty: 1.0,
            repeat_context_size: 64,
            eos_token_id: None,
        }
    }
}

impl GenerationConfig {
    /// Reads the checkpoint's generation config, or the defaults when it ships none.
    #[tracing::instrument(level = "info", skip(repo))]
    pub fn load(repo: &ApiRepo) -> Result<Self> {
        match repo.get("generation_config.json") {
            Ok(path) => Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?),
            Err(err) => {
                debug!("No generation config found, using defaults: {err}");
                Ok(Self::default())
            }
        }
    }

    pub fn eos_token_ids(&self) -> Vec<u32> {
        match &self.eos_token_id {
            Some(TokenIds::Single(id)) => vec![*id],
            Some(TokenIds::Many(ids)) => ids.clone(),
            None => Vec::new(),
        }
    }

    pub fn sampling(&self) -> Sampling {
        let temperature = match self.temperature {
            Some(temperature) if self.do_sample && temperature > 0.0 => temperature,
            _ => return Sampling::ArgMax,
        };
        // zero top_k and unit top_p both mean "no filtering"
        let top_k = self.top_k.filter(|&k| k > 0);
        let top_p = self.top_p.filter(|&p| p > 0.0 && p < 1.0);
        match (top_k, top_p) {
            (None, None) => Sampling::All { temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        }
    }

    pub fn logits_processor(&self) -> LogitsProcessor {
        LogitsProcessor::from_sampling(self.seed.unwrap_or_else(random), self.sampling())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_checkpoint_generation_config() {
        let config: GenerationConfig = serde_json::from_str(
            r#"{
                "bos_token_id": 151643,
                "pad_token_id": 151643,
                "do_sample": true,
                "eos_token_id": [151645, 151643],
                "top_k": 20,
                "top_p": 0.8,
                "repetition_penalty": 1.0,
                "temperature": 0.7
            }"#,
        )
        .unwrap();
        assert_eq!(config.eos_token_ids(), vec![151645, 151643]);
        assert_eq!(config.repeat_context_size, 64);
        assert!(matches!(
            config.sampling(),
            Sampling::TopKThenTopP { k: 20, .. }
        ));
    }

    #[test]
    fn single_eos_token_id() {
        let config: GenerationConfig = serde_json::from_str(r#"{"eos_token_id": 2}"#).unwrap();
        assert_eq!(config.eos_token_ids(), vec![2]);
    }

    #[test]
    fn greedy_without_sampling() {
        let config = GenerationConfig {
            temperature: Some(0.7),
            top_k: Some(20),
            ..GenerationConfig::default()
        };
        assert!(matches!(config.sampling(), Sampling::ArgMax));

        let config = GenerationConfig {
            do_sample: true,
            temperature: Some(0.0),
            ..GenerationConfig::default()
        };
        assert!(matches!(config.sampling(), Sampling::ArgMax));
    }

    #[test]
    fn disabled_filters_are_ignored() {
        let config = GenerationConfig {
            do_sample: true,
            top_k: Some(0),
            top_p: Some(1.0),
            ..GenerationConfig::default()
        };
        assert!(matches!(config.sampling(), Sampling::All { .. }));
    }
}
