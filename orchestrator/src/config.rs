// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{OrchestratorError, Result};

/// Serving backend an engine replica runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Vllm,
    Sglang,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Vllm => "vllm",
            Backend::Sglang => "sglang",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "vllm" => Ok(Backend::Vllm),
            "sglang" => Ok(Backend::Sglang),
            _ => Err(OrchestratorError::UnsupportedBackend(s.to_string())),
        }
    }
}

pub fn parse_backend(s: &str) -> std::result::Result<Backend, String> {
    s.parse::<Backend>().map_err(|e| e.to_string())
}

/// Backend-agnostic generation controls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub logprobs: Option<u32>,
}

fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f32 {
    1.0
}
fn default_top_p() -> f32 {
    1.0
}
fn default_top_k() -> i32 {
    -1
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            stop: vec![],
            logprobs: None,
        }
    }
}

impl SamplingParams {
    /// Translate into the request fields the given backend understands.
    pub fn for_backend(&self, backend: Backend) -> Value {
        let mut params = Map::new();
        params.insert("temperature".into(), json!(self.temperature));
        params.insert("top_p".into(), json!(self.top_p));
        params.insert("top_k".into(), json!(self.top_k));
        if !self.stop.is_empty() {
            params.insert("stop".into(), json!(self.stop));
        }
        match backend {
            Backend::Vllm => {
                params.insert("max_tokens".into(), json!(self.max_tokens));
                if let Some(logprobs) = self.logprobs {
                    params.insert("logprobs".into(), json!(logprobs));
                }
            }
            Backend::Sglang => {
                params.insert("max_new_tokens".into(), json!(self.max_tokens));
                // sglang reports logprobs through a top level flag, not a count
                if self.logprobs.is_some() {
                    params.insert("return_logprob".into(), json!(true));
                }
            }
        }
        Value::Object(params)
    }
}

/// Inference engine pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub num_inference_engines: usize,
    #[serde(default = "default_one")]
    pub tensor_parallel_size: usize,
    #[serde(default = "default_dtype")]
    pub model_dtype: String,
    pub model_path: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub disable_multiproc: bool,
    #[serde(default = "default_true")]
    pub enable_prefix_caching: bool,
    #[serde(default = "default_true")]
    pub enforce_eager: bool,
    #[serde(default = "default_max_model_len")]
    pub max_model_len: u32,
    #[serde(default)]
    pub gpu_memory_utilization: Option<f32>,
    #[serde(default)]
    pub enable_sleep: bool,
    #[serde(default)]
    pub async_engine: bool,
    #[serde(default = "default_max_num_batched_tokens")]
    pub max_num_batched_tokens: u32,
    #[serde(default = "default_max_num_seqs")]
    pub max_num_seqs: u32,
    #[serde(default)]
    pub sampling_params: SamplingParams,
    #[serde(default)]
    pub tokenizer: Option<String>,
    #[serde(default = "default_backend")]
    pub backend: Backend,
    /// Share the training placement group and time-share GPUs via sleep/wake
    #[serde(default)]
    pub colocate_all: bool,
    /// Engines that may be admitted onto one colocated GPU
    #[serde(default = "default_packing_denominator")]
    pub packing_denominator: u32,
    #[serde(default = "default_placement_timeout_secs")]
    pub placement_timeout_secs: u64,
    #[serde(default = "default_weight_sync_timeout_secs")]
    pub weight_sync_timeout_secs: u64,
}

fn default_one() -> usize {
    1
}
fn default_dtype() -> String {
    "bfloat16".to_string()
}
fn default_seed() -> u64 {
    42
}
fn default_true() -> bool {
    true
}
fn default_max_model_len() -> u32 {
    4096
}
fn default_max_num_batched_tokens() -> u32 {
    8192
}
fn default_max_num_seqs() -> u32 {
    1024
}
fn default_backend() -> Backend {
    Backend::Vllm
}
fn default_packing_denominator() -> u32 {
    5
}
fn default_placement_timeout_secs() -> u64 {
    30
}
fn default_weight_sync_timeout_secs() -> u64 {
    60
}

impl EngineConfig {
    pub fn new(model_path: impl Into<String>, num_inference_engines: usize) -> Self {
        Self {
            num_inference_engines,
            tensor_parallel_size: default_one(),
            model_dtype: default_dtype(),
            model_path: model_path.into(),
            seed: default_seed(),
            disable_multiproc: false,
            enable_prefix_caching: true,
            enforce_eager: true,
            max_model_len: default_max_model_len(),
            gpu_memory_utilization: None,
            enable_sleep: false,
            async_engine: false,
            max_num_batched_tokens: default_max_num_batched_tokens(),
            max_num_seqs: default_max_num_seqs(),
            sampling_params: SamplingParams::default(),
            tokenizer: None,
            backend: default_backend(),
            colocate_all: false,
            packing_denominator: default_packing_denominator(),
            placement_timeout_secs: default_placement_timeout_secs(),
            weight_sync_timeout_secs: default_weight_sync_timeout_secs(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let buf = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OrchestratorError::Config(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml(&buf)
    }

    /// Parse and validate a TOML config. An unknown backend is reported as
    /// such rather than as a parse error.
    pub fn from_toml(text: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(text)?;
        if let Some(backend) = table.get("backend").and_then(toml::Value::as_str) {
            backend.parse::<Backend>()?;
        }
        let config: EngineConfig = toml::Value::Table(table).try_into()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_inference_engines == 0 {
            return Err(OrchestratorError::Config(
                "`num_inference_engines` must be > 0".to_string(),
            ));
        }
        if self.tensor_parallel_size == 0 {
            return Err(OrchestratorError::Config(
                "`tensor_parallel_size` must be > 0".to_string(),
            ));
        }
        if self.packing_denominator == 0 {
            return Err(OrchestratorError::Config(
                "`packing_denominator` must be > 0".to_string(),
            ));
        }
        if let Some(utilization) = self.gpu_memory_utilization {
            if !(utilization > 0.0 && utilization <= 1.0) {
                return Err(OrchestratorError::Config(format!(
                    "`gpu_memory_utilization` must be in (0, 1]. Given: {utilization}"
                )));
            }
        }
        if self.async_engine && self.backend == Backend::Sglang {
            return Err(OrchestratorError::Config(
                "`async_engine` selects a vLLM engine flavor, sglang has only one".to_string(),
            ));
        }
        if self.sampling_params.max_tokens > self.max_model_len {
            return Err(OrchestratorError::Config(format!("`sampling_params.max_tokens` must be <= `max_model_len`. Given: {} and {}", self.sampling_params.max_tokens, self.max_model_len)));
        }
        Ok(())
    }

    /// Fraction of one GPU each colocated engine rank is admitted with
    pub fn colocated_gpu_share(&self) -> f64 {
        1.0 / self.packing_denominator as f64
    }

    pub fn placement_timeout(&self) -> Duration {
        Duration::from_secs(self.placement_timeout_secs)
    }

    pub fn weight_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.weight_sync_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend() {
        assert_eq!("vllm".parse::<Backend>().unwrap(), Backend::Vllm);
        assert_eq!("SGLang".parse::<Backend>().unwrap(), Backend::Sglang);
        assert_eq!(
            "trtllm".parse::<Backend>().unwrap_err(),
            OrchestratorError::UnsupportedBackend("trtllm".to_string())
        );
    }

    #[test]
    fn test_load_toml_with_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            num_inference_engines = 2
            tensor_parallel_size = 2
            model_path = "Qwen/Qwen3-0.6B"
            backend = "sglang"
            enable_sleep = true

            [sampling_params]
            max_tokens = 64
            stop = ["</s>"]
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.backend, Backend::Sglang);
        assert_eq!(config.max_num_batched_tokens, 8192);
        assert_eq!(config.max_num_seqs, 1024);
        assert_eq!(config.packing_denominator, 5);
        assert_eq!(config.placement_timeout(), Duration::from_secs(30));
        assert_eq!(config.sampling_params.max_tokens, 64);
        assert_eq!(config.sampling_params.temperature, 1.0);
    }

    #[test]
    fn test_unknown_backend_in_toml() {
        let err = toml::from_str::<EngineConfig>(
            r#"
            num_inference_engines = 1
            model_path = "m"
            backend = "tgi"
            "#,
        );
        assert!(err.is_err());
        assert_eq!(
            EngineConfig::from_toml(
                r#"
                num_inference_engines = 1
                model_path = "m"
                backend = "tgi"
                "#,
            )
            .unwrap_err(),
            OrchestratorError::UnsupportedBackend("tgi".to_string())
        );
    }

    #[test]
    fn test_validate() {
        let mut config = EngineConfig::new("m", 0);
        assert!(config.validate().is_err());
        config.num_inference_engines = 1;
        config.validate().unwrap();
        config.gpu_memory_utilization = Some(1.5);
        assert!(config.validate().is_err());
        config.gpu_memory_utilization = Some(0.8);
        config.packing_denominator = 0;
        assert!(config.validate().is_err());
        config.packing_denominator = 5;

        // vLLM picks an engine flavor, sglang has no such choice
        config.async_engine = true;
        config.validate().unwrap();
        config.backend = Backend::Sglang;
        assert!(matches!(config.validate(), Err(OrchestratorError::Config(_))));
    }

    #[test]
    fn test_colocated_share() {
        let mut config = EngineConfig::new("m", 1);
        assert!((config.colocated_gpu_share() - 0.2).abs() < 1e-9);
        config.packing_denominator = 2;
        assert!((config.colocated_gpu_share() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_sampling_params_for_backend() {
        let params = SamplingParams {
            max_tokens: 16,
            logprobs: Some(1),
            stop: vec!["\n".to_string()],
            ..Default::default()
        };
        let vllm = params.for_backend(Backend::Vllm);
        assert_eq!(vllm["max_tokens"], 16);
        assert_eq!(vllm["logprobs"], 1);
        assert!(vllm.get("max_new_tokens").is_none());

        let sglang = params.for_backend(Backend::Sglang);
        assert_eq!(sglang["max_new_tokens"], 16);
        assert_eq!(sglang["return_logprob"], true);
        assert_eq!(sglang["stop"][0], "\n");
        assert!(sglang.get("max_tokens").is_none());
    }
}
