// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
//! Engine backend talking to a serving process over its HTTP API.
//!
//! vLLM and SGLang expose the same lifecycle under different routes and
//! payloads; [`HttpEngine`] speaks whichever dialect its backend uses.
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::{json, Value};
use tokio::process::Child;

use super::{
    CommunicatorHandle, EngineBackend, GenerateInput, GenerateOutput, MemoryTag,
    NamedWeightUpdateRequest, SleepLevel,
};
use crate::config::{Backend, SamplingParams};
use crate::error::{OrchestratorError, Result};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub struct HttpEngine {
    replica: usize,
    backend: Backend,
    tp_size: usize,
    model: String,
    base_url: String,
    client: reqwest::Client,
    default_params: SamplingParams,
    async_engine: bool,
    child: Option<Child>,
}

impl HttpEngine {
    pub fn new(
        replica: usize,
        backend: Backend,
        tp_size: usize,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            replica,
            backend,
            tp_size,
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            default_params: SamplingParams::default(),
            async_engine: false,
            child: None,
        }
    }

    /// Own the serving process; it is killed on teardown
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    pub fn with_sampling_params(mut self, params: SamplingParams) -> Self {
        self.default_params = params;
        self
    }

    /// Submit every prompt as its own completion request, all in flight at
    /// once, instead of one batched request. vLLM only.
    pub fn with_async_engine(mut self, async_engine: bool) -> Self {
        self.async_engine = async_engine;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Poll `/health` until the server answers, the process exits, or `timeout` passes.
    pub async fn wait_healthy(&mut self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let url = format!("{}/health", self.base_url);
        loop {
            match self
                .client
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    tracing::info!("Replica<{}> => Healthy", self.replica);
                    return Ok(());
                }
                Ok(response) => {
                    tracing::debug!("Replica<{}> health returned {}", self.replica, response.status())
                }
                Err(err) => tracing::debug!("Replica<{}> not up yet: {}", self.replica, err),
            }
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(OrchestratorError::Launch(format!(
                        "engine process of replica {} exited with {status}",
                        self.replica
                    )));
                }
            }
            if start.elapsed() > timeout {
                return Err(OrchestratorError::Launch(format!(
                    "replica {} not healthy within {timeout:?}",
                    self.replica
                )));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        let mut builder = self.client.post(format!("{}{path}", self.base_url));
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(OrchestratorError::Request(format!(
                "POST {path} returned {status}: {text}"
            )));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| OrchestratorError::Request(format!("POST {path}: {e}")))
    }

    // sglang reports control failures in the body with a 200
    fn check_success(path: &str, response: &Value) -> Result<()> {
        match response.get("success").and_then(Value::as_bool) {
            Some(false) => Err(OrchestratorError::Communicator(format!(
                "{path}: {}",
                response
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
            ))),
            _ => Ok(()),
        }
    }

    async fn generate_vllm(&self, prompts: Vec<String>, params: &SamplingParams) -> Result<GenerateOutput> {
        let mut body = params.for_backend(Backend::Vllm);
        body["model"] = json!(self.model);
        body["prompt"] = json!(prompts);
        let response = self.post("/v1/completions", Some(body)).await?;
        let mut choices = response
            .get("choices")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| OrchestratorError::Request("completion without choices".to_string()))?;
        choices.sort_by_key(|choice| choice.get("index").and_then(Value::as_u64).unwrap_or(0));

        let mut output = GenerateOutput {
            response_logprobs: params.logprobs.map(|_| vec![]),
            ..Default::default()
        };
        for choice in choices {
            output
                .responses
                .push(choice["text"].as_str().unwrap_or_default().to_string());
            output.stop_reasons.push(
                choice["finish_reason"]
                    .as_str()
                    .unwrap_or("length")
                    .to_string(),
            );
            if let Some(all) = output.response_logprobs.as_mut() {
                let logprobs = choice["logprobs"]["token_logprobs"]
                    .as_array()
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(Value::as_f64)
                            .map(|v| v as f32)
                            .collect()
                    })
                    .unwrap_or_default();
                all.push(logprobs);
            }
        }
        Ok(output)
    }

    async fn generate_sglang(&self, prompts: Vec<String>, params: &SamplingParams) -> Result<GenerateOutput> {
        let mut sampling_params = params.for_backend(Backend::Sglang);
        let return_logprob = sampling_params
            .as_object_mut()
            .and_then(|params| params.remove("return_logprob"))
            .is_some();
        let body = json!({
            "text": prompts,
            "sampling_params": sampling_params,
            "return_logprob": return_logprob,
        });
        let response = self.post("/generate", Some(body)).await?;
        let items = response
            .as_array()
            .cloned()
            .ok_or_else(|| OrchestratorError::Request("generate returned no batch".to_string()))?;

        let mut output = GenerateOutput {
            response_logprobs: return_logprob.then(Vec::new),
            ..Default::default()
        };
        for item in items {
            output
                .responses
                .push(item["text"].as_str().unwrap_or_default().to_string());
            output.stop_reasons.push(
                item["meta_info"]["finish_reason"]["type"]
                    .as_str()
                    .unwrap_or("length")
                    .to_string(),
            );
            if let Some(all) = output.response_logprobs.as_mut() {
                // entries are [logprob, token_id, token_text]
                let logprobs = item["meta_info"]["output_token_logprobs"]
                    .as_array()
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|entry| entry.get(0).and_then(Value::as_f64))
                            .map(|v| v as f32)
                            .collect()
                    })
                    .unwrap_or_default();
                all.push(logprobs);
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl EngineBackend for HttpEngine {
    async fn generate(&mut self, input: GenerateInput) -> Result<GenerateOutput> {
        let params = input
            .sampling_params
            .unwrap_or_else(|| self.default_params.clone());
        let num_prompts = input.prompts.len();
        let output = match self.backend {
            Backend::Vllm if self.async_engine => {
                let outputs = try_join_all(
                    input
                        .prompts
                        .into_iter()
                        .map(|prompt| self.generate_vllm(vec![prompt], &params)),
                )
                .await?;
                outputs
                    .into_iter()
                    .fold(GenerateOutput::default(), |mut all, output| {
                        all.extend(output);
                        all
                    })
            }
            Backend::Vllm => self.generate_vllm(input.prompts, &params).await?,
            Backend::Sglang => self.generate_sglang(input.prompts, &params).await?,
        };
        if output.responses.len() != num_prompts {
            return Err(OrchestratorError::Request(format!(
                "{num_prompts} prompts but {} responses",
                output.responses.len()
            )));
        }
        Ok(output)
    }

    async fn wake_up(&mut self, tags: Vec<MemoryTag>) -> Result<()> {
        let tags: Vec<&str> = tags.iter().map(MemoryTag::as_str).collect();
        match self.backend {
            Backend::Vllm => {
                let query = tags
                    .iter()
                    .map(|tag| format!("tags={tag}"))
                    .collect::<Vec<_>>()
                    .join("&");
                self.post(&format!("/wake_up?{query}"), None).await?;
            }
            Backend::Sglang => {
                let response = self
                    .post("/resume_memory_occupation", Some(json!({ "tags": tags })))
                    .await?;
                Self::check_success("/resume_memory_occupation", &response)?;
            }
        }
        Ok(())
    }

    async fn sleep(&mut self, level: SleepLevel) -> Result<()> {
        match self.backend {
            Backend::Vllm => {
                self.post(&format!("/sleep?level={}", level.as_u8()), None)
                    .await?;
            }
            Backend::Sglang => {
                let response = self
                    .post("/release_memory_occupation", Some(json!({})))
                    .await?;
                Self::check_success("/release_memory_occupation", &response)?;
            }
        }
        Ok(())
    }

    async fn init_weight_update_communicator(&mut self, handle: CommunicatorHandle) -> Result<()> {
        match self.backend {
            Backend::Vllm => {
                let body = json!({
                    "method": "init_weight_update_communicator",
                    "args": [
                        handle.master_addr,
                        handle.master_port,
                        handle.rank_offset,
                        handle.world_size,
                        handle.group_name,
                        handle.backend.to_string(),
                        handle.override_existing,
                    ],
                });
                self.post("/collective_rpc", Some(body)).await?;
            }
            Backend::Sglang => {
                let body = json!({
                    "master_address": handle.master_addr,
                    "master_port": handle.master_port,
                    "rank_offset": handle.rank_offset,
                    "world_size": handle.world_size,
                    "group_name": handle.group_name,
                    "backend": handle.backend.to_string(),
                });
                let response = self.post("/init_weights_update_group", Some(body)).await?;
                Self::check_success("/init_weights_update_group", &response)?;
            }
        }
        Ok(())
    }

    async fn update_named_weight(&mut self, request: NamedWeightUpdateRequest) -> Result<()> {
        match self.backend {
            Backend::Vllm => {
                let body = json!({
                    "method": "update_weight",
                    "args": [
                        request.name,
                        request.dtype.to_string(),
                        request.shape,
                        request.transport.group_name,
                    ],
                });
                self.post("/collective_rpc", Some(body)).await?;
            }
            Backend::Sglang => {
                let body = json!({
                    "name": request.name,
                    "dtype": request.dtype.to_string(),
                    "shape": request.shape,
                    "group_name": request.transport.group_name,
                });
                let response = self
                    .post("/update_weights_from_distributed", Some(body))
                    .await?;
                Self::check_success("/update_weights_from_distributed", &response)?;
            }
        }
        Ok(())
    }

    async fn reset_prefix_cache(&mut self) -> Result<()> {
        let path = match self.backend {
            Backend::Vllm => "/reset_prefix_cache",
            Backend::Sglang => "/flush_cache",
        };
        self.post(path, None).await?;
        Ok(())
    }

    async fn teardown(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            child.kill().await?;
            tracing::info!("Replica<{}> engine process killed", self.replica);
        }
        Ok(())
    }

    fn tp_size(&self) -> usize {
        self.tp_size
    }
}
