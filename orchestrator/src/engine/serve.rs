// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
//! HTTP front for a [`SimEngine`], speaking either backend dialect.
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::sim::SimEngine;
use super::{
    CommBackend, CommunicatorHandle, DType, EngineBackend, GenerateInput, MemoryTag,
    NamedWeightUpdateRequest, SleepLevel, TransportDescriptor,
};
use crate::config::{Backend, SamplingParams};
use crate::error::OrchestratorError;

type SharedEngine = Arc<Mutex<SimEngine>>;

struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            OrchestratorError::EngineAsleep(_) | OrchestratorError::EngineUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            OrchestratorError::Request(_) | OrchestratorError::Communicator(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Routes of `backend`'s HTTP API backed by `engine`
pub fn router(backend: Backend, engine: SimEngine) -> Router {
    let state: SharedEngine = Arc::new(Mutex::new(engine));
    let router = Router::new().route("/health", get(health));
    let router = match backend {
        Backend::Vllm => router
            .route("/v1/completions", post(vllm_completions))
            .route("/sleep", post(vllm_sleep))
            .route("/wake_up", post(vllm_wake_up))
            .route("/reset_prefix_cache", post(reset_prefix_cache))
            .route("/collective_rpc", post(vllm_collective_rpc)),
        Backend::Sglang => router
            .route("/generate", post(sglang_generate))
            .route("/release_memory_occupation", post(sglang_release))
            .route("/resume_memory_occupation", post(sglang_resume))
            .route("/flush_cache", post(reset_prefix_cache))
            .route("/init_weights_update_group", post(sglang_init_group))
            .route(
                "/update_weights_from_distributed",
                post(sglang_update_weights),
            ),
    };
    router.with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn reset_prefix_cache(State(engine): State<SharedEngine>) -> ApiResult<StatusCode> {
    engine.lock().await.reset_prefix_cache().await?;
    Ok(StatusCode::OK)
}

fn parse_tags(tags: &[String]) -> Vec<MemoryTag> {
    let tags: Vec<MemoryTag> = tags
        .iter()
        .filter_map(|tag| match tag.as_str() {
            "weights" => Some(MemoryTag::Weights),
            "kv_cache" => Some(MemoryTag::KvCache),
            _ => None,
        })
        .collect();
    if tags.is_empty() {
        vec![MemoryTag::Weights, MemoryTag::KvCache]
    } else {
        tags
    }
}

#[derive(Debug, Deserialize)]
struct CompletionRequest {
    prompt: Vec<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    top_k: Option<i32>,
    #[serde(default)]
    stop: Vec<String>,
    #[serde(default)]
    logprobs: Option<u32>,
}

async fn vllm_completions(
    State(engine): State<SharedEngine>,
    Json(request): Json<CompletionRequest>,
) -> ApiResult<Json<Value>> {
    let defaults = SamplingParams::default();
    let params = SamplingParams {
        max_tokens: request.max_tokens.unwrap_or(defaults.max_tokens),
        temperature: request.temperature.unwrap_or(defaults.temperature),
        top_p: request.top_p.unwrap_or(defaults.top_p),
        top_k: request.top_k.unwrap_or(defaults.top_k),
        stop: request.stop,
        logprobs: request.logprobs,
    };
    let output = engine
        .lock()
        .await
        .generate(GenerateInput {
            prompts: request.prompt,
            sampling_params: Some(params),
        })
        .await?;

    let choices: Vec<Value> = output
        .responses
        .iter()
        .zip(&output.stop_reasons)
        .enumerate()
        .map(|(index, (text, finish_reason))| {
            let logprobs = output
                .response_logprobs
                .as_ref()
                .and_then(|all| all.get(index))
                .map(|values| json!({ "token_logprobs": values }));
            json!({
                "index": index,
                "text": text,
                "finish_reason": finish_reason,
                "logprobs": logprobs,
            })
        })
        .collect();
    Ok(Json(json!({ "object": "text_completion", "choices": choices })))
}

#[derive(Debug, Deserialize)]
struct SleepQuery {
    level: Option<u8>,
}

async fn vllm_sleep(
    State(engine): State<SharedEngine>,
    Query(query): Query<SleepQuery>,
) -> ApiResult<StatusCode> {
    let level = SleepLevel::from_u8(query.level.unwrap_or(1))?;
    engine.lock().await.sleep(level).await?;
    Ok(StatusCode::OK)
}

async fn vllm_wake_up(
    State(engine): State<SharedEngine>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> ApiResult<StatusCode> {
    let tags: Vec<String> = pairs
        .into_iter()
        .filter(|(key, _)| key == "tags")
        .map(|(_, value)| value)
        .collect();
    engine.lock().await.wake_up(parse_tags(&tags)).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct CollectiveRpc {
    method: String,
    #[serde(default)]
    args: Value,
}

fn rpc_args<T: serde::de::DeserializeOwned>(method: &str, args: Value) -> ApiResult<T> {
    serde_json::from_value(args).map_err(|e| {
        ApiError(OrchestratorError::Request(format!(
            "bad arguments for {method}: {e}"
        )))
    })
}

async fn vllm_collective_rpc(
    State(engine): State<SharedEngine>,
    Json(rpc): Json<CollectiveRpc>,
) -> ApiResult<Json<Value>> {
    match rpc.method.as_str() {
        "init_weight_update_communicator" => {
            let (master_addr, master_port, rank_offset, world_size, group_name, backend, override_existing): (
                String,
                u16,
                usize,
                usize,
                String,
                CommBackend,
                bool,
            ) = rpc_args(&rpc.method, rpc.args)?;
            engine
                .lock()
                .await
                .init_weight_update_communicator(CommunicatorHandle {
                    master_addr,
                    master_port,
                    rank_offset,
                    world_size,
                    group_name,
                    backend,
                    override_existing,
                })
                .await?;
        }
        "update_weight" => {
            let (name, dtype, shape, group_name): (String, DType, Vec<usize>, String) =
                rpc_args(&rpc.method, rpc.args)?;
            engine
                .lock()
                .await
                .update_named_weight(NamedWeightUpdateRequest {
                    name,
                    dtype,
                    shape,
                    transport: TransportDescriptor {
                        group_name,
                        src_rank: 0,
                    },
                })
                .await?;
        }
        method => {
            return Err(ApiError(OrchestratorError::Request(format!(
                "unknown collective_rpc method {method}"
            ))))
        }
    }
    Ok(Json(json!({ "results": [] })))
}

#[derive(Debug, Deserialize)]
struct SglangSamplingParams {
    #[serde(default)]
    max_new_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    top_k: Option<i32>,
    #[serde(default)]
    stop: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SglangGenerateRequest {
    text: Vec<String>,
    sampling_params: Option<SglangSamplingParams>,
    #[serde(default)]
    return_logprob: bool,
}

async fn sglang_generate(
    State(engine): State<SharedEngine>,
    Json(request): Json<SglangGenerateRequest>,
) -> ApiResult<Json<Value>> {
    let defaults = SamplingParams::default();
    let params = match request.sampling_params {
        Some(p) => SamplingParams {
            max_tokens: p.max_new_tokens.unwrap_or(defaults.max_tokens),
            temperature: p.temperature.unwrap_or(defaults.temperature),
            top_p: p.top_p.unwrap_or(defaults.top_p),
            top_k: p.top_k.unwrap_or(defaults.top_k),
            stop: p.stop,
            logprobs: request.return_logprob.then_some(1),
        },
        None => SamplingParams {
            logprobs: request.return_logprob.then_some(1),
            ..defaults
        },
    };
    let output = engine
        .lock()
        .await
        .generate(GenerateInput {
            prompts: request.text,
            sampling_params: Some(params),
        })
        .await?;

    let items: Vec<Value> = output
        .responses
        .iter()
        .zip(&output.stop_reasons)
        .enumerate()
        .map(|(index, (text, finish_reason))| {
            let logprobs: Vec<Value> = output
                .response_logprobs
                .as_ref()
                .and_then(|all| all.get(index))
                .map(|values| values.iter().map(|v| json!([v, 0, ""])).collect())
                .unwrap_or_default();
            json!({
                "text": text,
                "meta_info": {
                    "finish_reason": { "type": finish_reason },
                    "output_token_logprobs": logprobs,
                },
            })
        })
        .collect();
    Ok(Json(Value::Array(items)))
}

fn sglang_status(result: crate::error::Result<()>) -> Json<Value> {
    match result {
        Ok(()) => Json(json!({ "success": true, "message": "" })),
        Err(err) => Json(json!({ "success": false, "message": err.to_string() })),
    }
}

#[derive(Debug, Default, Deserialize)]
struct MemoryRequest {
    #[serde(default)]
    tags: Vec<String>,
}

async fn sglang_release(
    State(engine): State<SharedEngine>,
    Json(_request): Json<MemoryRequest>,
) -> Json<Value> {
    sglang_status(engine.lock().await.sleep(SleepLevel::Offload).await)
}

async fn sglang_resume(
    State(engine): State<SharedEngine>,
    Json(request): Json<MemoryRequest>,
) -> Json<Value> {
    sglang_status(engine.lock().await.wake_up(parse_tags(&request.tags)).await)
}

#[derive(Debug, Deserialize)]
struct InitGroupRequest {
    master_address: String,
    master_port: u16,
    rank_offset: usize,
    world_size: usize,
    group_name: String,
    backend: CommBackend,
}

async fn sglang_init_group(
    State(engine): State<SharedEngine>,
    Json(request): Json<InitGroupRequest>,
) -> Json<Value> {
    let handle = CommunicatorHandle {
        master_addr: request.master_address,
        master_port: request.master_port,
        rank_offset: request.rank_offset,
        world_size: request.world_size,
        group_name: request.group_name,
        backend: request.backend,
        override_existing: true,
    };
    sglang_status(
        engine
            .lock()
            .await
            .init_weight_update_communicator(handle)
            .await,
    )
}

#[derive(Debug, Deserialize)]
struct UpdateWeightsRequest {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
    group_name: String,
}

async fn sglang_update_weights(
    State(engine): State<SharedEngine>,
    Json(request): Json<UpdateWeightsRequest>,
) -> Json<Value> {
    let request = NamedWeightUpdateRequest {
        name: request.name,
        dtype: request.dtype,
        shape: request.shape,
        transport: TransportDescriptor {
            group_name: request.group_name,
            src_rank: 0,
        },
    };
    sglang_status(engine.lock().await.update_named_weight(request).await)
}
