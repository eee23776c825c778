// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
//! Serving engines: one actor task per replica, fronted by [`EngineClient`].
mod actor;
mod client;
pub mod http;
pub mod serve;
pub mod sim;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SamplingParams;
use crate::error::{OrchestratorError, Result};

pub use actor::spawn_engine;
pub use client::{EngineClient, EngineInfo};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateInput {
    pub prompts: Vec<String>,
    #[serde(default)]
    pub sampling_params: Option<SamplingParams>,
}

impl GenerateInput {
    pub fn new(prompts: Vec<String>) -> Self {
        Self {
            prompts,
            sampling_params: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOutput {
    pub responses: Vec<String>,
    pub stop_reasons: Vec<String>,
    #[serde(default)]
    pub response_logprobs: Option<Vec<Vec<f32>>>,
}

impl GenerateOutput {
    /// Append another output, keeping logprobs only if both sides carry them
    pub fn extend(&mut self, other: GenerateOutput) {
        let had_outputs = !self.responses.is_empty();
        self.responses.extend(other.responses);
        self.stop_reasons.extend(other.stop_reasons);
        self.response_logprobs = match (self.response_logprobs.take(), other.response_logprobs) {
            (Some(mut lhs), Some(rhs)) => {
                lhs.extend(rhs);
                Some(lhs)
            }
            (None, Some(rhs)) if !had_outputs => Some(rhs),
            _ => None,
        };
    }
}

/// GPU memory regions that sleep releases and wake-up restores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTag {
    Weights,
    KvCache,
}

impl MemoryTag {
    pub const ALL: [MemoryTag; 2] = [MemoryTag::Weights, MemoryTag::KvCache];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTag::Weights => "weights",
            MemoryTag::KvCache => "kv_cache",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SleepLevel {
    /// Weights offloaded to host memory, KV cache discarded
    #[default]
    Offload,
    /// Weights and KV cache discarded
    Discard,
}

impl SleepLevel {
    pub fn as_u8(&self) -> u8 {
        match self {
            SleepLevel::Offload => 1,
            SleepLevel::Discard => 2,
        }
    }

    pub fn from_u8(level: u8) -> Result<Self> {
        match level {
            1 => Ok(SleepLevel::Offload),
            2 => Ok(SleepLevel::Discard),
            _ => Err(OrchestratorError::Request(format!(
                "invalid sleep level {level}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommBackend {
    Nccl,
    Gloo,
}

impl fmt::Display for CommBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommBackend::Nccl => f.write_str("nccl"),
            CommBackend::Gloo => f.write_str("gloo"),
        }
    }
}

impl FromStr for CommBackend {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "nccl" => Ok(CommBackend::Nccl),
            "gloo" => Ok(CommBackend::Gloo),
            _ => Err(OrchestratorError::Communicator(format!(
                "unknown collective backend {s}"
            ))),
        }
    }
}

/// Rendezvous point of the weight update group.
///
/// Training ranks own `0..rank_offset`, engine ranks own `rank_offset..world_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicatorHandle {
    pub master_addr: String,
    pub master_port: u16,
    pub rank_offset: usize,
    pub world_size: usize,
    pub group_name: String,
    pub backend: CommBackend,
    #[serde(default)]
    pub override_existing: bool,
}

impl CommunicatorHandle {
    /// Handle as seen by replica `replica`, whose first rank follows the ranks of
    /// every replica before it.
    pub fn for_replica(&self, replica: usize, tp_size: usize) -> Self {
        Self {
            rank_offset: self.rank_offset + replica * tp_size,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32,
    Float16,
    Bfloat16,
}

impl DType {
    pub fn size_of(&self) -> usize {
        match self {
            DType::Float32 => 4,
            DType::Float16 | DType::Bfloat16 => 2,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Float32 => f.write_str("float32"),
            DType::Float16 => f.write_str("float16"),
            DType::Bfloat16 => f.write_str("bfloat16"),
        }
    }
}

/// How the receiving rank obtains the tensor bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportDescriptor {
    pub group_name: String,
    pub src_rank: usize,
}

/// One named tensor pushed over the weight update group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedWeightUpdateRequest {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub transport: TransportDescriptor,
}

impl NamedWeightUpdateRequest {
    pub fn num_bytes(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.size_of()
    }
}

/// Training-side tensor about to be broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl WeightTensor {
    pub fn new(name: impl Into<String>, dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let name = name.into();
        let expected = shape.iter().product::<usize>() * dtype.size_of();
        if expected != data.len() {
            return Err(OrchestratorError::Communicator(format!(
                "tensor {name} of shape {shape:?} and dtype {dtype} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            name,
            dtype,
            shape,
            data,
        })
    }

    pub fn request(&self, group_name: &str) -> NamedWeightUpdateRequest {
        NamedWeightUpdateRequest {
            name: self.name.clone(),
            dtype: self.dtype,
            shape: self.shape.clone(),
            transport: TransportDescriptor {
                group_name: group_name.to_string(),
                src_rank: 0,
            },
        }
    }
}

/// A serving engine process as seen from its actor task
#[async_trait]
pub trait EngineBackend: Send {
    async fn generate(&mut self, input: GenerateInput) -> Result<GenerateOutput>;

    async fn wake_up(&mut self, tags: Vec<MemoryTag>) -> Result<()>;

    async fn sleep(&mut self, level: SleepLevel) -> Result<()>;

    async fn init_weight_update_communicator(&mut self, handle: CommunicatorHandle) -> Result<()>;

    async fn update_named_weight(&mut self, request: NamedWeightUpdateRequest) -> Result<()>;

    async fn reset_prefix_cache(&mut self) -> Result<()>;

    /// Release the engine and everything it holds
    async fn teardown(&mut self) -> Result<()>;

    fn tp_size(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_replica_offsets_ranks() {
        let handle = CommunicatorHandle {
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
            rank_offset: 1,
            world_size: 5,
            group_name: "weights".to_string(),
            backend: CommBackend::Nccl,
            override_existing: false,
        };
        assert_eq!(handle.for_replica(0, 2).rank_offset, 1);
        assert_eq!(handle.for_replica(1, 2).rank_offset, 3);
        assert_eq!(handle.for_replica(1, 2).world_size, 5);
    }

    #[test]
    fn test_weight_tensor_size_check() {
        assert!(WeightTensor::new("w", DType::Bfloat16, vec![2, 3], vec![0; 12]).is_ok());
        assert!(WeightTensor::new("w", DType::Float32, vec![2, 3], vec![0; 12]).is_err());
        let tensor = WeightTensor::new("w", DType::Float32, vec![3], vec![0; 12]).unwrap();
        let request = tensor.request("g");
        assert_eq!(request.num_bytes(), 12);
        assert_eq!(request.transport.group_name, "g");
    }

    #[test]
    fn test_generate_output_extend() {
        let mut output = GenerateOutput::default();
        output.extend(GenerateOutput {
            responses: vec!["a".into()],
            stop_reasons: vec!["stop".into()],
            response_logprobs: Some(vec![vec![-0.1]]),
        });
        output.extend(GenerateOutput {
            responses: vec!["b".into()],
            stop_reasons: vec!["length".into()],
            response_logprobs: Some(vec![vec![-0.2]]),
        });
        assert_eq!(output.responses, vec!["a", "b"]);
        assert_eq!(output.response_logprobs.unwrap().len(), 2);
    }
}
