// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
//! Deterministic engine used when no GPU serving backend is available.
//!
//! Output is a pure function of the seed, the current weights and the prompt,
//! so a weight update is observable in generation. With prefix caching on,
//! completed prompts are served from the cache until it is reset.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{
    CommunicatorHandle, EngineBackend, GenerateInput, GenerateOutput, MemoryTag,
    NamedWeightUpdateRequest, SleepLevel,
};
use crate::collective::CollectiveRegistry;
use crate::config::SamplingParams;
use crate::error::{OrchestratorError, Result};

const VOCAB: &[&str] = &[
    "the", "model", "weights", "engine", "replica", "token", "batch", "rank", "sleep", "wake",
    "cache", "prefix", "train", "serve", "sync", "group",
];
const MAX_SIM_TOKENS: u32 = 16;

/// Backend version the simulator reports, recent enough for every supported backend
pub const EMULATED_BACKEND_VERSION: &str = "0.9.0";

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;

#[derive(Debug, Clone)]
pub struct SimOptions {
    pub model: String,
    pub replica: usize,
    pub tp_size: usize,
    pub seed: u64,
    pub enable_prefix_caching: bool,
    pub max_model_len: u32,
    /// used for requests that carry no sampling parameters
    pub sampling_params: SamplingParams,
}

impl SimOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            replica: 0,
            tp_size: 1,
            seed: 42,
            enable_prefix_caching: true,
            max_model_len: 4096,
            sampling_params: SamplingParams::default(),
        }
    }
}

#[derive(Debug)]
struct Communicator {
    handle: CommunicatorHandle,
    ranks: Range<usize>,
}

#[derive(Debug)]
pub struct SimEngine {
    options: SimOptions,
    checkpoint: BTreeMap<String, u64>,
    weights: BTreeMap<String, u64>,
    prefix_cache: HashMap<String, (String, String, Option<Vec<f32>>)>,
    released: HashSet<MemoryTag>,
    collective: Option<Arc<CollectiveRegistry>>,
    communicator: Option<Communicator>,
    torn_down: bool,
}

impl SimEngine {
    pub fn new(options: SimOptions) -> Self {
        let checkpoint = BTreeMap::from([(
            "checkpoint".to_string(),
            fnv1a(FNV_OFFSET, options.model.as_bytes()),
        )]);
        Self {
            weights: checkpoint.clone(),
            checkpoint,
            options,
            prefix_cache: HashMap::new(),
            released: HashSet::new(),
            collective: None,
            communicator: None,
            torn_down: false,
        }
    }

    /// Receive weight updates over `registry` instead of applying request metadata
    pub fn with_collective(mut self, registry: Arc<CollectiveRegistry>) -> Self {
        self.collective = Some(registry);
        self
    }

    pub fn weights_digest(&self) -> u64 {
        self.weights.iter().fold(FNV_OFFSET, |hash, (name, checksum)| {
            fnv1a(fnv1a(hash, name.as_bytes()), &checksum.to_le_bytes())
        })
    }

    pub fn cached_prompts(&self) -> usize {
        self.prefix_cache.len()
    }

    pub fn is_asleep(&self) -> bool {
        !self.released.is_empty()
    }

    fn check_alive(&self) -> Result<()> {
        if self.torn_down {
            return Err(OrchestratorError::EngineUnavailable(self.options.replica));
        }
        Ok(())
    }

    fn complete(&self, prompt: &str, params: &SamplingParams) -> (String, String, Option<Vec<f32>>) {
        let seed = fnv1a(
            fnv1a(self.options.seed, &self.weights_digest().to_le_bytes()),
            prompt.as_bytes(),
        );
        let mut rng = StdRng::seed_from_u64(seed);
        let budget = params.max_tokens.min(MAX_SIM_TOKENS);
        let natural_len = rng.gen_range(1..=MAX_SIM_TOKENS);
        let num_tokens = natural_len.min(budget);

        let mut tokens = Vec::with_capacity(num_tokens as usize);
        let mut logprobs = Vec::with_capacity(num_tokens as usize);
        for _ in 0..num_tokens {
            tokens.push(VOCAB[rng.gen_range(0..VOCAB.len())]);
            logprobs.push(-rng.gen_range(0.0f32..5.0));
        }
        let mut text = tokens.join(" ");
        let mut stop_reason = if natural_len <= budget { "stop" } else { "length" };
        if let Some(pos) = params
            .stop
            .iter()
            .filter(|stop| !stop.is_empty())
            .filter_map(|stop| text.find(stop.as_str()))
            .min()
        {
            text.truncate(pos);
            stop_reason = "stop";
        }
        let logprobs = params.logprobs.map(|_| logprobs);
        (text, stop_reason.to_string(), logprobs)
    }
}

#[async_trait]
impl EngineBackend for SimEngine {
    async fn generate(&mut self, input: GenerateInput) -> Result<GenerateOutput> {
        self.check_alive()?;
        if self.is_asleep() {
            return Err(OrchestratorError::EngineAsleep(self.options.replica));
        }
        let params = input
            .sampling_params
            .unwrap_or_else(|| self.options.sampling_params.clone());
        let mut output = GenerateOutput {
            response_logprobs: params.logprobs.map(|_| vec![]),
            ..Default::default()
        };
        for prompt in input.prompts {
            if prompt.split_whitespace().count() > self.options.max_model_len as usize {
                return Err(OrchestratorError::Request(format!(
                    "prompt exceeds max_model_len {}",
                    self.options.max_model_len
                )));
            }
            let cached = if self.options.enable_prefix_caching {
                self.prefix_cache.get(&prompt).cloned()
            } else {
                None
            };
            let completion = match cached {
                Some(cached) => cached,
                None => {
                    let completion = self.complete(&prompt, &params);
                    if self.options.enable_prefix_caching {
                        self.prefix_cache.insert(prompt, completion.clone());
                    }
                    completion
                }
            };
            let (response, stop_reason, logprobs) = completion;
            output.responses.push(response);
            output.stop_reasons.push(stop_reason);
            if let Some(all) = output.response_logprobs.as_mut() {
                all.push(logprobs.unwrap_or_default());
            }
        }
        Ok(output)
    }

    async fn wake_up(&mut self, tags: Vec<MemoryTag>) -> Result<()> {
        self.check_alive()?;
        for tag in tags {
            self.released.remove(&tag);
        }
        Ok(())
    }

    async fn sleep(&mut self, level: SleepLevel) -> Result<()> {
        self.check_alive()?;
        self.prefix_cache.clear();
        if level == SleepLevel::Discard {
            // discarded weights come back from the checkpoint
            self.weights = self.checkpoint.clone();
        }
        self.released.extend([MemoryTag::Weights, MemoryTag::KvCache]);
        Ok(())
    }

    async fn init_weight_update_communicator(&mut self, handle: CommunicatorHandle) -> Result<()> {
        self.check_alive()?;
        let ranks = handle.rank_offset..handle.rank_offset + self.options.tp_size;
        if ranks.end > handle.world_size {
            return Err(OrchestratorError::Communicator(format!(
                "ranks {ranks:?} exceed world size {}",
                handle.world_size
            )));
        }
        if let Some(registry) = &self.collective {
            registry.join(&handle, ranks.clone())?;
        }
        tracing::info!(
            "Replica<{}> joined group {} as ranks {:?}",
            self.options.replica,
            handle.group_name,
            ranks
        );
        self.communicator = Some(Communicator { handle, ranks });
        Ok(())
    }

    async fn update_named_weight(&mut self, request: NamedWeightUpdateRequest) -> Result<()> {
        self.check_alive()?;
        if self.released.contains(&MemoryTag::Weights) {
            return Err(OrchestratorError::EngineAsleep(self.options.replica));
        }
        let communicator = self
            .communicator
            .as_ref()
            .filter(|c| c.handle.group_name == request.transport.group_name)
            .ok_or_else(|| {
                OrchestratorError::Communicator(format!(
                    "replica {} has no communicator for group {}",
                    self.options.replica, request.transport.group_name
                ))
            })?;

        let checksum = match &self.collective {
            Some(registry) => {
                let received = futures::future::try_join_all(
                    communicator
                        .ranks
                        .clone()
                        .map(|rank| registry.receive(&request.transport.group_name, rank, &request.name)),
                )
                .await?;
                let mut checksum = FNV_OFFSET;
                for tensor in received {
                    if tensor.dtype != request.dtype || tensor.shape != request.shape {
                        return Err(OrchestratorError::Communicator(format!(
                            "tensor {} arrived as {} {:?}, expected {} {:?}",
                            request.name, tensor.dtype, tensor.shape, request.dtype, request.shape
                        )));
                    }
                    checksum = fnv1a(FNV_OFFSET, &tensor.data);
                }
                checksum
            }
            // no tensor bytes to look at, the update is identified by its metadata
            None => {
                let meta = format!("{}:{}:{:?}", request.name, request.dtype, request.shape);
                fnv1a(FNV_OFFSET, meta.as_bytes())
            }
        };
        self.weights.insert(request.name, checksum);
        Ok(())
    }

    async fn reset_prefix_cache(&mut self) -> Result<()> {
        self.check_alive()?;
        self.prefix_cache.clear();
        Ok(())
    }

    async fn teardown(&mut self) -> Result<()> {
        self.torn_down = true;
        self.prefix_cache.clear();
        self.communicator = None;
        Ok(())
    }

    fn tp_size(&self) -> usize {
        self.options.tp_size
    }
}
