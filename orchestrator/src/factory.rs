// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
//! Construction of engine replicas.
//!
//! The factory turns an [`EngineConfig`] into backend specific arguments, binds
//! every replica to its slice of the placement group, admits it onto those
//! bundles, and hands it to an [`EngineLauncher`].
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::instrument;

use crate::collective::CollectiveRegistry;
use crate::config::{Backend, EngineConfig, SamplingParams};
use crate::engine::http::HttpEngine;
use crate::engine::sim::{SimEngine, SimOptions, EMULATED_BACKEND_VERSION};
use crate::engine::{spawn_engine, EngineBackend, EngineClient, EngineInfo};
use crate::error::{OrchestratorError, Result};
use crate::placement::{ClusterScheduler, EnginePlacement, PlacementGroup, ShareLease};

const MIN_VLLM_VERSION: &str = "0.8.3";
const MIN_SGLANG_VERSION: &str = "0.4.8";

#[derive(Debug, Clone, PartialEq)]
pub struct VllmEngineArgs {
    pub model: String,
    pub enforce_eager: bool,
    pub tensor_parallel_size: usize,
    pub seed: u64,
    /// `uni` for a single rank, `ray` otherwise
    pub distributed_executor_backend: String,
    pub max_model_len: u32,
    pub enable_prefix_caching: bool,
    pub dtype: String,
    pub trust_remote_code: bool,
    pub disable_multiproc: bool,
    pub gpu_memory_utilization: Option<f32>,
    pub enable_sleep_mode: bool,
    pub max_num_batched_tokens: u32,
    pub max_num_seqs: u32,
    /// only the chosen token's logprob is ever requested
    pub max_logprobs: u32,
    /// one request per prompt instead of one batched request
    pub async_engine: bool,
    pub tokenizer: Option<String>,
    pub sampling_params: SamplingParams,
    pub bundle_indices: Vec<usize>,
    pub num_gpus: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SglangEngineArgs {
    pub model_path: String,
    pub tp_size: usize,
    pub mem_fraction_static: Option<f32>,
    pub random_seed: u64,
    pub context_length: u32,
    pub disable_radix_cache: bool,
    pub dtype: String,
    pub trust_remote_code: bool,
    pub max_prefill_tokens: u32,
    pub max_running_requests: u32,
    pub attention_backend: String,
    pub mm_attention_backend: String,
    pub enable_memory_saver: bool,
    pub tokenizer_path: Option<String>,
    pub sampling_params: SamplingParams,
    pub bundle_indices: Vec<usize>,
    pub num_gpus: f64,
}

/// Backend specific construction parameters of one replica
#[derive(Debug, Clone, PartialEq)]
pub enum EngineArgs {
    Vllm(VllmEngineArgs),
    Sglang(SglangEngineArgs),
}

fn flag(args: &mut Vec<String>, name: &str, value: impl ToString) {
    args.push(format!("--{name}"));
    args.push(value.to_string());
}

fn switch(args: &mut Vec<String>, name: &str, on: bool) {
    if on {
        args.push(format!("--{name}"));
    }
}

impl EngineArgs {
    pub fn backend(&self) -> Backend {
        match self {
            EngineArgs::Vllm(_) => Backend::Vllm,
            EngineArgs::Sglang(_) => Backend::Sglang,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            EngineArgs::Vllm(args) => &args.model,
            EngineArgs::Sglang(args) => &args.model_path,
        }
    }

    pub fn tp_size(&self) -> usize {
        match self {
            EngineArgs::Vllm(args) => args.tensor_parallel_size,
            EngineArgs::Sglang(args) => args.tp_size,
        }
    }

    pub fn seed(&self) -> u64 {
        match self {
            EngineArgs::Vllm(args) => args.seed,
            EngineArgs::Sglang(args) => args.random_seed,
        }
    }

    pub fn enable_prefix_caching(&self) -> bool {
        match self {
            EngineArgs::Vllm(args) => args.enable_prefix_caching,
            EngineArgs::Sglang(args) => !args.disable_radix_cache,
        }
    }

    pub fn max_model_len(&self) -> u32 {
        match self {
            EngineArgs::Vllm(args) => args.max_model_len,
            EngineArgs::Sglang(args) => args.context_length,
        }
    }

    /// Defaults for requests that carry no sampling parameters
    pub fn sampling_params(&self) -> &SamplingParams {
        match self {
            EngineArgs::Vllm(args) => &args.sampling_params,
            EngineArgs::Sglang(args) => &args.sampling_params,
        }
    }

    pub fn async_engine(&self) -> bool {
        match self {
            EngineArgs::Vllm(args) => args.async_engine,
            EngineArgs::Sglang(_) => false,
        }
    }

    /// Command line of the serving process, after the launch command itself
    pub fn cli_args(&self, port: u16) -> Vec<String> {
        let mut cli = vec![];
        match self {
            EngineArgs::Vllm(args) => {
                cli.push(args.model.clone());
                flag(&mut cli, "port", port);
                flag(&mut cli, "tensor-parallel-size", args.tensor_parallel_size);
                flag(&mut cli, "seed", args.seed);
                flag(
                    &mut cli,
                    "distributed-executor-backend",
                    &args.distributed_executor_backend,
                );
                flag(&mut cli, "max-model-len", args.max_model_len);
                flag(&mut cli, "dtype", &args.dtype);
                flag(&mut cli, "max-num-batched-tokens", args.max_num_batched_tokens);
                flag(&mut cli, "max-num-seqs", args.max_num_seqs);
                flag(&mut cli, "max-logprobs", args.max_logprobs);
                if let Some(utilization) = args.gpu_memory_utilization {
                    flag(&mut cli, "gpu-memory-utilization", utilization);
                }
                if let Some(tokenizer) = &args.tokenizer {
                    flag(&mut cli, "tokenizer", tokenizer);
                }
                switch(&mut cli, "enforce-eager", args.enforce_eager);
                switch(&mut cli, "enable-prefix-caching", args.enable_prefix_caching);
                switch(&mut cli, "enable-sleep-mode", args.enable_sleep_mode);
                switch(&mut cli, "trust-remote-code", args.trust_remote_code);
            }
            EngineArgs::Sglang(args) => {
                flag(&mut cli, "model-path", &args.model_path);
                flag(&mut cli, "port", port);
                flag(&mut cli, "tp-size", args.tp_size);
                flag(&mut cli, "random-seed", args.random_seed);
                flag(&mut cli, "context-length", args.context_length);
                flag(&mut cli, "dtype", &args.dtype);
                flag(&mut cli, "max-prefill-tokens", args.max_prefill_tokens);
                flag(&mut cli, "max-running-requests", args.max_running_requests);
                flag(&mut cli, "attention-backend", &args.attention_backend);
                flag(&mut cli, "mm-attention-backend", &args.mm_attention_backend);
                if let Some(fraction) = args.mem_fraction_static {
                    flag(&mut cli, "mem-fraction-static", fraction);
                }
                if let Some(tokenizer) = &args.tokenizer_path {
                    flag(&mut cli, "tokenizer-path", tokenizer);
                }
                switch(&mut cli, "disable-radix-cache", args.disable_radix_cache);
                switch(&mut cli, "enable-memory-saver", args.enable_memory_saver);
                switch(&mut cli, "trust-remote-code", args.trust_remote_code);
            }
        }
        cli
    }

    /// Environment of the serving process bound to `devices`
    pub fn env(&self, devices: &[u32]) -> Vec<(String, String)> {
        let visible = devices
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut env = vec![
            ("CUDA_VISIBLE_DEVICES".to_string(), visible),
            ("NO_COLOR".to_string(), "1".to_string()),
        ];
        if let EngineArgs::Vllm(args) = self {
            // sleep, wake and collective_rpc are dev mode endpoints
            env.push(("VLLM_SERVER_DEV_MODE".to_string(), "1".to_string()));
            if args.disable_multiproc {
                env.push((
                    "VLLM_ENABLE_V1_MULTIPROCESSING".to_string(),
                    "0".to_string(),
                ));
            }
        }
        env
    }
}

/// Everything needed to start one serving process
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub port: u16,
}

impl LaunchSpec {
    pub fn new(command: &[String], engine_args: &EngineArgs, devices: &[u32], port: u16) -> Result<Self> {
        let (program, prefix) = command
            .split_first()
            .ok_or_else(|| OrchestratorError::Config("empty engine command".to_string()))?;
        let mut args = prefix.to_vec();
        args.extend(engine_args.cli_args(port));
        Ok(Self {
            program: program.clone(),
            args,
            env: engine_args.env(devices),
            port,
        })
    }
}

fn parse_version(version: &str) -> Vec<u64> {
    let mut parts = vec![];
    for part in version.trim().trim_start_matches('v').split('.') {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        match digits.parse::<u64>() {
            Ok(number) => parts.push(number),
            Err(_) => break,
        }
        // "8rc1" or "8post1": the numeric release stops here
        if digits.len() != part.len() {
            break;
        }
    }
    parts
}

/// `found >= required`, comparing numeric release components only
pub fn version_at_least(found: &str, required: &str) -> bool {
    let mut found = parse_version(found);
    let mut required = parse_version(required);
    let len = found.len().max(required.len());
    found.resize(len, 0);
    required.resize(len, 0);
    found >= required
}

pub fn check_backend_version(backend: Backend, found: &str) -> Result<()> {
    let required = match backend {
        Backend::Vllm => MIN_VLLM_VERSION,
        Backend::Sglang => MIN_SGLANG_VERSION,
    };
    if parse_version(found).is_empty() || !version_at_least(found, required) {
        return Err(OrchestratorError::IncompatibleBackendVersion {
            backend: backend.to_string(),
            found: found.to_string(),
            required: required.to_string(),
        });
    }
    Ok(())
}

/// Starts serving engines
#[async_trait]
pub trait EngineLauncher: Send + Sync + fmt::Debug {
    async fn backend_version(&self, backend: Backend) -> Result<String>;

    async fn launch(&self, info: &EngineInfo, args: EngineArgs) -> Result<Box<dyn EngineBackend>>;
}

/// Launches [`SimEngine`]s inside this process
#[derive(Debug, Clone, Default)]
pub struct SimLauncher {
    collective: Option<Arc<CollectiveRegistry>>,
}

impl SimLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collective(registry: Arc<CollectiveRegistry>) -> Self {
        Self {
            collective: Some(registry),
        }
    }
}

#[async_trait]
impl EngineLauncher for SimLauncher {
    async fn backend_version(&self, _backend: Backend) -> Result<String> {
        Ok(EMULATED_BACKEND_VERSION.to_string())
    }

    async fn launch(&self, info: &EngineInfo, args: EngineArgs) -> Result<Box<dyn EngineBackend>> {
        let engine = SimEngine::new(SimOptions {
            model: args.model().to_string(),
            replica: info.replica,
            tp_size: args.tp_size(),
            seed: args.seed(),
            enable_prefix_caching: args.enable_prefix_caching(),
            max_model_len: args.max_model_len(),
            sampling_params: args.sampling_params().clone(),
        });
        let engine = match &self.collective {
            Some(registry) => engine.with_collective(registry.clone()),
            None => engine,
        };
        Ok(Box::new(engine))
    }
}

/// Launches one OS process per replica and drives it over HTTP
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: Vec<String>,
    host: String,
    base_port: u16,
    startup_timeout: Duration,
    version: Option<String>,
}

impl ProcessLauncher {
    pub fn new(command: Vec<String>, base_port: u16) -> Self {
        Self {
            command,
            host: "127.0.0.1".to_string(),
            base_port,
            startup_timeout: Duration::from_secs(600),
            version: None,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Port of the server of `replica`
    pub fn port_for(&self, replica: usize) -> Result<u16> {
        u16::try_from(replica)
            .ok()
            .and_then(|offset| self.base_port.checked_add(offset))
            .ok_or_else(|| {
                OrchestratorError::Config(format!(
                    "replica {replica} has no port above base port {}",
                    self.base_port
                ))
            })
    }

    /// Skip asking the command for its version
    pub fn with_backend_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn backend_version(&self, backend: Backend) -> Result<String> {
        if let Some(version) = &self.version {
            return Ok(version.clone());
        }
        let program = self
            .command
            .first()
            .ok_or_else(|| OrchestratorError::Config("empty engine command".to_string()))?;
        let output = Command::new(program).arg("--version").output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // "0.9.1" or "engine-sim 0.9.0"
        let version = stdout
            .split_whitespace()
            .last()
            .ok_or_else(|| {
                OrchestratorError::Launch(format!("`{program} --version` printed nothing"))
            })?
            .to_string();
        tracing::info!("Backend {} version {}", backend, version);
        Ok(version)
    }

    #[instrument(skip_all, fields(replica = info.replica))]
    async fn launch(&self, info: &EngineInfo, args: EngineArgs) -> Result<Box<dyn EngineBackend>> {
        let port = self.port_for(info.replica)?;
        let spec = LaunchSpec::new(&self.command, &args, &info.placement.devices, port)?;
        tracing::debug!("Replica<{}> launching {} {:?}", info.replica, spec.program, spec.args);

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // forward engine output as debug logs under the "engine" target
        let replica = info.replica;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "engine", replica, stream = "stdout", "{}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "engine", replica, stream = "stderr", "{}", line);
                }
            });
        }

        let mut engine = HttpEngine::new(
            info.replica,
            args.backend(),
            args.tp_size(),
            args.model(),
            format!("http://{}:{}", self.host, port),
        )
        .with_child(child)
        .with_sampling_params(args.sampling_params().clone())
        .with_async_engine(args.async_engine());
        if let Err(err) = engine.wait_healthy(self.startup_timeout).await {
            let _ = engine.teardown().await;
            return Err(err);
        }
        Ok(Box::new(engine))
    }
}

/// Builds the replicas of one pool
#[derive(Debug, Clone)]
pub struct EngineActorFactory {
    config: EngineConfig,
    launcher: Arc<dyn EngineLauncher>,
    scheduler: Arc<dyn ClusterScheduler>,
}

impl EngineActorFactory {
    pub fn new(
        config: EngineConfig,
        launcher: Arc<dyn EngineLauncher>,
        scheduler: Arc<dyn ClusterScheduler>,
    ) -> Self {
        Self {
            config,
            launcher,
            scheduler,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fail fast on a backend older than the minimum supported release
    pub async fn check_backend(&self) -> Result<String> {
        let version = self.launcher.backend_version(self.config.backend).await?;
        check_backend_version(self.config.backend, &version)?;
        Ok(version)
    }

    /// Bundles `[replica * tp, (replica + 1) * tp)` of `group`
    pub fn placement_for(
        &self,
        replica: usize,
        group: &PlacementGroup,
        gpu_share: f64,
    ) -> Result<EnginePlacement> {
        let tp = self.config.tensor_parallel_size;
        let bundle_indices: Vec<usize> = (replica * tp..(replica + 1) * tp).collect();
        if bundle_indices.last().map_or(true, |last| *last >= group.len()) {
            return Err(OrchestratorError::Resources(format!(
                "replica {replica} needs bundles {bundle_indices:?} but {} has {} bundles",
                group.id,
                group.len()
            )));
        }
        Ok(EnginePlacement {
            placement_group: group.id,
            devices: group.devices_for(&bundle_indices),
            bundle_indices,
            gpu_share,
        })
    }

    pub fn engine_args(&self, replica: usize, placement: &EnginePlacement) -> EngineArgs {
        let config = &self.config;
        let tp = config.tensor_parallel_size;
        let seed = config.seed + replica as u64;
        match config.backend {
            Backend::Vllm => EngineArgs::Vllm(VllmEngineArgs {
                model: config.model_path.clone(),
                enforce_eager: config.enforce_eager,
                tensor_parallel_size: tp,
                seed,
                distributed_executor_backend: if tp == 1 { "uni" } else { "ray" }.to_string(),
                max_model_len: config.max_model_len,
                enable_prefix_caching: config.enable_prefix_caching,
                dtype: config.model_dtype.clone(),
                trust_remote_code: true,
                disable_multiproc: config.disable_multiproc,
                gpu_memory_utilization: config.gpu_memory_utilization,
                enable_sleep_mode: config.enable_sleep,
                max_num_batched_tokens: config.max_num_batched_tokens,
                max_num_seqs: config.max_num_seqs,
                max_logprobs: 1,
                async_engine: config.async_engine,
                tokenizer: config.tokenizer.clone(),
                sampling_params: config.sampling_params.clone(),
                bundle_indices: placement.bundle_indices.clone(),
                num_gpus: placement.gpu_share,
            }),
            Backend::Sglang => EngineArgs::Sglang(SglangEngineArgs {
                model_path: config.model_path.clone(),
                tp_size: tp,
                mem_fraction_static: config.gpu_memory_utilization,
                random_seed: seed,
                context_length: config.max_model_len,
                disable_radix_cache: !config.enable_prefix_caching,
                dtype: config.model_dtype.clone(),
                trust_remote_code: true,
                max_prefill_tokens: config.max_num_batched_tokens,
                max_running_requests: config.max_num_seqs,
                attention_backend: "fa3".to_string(),
                mm_attention_backend: "fa3".to_string(),
                enable_memory_saver: config.enable_sleep,
                tokenizer_path: config.tokenizer.clone(),
                sampling_params: config.sampling_params.clone(),
                bundle_indices: placement.bundle_indices.clone(),
                num_gpus: placement.gpu_share,
            }),
        }
    }

    async fn release_leases(&self, leases: Vec<ShareLease>) {
        for lease in leases {
            if let Err(err) = self.scheduler.release_share(lease).await {
                tracing::warn!("Failed to release share on {}: {}", lease.placement_group, err);
            }
        }
    }

    pub async fn release(&self, leases: Vec<ShareLease>) {
        self.release_leases(leases).await
    }

    async fn create_engine(
        &self,
        replica: usize,
        group: &PlacementGroup,
        gpu_share: f64,
    ) -> Result<(EngineClient, Vec<ShareLease>)> {
        let placement = self.placement_for(replica, group, gpu_share)?;
        let mut leases = Vec::with_capacity(placement.bundle_indices.len());
        for &bundle_index in &placement.bundle_indices {
            match self
                .scheduler
                .reserve_share(group.id, bundle_index, gpu_share, gpu_share)
                .await
            {
                Ok(lease) => leases.push(lease),
                Err(err) => {
                    self.release_leases(leases).await;
                    return Err(err);
                }
            }
        }

        let args = self.engine_args(replica, &placement);
        let info = EngineInfo {
            replica,
            backend: self.config.backend,
            tp_size: self.config.tensor_parallel_size,
            placement,
            max_model_len: self.config.max_model_len,
        };
        match self.launcher.launch(&info, args).await {
            Ok(backend) => {
                tracing::info!(
                    "Replica<{}> => Launched on bundles {:?}",
                    replica,
                    info.placement.bundle_indices
                );
                Ok((spawn_engine(info, backend), leases))
            }
            Err(err) => {
                self.release_leases(leases).await;
                Err(err)
            }
        }
    }

    /// Launch every replica on `group`.
    ///
    /// Either all replicas come up, or the ones that did are torn down and
    /// every share is released before the first error is returned.
    #[instrument(skip_all, fields(replicas = self.config.num_inference_engines, group = %group.id))]
    pub async fn create_engines(
        &self,
        group: &PlacementGroup,
        gpu_share: f64,
    ) -> Result<(Vec<EngineClient>, Vec<ShareLease>)> {
        let results = join_all(
            (0..self.config.num_inference_engines)
                .map(|replica| self.create_engine(replica, group, gpu_share)),
        )
        .await;

        let mut engines = vec![];
        let mut leases = vec![];
        let mut first_error = None;
        for result in results {
            match result {
                Ok((engine, engine_leases)) => {
                    engines.push(engine);
                    leases.extend(engine_leases);
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            tracing::error!("Engine creation failed, tearing down {} replicas", engines.len());
            join_all(engines.iter().map(|engine| engine.teardown())).await;
            self.release_leases(leases).await;
            return Err(err);
        }
        Ok((engines, leases))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::{BundlePlanner, LocalCluster, PlacementStrategy};

    #[test]
    fn test_version_gate() {
        assert!(version_at_least("0.8.3", "0.8.3"));
        assert!(version_at_least("0.10.0", "0.8.3"));
        assert!(!version_at_least("0.8.2", "0.8.3"));
        assert!(version_at_least("0.4.8.post1", "0.4.8"));
        assert!(version_at_least("0.9.0rc1", "0.8.3"));
        assert!(check_backend_version(Backend::Vllm, "0.8.3").is_ok());
        assert_eq!(
            check_backend_version(Backend::Vllm, "0.7.3"),
            Err(OrchestratorError::IncompatibleBackendVersion {
                backend: "vllm".to_string(),
                found: "0.7.3".to_string(),
                required: "0.8.3".to_string(),
            })
        );
        assert!(check_backend_version(Backend::Sglang, "0.4.7").is_err());
        assert!(check_backend_version(Backend::Sglang, "garbage").is_err());
    }

    fn factory(config: EngineConfig, cluster: Arc<LocalCluster>) -> EngineActorFactory {
        EngineActorFactory::new(config, Arc::new(SimLauncher::new()), cluster)
    }

    async fn reserve(cluster: &Arc<LocalCluster>, bundles: usize) -> PlacementGroup {
        let planner = BundlePlanner::new(cluster.clone(), Duration::from_secs(1));
        planner
            .reserve(
                vec![crate::placement::Bundle::full_gpu(); bundles],
                PlacementStrategy::Pack,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bundle_slices_per_replica() {
        let cluster = Arc::new(LocalCluster::new(1, 8, 16.0));
        let mut config = EngineConfig::new("m", 2);
        config.tensor_parallel_size = 2;
        let factory = factory(config, cluster.clone());
        let group = reserve(&cluster, 4).await;

        assert_eq!(factory.placement_for(0, &group, 1.0).unwrap().bundle_indices, vec![0, 1]);
        let second = factory.placement_for(1, &group, 1.0).unwrap();
        assert_eq!(second.bundle_indices, vec![2, 3]);
        assert_eq!(second.devices.len(), 2);
        assert!(factory.placement_for(2, &group, 1.0).is_err());
    }

    #[tokio::test]
    async fn test_vllm_args() {
        let cluster = Arc::new(LocalCluster::new(1, 4, 8.0));
        let mut config = EngineConfig::new("Qwen/Qwen3-0.6B", 2);
        config.seed = 7;
        config.disable_multiproc = true;
        let factory = factory(config.clone(), cluster.clone());
        let group = reserve(&cluster, 2).await;

        let placement = factory.placement_for(1, &group, 1.0).unwrap();
        let args = factory.engine_args(1, &placement);
        let EngineArgs::Vllm(vllm) = &args else {
            panic!("expected vllm args");
        };
        assert_eq!(vllm.seed, 8);
        assert_eq!(vllm.distributed_executor_backend, "uni");
        assert_eq!(vllm.max_logprobs, 1);
        assert_eq!(vllm.bundle_indices, vec![1]);
        assert_eq!(vllm.max_num_batched_tokens, 8192);

        let cli = args.cli_args(8001);
        assert_eq!(cli[0], "Qwen/Qwen3-0.6B");
        assert!(cli.windows(2).any(|w| w == ["--port", "8001"]));
        assert!(cli.contains(&"--enable-prefix-caching".to_string()));
        assert!(!cli.contains(&"--enable-sleep-mode".to_string()));

        let env = args.env(&placement.devices);
        assert!(env.contains(&("VLLM_ENABLE_V1_MULTIPROCESSING".to_string(), "0".to_string())));
        assert!(env.contains(&("CUDA_VISIBLE_DEVICES".to_string(), "1".to_string())));

        let mut tp2 = config;
        tp2.tensor_parallel_size = 2;
        tp2.num_inference_engines = 1;
        let factory = EngineActorFactory::new(tp2, Arc::new(SimLauncher::new()), cluster);
        let EngineArgs::Vllm(vllm) = factory.engine_args(0, &placement) else {
            panic!("expected vllm args");
        };
        assert_eq!(vllm.distributed_executor_backend, "ray");
    }

    #[tokio::test]
    async fn test_sglang_args() {
        let cluster = Arc::new(LocalCluster::new(1, 2, 4.0));
        let mut config = EngineConfig::new("m", 1);
        config.backend = Backend::Sglang;
        config.enable_prefix_caching = false;
        config.enable_sleep = true;
        config.gpu_memory_utilization = Some(0.7);
        let factory = factory(config, cluster.clone());
        let group = reserve(&cluster, 1).await;
        let placement = factory.placement_for(0, &group, 1.0).unwrap();

        let args = factory.engine_args(0, &placement);
        let EngineArgs::Sglang(sglang) = &args else {
            panic!("expected sglang args");
        };
        assert!(sglang.disable_radix_cache);
        assert!(sglang.enable_memory_saver);
        assert_eq!(sglang.random_seed, 42);
        assert_eq!(sglang.attention_backend, "fa3");
        assert_eq!(sglang.mm_attention_backend, "fa3");
        assert_eq!(sglang.mem_fraction_static, Some(0.7));
        assert_eq!(sglang.max_running_requests, 1024);

        let spec = LaunchSpec::new(
            &["python".to_string(), "-m".to_string(), "sglang.launch_server".to_string()],
            &args,
            &placement.devices,
            30000,
        )
        .unwrap();
        assert_eq!(spec.program, "python");
        assert_eq!(&spec.args[..4], ["-m", "sglang.launch_server", "--model-path", "m"]);
        assert!(!spec.env.iter().any(|(key, _)| key.starts_with("VLLM_")));
    }

    #[tokio::test]
    async fn test_tokenizer_flag_per_dialect() {
        let cluster = Arc::new(LocalCluster::new(1, 2, 4.0));
        let group = reserve(&cluster, 1).await;
        let mut config = EngineConfig::new("m", 1);
        config.tokenizer = Some("tok/path".to_string());
        config.async_engine = true;

        let factory = factory(config.clone(), cluster.clone());
        let placement = factory.placement_for(0, &group, 1.0).unwrap();
        let vllm = factory.engine_args(0, &placement);
        assert!(vllm.async_engine());
        assert!(vllm.cli_args(8000).windows(2).any(|w| w == ["--tokenizer", "tok/path"]));

        config.backend = Backend::Sglang;
        config.async_engine = false;
        let sglang = EngineActorFactory::new(config, Arc::new(SimLauncher::new()), cluster)
            .engine_args(0, &placement);
        assert!(!sglang.async_engine());
        assert!(sglang
            .cli_args(30000)
            .windows(2)
            .any(|w| w == ["--tokenizer-path", "tok/path"]));
    }

    #[test]
    fn test_port_for_replica() {
        let launcher = ProcessLauncher::new(vec!["engine-sim".to_string()], 8100);
        assert_eq!(launcher.port_for(3).unwrap(), 8103);
        let high = ProcessLauncher::new(vec!["engine-sim".to_string()], u16::MAX - 1);
        assert_eq!(high.port_for(1).unwrap(), u16::MAX);
        assert!(matches!(high.port_for(2), Err(OrchestratorError::Config(_))));
        assert!(matches!(
            launcher.port_for(usize::from(u16::MAX) + 1),
            Err(OrchestratorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_configured_sampling_params_reach_engines() {
        let cluster = Arc::new(LocalCluster::new(1, 1, 2.0));
        let group = reserve(&cluster, 1).await;
        let mut config = EngineConfig::new("m", 1);
        config.sampling_params.max_tokens = 1;
        let (engines, _leases) = factory(config, cluster)
            .create_engines(&group, 1.0)
            .await
            .unwrap();
        let output = engines[0]
            .generate(crate::engine::GenerateInput::new(vec!["a".into(), "b".into()]))
            .await
            .unwrap();
        assert!(output.responses.iter().all(|r| r.split(' ').count() == 1));
    }

    #[derive(Debug)]
    struct FailingLauncher {
        fail_replica: usize,
    }

    #[async_trait]
    impl EngineLauncher for FailingLauncher {
        async fn backend_version(&self, _backend: Backend) -> Result<String> {
            Ok("0.8.5".to_string())
        }

        async fn launch(&self, info: &EngineInfo, args: EngineArgs) -> Result<Box<dyn EngineBackend>> {
            if info.replica == self.fail_replica {
                return Err(OrchestratorError::Launch("no such model".to_string()));
            }
            SimLauncher::new().launch(info, args).await
        }
    }

    #[tokio::test]
    async fn test_failed_launch_releases_shares() {
        let cluster = Arc::new(LocalCluster::new(1, 4, 8.0));
        let group = reserve(&cluster, 3).await;
        let factory = EngineActorFactory::new(
            EngineConfig::new("m", 3),
            Arc::new(FailingLauncher { fail_replica: 1 }),
            cluster.clone(),
        );
        let err = factory.create_engines(&group, 1.0).await.unwrap_err();
        assert_eq!(err, OrchestratorError::Launch("no such model".to_string()));

        // every bundle can be fully admitted again
        for bundle in 0..3 {
            cluster.reserve_share(group.id, bundle, 1.0, 1.0).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_create_engines_admits_shares() {
        let cluster = Arc::new(LocalCluster::new(1, 2, 4.0));
        let group = reserve(&cluster, 2).await;
        let factory = factory(EngineConfig::new("m", 2), cluster.clone());
        let (engines, leases) = factory.create_engines(&group, 0.2).await.unwrap();
        assert_eq!(engines.len(), 2);
        assert_eq!(leases.len(), 2);
        assert_eq!(engines[1].info().placement.bundle_indices, vec![1]);
        assert!((engines[0].info().placement.gpu_share - 0.2).abs() < 1e-9);
        // four more colocated actors fit next to each engine, a fifth does not
        for _ in 0..4 {
            cluster.reserve_share(group.id, 0, 0.2, 0.2).await.unwrap();
        }
        assert!(cluster.reserve_share(group.id, 0, 0.2, 0.2).await.is_err());
    }
}
