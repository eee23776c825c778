// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::sdk::propagation::TraceContextPropagator;
use opentelemetry::sdk::trace;
use opentelemetry::sdk::trace::Sampler;
use opentelemetry::sdk::Resource;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use orchestrator::config::{Backend, EngineConfig};
use orchestrator::engine::{CommBackend, CommunicatorHandle, DType, GenerateInput, MemoryTag, WeightTensor};
use orchestrator::error::OrchestratorError;
use orchestrator::factory::{EngineLauncher, ProcessLauncher, SimLauncher};
use orchestrator::placement::{Bundle, BundlePlanner, ClusterScheduler, LocalCluster, PlacementStrategy};
use orchestrator::pool::EnginePool;
use orchestrator::weight_sync::WeightSyncCoordinator;
use orchestrator::CollectiveRegistry;
use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LauncherKind {
    /// Emulated engines inside this process
    Sim,
    /// One engine server process per replica
    Process,
}

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(required = true, long, env)]
    config_path: String,
    #[clap(default_value = "sim", long, env, value_enum)]
    launcher: LauncherKind,
    #[clap(default_value = "1", long, env)]
    num_nodes: usize,
    #[clap(default_value = "8", long, env)]
    num_gpus_per_node: u32,
    #[clap(default_value = "64", long, env)]
    cpus_per_node: f64,
    /// Newline separated prompts to run through the pool once it is up
    #[clap(long, env)]
    prompts_path: Option<String>,
    /// Engine server command, defaults to the backend's own entrypoint
    #[clap(long, env)]
    engine_command: Option<String>,
    #[clap(default_value = "8100", long, env)]
    base_port: u16,
    #[clap(long, env)]
    backend_version: Option<String>,
    /// Push one synthetic tensor through the weight update group (sim launcher only)
    #[clap(long)]
    sync_weights: bool,
    /// Tear down after the prompts instead of waiting for ctrl-c
    #[clap(long)]
    once: bool,
    #[clap(long, env)]
    json_output: bool,
    #[clap(long, env)]
    otlp_endpoint: Option<String>,
    #[clap(long, env)]
    log_path: Option<String>,
    #[clap(long, env)]
    prometheus_port: Option<u16>,
}

fn default_engine_command(backend: Backend) -> Vec<String> {
    match backend {
        Backend::Vllm => vec!["vllm".to_string(), "serve".to_string()],
        Backend::Sglang => ["python", "-m", "sglang.launch_server"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    }
}

fn main() -> Result<(), AppError> {
    let args = Args::parse();
    let Args {
        config_path,
        launcher,
        num_nodes,
        num_gpus_per_node,
        cpus_per_node,
        prompts_path,
        engine_command,
        base_port,
        backend_version,
        sync_weights,
        once,
        json_output,
        otlp_endpoint,
        log_path,
        prometheus_port,
    } = args;

    let config = EngineConfig::from_file(&config_path)?;
    if sync_weights && !matches!(launcher, LauncherKind::Sim) {
        return Err(AppError::ArgumentValidation(
            "`--sync-weights` needs the sim launcher".to_string(),
        ));
    }

    let _guard = init_logging(otlp_endpoint, json_output, log_path)?;

    let app = async move {
        if let Some(port) = prometheus_port {
            PrometheusBuilder::new()
                .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
                .install()
                .map_err(|e| AppError::Metrics(e.to_string()))?;
        }

        let registry = Arc::new(CollectiveRegistry::new());
        let launcher: Arc<dyn EngineLauncher> = match launcher {
            LauncherKind::Sim => Arc::new(SimLauncher::with_collective(registry.clone())),
            LauncherKind::Process => {
                let command = match engine_command {
                    Some(command) => command.split_whitespace().map(String::from).collect(),
                    None => default_engine_command(config.backend),
                };
                let launcher = ProcessLauncher::new(command, base_port);
                Arc::new(match backend_version {
                    Some(version) => launcher.with_backend_version(version),
                    None => launcher,
                })
            }
        };
        let scheduler: Arc<dyn ClusterScheduler> =
            Arc::new(LocalCluster::new(num_nodes, num_gpus_per_node, cpus_per_node));

        // Colocated engines join the group the trainer would otherwise hold
        let shared_pg = if config.colocate_all {
            let planner = BundlePlanner::new(scheduler.clone(), config.placement_timeout());
            let bundles =
                vec![Bundle::full_gpu(); config.num_inference_engines * config.tensor_parallel_size];
            Some(planner.reserve(bundles, PlacementStrategy::Pack).await?)
        } else {
            None
        };

        let mut pool = EnginePool::create(config.clone(), shared_pg, scheduler, launcher).await?;
        let result = drive(&pool, &registry, prompts_path, sync_weights, once).await;
        pool.teardown().await?;
        result
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(app)
}

async fn drive(
    pool: &EnginePool,
    registry: &CollectiveRegistry,
    prompts_path: Option<String>,
    sync_weights: bool,
    once: bool,
) -> Result<(), AppError> {
    if pool.config().enable_sleep {
        pool.wake_up_all(vec![MemoryTag::Weights]).await?;
    }
    if sync_weights {
        let handle = CommunicatorHandle {
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
            rank_offset: 1,
            world_size: 1 + pool.num_engine_ranks(),
            group_name: "rl_weights".to_string(),
            backend: CommBackend::Nccl,
            override_existing: false,
        };
        let tensor = WeightTensor::new("lm_head.weight", DType::Float32, vec![4, 4], vec![1u8; 64])?;
        let report = WeightSyncCoordinator::for_pool(pool)
            .sync_weights(&handle, &[tensor], registry)
            .await?;
        tracing::info!(
            "Synced {} tensors ({} bytes) in {:?}",
            report.tensors,
            report.bytes,
            report.elapsed
        );
    }
    if pool.config().enable_sleep {
        pool.wake_up_all(vec![MemoryTag::KvCache]).await?;
    }

    if let Some(path) = prompts_path {
        let prompts: Vec<String> = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| AppError::ArgumentValidation(format!("{path}: {e}")))?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(String::from)
            .collect();
        let output = pool
            .generate(GenerateInput {
                prompts: prompts.clone(),
                sampling_params: Some(pool.config().sampling_params.clone()),
            })
            .await?;
        for (prompt, (response, stop_reason)) in prompts
            .iter()
            .zip(output.responses.iter().zip(&output.stop_reasons))
        {
            println!(
                "{}",
                serde_json::json!({ "prompt": prompt, "response": response, "stop_reason": stop_reason })
            );
        }
    }

    if !once {
        tracing::info!("Serving {} replicas, ctrl-c to stop", pool.len());
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

/// Init logging from the command line and the LOG_LEVEL env variable:
///     - otlp_endpoint is an optional URL to an Open Telemetry collector
///     - json_output switches the fmt layer to JSON lines
///     - log_path sends the fmt layer to a file instead of stdout
///     - LOG_LEVEL is an EnvFilter directive such as `info` or `orchestrator=debug` (default to info)
fn init_logging(
    otlp_endpoint: Option<String>,
    json_output: bool,
    log_path: Option<String>,
) -> Result<Option<WorkerGuard>, AppError> {
    let mut layers = Vec::new();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true);

    let guard = match log_path {
        Some(path) => {
            let (non_blocking, guard) = NonBlocking::new(std::fs::File::create(path)?);
            let fmt_layer = fmt_layer.with_ansi(false).with_writer(non_blocking);
            let fmt_layer = match json_output {
                true => fmt_layer.json().flatten_event(true).boxed(),
                false => fmt_layer.boxed(),
            };
            layers.push(fmt_layer);
            Some(guard)
        }
        None => {
            let fmt_layer = match json_output {
                true => fmt_layer.json().flatten_event(true).boxed(),
                false => fmt_layer.boxed(),
            };
            layers.push(fmt_layer);
            None
        }
    };

    // OpenTelemetry tracing layer
    if let Some(otlp_endpoint) = otlp_endpoint {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(otlp_endpoint),
            )
            .with_trace_config(
                trace::config()
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        "blitz.orchestrator",
                    )]))
                    .with_sampler(Sampler::AlwaysOn),
            )
            .install_batch(opentelemetry::runtime::Tokio);

        if let Ok(tracer) = tracer {
            layers.push(tracing_opentelemetry::layer().with_tracer(tracer).boxed());
            init_tracing_opentelemetry::init_propagator()
                .map_err(|e| AppError::Logging(e.to_string()))?;
        };
    }

    let env_filter =
        EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .init();
    Ok(guard)
}

#[derive(Debug, Error)]
enum AppError {
    #[error("Argument validation error: {0}")]
    ArgumentValidation(String),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("Could not set up logging: {0}")]
    Logging(String),
    #[error("Could not install the metrics exporter: {0}")]
    Metrics(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
