// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
//! Stand-in for a GPU serving backend.
//!
//! `engine-sim serve <model>` accepts the vLLM server flags and
//! `engine-sim launch-server --model-path <model>` the SGLang ones; both serve
//! a simulated engine over the matching HTTP API.
use clap::{Args, Parser, Subcommand};
use orchestrator::config::Backend;
use orchestrator::engine::serve::router;
use orchestrator::engine::sim::{SimEngine, SimOptions, EMULATED_BACKEND_VERSION};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(name = "engine-sim", version = EMULATED_BACKEND_VERSION, about)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// vLLM style server
    Serve(VllmServe),
    /// SGLang style server
    LaunchServer(SglangServe),
}

#[derive(Args, Debug)]
struct VllmServe {
    model: String,
    #[clap(default_value = "127.0.0.1", long)]
    host: String,
    #[clap(default_value = "8000", long)]
    port: u16,
    #[clap(default_value = "1", long)]
    tensor_parallel_size: usize,
    #[clap(default_value = "0", long)]
    seed: u64,
    #[clap(long)]
    distributed_executor_backend: Option<String>,
    #[clap(default_value = "4096", long)]
    max_model_len: u32,
    #[clap(long)]
    dtype: Option<String>,
    #[clap(long)]
    max_num_batched_tokens: Option<u32>,
    #[clap(long)]
    max_num_seqs: Option<u32>,
    #[clap(long)]
    max_logprobs: Option<u32>,
    #[clap(long)]
    gpu_memory_utilization: Option<f32>,
    #[clap(long)]
    tokenizer: Option<String>,
    #[clap(long)]
    enforce_eager: bool,
    #[clap(long)]
    enable_prefix_caching: bool,
    #[clap(long)]
    enable_sleep_mode: bool,
    #[clap(long)]
    trust_remote_code: bool,
}

#[derive(Args, Debug)]
struct SglangServe {
    #[clap(long)]
    model_path: String,
    #[clap(default_value = "127.0.0.1", long)]
    host: String,
    #[clap(default_value = "30000", long)]
    port: u16,
    #[clap(default_value = "1", long)]
    tp_size: usize,
    #[clap(default_value = "0", long)]
    random_seed: u64,
    #[clap(default_value = "4096", long)]
    context_length: u32,
    #[clap(long)]
    dtype: Option<String>,
    #[clap(long)]
    max_prefill_tokens: Option<u32>,
    #[clap(long)]
    max_running_requests: Option<u32>,
    #[clap(long)]
    attention_backend: Option<String>,
    #[clap(long)]
    mm_attention_backend: Option<String>,
    #[clap(long)]
    mem_fraction_static: Option<f32>,
    #[clap(long)]
    tokenizer_path: Option<String>,
    #[clap(long)]
    disable_radix_cache: bool,
    #[clap(long)]
    enable_memory_saver: bool,
    #[clap(long)]
    trust_remote_code: bool,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (backend, host, port, options) = match Cli::parse().command {
        Command::Serve(args) => {
            if let Some(tokenizer) = &args.tokenizer {
                tracing::info!("Tokenizer {} (generation is simulated)", tokenizer);
            }
            let options = SimOptions {
                tp_size: args.tensor_parallel_size,
                seed: args.seed,
                enable_prefix_caching: args.enable_prefix_caching,
                max_model_len: args.max_model_len,
                ..SimOptions::new(args.model)
            };
            (Backend::Vllm, args.host, args.port, options)
        }
        Command::LaunchServer(args) => {
            if let Some(tokenizer) = &args.tokenizer_path {
                tracing::info!("Tokenizer {} (generation is simulated)", tokenizer);
            }
            let options = SimOptions {
                tp_size: args.tp_size,
                seed: args.random_seed,
                enable_prefix_caching: !args.disable_radix_cache,
                max_model_len: args.context_length,
                ..SimOptions::new(args.model_path)
            };
            (Backend::Sglang, args.host, args.port, options)
        }
    };

    let listener = TcpListener::bind((host.as_str(), port)).await?;
    let port = listener.local_addr()?.port();
    tracing::info!("Serving {} as {} on port {}", options.model, backend, port);
    println!("READY {port}");
    axum::serve(listener, router(backend, SimEngine::new(options))).await
}
