// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestrator::config::EngineConfig;
use orchestrator::engine::sim::{SimEngine, SimOptions};
use orchestrator::engine::{
    CommBackend, CommunicatorHandle, DType, EngineBackend, GenerateInput, GenerateOutput,
    MemoryTag, SleepLevel, WeightTensor,
};
use orchestrator::error::{OrchestratorError, Result};
use orchestrator::factory::SimLauncher;
use orchestrator::placement::{
    Bundle, BundlePlanner, ClusterScheduler, LocalCluster, PlacementStrategy,
};
use orchestrator::pool::EnginePool;
use orchestrator::weight_sync::{WeightBroadcaster, WeightSyncCoordinator};
use orchestrator::CollectiveRegistry;

const GROUP: &str = "rl_weights";
const TP: usize = 2;

fn handle(rank_offset: usize, world_size: usize) -> CommunicatorHandle {
    CommunicatorHandle {
        master_addr: "127.0.0.1".to_string(),
        master_port: 29500,
        rank_offset,
        world_size,
        group_name: GROUP.to_string(),
        backend: CommBackend::Nccl,
        override_existing: false,
    }
}

fn tensors() -> Vec<WeightTensor> {
    vec![
        WeightTensor::new("embed.weight", DType::Bfloat16, vec![8, 4], vec![3; 64]).unwrap(),
        WeightTensor::new("lm_head.weight", DType::Float32, vec![4, 4], vec![7; 64]).unwrap(),
    ]
}

fn prompts() -> Vec<String> {
    vec!["reward the policy".to_string(), "sample a rollout".to_string()]
}

/// Standalone engine for `replica` that received `tensors` over its own group
async fn reference(replica: usize, tensors: &[WeightTensor]) -> SimEngine {
    let registry = Arc::new(CollectiveRegistry::new());
    let mut engine = SimEngine::new(SimOptions {
        replica,
        tp_size: TP,
        seed: EngineConfig::new("m", 1).seed + replica as u64,
        ..SimOptions::new("m")
    })
    .with_collective(registry.clone());
    let handle = handle(1, 1 + TP);
    engine.init_weight_update_communicator(handle.clone()).await.unwrap();
    for tensor in tensors {
        registry.stage(&handle, tensor).unwrap();
        engine.update_named_weight(tensor.request(GROUP)).await.unwrap();
    }
    engine
}

async fn expected_output(tensors: &[WeightTensor]) -> GenerateOutput {
    let mut output = GenerateOutput::default();
    for (replica, prompt) in prompts().into_iter().enumerate() {
        let mut engine = reference(replica, tensors).await;
        output.extend(engine.generate(GenerateInput::new(vec![prompt])).await.unwrap());
    }
    output
}

#[tokio::test]
async fn test_colocated_train_sync_serve_cycle() {
    let cluster = Arc::new(LocalCluster::new(1, 4, 8.0));
    let registry = Arc::new(CollectiveRegistry::new());
    let planner = BundlePlanner::new(cluster.clone(), Duration::from_secs(1));
    let training_pg = planner
        .reserve(vec![Bundle::full_gpu(); 4], PlacementStrategy::Pack)
        .await
        .unwrap();

    let mut config = EngineConfig::new("m", 2);
    config.tensor_parallel_size = TP;
    config.colocate_all = true;
    config.enable_sleep = true;
    let mut pool = EnginePool::create(
        config,
        Some(training_pg),
        cluster.clone(),
        Arc::new(SimLauncher::with_collective(registry.clone())),
    )
    .await
    .unwrap();
    assert_eq!(cluster.placement_groups_created(), 1);

    // engines start asleep while the trainer owns the GPUs
    let err = pool.generate(GenerateInput::new(prompts())).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::EngineAsleep(_)));

    pool.wake_up_all(vec![MemoryTag::Weights]).await.unwrap();
    let mut coordinator = WeightSyncCoordinator::for_pool(&pool);
    let report = coordinator
        .sync_weights(&handle(1, 1 + pool.num_engine_ranks()), &tensors(), registry.as_ref())
        .await
        .unwrap();
    assert_eq!(report.tensors, 2);
    assert_eq!(report.bytes, 128);
    assert_eq!(registry.members(GROUP), vec![1, 2, 3, 4]);

    // weights are back but the KV cache is not
    assert!(pool.generate(GenerateInput::new(prompts())).await.is_err());
    pool.wake_up_all(vec![MemoryTag::KvCache]).await.unwrap();

    let served = pool.generate(GenerateInput::new(prompts())).await.unwrap();
    assert_eq!(served, expected_output(&tensors()).await);

    pool.teardown().await.unwrap();
}

#[tokio::test]
async fn test_sync_invalidates_cached_completions() {
    let cluster = Arc::new(LocalCluster::new(1, 4, 8.0));
    let registry = Arc::new(CollectiveRegistry::new());
    let mut config = EngineConfig::new("m", 2);
    config.tensor_parallel_size = TP;
    let mut pool = EnginePool::create(
        config,
        None,
        cluster,
        Arc::new(SimLauncher::with_collective(registry.clone())),
    )
    .await
    .unwrap();

    let first = tensors();
    let mut coordinator = WeightSyncCoordinator::for_pool(&pool);
    let handle = handle(1, 1 + pool.num_engine_ranks());
    coordinator
        .sync_weights(&handle, &first, registry.as_ref())
        .await
        .unwrap();
    let before = pool.generate(GenerateInput::new(prompts())).await.unwrap();
    assert_eq!(before, expected_output(&first).await);

    let second = vec![WeightTensor::new("lm_head.weight", DType::Float32, vec![4, 4], vec![9; 64]).unwrap()];
    coordinator
        .sync_weights(&handle, &second, registry.as_ref())
        .await
        .unwrap();
    let after = pool.generate(GenerateInput::new(prompts())).await.unwrap();
    let mut all = first.clone();
    all.extend(second);
    assert_eq!(after, expected_output(&all).await);

    pool.teardown().await.unwrap();
}

#[tokio::test]
async fn test_sleep_wake_keeps_outputs() {
    let cluster = Arc::new(LocalCluster::new(1, 2, 4.0));
    let mut pool = EnginePool::create(
        EngineConfig::new("m", 2),
        None,
        cluster,
        Arc::new(SimLauncher::new()),
    )
    .await
    .unwrap();

    let input = GenerateInput::new(prompts());
    let before = pool.generate(input.clone()).await.unwrap();
    pool.sleep_all(SleepLevel::Offload).await.unwrap();
    // a second sleep is a no-op
    pool.sleep_all(SleepLevel::Offload).await.unwrap();
    pool.wake_up_all(vec![]).await.unwrap();
    assert_eq!(pool.generate(input).await.unwrap(), before);

    pool.teardown().await.unwrap();
    pool.teardown().await.unwrap();
}

#[tokio::test]
async fn test_unsupported_backend_leaks_nothing() {
    let config = r#"
        num_inference_engines = 2
        model_path = "m"
        backend = "tensorrt"
    "#;
    assert_eq!(
        EngineConfig::from_toml(config).unwrap_err(),
        OrchestratorError::UnsupportedBackend("tensorrt".to_string())
    );

    // the orchestrator refuses to start before it reserves anything
    let path = std::env::temp_dir().join(format!("orchestrator-{}-tensorrt.toml", std::process::id()));
    std::fs::write(&path, config).unwrap();
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_orchestrator"))
        .arg("--config-path")
        .arg(&path)
        .arg("--once")
        .env("LOG_LEVEL", "info")
        .output()
        .unwrap();
    std::fs::remove_file(&path).unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("UnsupportedBackend(\"tensorrt\")"), "{stderr}");
}

struct SilentBroadcaster;

#[async_trait]
impl WeightBroadcaster for SilentBroadcaster {
    async fn broadcast(&self, _handle: &CommunicatorHandle, _tensor: &WeightTensor) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_sync_timeout_then_retry_and_teardown() {
    let cluster = Arc::new(LocalCluster::new(1, 4, 8.0));
    let registry = Arc::new(CollectiveRegistry::new());
    let mut config = EngineConfig::new("m", 2);
    config.weight_sync_timeout_secs = 1;
    config.sampling_params.max_tokens = 1;
    let mut pool = EnginePool::create(
        config,
        None,
        cluster.clone(),
        Arc::new(SimLauncher::with_collective(registry.clone())),
    )
    .await
    .unwrap();

    // configured sampling defaults apply to requests without their own
    let served = pool.generate(GenerateInput::new(prompts())).await.unwrap();
    assert!(served.responses.iter().all(|r| r.split(' ').count() == 1));

    let mut coordinator = WeightSyncCoordinator::for_pool(&pool);
    let handle = handle(1, 1 + pool.num_engine_ranks());
    let err = coordinator
        .sync_weights(&handle, &tensors(), &SilentBroadcaster)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OrchestratorError::WeightSyncFailure {
            step: "update_named_weight(embed.weight)".to_string(),
            replicas: vec![0, 1],
        }
    );

    // the replicas are free again, so a retry lands
    coordinator
        .sync_weights(&handle, &tensors(), registry.as_ref())
        .await
        .unwrap();

    // teardown interrupts a sync that is still waiting on its broadcast
    let mut patient = WeightSyncCoordinator::new(pool.engines().to_vec(), Duration::from_secs(600));
    let stuck = {
        // a fresh coordinator rebuilds the group before waiting on the update
        let handle = CommunicatorHandle {
            override_existing: true,
            ..handle.clone()
        };
        tokio::spawn(async move {
            patient
                .sync_weights(&handle, &tensors(), &SilentBroadcaster)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    tokio::time::timeout(Duration::from_secs(5), pool.teardown())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        stuck.await.unwrap().unwrap_err(),
        OrchestratorError::WeightSyncFailure {
            step: "update_named_weight(embed.weight)".to_string(),
            replicas: vec![0, 1],
        }
    );
    assert_eq!(cluster.free_gpus(), 4);
}
