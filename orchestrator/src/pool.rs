// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tracing::instrument;

use crate::config::EngineConfig;
use crate::engine::{EngineClient, GenerateInput, GenerateOutput, MemoryTag, SleepLevel};
use crate::error::{OrchestratorError, Result};
use crate::factory::{EngineActorFactory, EngineLauncher};
use crate::placement::{BundlePlan, BundlePlanner, ClusterScheduler, PlacementGroup, ShareLease};

/// Ordered set of engine replicas sharing one placement group.
///
/// Replica order is fixed at construction and is the order every bulk
/// operation and [`EnginePool::engines`] report.
#[derive(Debug)]
pub struct EnginePool {
    engines: Vec<EngineClient>,
    leases: Vec<ShareLease>,
    factory: EngineActorFactory,
    planner: BundlePlanner,
    placement_group: PlacementGroup,
    owns_placement_group: bool,
    torn_down: bool,
}

impl EnginePool {
    /// Reserve resources and bring up every replica.
    ///
    /// `shared_pg` selects colocation: engines are admitted onto the training
    /// placement group with a fractional GPU share instead of reserving their
    /// own. Nothing acquired here outlives a failed construction.
    #[instrument(skip_all, fields(replicas = config.num_inference_engines, backend = %config.backend))]
    pub async fn create(
        config: EngineConfig,
        shared_pg: Option<PlacementGroup>,
        scheduler: Arc<dyn ClusterScheduler>,
        launcher: Arc<dyn EngineLauncher>,
    ) -> Result<Self> {
        config.validate()?;
        if config.colocate_all && shared_pg.is_none() {
            return Err(OrchestratorError::Config(
                "`colocate_all` needs the training placement group".to_string(),
            ));
        }
        let planner = BundlePlanner::new(scheduler.clone(), config.placement_timeout());
        let factory = EngineActorFactory::new(config.clone(), launcher, scheduler);
        let version = factory.check_backend().await?;
        tracing::info!("Using {} {}", config.backend, version);

        let plan = BundlePlanner::plan(
            config.num_inference_engines,
            config.tensor_parallel_size,
            shared_pg.is_some(),
            config.packing_denominator,
        )?;
        let gpu_share = plan.gpu_share();
        let (placement_group, owns_placement_group) = match (plan, shared_pg) {
            (BundlePlan::Colocated { .. }, Some(group)) => (group, false),
            (BundlePlan::Dedicated { bundles, strategy }, _) => {
                (planner.reserve(bundles, strategy).await?, true)
            }
            (BundlePlan::Colocated { .. }, None) => {
                return Err(OrchestratorError::Config(
                    "colocated plan without a shared placement group".to_string(),
                ))
            }
        };

        let (engines, leases) = match factory.create_engines(&placement_group, gpu_share).await {
            Ok(created) => created,
            Err(err) => {
                if owns_placement_group {
                    let _ = planner.release(&placement_group).await;
                }
                return Err(err);
            }
        };

        let mut pool = Self {
            engines,
            leases,
            factory,
            planner,
            placement_group,
            owns_placement_group,
            torn_down: false,
        };
        if config.enable_sleep {
            if let Err(err) = pool.sleep_all(SleepLevel::Offload).await {
                let _ = pool.teardown().await;
                return Err(err);
            }
        }
        tracing::info!(
            "EnginePool => Ready({} replicas on {})",
            pool.len(),
            pool.placement_group.id
        );
        Ok(pool)
    }

    pub fn engines(&self) -> &[EngineClient] {
        &self.engines
    }

    pub fn get(&self, replica: usize) -> Option<&EngineClient> {
        self.engines.get(replica)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn config(&self) -> &EngineConfig {
        self.factory.config()
    }

    pub fn placement_group(&self) -> &PlacementGroup {
        &self.placement_group
    }

    pub fn owns_placement_group(&self) -> bool {
        self.owns_placement_group
    }

    /// Engine ranks across all replicas
    pub fn num_engine_ranks(&self) -> usize {
        self.engines.iter().map(EngineClient::tp_size).sum()
    }

    // Issue `call` to every replica at once and wait for all of them
    async fn fan_out<'a, F, Fut>(&'a self, op: &str, call: F) -> Result<()>
    where
        F: Fn(&'a EngineClient) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let results = join_all(self.engines.iter().map(call)).await;
        let mut first_error = None;
        for (replica, result) in results.into_iter().enumerate() {
            if let Err(err) = result {
                tracing::error!("Replica<{}> {} failed: {}", replica, op, err);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    #[instrument(skip(self))]
    pub async fn sleep_all(&self, level: SleepLevel) -> Result<()> {
        self.fan_out("sleep", |engine| engine.sleep(level)).await
    }

    /// Wake `tags` on every replica, everything when `tags` is empty
    #[instrument(skip(self))]
    pub async fn wake_up_all(&self, tags: Vec<MemoryTag>) -> Result<()> {
        self.fan_out("wake_up", |engine| engine.wake_up(tags.clone()))
            .await
    }

    #[instrument(skip(self))]
    pub async fn reset_prefix_cache_all(&self) -> Result<()> {
        self.fan_out("reset_prefix_cache", |engine| engine.reset_prefix_cache())
            .await
    }

    /// Split the prompts into contiguous chunks, one per replica, and
    /// reassemble the outputs in prompt order.
    #[instrument(skip_all, fields(prompts = input.prompts.len()))]
    pub async fn generate(&self, input: GenerateInput) -> Result<GenerateOutput> {
        if input.prompts.is_empty() || self.engines.is_empty() {
            return Ok(GenerateOutput::default());
        }
        let chunk_size = input.prompts.len().div_ceil(self.engines.len());
        let requests = input
            .prompts
            .chunks(chunk_size)
            .zip(&self.engines)
            .map(|(prompts, engine)| {
                engine.generate(GenerateInput {
                    prompts: prompts.to_vec(),
                    sampling_params: input.sampling_params.clone(),
                })
            });
        let mut output = GenerateOutput::default();
        for result in join_all(requests).await {
            output.extend(result?);
        }
        Ok(output)
    }

    /// Tear down every replica and release what the pool holds.
    ///
    /// A shared placement group stays with its owner.
    #[instrument(skip(self))]
    pub async fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let result = self
            .fan_out("teardown", |engine| async move {
                match engine.teardown().await {
                    Err(OrchestratorError::EngineUnavailable(_)) => Ok(()),
                    other => other,
                }
            })
            .await;
        self.factory.release(std::mem::take(&mut self.leases)).await;
        if self.owns_placement_group {
            if let Err(err) = self.planner.release(&self.placement_group).await {
                tracing::error!("Failed to remove {}: {}", self.placement_group.id, err);
                // an engine teardown failure came first
                return result.and(Err(err));
            }
        }
        tracing::info!("EnginePool => TornDown");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::config::Backend;
    use crate::engine::EngineBackend;
    use crate::engine::EngineInfo;
    use crate::factory::{EngineArgs, SimLauncher};
    use crate::placement::{Bundle, LocalCluster, PlacementStrategy};

    fn sim() -> Arc<dyn EngineLauncher> {
        Arc::new(SimLauncher::new())
    }

    #[tokio::test]
    async fn test_dedicated_bundles_per_replica() {
        let cluster = Arc::new(LocalCluster::new(1, 8, 16.0));
        let mut config = EngineConfig::new("m", 2);
        config.tensor_parallel_size = 2;
        let mut pool = EnginePool::create(config, None, cluster.clone(), sim())
            .await
            .unwrap();

        assert_eq!(cluster.placement_groups_created(), 1);
        let group = pool.placement_group();
        assert_eq!(group.bundles, vec![Bundle { gpu: 1.0, cpu: 1.0 }; 4]);
        assert_eq!(group.strategy, PlacementStrategy::Pack);
        assert_eq!(pool.engines()[0].info().placement.bundle_indices, vec![0, 1]);
        assert_eq!(pool.engines()[1].info().placement.bundle_indices, vec![2, 3]);
        assert_eq!(pool.num_engine_ranks(), 4);
        assert_eq!(cluster.free_gpus(), 4);

        pool.teardown().await.unwrap();
        assert_eq!(cluster.free_gpus(), 8);
    }

    #[tokio::test]
    async fn test_colocated_pool_adopts_shared_group() {
        let cluster = Arc::new(LocalCluster::new(1, 4, 8.0));
        let planner = BundlePlanner::new(cluster.clone(), Duration::from_secs(1));
        let shared = planner
            .reserve(vec![Bundle::full_gpu(); 4], PlacementStrategy::Pack)
            .await
            .unwrap();

        let mut config = EngineConfig::new("m", 4);
        config.colocate_all = true;
        let mut pool = EnginePool::create(config, Some(shared.clone()), cluster.clone(), sim())
            .await
            .unwrap();
        assert_eq!(cluster.placement_groups_created(), 1);
        assert!(!pool.owns_placement_group());
        for engine in pool.engines() {
            assert!((engine.info().placement.gpu_share - 0.2).abs() < 1e-9);
        }
        // training actors still fit next to the engines
        cluster.reserve_share(shared.id, 0, 0.8, 0.8).await.unwrap();
        assert!(cluster.reserve_share(shared.id, 0, 0.1, 0.0).await.is_err());

        pool.teardown().await.unwrap();
        // the shared group outlives the pool
        cluster.reserve_share(shared.id, 1, 1.0, 1.0).await.unwrap();
    }

    #[tokio::test]
    async fn test_colocate_all_without_shared_group() {
        let cluster = Arc::new(LocalCluster::new(1, 4, 8.0));
        let mut config = EngineConfig::new("m", 1);
        config.colocate_all = true;
        let err = EnginePool::create(config, None, cluster, sim()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[tokio::test]
    async fn test_enable_sleep_starts_asleep() {
        let cluster = Arc::new(LocalCluster::new(1, 2, 4.0));
        let mut config = EngineConfig::new("m", 2);
        config.enable_sleep = true;
        let pool = EnginePool::create(config, None, cluster, sim()).await.unwrap();
        let input = GenerateInput::new(vec!["a".to_string()]);
        assert_eq!(
            pool.engines()[0].generate(input.clone()).await,
            Err(OrchestratorError::EngineAsleep(0))
        );
        // a second sleep is a no-op
        pool.sleep_all(SleepLevel::Offload).await.unwrap();
        pool.wake_up_all(vec![]).await.unwrap();
        pool.wake_up_all(vec![]).await.unwrap();
        assert_eq!(pool.engines()[1].generate(input).await.unwrap().responses.len(), 1);
    }

    #[tokio::test]
    async fn test_generate_shards_prompts_in_order() {
        let cluster = Arc::new(LocalCluster::new(1, 2, 4.0));
        let pool = EnginePool::create(EngineConfig::new("m", 2), None, cluster, sim())
            .await
            .unwrap();
        let prompts: Vec<String> = (0..5).map(|i| format!("prompt {i}")).collect();
        let output = pool.generate(GenerateInput::new(prompts.clone())).await.unwrap();
        assert_eq!(output.responses.len(), 5);
        assert_eq!(output.stop_reasons.len(), 5);

        let first = pool.engines()[0]
            .generate(GenerateInput::new(prompts[..3].to_vec()))
            .await
            .unwrap();
        let second = pool.engines()[1]
            .generate(GenerateInput::new(prompts[3..].to_vec()))
            .await
            .unwrap();
        assert_eq!(output.responses[..3], first.responses[..]);
        assert_eq!(output.responses[3..], second.responses[..]);
    }

    #[tokio::test]
    async fn test_teardown_makes_engines_unavailable() {
        let cluster = Arc::new(LocalCluster::new(1, 2, 4.0));
        let mut pool = EnginePool::create(EngineConfig::new("m", 2), None, cluster, sim())
            .await
            .unwrap();
        let engine = pool.engines()[1].clone();
        pool.teardown().await.unwrap();
        pool.teardown().await.unwrap();
        assert_eq!(
            engine.reset_prefix_cache().await,
            Err(OrchestratorError::EngineUnavailable(1))
        );
        assert!(engine.is_closed());
    }

    #[derive(Debug)]
    struct OldBackend;

    #[async_trait]
    impl EngineLauncher for OldBackend {
        async fn backend_version(&self, _backend: Backend) -> Result<String> {
            Ok("0.7.2".to_string())
        }

        async fn launch(&self, _info: &EngineInfo, _args: EngineArgs) -> Result<Box<dyn EngineBackend>> {
            unreachable!("version gate runs first")
        }
    }

    #[tokio::test]
    async fn test_incompatible_backend_reserves_nothing() {
        let cluster = Arc::new(LocalCluster::new(1, 2, 4.0));
        let err = EnginePool::create(EngineConfig::new("m", 2), None, cluster.clone(), Arc::new(OldBackend))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::IncompatibleBackendVersion { .. }));
        assert_eq!(cluster.placement_groups_created(), 0);
    }

    #[derive(Debug)]
    struct FlakyLauncher;

    #[async_trait]
    impl EngineLauncher for FlakyLauncher {
        async fn backend_version(&self, _backend: Backend) -> Result<String> {
            Ok("0.9.2".to_string())
        }

        async fn launch(&self, info: &EngineInfo, args: EngineArgs) -> Result<Box<dyn EngineBackend>> {
            if info.replica == 2 {
                return Err(OrchestratorError::Launch("out of memory".to_string()));
            }
            SimLauncher::new().launch(info, args).await
        }
    }

    #[tokio::test]
    async fn test_failed_construction_releases_placement_group() {
        let cluster = Arc::new(LocalCluster::new(1, 4, 8.0));
        let err = EnginePool::create(EngineConfig::new("m", 3), None, cluster.clone(), Arc::new(FlakyLauncher))
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::Launch("out of memory".to_string()));
        assert_eq!(cluster.placement_groups_created(), 1);
        assert_eq!(cluster.free_gpus(), 4);
    }

    #[tokio::test]
    async fn test_scheduling_timeout() {
        let cluster = Arc::new(LocalCluster::new(1, 2, 4.0));
        let mut config = EngineConfig::new("m", 2);
        config.tensor_parallel_size = 2;
        config.placement_timeout_secs = 1;
        let err = EnginePool::create(config, None, cluster.clone(), sim()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::SchedulingTimeout { bundles: 4, .. }));
        assert_eq!(cluster.free_gpus(), 2);
    }

    /// Cluster that cannot remove placement groups
    #[derive(Debug)]
    struct StickyCluster(LocalCluster);

    #[async_trait]
    impl ClusterScheduler for StickyCluster {
        async fn create_placement_group(
            &self,
            bundles: Vec<Bundle>,
            strategy: PlacementStrategy,
        ) -> Result<crate::placement::PlacementGroupId> {
            self.0.create_placement_group(bundles, strategy).await
        }

        async fn wait_ready(&self, id: crate::placement::PlacementGroupId) -> Result<PlacementGroup> {
            self.0.wait_ready(id).await
        }

        async fn remove_placement_group(&self, id: crate::placement::PlacementGroupId) -> Result<()> {
            Err(OrchestratorError::Resources(format!("{id} is still in use")))
        }

        async fn reserve_share(
            &self,
            id: crate::placement::PlacementGroupId,
            bundle_index: usize,
            gpu: f64,
            cpu: f64,
        ) -> Result<ShareLease> {
            self.0.reserve_share(id, bundle_index, gpu, cpu).await
        }

        async fn release_share(&self, lease: ShareLease) -> Result<()> {
            self.0.release_share(lease).await
        }

        fn placement_groups_created(&self) -> usize {
            self.0.placement_groups_created()
        }
    }

    #[tokio::test]
    async fn test_teardown_reports_release_failure_after_engines() {
        let cluster = Arc::new(StickyCluster(LocalCluster::new(1, 2, 4.0)));
        let mut pool = EnginePool::create(EngineConfig::new("m", 2), None, cluster, sim())
            .await
            .unwrap();
        let engines = pool.engines().to_vec();
        let err = pool.teardown().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Resources(_)));
        // engines went down before the group removal failed
        assert!(engines.iter().all(EngineClient::is_closed));
        pool.teardown().await.unwrap();
    }
}
