// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
//! Pushing trained weights into live engines.
//!
//! The training side owns rank 0 (more generally `0..rank_offset`) of a
//! collective group whose remaining ranks belong to the engine replicas. A
//! sync first makes sure every replica joined the group, then moves one named
//! tensor at a time: the broadcast and the receiving `update_named_weight`
//! calls run together and the next tensor starts only when every replica
//! acknowledged. Prefix caches are reset once all tensors landed.
use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::instrument;

use crate::engine::{CommunicatorHandle, EngineClient, WeightTensor};
use crate::error::{OrchestratorError, Result};
use crate::pool::EnginePool;

/// Training side of the weight update group
#[async_trait]
pub trait WeightBroadcaster: Send + Sync {
    /// Send `tensor` from the training rank to every engine rank of the group
    async fn broadcast(&self, handle: &CommunicatorHandle, tensor: &WeightTensor) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub tensors: usize,
    pub bytes: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct WeightSyncCoordinator {
    engines: Vec<EngineClient>,
    step_timeout: Duration,
    initialized: Option<CommunicatorHandle>,
    /// group being joined and the replica positions already in it
    joining: Option<CommunicatorHandle>,
    joined: HashSet<usize>,
}

impl WeightSyncCoordinator {
    pub fn new(engines: Vec<EngineClient>, step_timeout: Duration) -> Self {
        Self {
            engines,
            step_timeout,
            initialized: None,
            joining: None,
            joined: HashSet::new(),
        }
    }

    pub fn for_pool(pool: &EnginePool) -> Self {
        Self::new(pool.engines().to_vec(), pool.config().weight_sync_timeout())
    }

    pub fn engine_ranks(&self) -> usize {
        self.engines.iter().map(EngineClient::tp_size).sum()
    }

    /// Group every replica joined, if any
    pub fn initialized(&self) -> Option<&CommunicatorHandle> {
        self.initialized.as_ref()
    }

    // One lock-step round over the replicas at `positions`: `call` goes to
    // each concurrently and each must acknowledge within the step timeout.
    // Returns the positions that did not.
    async fn run_round<'a, F, Fut>(&'a self, step: &str, positions: &[usize], call: F) -> Vec<usize>
    where
        F: Fn(usize, &'a EngineClient) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let step_timeout = self.step_timeout;
        let results = join_all(positions.iter().map(|&position| {
            let ack = call(position, &self.engines[position]);
            async move { tokio::time::timeout(step_timeout, ack).await }
        }))
        .await;

        let mut failed = vec![];
        for (&position, result) in positions.iter().zip(results) {
            let replica = self.engines[position].replica();
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!("Replica<{}> failed `{}`: {}", replica, step, err);
                    failed.push(position);
                }
                Err(_) => {
                    tracing::error!(
                        "Replica<{}> did not acknowledge `{}` within {:?}",
                        replica,
                        step,
                        step_timeout
                    );
                    failed.push(position);
                }
            }
        }
        failed
    }

    fn failure(&self, step: &str, failed: &[usize]) -> Result<()> {
        if failed.is_empty() {
            return Ok(());
        }
        Err(OrchestratorError::WeightSyncFailure {
            step: step.to_string(),
            replicas: failed.iter().map(|&position| self.engines[position].replica()).collect(),
        })
    }

    async fn run_step<'a, F, Fut>(&'a self, step: &str, call: F) -> Result<()>
    where
        F: Fn(usize, &'a EngineClient) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let positions: Vec<usize> = (0..self.engines.len()).collect();
        let failed = self.run_round(step, &positions, call).await;
        self.failure(step, &failed)
    }

    /// Have every replica join the weight update group.
    ///
    /// Replica `i` takes the `tp_size` ranks following replica `i - 1`. A
    /// repeated call for the same group is skipped unless `override_existing`.
    /// After a partial failure, calling again with the same handle only
    /// retries the replicas that have not joined yet.
    #[instrument(skip_all, fields(group = %handle.group_name, world_size = handle.world_size))]
    pub async fn init_communicator(&mut self, handle: CommunicatorHandle) -> Result<()> {
        let expected = handle.rank_offset + self.engine_ranks();
        if handle.world_size != expected {
            return Err(OrchestratorError::Communicator(format!(
                "world size {} does not match rank offset {} plus {} engine ranks",
                handle.world_size,
                handle.rank_offset,
                self.engine_ranks()
            )));
        }
        if let Some(current) = &self.initialized {
            if current.group_name == handle.group_name && !handle.override_existing {
                tracing::debug!("Group {} already initialized", handle.group_name);
                return Ok(());
            }
        }
        let retrying = self.initialized.is_none() && self.joining.as_ref() == Some(&handle);
        if !retrying {
            self.joining = Some(handle.clone());
            self.joined.clear();
        }
        self.initialized = None;

        let step = "init_weight_update_communicator";
        let pending: Vec<usize> = (0..self.engines.len())
            .filter(|position| !self.joined.contains(position))
            .collect();
        let failed = self
            .run_round(step, &pending, |position, engine| {
                engine.init_weight_update_communicator(handle.for_replica(position, engine.tp_size()))
            })
            .await;
        self.joined
            .extend(pending.iter().filter(|position| !failed.contains(position)));
        self.failure(step, &failed)?;
        tracing::info!("Group {} => Initialized", handle.group_name);
        self.initialized = Some(handle);
        Ok(())
    }

    /// Push `tensors` into every replica, then reset their prefix caches.
    ///
    /// No step is retried. The first failing step aborts the sync and names
    /// the replicas that failed it.
    #[instrument(skip_all, fields(group = %handle.group_name, tensors = tensors.len()))]
    pub async fn sync_weights(
        &mut self,
        handle: &CommunicatorHandle,
        tensors: &[WeightTensor],
        broadcaster: &dyn WeightBroadcaster,
    ) -> Result<SyncReport> {
        let start = Instant::now();
        let joined = self
            .initialized
            .as_ref()
            .map_or(false, |current| current.group_name == handle.group_name);
        if !joined {
            self.init_communicator(handle.clone()).await?;
        }

        let mut bytes = 0;
        for tensor in tensors {
            let request = tensor.request(&handle.group_name);
            let step = format!("update_named_weight({})", tensor.name);
            let (sent, updated) = futures::join!(
                tokio::time::timeout(self.step_timeout, broadcaster.broadcast(handle, tensor)),
                self.run_step(&step, |_, engine| engine.update_named_weight(request.clone()))
            );
            updated?;
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!("Broadcast of {} failed: {}", tensor.name, err);
                    return Err(OrchestratorError::WeightSyncFailure {
                        step: format!("broadcast({})", tensor.name),
                        replicas: vec![],
                    });
                }
                Err(_) => {
                    return Err(OrchestratorError::WeightSyncFailure {
                        step: format!("broadcast({})", tensor.name),
                        replicas: vec![],
                    })
                }
            }
            bytes += tensor.data.len();
            tracing::debug!("Tensor {} => Synced", tensor.name);
        }

        // cached prefixes were computed with the old weights
        self.run_step("reset_prefix_cache", |_, engine| engine.reset_prefix_cache())
            .await?;

        let elapsed = start.elapsed();
        metrics::histogram!("fleet_weight_sync_duration", elapsed.as_secs_f64());
        metrics::counter!("fleet_weight_sync_bytes", bytes as u64);
        tracing::info!(
            "Synced {} tensors ({} bytes) into {} replicas in {:?}",
            tensors.len(),
            bytes,
            self.engines.len(),
            elapsed
        );
        Ok(SyncReport {
            tensors: tensors.len(),
            bytes,
            elapsed,
        })
    }
}
