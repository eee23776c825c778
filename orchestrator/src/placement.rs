// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::instrument;

use crate::error::{OrchestratorError, Result};

const SHARE_EPSILON: f64 = 1e-9;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlacementGroupId(pub u64);

impl fmt::Display for PlacementGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pg-{}", self.0)
    }
}

/// A schedulable slice of one node
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub gpu: f64,
    pub cpu: f64,
}

impl Bundle {
    pub fn full_gpu() -> Self {
        Self { gpu: 1.0, cpu: 1.0 }
    }

    fn devices(&self) -> usize {
        self.gpu.ceil() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementStrategy {
    /// Prefer few nodes, spill over when a node is full
    Pack,
    /// All bundles on one node or not at all
    StrictPack,
    /// Prefer distinct nodes per bundle
    Spread,
}

/// Atomically reserved bundles
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementGroup {
    pub id: PlacementGroupId,
    pub bundles: Vec<Bundle>,
    pub strategy: PlacementStrategy,
    /// node hosting each bundle
    pub bundle_nodes: Vec<NodeId>,
    /// GPU ordinals on that node held by each bundle
    pub bundle_devices: Vec<Vec<u32>>,
}

impl PlacementGroup {
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// GPU ordinals visible to a process bound to `bundle_indices`
    pub fn devices_for(&self, bundle_indices: &[usize]) -> Vec<u32> {
        bundle_indices
            .iter()
            .filter_map(|&i| self.bundle_devices.get(i))
            .flat_map(|devices| devices.iter().copied())
            .collect()
    }
}

/// Where one engine replica runs
#[derive(Debug, Clone, PartialEq)]
pub struct EnginePlacement {
    pub placement_group: PlacementGroupId,
    /// one bundle per tensor parallel rank
    pub bundle_indices: Vec<usize>,
    /// GPU share each rank was admitted with
    pub gpu_share: f64,
    pub devices: Vec<u32>,
}

/// Fractional share of a bundle held by one actor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShareLease {
    pub placement_group: PlacementGroupId,
    pub bundle_index: usize,
    pub gpu: f64,
    pub cpu: f64,
}

/// Cluster resource scheduler
#[async_trait]
pub trait ClusterScheduler: Send + Sync + fmt::Debug {
    /// Register a placement group. It may stay pending until capacity frees up.
    async fn create_placement_group(
        &self,
        bundles: Vec<Bundle>,
        strategy: PlacementStrategy,
    ) -> Result<PlacementGroupId>;

    /// Resolves once every bundle of the group is reserved
    async fn wait_ready(&self, id: PlacementGroupId) -> Result<PlacementGroup>;

    async fn remove_placement_group(&self, id: PlacementGroupId) -> Result<()>;

    /// Admit an actor onto a bundle. Aggregate shares per bundle never exceed the bundle.
    async fn reserve_share(
        &self,
        id: PlacementGroupId,
        bundle_index: usize,
        gpu: f64,
        cpu: f64,
    ) -> Result<ShareLease>;

    async fn release_share(&self, lease: ShareLease) -> Result<()>;

    fn placement_groups_created(&self) -> usize;
}

#[derive(Debug, Clone)]
struct NodeState {
    free_devices: Vec<u32>,
    free_cpus: f64,
}

#[derive(Debug)]
struct GroupState {
    bundles: Vec<Bundle>,
    strategy: PlacementStrategy,
    placement: Option<(Vec<NodeId>, Vec<Vec<u32>>)>,
    used: Vec<(f64, f64)>,
}

#[derive(Debug)]
struct ClusterState {
    nodes: Vec<NodeState>,
    groups: BTreeMap<PlacementGroupId, GroupState>,
}

/// In-process scheduler over a fixed fleet of nodes
#[derive(Debug)]
pub struct LocalCluster {
    state: Mutex<ClusterState>,
    changed: Notify,
    next_id: AtomicU64,
    created: AtomicUsize,
}

impl LocalCluster {
    /// `num_nodes` identical nodes
    pub fn new(num_nodes: usize, gpus_per_node: u32, cpus_per_node: f64) -> Self {
        Self::with_nodes(vec![(gpus_per_node, cpus_per_node); num_nodes])
    }

    pub fn with_nodes(nodes: Vec<(u32, f64)>) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|(gpus, cpus)| NodeState {
                free_devices: (0..gpus).collect(),
                free_cpus: cpus,
            })
            .collect();
        Self {
            state: Mutex::new(ClusterState {
                nodes,
                groups: BTreeMap::new(),
            }),
            changed: Notify::new(),
            next_id: AtomicU64::new(0),
            created: AtomicUsize::new(0),
        }
    }

    pub fn free_gpus(&self) -> usize {
        self.lock()
            .nodes
            .iter()
            .map(|node| node.free_devices.len())
            .sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        // a poisoned lock only means another task panicked mid-update of plain data
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Place the group if it is still pending. Returns the group once placed.
    fn try_ready(&self, id: PlacementGroupId) -> Result<Option<PlacementGroup>> {
        let mut state = self.lock();
        let ClusterState { nodes, groups } = &mut *state;
        let group = groups.get_mut(&id).ok_or_else(|| {
            OrchestratorError::Resources(format!("placement group {id} was removed"))
        })?;
        if group.placement.is_none() {
            if let Some((placed_nodes, bundle_nodes, bundle_devices)) =
                place(nodes, &group.bundles, group.strategy)
            {
                *nodes = placed_nodes;
                tracing::info!(
                    "PlacementGroup<{}> ready on nodes {:?}",
                    id,
                    bundle_nodes
                );
                group.placement = Some((bundle_nodes, bundle_devices));
            }
        }
        Ok(group
            .placement
            .as_ref()
            .map(|(bundle_nodes, bundle_devices)| PlacementGroup {
                id,
                bundles: group.bundles.clone(),
                strategy: group.strategy,
                bundle_nodes: bundle_nodes.clone(),
                bundle_devices: bundle_devices.clone(),
            }))
    }
}

/// Try to fit `bundles` onto `nodes`, returning the updated node state on success.
fn place(
    nodes: &[NodeState],
    bundles: &[Bundle],
    strategy: PlacementStrategy,
) -> Option<(Vec<NodeState>, Vec<NodeId>, Vec<Vec<u32>>)> {
    let mut nodes = nodes.to_vec();
    let fits = |node: &NodeState, bundle: &Bundle| {
        node.free_devices.len() >= bundle.devices() && node.free_cpus + SHARE_EPSILON >= bundle.cpu
    };

    let mut bundle_nodes = Vec::with_capacity(bundles.len());
    match strategy {
        PlacementStrategy::StrictPack => {
            let devices: usize = bundles.iter().map(Bundle::devices).sum();
            let cpus: f64 = bundles.iter().map(|b| b.cpu).sum();
            let node_id = (0..nodes.len()).find(|&i| {
                nodes[i].free_devices.len() >= devices && nodes[i].free_cpus + SHARE_EPSILON >= cpus
            })?;
            bundle_nodes.resize(bundles.len(), node_id);
        }
        PlacementStrategy::Pack => {
            // fill the roomiest node first so bundles of one replica land together
            let mut order: Vec<NodeId> = (0..nodes.len()).collect();
            order.sort_by_key(|&i| std::cmp::Reverse(nodes[i].free_devices.len()));
            let mut free: Vec<(usize, f64)> = nodes
                .iter()
                .map(|n| (n.free_devices.len(), n.free_cpus))
                .collect();
            let mut cursor = 0;
            for bundle in bundles {
                loop {
                    let node_id = *order.get(cursor)?;
                    let (devices, cpus) = &mut free[node_id];
                    if *devices >= bundle.devices() && *cpus + SHARE_EPSILON >= bundle.cpu {
                        *devices -= bundle.devices();
                        *cpus -= bundle.cpu;
                        bundle_nodes.push(node_id);
                        break;
                    }
                    cursor += 1;
                }
            }
        }
        PlacementStrategy::Spread => {
            let mut load = vec![0usize; nodes.len()];
            let mut free: Vec<NodeState> = nodes.clone();
            for bundle in bundles {
                let node_id = (0..free.len())
                    .filter(|&i| fits(&free[i], bundle))
                    .min_by_key(|&i| load[i])?;
                let node = &mut free[node_id];
                let remaining = node.free_devices.len() - bundle.devices();
                node.free_devices.truncate(remaining);
                node.free_cpus -= bundle.cpu;
                load[node_id] += 1;
                bundle_nodes.push(node_id);
            }
        }
    }

    let mut bundle_devices = Vec::with_capacity(bundles.len());
    for (bundle, &node_id) in bundles.iter().zip(bundle_nodes.iter()) {
        let node = &mut nodes[node_id];
        let devices: Vec<u32> = node.free_devices.drain(..bundle.devices()).collect();
        node.free_cpus -= bundle.cpu;
        bundle_devices.push(devices);
    }
    Some((nodes, bundle_nodes, bundle_devices))
}

#[async_trait]
impl ClusterScheduler for LocalCluster {
    #[instrument(skip(self))]
    async fn create_placement_group(
        &self,
        bundles: Vec<Bundle>,
        strategy: PlacementStrategy,
    ) -> Result<PlacementGroupId> {
        if bundles.is_empty() {
            return Err(OrchestratorError::Config(
                "placement group needs at least one bundle".to_string(),
            ));
        }
        let id = PlacementGroupId(self.next_id.fetch_add(1, Ordering::SeqCst));
        {
            let mut state = self.lock();
            let used = vec![(0.0, 0.0); bundles.len()];
            state.groups.insert(
                id,
                GroupState {
                    bundles,
                    strategy,
                    placement: None,
                    used,
                },
            );
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        metrics::increment_counter!("fleet_placement_groups", "event" => "created");
        self.try_ready(id)?;
        Ok(id)
    }

    async fn wait_ready(&self, id: PlacementGroupId) -> Result<PlacementGroup> {
        loop {
            // registered before the check, so a release in between is not missed
            let notified = self.changed.notified();
            if let Some(group) = self.try_ready(id)? {
                return Ok(group);
            }
            tracing::debug!("PlacementGroup<{}> pending", id);
            notified.await;
        }
    }

    #[instrument(skip(self))]
    async fn remove_placement_group(&self, id: PlacementGroupId) -> Result<()> {
        {
            let mut state = self.lock();
            let group = state.groups.remove(&id).ok_or_else(|| {
                OrchestratorError::Resources(format!("unknown placement group {id}"))
            })?;
            if let Some((bundle_nodes, bundle_devices)) = group.placement {
                for ((bundle, node_id), devices) in group
                    .bundles
                    .iter()
                    .zip(bundle_nodes)
                    .zip(bundle_devices)
                {
                    let node = &mut state.nodes[node_id];
                    node.free_devices.extend(devices);
                    node.free_devices.sort_unstable();
                    node.free_cpus += bundle.cpu;
                }
            }
        }
        metrics::increment_counter!("fleet_placement_groups", "event" => "removed");
        tracing::info!("PlacementGroup<{}> removed", id);
        self.changed.notify_waiters();
        Ok(())
    }

    async fn reserve_share(
        &self,
        id: PlacementGroupId,
        bundle_index: usize,
        gpu: f64,
        cpu: f64,
    ) -> Result<ShareLease> {
        let mut state = self.lock();
        let group = state.groups.get_mut(&id).ok_or_else(|| {
            OrchestratorError::Resources(format!("unknown placement group {id}"))
        })?;
        if group.placement.is_none() {
            return Err(OrchestratorError::Resources(format!(
                "placement group {id} is not ready"
            )));
        }
        let bundle = *group.bundles.get(bundle_index).ok_or_else(|| {
            OrchestratorError::Resources(format!(
                "bundle index {bundle_index} out of range for {id} with {} bundles",
                group.bundles.len()
            ))
        })?;
        let (used_gpu, used_cpu) = &mut group.used[bundle_index];
        if *used_gpu + gpu > bundle.gpu + SHARE_EPSILON
            || *used_cpu + cpu > bundle.cpu + SHARE_EPSILON
        {
            return Err(OrchestratorError::Resources(format!(
                "bundle {bundle_index} of {id} cannot admit gpu={gpu} cpu={cpu}: {used_gpu:.2}/{} gpu and {used_cpu:.2}/{} cpu in use",
                bundle.gpu, bundle.cpu
            )));
        }
        *used_gpu += gpu;
        *used_cpu += cpu;
        Ok(ShareLease {
            placement_group: id,
            bundle_index,
            gpu,
            cpu,
        })
    }

    async fn release_share(&self, lease: ShareLease) -> Result<()> {
        let mut state = self.lock();
        // shares die with their group
        if let Some(group) = state.groups.get_mut(&lease.placement_group) {
            if let Some((used_gpu, used_cpu)) = group.used.get_mut(lease.bundle_index) {
                *used_gpu = (*used_gpu - lease.gpu).max(0.0);
                *used_cpu = (*used_cpu - lease.cpu).max(0.0);
            }
        }
        Ok(())
    }

    fn placement_groups_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

/// Resources a pool of engines needs
#[derive(Debug, Clone, PartialEq)]
pub enum BundlePlan {
    /// A fresh packed placement group, one full GPU per engine rank
    Dedicated {
        bundles: Vec<Bundle>,
        strategy: PlacementStrategy,
    },
    /// Reuse the training placement group, each engine rank takes `gpu_share`
    Colocated { gpu_share: f64 },
}

impl BundlePlan {
    pub fn gpu_share(&self) -> f64 {
        match self {
            BundlePlan::Dedicated { .. } => 1.0,
            BundlePlan::Colocated { gpu_share } => *gpu_share,
        }
    }
}

/// Computes and reserves engine bundles
#[derive(Debug, Clone)]
pub struct BundlePlanner {
    scheduler: Arc<dyn ClusterScheduler>,
    timeout: Duration,
}

impl BundlePlanner {
    pub fn new(scheduler: Arc<dyn ClusterScheduler>, timeout: Duration) -> Self {
        Self { scheduler, timeout }
    }

    pub fn plan(
        num_replicas: usize,
        tensor_parallel_size: usize,
        colocated: bool,
        packing_denominator: u32,
    ) -> Result<BundlePlan> {
        if num_replicas == 0 || tensor_parallel_size == 0 {
            return Err(OrchestratorError::Config(format!(
                "cannot plan {num_replicas} replicas with tensor parallel size {tensor_parallel_size}"
            )));
        }
        if colocated {
            if packing_denominator == 0 {
                return Err(OrchestratorError::Config(
                    "`packing_denominator` must be > 0".to_string(),
                ));
            }
            return Ok(BundlePlan::Colocated {
                gpu_share: 1.0 / packing_denominator as f64,
            });
        }
        Ok(BundlePlan::Dedicated {
            bundles: vec![Bundle::full_gpu(); num_replicas * tensor_parallel_size],
            strategy: PlacementStrategy::Pack,
        })
    }

    /// Reserve a placement group, giving up after the configured deadline.
    #[instrument(skip(self, bundles), fields(bundles = bundles.len()))]
    pub async fn reserve(
        &self,
        bundles: Vec<Bundle>,
        strategy: PlacementStrategy,
    ) -> Result<PlacementGroup> {
        let num_bundles = bundles.len();
        let id = self
            .scheduler
            .create_placement_group(bundles, strategy)
            .await?;
        match tokio::time::timeout(self.timeout, self.scheduler.wait_ready(id)).await {
            Ok(Ok(group)) => Ok(group),
            Ok(Err(err)) => {
                let _ = self.scheduler.remove_placement_group(id).await;
                Err(err)
            }
            Err(_) => {
                tracing::error!(
                    "PlacementGroup<{}> not ready within {:?}, releasing",
                    id,
                    self.timeout
                );
                let _ = self.scheduler.remove_placement_group(id).await;
                Err(OrchestratorError::SchedulingTimeout {
                    bundles: num_bundles,
                    timeout: self.timeout,
                })
            }
        }
    }

    pub async fn release(&self, group: &PlacementGroup) -> Result<()> {
        self.scheduler.remove_placement_group(group.id).await
    }

    pub fn scheduler(&self) -> &Arc<dyn ClusterScheduler> {
        &self.scheduler
    }
}
