// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
//! In-process rendezvous for weight update groups.
//!
//! Stands in for the NCCL/Gloo group that links the training rank to the
//! engine ranks: engines join with their rank range, the training side
//! broadcasts named tensors, and every engine rank receives each broadcast
//! exactly once.
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::engine::{CommunicatorHandle, WeightTensor};
use crate::error::{OrchestratorError, Result};
use crate::weight_sync::WeightBroadcaster;

#[derive(Debug)]
struct GroupState {
    handle: CommunicatorHandle,
    members: BTreeSet<usize>,
    /// latest broadcast per tensor name, tagged with a sequence number
    tensors: HashMap<String, (u64, WeightTensor)>,
    /// last sequence number each rank consumed per tensor name
    delivered: HashMap<(usize, String), u64>,
    seq: u64,
}

impl GroupState {
    fn new(handle: &CommunicatorHandle) -> Self {
        Self {
            handle: handle.clone(),
            members: BTreeSet::new(),
            tensors: HashMap::new(),
            delivered: HashMap::new(),
            seq: 0,
        }
    }

    fn same_rendezvous(&self, handle: &CommunicatorHandle) -> bool {
        self.handle.master_addr == handle.master_addr
            && self.handle.master_port == handle.master_port
            && self.handle.world_size == handle.world_size
            && self.handle.backend == handle.backend
    }
}

#[derive(Debug, Default)]
pub struct CollectiveRegistry {
    groups: Mutex<HashMap<String, GroupState>>,
    staged: Notify,
}

impl CollectiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, GroupState>> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Join `ranks` of `handle.group_name`.
    ///
    /// A rank joins a group at most once. Re-joining, or joining with a
    /// different rendezvous, requires `override_existing`, which rebuilds the group.
    pub fn join(&self, handle: &CommunicatorHandle, ranks: Range<usize>) -> Result<()> {
        if ranks.is_empty() || ranks.end > handle.world_size || ranks.start == 0 {
            return Err(OrchestratorError::Communicator(format!(
                "ranks {ranks:?} are outside the engine ranks of group {} (world size {})",
                handle.group_name, handle.world_size
            )));
        }
        let mut groups = self.lock();
        let group = groups
            .entry(handle.group_name.clone())
            .or_insert_with(|| GroupState::new(handle));

        let conflict = !group.same_rendezvous(handle)
            || ranks.clone().any(|rank| group.members.contains(&rank));
        if conflict {
            if !handle.override_existing {
                return Err(OrchestratorError::Communicator(format!(
                    "group {} already exists with ranks {:?}",
                    handle.group_name, group.members
                )));
            }
            tracing::info!("Group<{}> rebuilt by override", handle.group_name);
            *group = GroupState::new(handle);
        }
        group.members.extend(ranks);
        Ok(())
    }

    pub fn members(&self, group_name: &str) -> Vec<usize> {
        self.lock()
            .get(group_name)
            .map(|group| group.members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn destroy(&self, group_name: &str) {
        self.lock().remove(group_name);
        self.staged.notify_waiters();
    }

    /// Stage `tensor` for every engine rank of the group
    pub fn stage(&self, handle: &CommunicatorHandle, tensor: &WeightTensor) -> Result<()> {
        {
            let mut groups = self.lock();
            let group = groups.get_mut(&handle.group_name).ok_or_else(|| {
                OrchestratorError::Communicator(format!(
                    "group {} has not been initialized",
                    handle.group_name
                ))
            })?;
            let expected = handle.world_size.saturating_sub(handle.rank_offset);
            if group.members.len() != expected {
                return Err(OrchestratorError::Communicator(format!(
                    "group {} has {} engine ranks, world size {} with rank offset {} expects {}",
                    handle.group_name,
                    group.members.len(),
                    handle.world_size,
                    handle.rank_offset,
                    expected
                )));
            }
            group.seq += 1;
            let seq = group.seq;
            group
                .tensors
                .insert(tensor.name.clone(), (seq, tensor.clone()));
        }
        self.staged.notify_waiters();
        Ok(())
    }

    /// Wait for the next broadcast of `name` not yet seen by `rank`.
    ///
    /// Fails once the group is destroyed.
    pub async fn receive(&self, group_name: &str, rank: usize, name: &str) -> Result<WeightTensor> {
        loop {
            let notified = self.staged.notified();
            {
                let mut groups = self.lock();
                let group = groups.get_mut(group_name).ok_or_else(|| {
                    OrchestratorError::Communicator(format!("group {group_name} is gone"))
                })?;
                if !group.members.contains(&rank) {
                    return Err(OrchestratorError::Communicator(format!(
                        "rank {rank} is not a member of group {group_name}"
                    )));
                }
                if let Some((seq, tensor)) = group.tensors.get(name) {
                    let key = (rank, name.to_string());
                    if group.delivered.get(&key).map_or(true, |seen| seen < seq) {
                        let (seq, tensor) = (*seq, tensor.clone());
                        group.delivered.insert(key, seq);
                        return Ok(tensor);
                    }
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl WeightBroadcaster for CollectiveRegistry {
    async fn broadcast(&self, handle: &CommunicatorHandle, tensor: &WeightTensor) -> Result<()> {
        self.stage(handle, tensor)
    }
}
