// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
//! Calls against a group of training workers.
//!
//! `pass_through` hands every worker the same payload. `mesh` splits one
//! batch along the data parallel axis and gathers one shard per data parallel
//! rank back, in rank order.
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures::future::join_all;
use nohash_hasher::IntMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{instrument, Instrument, Span};

use crate::error::{OrchestratorError, Result};

/// Coordinates of one worker in the parallel mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshRank {
    pub dp: usize,
    pub sp: usize,
    pub tp: usize,
    pub pp: usize,
    pub world_size: usize,
    pub dp_size: usize,
    pub pp_size: usize,
}

impl MeshRank {
    /// Plain data parallel layout: rank `dp` of `dp_size`
    pub fn data_parallel(dp: usize, dp_size: usize) -> Self {
        Self {
            dp,
            sp: 0,
            tp: 0,
            pp: 0,
            world_size: dp_size,
            dp_size,
            pp_size: 1,
        }
    }

    /// The one rank per data parallel group whose output is kept
    pub fn is_collection_dp_rank(&self) -> bool {
        self.tp == 0 && self.sp == 0 && self.pp + 1 == self.pp_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    PassThrough,
    Mesh,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::PassThrough => "pass_through",
            DispatchMode::Mesh => "mesh",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchMode {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pass_through" => Ok(DispatchMode::PassThrough),
            "mesh" => Ok(DispatchMode::Mesh),
            _ => Err(OrchestratorError::MeshDispatch(format!(
                "unknown dispatch mode {s}"
            ))),
        }
    }
}

/// Row oriented training batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingBatch {
    pub rows: Vec<Value>,
}

impl TrainingBatch {
    pub fn new(rows: Vec<Value>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `parts` equal contiguous chunks
    pub fn chunk(&self, parts: usize) -> Result<Vec<TrainingBatch>> {
        if parts == 0 || self.rows.len() % parts != 0 {
            return Err(OrchestratorError::MeshDispatch(format!(
                "batch of {} rows cannot be split into {parts} equal chunks",
                self.rows.len()
            )));
        }
        let size = self.rows.len() / parts;
        if size == 0 {
            return Ok(vec![TrainingBatch::default(); parts]);
        }
        Ok(self
            .rows
            .chunks(size)
            .map(|rows| TrainingBatch::new(rows.to_vec()))
            .collect())
    }

    pub fn concat(batches: impl IntoIterator<Item = TrainingBatch>) -> Self {
        Self {
            rows: batches.into_iter().flat_map(|batch| batch.rows).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Batch(TrainingBatch),
    Json(Value),
}

/// A training worker as seen from its actor task
#[async_trait]
pub trait TrainingWorker: Send {
    async fn call(&mut self, method: &str, payload: Payload) -> Result<Payload>;
}

#[derive(Debug)]
struct WorkerRequest {
    method: String,
    payload: Payload,
    response_sender: oneshot::Sender<Result<Payload>>,
    span: Span,
}

/// Handle to a worker actor
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    actor: usize,
    sender: mpsc::UnboundedSender<WorkerRequest>,
}

/// A call that was sent and not yet awaited
#[derive(Debug)]
pub struct PendingCall {
    actor: usize,
    receiver: oneshot::Receiver<Result<Payload>>,
}

impl PendingCall {
    pub async fn wait(self) -> Result<Payload> {
        self.receiver
            .await
            .map_err(|_| OrchestratorError::MeshDispatch(format!("worker {} is gone", self.actor)))?
    }
}

pub fn spawn_worker(actor: usize, worker: Box<dyn TrainingWorker>) -> WorkerHandle {
    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(worker_task(actor, worker, receiver));
    WorkerHandle { actor, sender }
}

async fn worker_task(
    actor: usize,
    mut worker: Box<dyn TrainingWorker>,
    mut receiver: mpsc::UnboundedReceiver<WorkerRequest>,
) {
    while let Some(request) = receiver.recv().await {
        let result = worker
            .call(&request.method, request.payload)
            .instrument(request.span)
            .await;
        if let Err(err) = &result {
            tracing::warn!("Worker<{}> {} failed: {}", actor, request.method, err);
        }
        let _ = request.response_sender.send(result);
    }
}

impl WorkerHandle {
    pub fn actor(&self) -> usize {
        self.actor
    }

    /// Send the call now; the reply is awaited through the returned [`PendingCall`]
    pub fn submit(&self, method: &str, payload: Payload) -> Result<PendingCall> {
        let (response_sender, receiver) = oneshot::channel();
        self.sender
            .send(WorkerRequest {
                method: method.to_string(),
                payload,
                response_sender,
                span: Span::current(),
            })
            .map_err(|_| {
                OrchestratorError::MeshDispatch(format!("worker {} is gone", self.actor))
            })?;
        Ok(PendingCall {
            actor: self.actor,
            receiver,
        })
    }

    pub async fn call(&self, method: &str, payload: Payload) -> Result<Payload> {
        self.submit(method, payload)?.wait().await
    }
}

#[derive(Debug, Clone)]
pub struct ActorInfo {
    pub handle: WorkerHandle,
    pub rank: MeshRank,
}

/// What [`ActorGroup::collect`] hands back
#[derive(Debug, Clone, PartialEq)]
pub enum Collected {
    /// One result per actor, in actor order
    PerActor(Vec<Payload>),
    /// Shards of the collection ranks, in data parallel order
    Concatenated(TrainingBatch),
}

// Checks that the collection ranks cover `0..dp_size` exactly once
fn validate_mesh(ranks: &[MeshRank]) -> Result<usize> {
    let first = ranks
        .first()
        .ok_or_else(|| OrchestratorError::MeshDispatch("empty actor group".to_string()))?;
    let (dp_size, pp_size) = (first.dp_size, first.pp_size);
    if dp_size == 0 || pp_size == 0 {
        return Err(OrchestratorError::MeshDispatch(format!(
            "invalid mesh with dp_size {dp_size} and pp_size {pp_size}"
        )));
    }
    let mut collectors = vec![0usize; dp_size];
    for (actor, rank) in ranks.iter().enumerate() {
        if rank.dp_size != dp_size || rank.pp_size != pp_size {
            return Err(OrchestratorError::MeshDispatch(format!(
                "actor {actor} reports dp_size {} and pp_size {}, expected {dp_size} and {pp_size}",
                rank.dp_size, rank.pp_size
            )));
        }
        if rank.dp >= dp_size {
            return Err(OrchestratorError::MeshDispatch(format!(
                "actor {actor} has dp rank {} outside dp_size {dp_size}",
                rank.dp
            )));
        }
        if rank.is_collection_dp_rank() {
            collectors[rank.dp] += 1;
        }
    }
    if let Some((dp, count)) = collectors.iter().enumerate().find(|(_, count)| **count != 1) {
        return Err(OrchestratorError::MeshDispatch(format!(
            "dp rank {dp} has {count} collection actors, expected exactly one"
        )));
    }
    Ok(dp_size)
}

/// Concatenate mesh results by ascending data parallel rank.
///
/// `results[i]` is the reply of the actor at `ranks[i]`. Only collection ranks
/// contribute; the other ranks of a data parallel group hold duplicates.
pub fn concatenate_outputs_after_mesh_dispatch(
    ranks: &[MeshRank],
    results: Vec<Payload>,
) -> Result<TrainingBatch> {
    if ranks.len() != results.len() {
        return Err(OrchestratorError::MeshDispatch(format!(
            "{} results for {} actors",
            results.len(),
            ranks.len()
        )));
    }
    let dp_size = validate_mesh(ranks)?;
    let mut shards: IntMap<usize, TrainingBatch> = IntMap::default();
    for (actor, (rank, result)) in ranks.iter().zip(results).enumerate() {
        if !rank.is_collection_dp_rank() {
            continue;
        }
        match result {
            Payload::Batch(batch) => {
                shards.insert(rank.dp, batch);
            }
            Payload::Json(_) => {
                return Err(OrchestratorError::MeshDispatch(format!(
                    "actor {actor} returned a non batch result"
                )))
            }
        }
    }
    let ordered = (0..dp_size)
        .map(|dp| {
            shards.remove(&dp).ok_or_else(|| {
                OrchestratorError::MeshDispatch(format!("no shard for dp rank {dp}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(TrainingBatch::concat(ordered))
}

/// Ordered workers plus their mesh coordinates
#[derive(Debug, Clone)]
pub struct ActorGroup {
    actor_infos: Vec<ActorInfo>,
}

impl ActorGroup {
    pub fn new(actor_infos: Vec<ActorInfo>) -> Self {
        Self { actor_infos }
    }

    pub fn actor_infos(&self) -> &[ActorInfo] {
        &self.actor_infos
    }

    pub fn len(&self) -> usize {
        self.actor_infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actor_infos.is_empty()
    }

    fn ranks(&self) -> Vec<MeshRank> {
        self.actor_infos.iter().map(|info| info.rank).collect()
    }

    /// Send `method` to every actor without waiting for the replies
    #[instrument(skip(self, payload))]
    pub fn dispatch(&self, mode: DispatchMode, method: &str, payload: Payload) -> Result<Vec<PendingCall>> {
        metrics::increment_counter!("fleet_dispatch_calls", "mode" => mode.as_str());
        match mode {
            DispatchMode::PassThrough => self
                .actor_infos
                .iter()
                .map(|info| info.handle.submit(method, payload.clone()))
                .collect(),
            DispatchMode::Mesh => {
                let Payload::Batch(batch) = payload else {
                    return Err(OrchestratorError::MeshDispatch(
                        "mesh dispatch needs a batch".to_string(),
                    ));
                };
                let dp_size = validate_mesh(&self.ranks())?;
                let chunks = batch.chunk(dp_size)?;
                self.actor_infos
                    .iter()
                    .map(|info| {
                        info.handle
                            .submit(method, Payload::Batch(chunks[info.rank.dp].clone()))
                    })
                    .collect()
            }
        }
    }

    /// Await the replies of a [`ActorGroup::dispatch`] made with the same mode
    pub async fn collect(&self, mode: DispatchMode, pending: Vec<PendingCall>) -> Result<Collected> {
        let results = join_all(pending.into_iter().map(PendingCall::wait))
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        match mode {
            DispatchMode::PassThrough => Ok(Collected::PerActor(results)),
            DispatchMode::Mesh => Ok(Collected::Concatenated(
                concatenate_outputs_after_mesh_dispatch(&self.ranks(), results)?,
            )),
        }
    }

    pub async fn pass_through(&self, method: &str, payload: Payload) -> Result<Vec<Payload>> {
        let pending = self.dispatch(DispatchMode::PassThrough, method, payload)?;
        match self.collect(DispatchMode::PassThrough, pending).await? {
            Collected::PerActor(results) => Ok(results),
            Collected::Concatenated(batch) => Ok(vec![Payload::Batch(batch)]),
        }
    }

    pub async fn mesh(&self, method: &str, batch: TrainingBatch) -> Result<TrainingBatch> {
        let pending = self.dispatch(DispatchMode::Mesh, method, Payload::Batch(batch))?;
        match self.collect(DispatchMode::Mesh, pending).await? {
            Collected::Concatenated(batch) => Ok(batch),
            Collected::PerActor(_) => Err(OrchestratorError::MeshDispatch(
                "mesh collect returned per actor results".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Tags every row with the worker's mesh coordinates
    struct TaggingWorker {
        rank: MeshRank,
    }

    #[async_trait]
    impl TrainingWorker for TaggingWorker {
        async fn call(&mut self, method: &str, payload: Payload) -> Result<Payload> {
            match (method, payload) {
                ("forward", Payload::Batch(batch)) => Ok(Payload::Batch(TrainingBatch::new(
                    batch
                        .rows
                        .into_iter()
                        .map(|row| json!({ "dp": self.rank.dp, "tp": self.rank.tp, "row": row }))
                        .collect(),
                ))),
                // one row per dp rank up to its own, so shapes differ across actors
                ("stats", Payload::Batch(batch)) => Ok(Payload::Batch(TrainingBatch::new(
                    batch.rows.into_iter().take(self.rank.dp + 1).collect(),
                ))),
                ("offload", payload) => Ok(Payload::Json(json!({ "dp": self.rank.dp, "tp": self.rank.tp, "got": payload == Payload::Json(json!("all")) }))),
                (method, _) => Err(OrchestratorError::MeshDispatch(format!("no method {method}"))),
            }
        }
    }

    fn group(ranks: Vec<MeshRank>) -> ActorGroup {
        ActorGroup::new(
            ranks
                .into_iter()
                .enumerate()
                .map(|(actor, rank)| ActorInfo {
                    handle: spawn_worker(actor, Box::new(TaggingWorker { rank })),
                    rank,
                })
                .collect(),
        )
    }

    fn rows(n: usize) -> TrainingBatch {
        TrainingBatch::new((0..n).map(|i| json!(i)).collect())
    }

    #[tokio::test]
    async fn test_mesh_orders_by_dp_rank() {
        // insertion order deliberately differs from dp order
        let ranks = [2, 0, 3, 1]
            .into_iter()
            .map(|dp| MeshRank::data_parallel(dp, 4))
            .collect();
        let output = group(ranks).mesh("forward", rows(8)).await.unwrap();
        assert_eq!(output.len(), 8);
        for (i, row) in output.rows.iter().enumerate() {
            assert_eq!(row["row"], json!(i));
            assert_eq!(row["dp"], json!(i / 2));
        }
    }

    #[tokio::test]
    async fn test_mesh_keeps_collection_ranks_only() {
        let mut ranks = vec![];
        for tp in [1, 0] {
            for dp in [1, 0] {
                ranks.push(MeshRank {
                    dp,
                    sp: 0,
                    tp,
                    pp: 0,
                    world_size: 4,
                    dp_size: 2,
                    pp_size: 1,
                });
            }
        }
        let output = group(ranks).mesh("forward", rows(4)).await.unwrap();
        assert_eq!(output.len(), 4);
        assert!(output.rows.iter().all(|row| row["tp"] == json!(0)));
        assert_eq!(output.rows[3]["dp"], json!(1));
    }

    #[tokio::test]
    async fn test_pass_through_keeps_actor_order() {
        let ranks = vec![MeshRank::data_parallel(1, 2), MeshRank::data_parallel(0, 2)];
        let results = group(ranks)
            .pass_through("offload", Payload::Json(json!("all")))
            .await
            .unwrap();
        assert_eq!(
            results,
            vec![
                Payload::Json(json!({ "dp": 1, "tp": 0, "got": true })),
                Payload::Json(json!({ "dp": 0, "tp": 0, "got": true })),
            ]
        );
    }

    #[tokio::test]
    async fn test_pass_through_keeps_uneven_results() {
        let ranks = [1, 0, 2]
            .into_iter()
            .map(|dp| MeshRank::data_parallel(dp, 3))
            .collect();
        let results = group(ranks)
            .pass_through("stats", Payload::Batch(rows(3)))
            .await
            .unwrap();
        let sizes: Vec<usize> = results
            .iter()
            .map(|payload| match payload {
                Payload::Batch(batch) => batch.len(),
                Payload::Json(_) => panic!("expected a batch"),
            })
            .collect();
        assert_eq!(sizes, vec![2, 1, 3]);
        assert_eq!(results[1], Payload::Batch(TrainingBatch::new(vec![json!(0)])));
    }

    #[tokio::test]
    async fn test_dispatch_does_not_wait() {
        let group = group(vec![MeshRank::data_parallel(0, 1)]);
        let pending = group
            .dispatch(DispatchMode::PassThrough, "unknown", Payload::Json(json!(null)))
            .unwrap();
        let err = group.collect(DispatchMode::PassThrough, pending).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::MeshDispatch(_)));
    }

    #[tokio::test]
    async fn test_inconsistent_mesh_is_rejected() {
        let missing = group(vec![MeshRank::data_parallel(0, 2), MeshRank::data_parallel(0, 2)]);
        assert!(missing.mesh("forward", rows(4)).await.is_err());

        let out_of_range = group(vec![MeshRank::data_parallel(0, 1), MeshRank::data_parallel(1, 1)]);
        assert!(out_of_range.mesh("forward", rows(2)).await.is_err());

        let uneven = group(vec![MeshRank::data_parallel(0, 2), MeshRank::data_parallel(1, 2)]);
        assert!(uneven.mesh("forward", rows(3)).await.is_err());
        assert!(uneven
            .dispatch(DispatchMode::Mesh, "forward", Payload::Json(json!([1, 2])))
            .is_err());
    }

    #[test]
    fn test_concatenate_checks_results() {
        let ranks = vec![MeshRank::data_parallel(1, 2), MeshRank::data_parallel(0, 2)];
        let batch = |v: i32| Payload::Batch(TrainingBatch::new(vec![json!(v)]));

        let output = concatenate_outputs_after_mesh_dispatch(&ranks, vec![batch(1), batch(0)]).unwrap();
        assert_eq!(output.rows, vec![json!(0), json!(1)]);
        assert!(concatenate_outputs_after_mesh_dispatch(&ranks, vec![batch(1)]).is_err());
        assert!(concatenate_outputs_after_mesh_dispatch(
            &ranks,
            vec![batch(1), Payload::Json(json!(0))]
        )
        .is_err());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!("mesh".parse::<DispatchMode>().unwrap(), DispatchMode::Mesh);
        assert_eq!(
            "pass_through".parse::<DispatchMode>().unwrap(),
            DispatchMode::PassThrough
        );
        assert!("broadcast".parse::<DispatchMode>().is_err());
    }
}
