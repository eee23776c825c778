// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
//! Inference engine fleet for RL training loops.
//!
//! Reserves GPUs for a set of engine replicas, launches them, serves
//! generation through them, and pushes freshly trained weights into them.

pub mod collective;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod factory;
pub mod placement;
pub mod pool;
pub mod weight_sync;

pub use collective::CollectiveRegistry;
pub use config::{Backend, EngineConfig, SamplingParams};
pub use dispatch::{
    concatenate_outputs_after_mesh_dispatch, ActorGroup, ActorInfo, DispatchMode, MeshRank,
    Payload, TrainingBatch, TrainingWorker,
};
pub use engine::{
    spawn_engine, CommBackend, CommunicatorHandle, EngineBackend, EngineClient, EngineInfo,
    GenerateInput, GenerateOutput, MemoryTag, SleepLevel, WeightTensor,
};
pub use error::{OrchestratorError, Result};
pub use factory::{EngineActorFactory, EngineLauncher, ProcessLauncher, SimLauncher};
pub use placement::{BundlePlanner, ClusterScheduler, LocalCluster, PlacementGroup};
pub use pool::EnginePool;
pub use weight_sync::{WeightBroadcaster, WeightSyncCoordinator};
