// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("Placement group of {bundles} bundles was not ready within {timeout:?}")]
    SchedulingTimeout { bundles: usize, timeout: Duration },
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),
    #[error("Incompatible {backend} version {found}: requires >= {required}")]
    IncompatibleBackendVersion {
        backend: String,
        found: String,
        required: String,
    },
    #[error("Inference engine {0} is unavailable")]
    EngineUnavailable(usize),
    #[error("Inference engine {0} is asleep")]
    EngineAsleep(usize),
    #[error("Weight sync failed at `{step}` on replicas {replicas:?}")]
    WeightSyncFailure { step: String, replicas: Vec<usize> },
    #[error("Mesh dispatch error: {0}")]
    MeshDispatch(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Insufficient cluster resources: {0}")]
    Resources(String),
    #[error("Communicator error: {0}")]
    Communicator(String),
    #[error("Engine request failed: {0}")]
    Request(String),
    #[error("Could not launch inference engine: {0}")]
    Launch(String),
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        let err = Self::Request(err.to_string());
        tracing::error!("{err}");
        err
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        let err = Self::Launch(err.to_string());
        tracing::error!("{err}");
        err
    }
}

impl From<toml::de::Error> for OrchestratorError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
