// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{instrument, Span};

use super::actor::{EngineCommand, EngineRequest, Responder};
use super::{
    CommunicatorHandle, GenerateInput, GenerateOutput, MemoryTag, NamedWeightUpdateRequest,
    SleepLevel,
};
use crate::config::Backend;
use crate::error::{OrchestratorError, Result};
use crate::placement::EnginePlacement;

/// Static description of one replica
#[derive(Debug, Clone, PartialEq)]
pub struct EngineInfo {
    pub replica: usize,
    pub backend: Backend,
    pub tp_size: usize,
    pub placement: EnginePlacement,
    pub max_model_len: u32,
}

/// Handle to one serving engine replica.
///
/// Every method is a request to the replica's actor task; the reply is awaited
/// by the caller. Dropping the returned future abandons the call on the
/// replica. Teardown interrupts the call in flight, and from then on every
/// call fails with `EngineUnavailable`.
#[derive(Debug, Clone)]
pub struct EngineClient {
    info: Arc<EngineInfo>,
    sender: mpsc::UnboundedSender<EngineRequest>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl EngineClient {
    pub(super) fn new(
        info: EngineInfo,
        sender: mpsc::UnboundedSender<EngineRequest>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            info: Arc::new(info),
            sender,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn replica(&self) -> usize {
        self.info.replica
    }

    pub fn tp_size(&self) -> usize {
        self.info.tp_size
    }

    pub fn info(&self) -> &EngineInfo {
        &self.info
    }

    /// True once the actor has exited
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn send<T>(
        &self,
        command: impl FnOnce(Responder<T>) -> EngineCommand,
    ) -> Result<oneshot::Receiver<Result<T>>> {
        let (response_sender, response_receiver) = oneshot::channel();
        self.sender
            .send(EngineRequest {
                command: command(response_sender),
                span: Span::current(),
            })
            .map_err(|_| OrchestratorError::EngineUnavailable(self.info.replica))?;
        Ok(response_receiver)
    }

    async fn call<T>(&self, command: impl FnOnce(Responder<T>) -> EngineCommand) -> Result<T> {
        self.send(command)?
            .await
            .map_err(|_| OrchestratorError::EngineUnavailable(self.info.replica))?
    }

    #[instrument(skip_all, fields(replica = self.info.replica, prompts = input.prompts.len()))]
    pub async fn generate(&self, input: GenerateInput) -> Result<GenerateOutput> {
        self.call(|sender| EngineCommand::Generate(input, sender))
            .await
    }

    /// Restore the given memory regions, or everything when `tags` is empty
    #[instrument(skip(self), fields(replica = self.info.replica))]
    pub async fn wake_up(&self, tags: Vec<MemoryTag>) -> Result<()> {
        self.call(|sender| EngineCommand::WakeUp(tags, sender)).await
    }

    #[instrument(skip(self), fields(replica = self.info.replica))]
    pub async fn sleep(&self, level: SleepLevel) -> Result<()> {
        self.call(|sender| EngineCommand::Sleep(level, sender)).await
    }

    #[instrument(skip_all, fields(replica = self.info.replica, group = %handle.group_name))]
    pub async fn init_weight_update_communicator(&self, handle: CommunicatorHandle) -> Result<()> {
        self.call(|sender| EngineCommand::InitCommunicator(handle, sender))
            .await
    }

    #[instrument(skip_all, fields(replica = self.info.replica, name = %request.name))]
    pub async fn update_named_weight(&self, request: NamedWeightUpdateRequest) -> Result<()> {
        self.call(|sender| EngineCommand::UpdateNamedWeight(request, sender))
            .await
    }

    #[instrument(skip_all, fields(replica = self.info.replica))]
    pub async fn reset_prefix_cache(&self) -> Result<()> {
        self.call(EngineCommand::ResetPrefixCache).await
    }

    #[instrument(skip_all, fields(replica = self.info.replica))]
    pub async fn teardown(&self) -> Result<()> {
        // queue first so the actor finds the request once it is interrupted
        let response = self.send(EngineCommand::Teardown);
        self.shutdown.send_replace(true);
        response?
            .await
            .map_err(|_| OrchestratorError::EngineUnavailable(self.info.replica))?
    }
}
