// Copyright 2025 Blitz-serving
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::future::Future;
use std::ops::ControlFlow;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Instrument, Span};

use super::client::{EngineClient, EngineInfo};
use super::{
    CommunicatorHandle, EngineBackend, GenerateInput, GenerateOutput, MemoryTag,
    NamedWeightUpdateRequest, SleepLevel,
};
use crate::error::{OrchestratorError, Result};

pub(super) type Responder<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
pub(super) enum EngineCommand {
    Generate(GenerateInput, Responder<GenerateOutput>),
    WakeUp(Vec<MemoryTag>, Responder<()>),
    Sleep(SleepLevel, Responder<()>),
    InitCommunicator(CommunicatorHandle, Responder<()>),
    UpdateNamedWeight(NamedWeightUpdateRequest, Responder<()>),
    ResetPrefixCache(Responder<()>),
    Teardown(Responder<()>),
}

impl EngineCommand {
    fn op(&self) -> &'static str {
        match self {
            EngineCommand::Generate(..) => "generate",
            EngineCommand::WakeUp(..) => "wake_up",
            EngineCommand::Sleep(..) => "sleep",
            EngineCommand::InitCommunicator(..) => "init_weight_update_communicator",
            EngineCommand::UpdateNamedWeight(..) => "update_named_weight",
            EngineCommand::ResetPrefixCache(..) => "reset_prefix_cache",
            EngineCommand::Teardown(..) => "teardown",
        }
    }
}

#[derive(Debug)]
pub(super) struct EngineRequest {
    pub(super) command: EngineCommand,
    pub(super) span: Span,
}

/// Spawn the actor task owning `backend` and return the client bound to it.
pub fn spawn_engine(info: EngineInfo, backend: Box<dyn EngineBackend>) -> EngineClient {
    let (sender, receiver) = mpsc::unbounded_channel();
    let (shutdown, shutdown_receiver) = watch::channel(false);
    tokio::spawn(engine_task(info.replica, backend, receiver, shutdown_receiver));
    EngineClient::new(info, sender, shutdown)
}

fn respond<T>(replica: usize, op: &'static str, sender: Responder<T>, result: Result<T>) {
    if let Err(err) = &result {
        metrics::increment_counter!("fleet_engine_errors", "op" => op);
        tracing::warn!("Replica<{}> {} failed: {}", replica, op, err);
    }
    // caller stopped waiting, nothing left to do
    let _ = sender.send(result);
}

/// How a backend call ended
enum Step<T> {
    Done(Result<T>),
    /// The caller dropped its end of the call
    Abandoned,
    /// Teardown was requested while the call was running
    Shutdown,
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // a dropped sender means every client is gone
    let _ = shutdown.wait_for(|down| *down).await;
}

// Drive `call` unless the replica is torn down or the caller gives up first.
// Either way the backend future is dropped, which ends whatever it awaited.
async fn run<T>(
    shutdown: &mut watch::Receiver<bool>,
    sender: &mut Responder<T>,
    call: impl Future<Output = Result<T>>,
) -> Step<T> {
    tokio::select! {
        biased;
        _ = shutdown_requested(shutdown) => Step::Shutdown,
        _ = sender.closed() => Step::Abandoned,
        result = call => Step::Done(result),
    }
}

fn settle<T>(replica: usize, op: &'static str, sender: Responder<T>, step: Step<T>) -> ControlFlow<()> {
    match step {
        Step::Done(result) => {
            respond(replica, op, sender, result);
            ControlFlow::Continue(())
        }
        Step::Abandoned => {
            metrics::increment_counter!("fleet_engine_abandoned_calls", "op" => op);
            tracing::warn!("Replica<{}> {} abandoned by its caller", replica, op);
            ControlFlow::Continue(())
        }
        Step::Shutdown => {
            respond(replica, op, sender, Err(OrchestratorError::EngineUnavailable(replica)));
            ControlFlow::Break(())
        }
    }
}

// Background task standing in for the remote engine process. Commands are
// handled one at a time in arrival order; a teardown interrupts the command
// in flight.
async fn engine_task(
    replica: usize,
    mut backend: Box<dyn EngineBackend>,
    mut receiver: mpsc::UnboundedReceiver<EngineRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    // regions released by the last sleep and not woken since
    let mut sleeping: HashSet<MemoryTag> = HashSet::new();
    let mut teardown_waiters = vec![];

    loop {
        let EngineRequest { command, span } = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            request = receiver.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        let op = command.op();
        metrics::increment_counter!("fleet_engine_calls", "op" => op);
        let flow = match command {
            EngineCommand::Generate(input, mut sender) => {
                if !sleeping.is_empty() {
                    respond(replica, op, sender, Err(OrchestratorError::EngineAsleep(replica)));
                    continue;
                }
                let step = run(&mut shutdown, &mut sender, backend.generate(input).instrument(span)).await;
                settle(replica, op, sender, step)
            }
            EngineCommand::Sleep(level, mut sender) => {
                if sleeping.len() == MemoryTag::ALL.len() {
                    tracing::debug!("Replica<{}> already asleep", replica);
                    respond(replica, op, sender, Ok(()));
                    continue;
                }
                // a partial wake still holds memory, so sleep again in full
                let step = run(&mut shutdown, &mut sender, backend.sleep(level).instrument(span)).await;
                if let Step::Done(Ok(())) = step {
                    if sleeping.is_empty() {
                        metrics::increment_gauge!("fleet_engines_asleep", 1.0);
                    }
                    sleeping.extend(MemoryTag::ALL);
                    tracing::info!("Replica<{}> => Asleep({:?})", replica, level);
                }
                settle(replica, op, sender, step)
            }
            EngineCommand::WakeUp(tags, mut sender) => {
                let tags: Vec<MemoryTag> = if tags.is_empty() {
                    sleeping.iter().copied().collect()
                } else {
                    tags.into_iter().filter(|tag| sleeping.contains(tag)).collect()
                };
                if tags.is_empty() {
                    tracing::debug!("Replica<{}> already awake", replica);
                    respond(replica, op, sender, Ok(()));
                    continue;
                }
                let step = run(&mut shutdown, &mut sender, backend.wake_up(tags.clone()).instrument(span)).await;
                if let Step::Done(Ok(())) = step {
                    tags.iter().for_each(|tag| {
                        sleeping.remove(tag);
                    });
                    if sleeping.is_empty() {
                        metrics::decrement_gauge!("fleet_engines_asleep", 1.0);
                        tracing::info!("Replica<{}> => Awake", replica);
                    }
                }
                settle(replica, op, sender, step)
            }
            EngineCommand::InitCommunicator(handle, mut sender) => {
                let call = backend.init_weight_update_communicator(handle).instrument(span);
                let step = run(&mut shutdown, &mut sender, call).await;
                settle(replica, op, sender, step)
            }
            EngineCommand::UpdateNamedWeight(request, mut sender) => {
                if sleeping.contains(&MemoryTag::Weights) {
                    respond(replica, op, sender, Err(OrchestratorError::EngineAsleep(replica)));
                    continue;
                }
                let call = backend.update_named_weight(request).instrument(span);
                let step = run(&mut shutdown, &mut sender, call).await;
                settle(replica, op, sender, step)
            }
            EngineCommand::ResetPrefixCache(mut sender) => {
                let step = run(&mut shutdown, &mut sender, backend.reset_prefix_cache().instrument(span)).await;
                settle(replica, op, sender, step)
            }
            EngineCommand::Teardown(sender) => {
                teardown_waiters.push(sender);
                ControlFlow::Break(())
            }
        };
        if flow.is_break() {
            break;
        }
    }

    let result = backend.teardown().await;
    if !sleeping.is_empty() {
        metrics::decrement_gauge!("fleet_engines_asleep", 1.0);
    }
    tracing::info!("Replica<{}> => TornDown", replica);

    // the teardown request itself may still be queued behind the interrupted call
    receiver.close();
    while let Ok(EngineRequest { command, .. }) = receiver.try_recv() {
        if let EngineCommand::Teardown(sender) = command {
            teardown_waiters.push(sender);
        }
        // dropping any other responder fails its call with EngineUnavailable
    }
    for sender in teardown_waiters {
        respond(replica, "teardown", sender, result.clone());
    }
}
