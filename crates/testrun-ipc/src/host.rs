//! Coordinator side of shared-worker channels.
//!
//! Every `shared-worker-connect` a unit sends becomes a [`SharedWorkerPort`]
//! that the coordinator hands to its [`SharedWorkerHost`]. The host decides
//! which shared worker serves the channel, and reports failures back through
//! the port.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use testrun_core::{ChannelId, MessageId, SharedMessage, TestFile, ToUnit, WorkerId};

use crate::error::{ChannelError, HostError};
use crate::relay::Outbound;
use crate::transport::WorkerEvent;

/// Boxed error returned by shared worker implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One unit's channel to a shared worker, seen from the coordinator.
pub struct SharedWorkerPort {
    channel_id: ChannelId,
    worker_id: WorkerId,
    file: TestFile,
    filename: String,
    initial_data: Value,
    to_unit: Outbound<ToUnit>,
    from_unit: mpsc::UnboundedReceiver<SharedMessage>,
    events: mpsc::WeakUnboundedSender<WorkerEvent>,
    sequence: u64,
    errored: bool,
}

impl fmt::Debug for SharedWorkerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWorkerPort")
            .field("channel_id", &self.channel_id)
            .field("worker_id", &self.worker_id)
            .field("filename", &self.filename)
            .field("errored", &self.errored)
            .finish()
    }
}

impl SharedWorkerPort {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        channel_id: ChannelId,
        worker_id: WorkerId,
        file: TestFile,
        filename: String,
        initial_data: Value,
        to_unit: Outbound<ToUnit>,
        from_unit: mpsc::UnboundedReceiver<SharedMessage>,
        events: mpsc::WeakUnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            channel_id,
            worker_id,
            file,
            filename,
            initial_data,
            to_unit,
            from_unit,
            events,
            sequence: 0,
            errored: false,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// The test file of the unit that opened the channel.
    pub fn file(&self) -> &TestFile {
        &self.file
    }

    /// The shared worker the unit asked for.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn initial_data(&self) -> &Value {
        &self.initial_data
    }

    pub fn is_errored(&self) -> bool {
        self.errored
    }

    /// Tell the unit the channel is usable.
    pub fn ready(&self) {
        if !self.errored {
            self.to_unit.send(ToUnit::SharedWorkerReady {
                channel_id: self.channel_id.clone(),
            });
        }
    }

    /// Returns true once the unit that opened the channel has exited.
    pub fn is_closed(&self) -> bool {
        self.to_unit.is_closed()
    }

    /// Resolves once the unit that opened the channel has exited.
    pub async fn closed(&self) {
        self.to_unit.closed().await
    }

    /// Post a message to the unit. Fails once the channel errored or the unit exited.
    pub fn post(&mut self, data: Value, reply_to: Option<MessageId>) -> Result<MessageId, ChannelError> {
        if self.errored || self.to_unit.is_closed() {
            return Err(ChannelError::Unavailable);
        }
        self.sequence += 1;
        let message_id = MessageId::from_host(&self.channel_id, self.sequence);
        self.to_unit.send(ToUnit::SharedWorkerMessage {
            channel_id: self.channel_id.clone(),
            message: SharedMessage {
                message_id: message_id.clone(),
                reply_to,
                data,
            },
        });
        Ok(message_id)
    }

    /// Next message from the unit. Returns `None` once the unit is gone or the channel errored.
    pub async fn recv(&mut self) -> Option<SharedMessage> {
        if self.errored {
            return None;
        }
        self.from_unit.recv().await
    }

    /// Mark the channel dead on both sides.
    pub fn fail(&mut self) {
        if self.errored {
            return;
        }
        self.errored = true;
        warn!(channel_id = %self.channel_id, filename = %self.filename, "Shared worker channel failed");

        self.to_unit.send(ToUnit::SharedWorkerError {
            channel_id: self.channel_id.clone(),
        });
        if let Some(events) = self.events.upgrade() {
            let _ = events.send(WorkerEvent::SharedWorkerError(self.channel_id.clone()));
        }
        self.from_unit.close();
    }
}

/// Receives shared-worker connections for the duration of a run.
#[async_trait]
pub trait SharedWorkerHost: Send + Sync {
    /// Take over a new channel. Must not wait on the channel's traffic.
    async fn attach(&self, port: SharedWorkerPort);

    /// Wait for every attached channel to finish; returns what went wrong.
    ///
    /// Called once every unit has exited, so channels still being served
    /// belong to gone units.
    async fn teardown(&self) -> Vec<HostError>;
}

/// A shared worker: serves the channels opened to one filename.
#[async_trait]
pub trait SharedWorker: Send + Sync + 'static {
    /// Serve one channel until the unit goes away.
    ///
    /// Call [`SharedWorkerPort::ready`] once the channel is usable. An error
    /// fails the channel. [`RegistryHost`] stops serving once the unit exits,
    /// whether or not this future has resolved.
    async fn serve(&self, port: &mut SharedWorkerPort) -> Result<(), BoxError>;
}

/// Host dispatching channels to shared workers registered by filename.
#[derive(Default)]
pub struct RegistryHost {
    workers: HashMap<String, Arc<dyn SharedWorker>>,
    tasks: Mutex<JoinSet<Result<(), HostError>>>,
}

impl RegistryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve channels opened to `filename` with `worker`.
    pub fn register(mut self, filename: impl Into<String>, worker: impl SharedWorker) -> Self {
        self.workers.insert(filename.into(), Arc::new(worker));
        self
    }
}

#[async_trait]
impl SharedWorkerHost for RegistryHost {
    async fn attach(&self, mut port: SharedWorkerPort) {
        let Some(worker) = self.workers.get(port.filename()).cloned() else {
            warn!(
                filename = %port.filename(),
                channel_id = %port.channel_id(),
                error = %HostError::UnknownWorker(port.filename().to_string()),
                "Rejecting shared worker connection"
            );
            port.fail();
            return;
        };

        info!(filename = %port.filename(), channel_id = %port.channel_id(), "Attaching shared worker channel");
        let unit = port.to_unit.clone();
        let channel_id = port.channel_id().clone();
        self.tasks.lock().await.spawn(async move {
            let result = tokio::select! {
                biased;
                result = worker.serve(&mut port) => result,
                _ = unit.closed() => {
                    debug!(channel_id = %channel_id, "Unit exited; stopping shared worker channel");
                    return Ok(());
                }
            };
            match result {
                Ok(()) => Ok(()),
                // Posting to a unit that already exited is not a worker failure.
                Err(e) if port.is_closed() && is_unavailable(&*e) => Ok(()),
                Err(e) => {
                    port.fail();
                    Err(HostError::Failed {
                        filename: port.filename().to_string(),
                        channel_id: port.channel_id().clone(),
                        message: e.to_string(),
                    })
                }
            }
        });
    }

    async fn teardown(&self) -> Vec<HostError> {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        debug!(channels = tasks.len(), "Tearing down shared worker channels");

        let mut errors = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(HostError::Aborted(e.to_string())),
            }
        }
        errors
    }
}

fn is_unavailable(error: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    matches!(error.downcast_ref::<ChannelError>(), Some(ChannelError::Unavailable))
}
