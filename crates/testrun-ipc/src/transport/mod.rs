//! Execution-unit transports.
//!
//! A [`Transport`] launches one unit for one test file and hands back a
//! [`WorkerHandle`]. Both transports share the coordinator side of the
//! control protocol ([`session`]); they differ only in how messages move and
//! how exits are classified.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use testrun_core::{
    ChannelId, StateChange, TestFile, ToUnit, TransportKind, WorkerExit, WorkerFailure, WorkerId,
    WorkerOptions,
};

use crate::error::TransportError;
use crate::host::SharedWorkerPort;
use crate::relay::{lock, Outbound};

pub mod process;
pub(crate) mod session;
pub mod thread;

pub use process::ProcessTransport;
pub use thread::ThreadTransport;

use session::Session;

/// Capacity of the bounded channel carrying coordinator messages to a unit.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Launches execution units.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which kind of unit this transport launches.
    fn kind(&self) -> TransportKind;

    /// Start a unit for `file`. `options` are delivered once the unit asks for them.
    async fn spawn(
        &self,
        file: &TestFile,
        options: WorkerOptions,
    ) -> Result<WorkerHandle, TransportError>;
}

/// Something a worker reported to the coordinator.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A state change for the worker's file. The last event of every worker is
    /// a terminal change (`WorkerFinished` or `WorkerFailed`).
    StateChange(StateChange),

    /// The unit opened a channel to a shared worker.
    SharedWorkerConnect(SharedWorkerPort),

    /// A shared-worker connection transitioned to errored.
    SharedWorkerError(ChannelId),
}

#[derive(Debug, Default)]
pub(crate) struct PongWaiters {
    waiters: VecDeque<oneshot::Sender<()>>,
    closed: bool,
}

pub(crate) type PongQueue = Arc<Mutex<PongWaiters>>;

impl PongWaiters {
    pub(crate) fn resolve_next(&mut self) {
        match self.waiters.pop_front() {
            Some(waiter) => {
                let _ = waiter.send(());
            }
            None => debug!("Received pong nobody waits for"),
        }
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.waiters.clear();
    }
}

/// Coordinator-side handle to one running unit.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    file: TestFile,
    kind: TransportKind,
    outbound: Outbound<ToUnit>,
    force_exit: CancellationToken,
    pongs: PongQueue,
    events: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
    exit: watch::Receiver<Option<WorkerExit>>,
}

impl WorkerHandle {
    /// The worker's id.
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// The test file the worker runs.
    pub fn file(&self) -> &TestFile {
        &self.file
    }

    /// The transport kind that launched the worker.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Take the worker's event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<WorkerEvent>> {
        self.events.take()
    }

    /// Force the unit to terminate.
    ///
    /// Processes are killed. Thread units are torn down once they reported
    /// `starting`; a request made earlier is held until then.
    pub fn exit(&self) {
        debug!(worker_id = %self.id, "Force exit requested");
        self.force_exit.cancel();
    }

    /// Tell the unit that another worker failed while fail-fast is on.
    pub fn notify_of_peer_failure(&self) {
        self.outbound.send(ToUnit::PeerFailed);
    }

    /// Resolve once every message sent to the unit so far has been processed.
    ///
    /// The coordinator never waits on this; it is for embedders that need to
    /// know a notice such as [`notify_of_peer_failure`](Self::notify_of_peer_failure)
    /// reached the unit before acting on it. The unit confirms with a `pong`
    /// after handling everything queued ahead of the `ping`. Fails once the
    /// worker has exited.
    pub async fn flush(&self) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pongs = lock(&self.pongs);
            if pongs.closed {
                return Err(TransportError::ChannelClosed);
            }
            pongs.waiters.push_back(tx);
        }
        self.outbound.send(ToUnit::Ping);
        rx.await.map_err(|_| TransportError::ChannelClosed)
    }

    /// The exit classification, once known.
    pub fn exit_status(&self) -> Option<WorkerExit> {
        self.exit.borrow().clone()
    }

    /// Wait until the unit has terminated and been classified.
    pub async fn wait(&self) -> WorkerExit {
        let mut exit = self.exit.clone();
        let result = exit.wait_for(Option::is_some).await.map(|exit| exit.clone());
        match result {
            Ok(Some(exit)) => exit,
            _ => WorkerFailure::TransportError {
                cause: "worker supervisor stopped without classifying the exit".to_string(),
            }
            .into(),
        }
    }
}

/// Create the coordinator side of a unit's control protocol.
///
/// Returns the handle given to the caller, the session the transport's
/// supervisor drives, and the receiving end of the coordinator-to-unit channel.
pub(crate) fn open_session(
    file: &TestFile,
    options: WorkerOptions,
    outbound_capacity: usize,
) -> (WorkerHandle, Session, mpsc::Receiver<ToUnit>) {
    let (to_unit_tx, to_unit_rx) = mpsc::channel(outbound_capacity.max(1));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = watch::channel(None);
    let outbound = Outbound::new(to_unit_tx);
    let force_exit = CancellationToken::new();
    let pongs = PongQueue::default();

    let handle = WorkerHandle {
        id: options.worker_id.clone(),
        file: file.clone(),
        kind: options.kind,
        outbound: outbound.clone(),
        force_exit: force_exit.clone(),
        pongs: Arc::clone(&pongs),
        events: Some(events_rx),
        exit: exit_rx,
    };
    let session = Session::new(file.clone(), options, outbound, events_tx, pongs, force_exit, exit_tx);
    (handle, session, to_unit_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use testrun_core::FromUnit;

    fn options(file: &TestFile) -> WorkerOptions {
        WorkerOptions {
            worker_id: WorkerId::new("w1"),
            file: file.clone(),
            kind: TransportKind::Thread,
            fail_fast: false,
            extra: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_flush_resolves_on_pong() {
        let file = TestFile::new("/tmp/a.test").unwrap();
        let (handle, mut session, mut to_unit) = open_session(&file, options(&file), 4);

        let flush = tokio::spawn(async move {
            let result = handle.flush().await;
            (handle, result)
        });
        assert_eq!(to_unit.recv().await, Some(ToUnit::Ping));
        session.handle(FromUnit::Pong);

        let (_handle, result) = flush.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_flush_fails_after_exit() {
        let file = TestFile::new("/tmp/a.test").unwrap();
        let (handle, session, _to_unit) = open_session(&file, options(&file), 4);

        session.finish(WorkerExit::Finished);
        assert!(matches!(handle.flush().await, Err(TransportError::ChannelClosed)));
        assert_eq!(handle.wait().await, WorkerExit::Finished);
    }

    #[tokio::test]
    async fn test_terminal_change_is_last_event() {
        let file = TestFile::new("/tmp/a.test").unwrap();
        let (mut handle, mut session, _to_unit) = open_session(&file, options(&file), 4);
        let mut events = handle.take_events().unwrap();
        assert!(handle.take_events().is_none());

        session.handle(FromUnit::StateChange {
            change: StateChange::TestPassed {
                title: "ok".to_string(),
                duration_ms: Some(3),
            },
        });
        session.finish(WorkerExit::ForcedExit);

        assert!(matches!(
            events.recv().await,
            Some(WorkerEvent::StateChange(StateChange::TestPassed { .. }))
        ));
        assert!(matches!(
            events.recv().await,
            Some(WorkerEvent::StateChange(StateChange::WorkerFinished { forced_exit: true }))
        ));
        assert!(events.recv().await.is_none());
        assert_eq!(handle.exit_status(), Some(WorkerExit::ForcedExit));
    }
}
