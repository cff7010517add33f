//! Units running on dedicated threads inside the coordinator process.
//!
//! Each unit gets an OS thread with its own current-thread runtime. Messages
//! move as values over bounded channels; output written through the unit's
//! writers arrives as output chunks.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use testrun_core::{FromUnit, TestFile, TransportKind, WorkerExit, WorkerFailure, WorkerOptions};

use super::session::Session;
use super::{open_session, Transport, WorkerHandle, DEFAULT_OUTBOUND_CAPACITY};
use crate::error::TransportError;
use crate::unit::{self, UnitEntry, UnitLink};

type ThreadOutcome = Result<(), String>;

/// How long a torn-down unit gets to release its channel before its exit is published.
const TEARDOWN_GRACE: Duration = Duration::from_secs(1);

/// Launches each unit on its own thread, running `entry`.
#[derive(Clone)]
pub struct ThreadTransport {
    entry: Arc<dyn UnitEntry>,
    outbound_capacity: usize,
    stack_size: Option<usize>,
}

impl ThreadTransport {
    /// Create a transport running `entry` for every test file.
    pub fn new(entry: impl UnitEntry) -> Self {
        Self {
            entry: Arc::new(entry),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            stack_size: None,
        }
    }

    /// Set the capacity of the channels in both directions.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Set the stack size of unit threads.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
}

#[async_trait]
impl Transport for ThreadTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Thread
    }

    async fn spawn(
        &self,
        file: &TestFile,
        options: WorkerOptions,
    ) -> Result<WorkerHandle, TransportError> {
        let worker_id = options.worker_id.clone();
        let capacity = self.outbound_capacity.max(1);
        let (handle, session, to_unit) = open_session(file, options, capacity);
        let (from_unit_tx, from_unit_rx) = mpsc::channel(capacity);
        let (done_tx, done_rx) = oneshot::channel();
        let teardown = CancellationToken::new();

        let link = UnitLink::local(
            worker_id.clone(),
            file.clone(),
            from_unit_tx,
            to_unit,
            teardown.clone(),
        );
        let entry = Arc::clone(&self.entry);

        let mut builder = std::thread::Builder::new().name(format!("testrun-unit-{worker_id}"));
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        builder.spawn(move || {
            let outcome = run_unit_thread(entry, link);
            let _ = done_tx.send(outcome);
        })?;

        info!(worker_id = %worker_id, file = %file, "Spawned unit thread");
        tokio::spawn(supervise(session, from_unit_rx, done_rx, teardown));
        Ok(handle)
    }
}

fn run_unit_thread(entry: Arc<dyn UnitEntry>, link: UnitLink) -> ThreadOutcome {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to build unit runtime: {e}"))?;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(unit::run_entry(entry, link))
    }));
    // Every sender the unit held is gone once the runtime is dropped, so the
    // supervisor sees the channel close before the outcome arrives.
    drop(runtime);
    outcome.map_err(|panic| panic_message(panic.as_ref()))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("unit panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("unit panicked: {message}")
    } else {
        "unit panicked".to_string()
    }
}

async fn supervise(
    mut session: Session,
    mut from_unit: mpsc::Receiver<FromUnit>,
    mut done: oneshot::Receiver<ThreadOutcome>,
    teardown: CancellationToken,
) {
    let force_exit = session.force_exit_token();
    let mut outcome: Option<ThreadOutcome> = None;
    let mut closed = false;

    loop {
        if closed {
            if let Some(outcome) = outcome.take() {
                let exit = match outcome {
                    Ok(()) => WorkerExit::Finished,
                    Err(cause) => WorkerFailure::TransportError { cause }.into(),
                };
                session.finish(exit);
                return;
            }
        }

        tokio::select! {
            message = from_unit.recv(), if !closed => match message {
                Some(message) => session.handle(message),
                None => closed = true,
            },
            result = &mut done, if outcome.is_none() => {
                outcome = Some(result.unwrap_or_else(|_| {
                    warn!(worker_id = %session.worker_id(), "Unit thread ended without reporting");
                    Err("unit thread ended without reporting".to_string())
                }));
            }
            // A unit that has not reported `starting` yet is still setting up
            // its runtime; tearing it down then would leave it half-built.
            _ = force_exit.cancelled(), if session.is_started() => {
                debug!(worker_id = %session.worker_id(), "Tearing down unit thread");
                teardown.cancel();
                // Reports the unit sent before the teardown still count.
                if !closed {
                    let drained =
                        tokio::time::timeout(TEARDOWN_GRACE, drain(&mut session, &mut from_unit)).await;
                    if drained.is_err() {
                        warn!(worker_id = %session.worker_id(), "Unit thread did not stop after teardown");
                    }
                }
                session.finish(WorkerExit::ForcedExit);
                return;
            }
        }
    }
}

async fn drain(session: &mut Session, from_unit: &mut mpsc::Receiver<FromUnit>) {
    while let Some(message) = from_unit.recv().await {
        session.handle(message);
    }
}
