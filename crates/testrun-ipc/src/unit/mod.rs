//! The execution-unit side of the control protocol.
//!
//! A [`Unit`] is what test-running code holds: it fetches options, reports
//! state changes, opens shared-worker channels and learns about peer
//! failures. Process units build one with [`Unit::connect_from_env`]; thread
//! units receive one from [`ThreadTransport`](crate::ThreadTransport).

use std::env;
use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use testrun_core::{duration_ms, FromUnit, StateChange, TestFile, ToUnit, WorkerId, WorkerOptions};

use crate::error::TransportError;
use crate::relay::{lock, Outbound};
use crate::transport::DEFAULT_OUTBOUND_CAPACITY;
use crate::wire::{self, CONTROL_ADDR_ENV, TEST_FILE_ENV, WORKER_ID_ENV};

mod channel;

pub use channel::{Connection, Subscription};

use channel::Channels;

/// Code run by an execution unit.
#[async_trait]
pub trait UnitEntry: Send + Sync + 'static {
    /// Run the unit's test file. The unit finishes once this returns and no
    /// shared-worker channel keeps it alive.
    async fn run(&self, unit: Unit);
}

#[async_trait]
impl<F, Fut> UnitEntry for F
where
    F: Fn(Unit) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn run(&self, unit: Unit) {
        (self)(unit).await
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputMode {
    /// Output becomes `worker-stdout` / `worker-stderr` chunks.
    Captured,
    /// Output goes to the process's own stdio, which the coordinator pipes.
    Inherited,
}

struct WriterTask {
    handle: JoinHandle<Result<(), TransportError>>,
    shutdown: CancellationToken,
}

/// Raw channels connecting a unit to its coordinator.
pub struct UnitLink {
    worker_id: WorkerId,
    file: TestFile,
    to_coordinator: mpsc::Sender<FromUnit>,
    from_coordinator: mpsc::Receiver<ToUnit>,
    teardown: CancellationToken,
    output: OutputMode,
    writer: Option<WriterTask>,
}

impl UnitLink {
    /// Link for a unit running inside the coordinator process.
    pub(crate) fn local(
        worker_id: WorkerId,
        file: TestFile,
        to_coordinator: mpsc::Sender<FromUnit>,
        from_coordinator: mpsc::Receiver<ToUnit>,
        teardown: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            file,
            to_coordinator,
            from_coordinator,
            teardown,
            output: OutputMode::Captured,
            writer: None,
        }
    }
}

struct UnitInner {
    worker_id: WorkerId,
    file: TestFile,
    outbound: Outbound<FromUnit>,
    options: Mutex<Option<oneshot::Receiver<WorkerOptions>>>,
    peer_failed: watch::Sender<bool>,
    teardown: CancellationToken,
    channels: Channels,
    output: OutputMode,
    writer: tokio::sync::Mutex<Option<WriterTask>>,
}

/// Handle held by code running inside an execution unit. Cheap to clone.
#[derive(Clone)]
pub struct Unit {
    inner: Arc<UnitInner>,
}

impl Unit {
    /// Start the unit side of the protocol over `link` and report `starting`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(link: UnitLink) -> Self {
        let outbound = Outbound::new(link.to_coordinator);
        let (options_tx, options_rx) = oneshot::channel();
        let inner = Arc::new(UnitInner {
            channels: Channels::new(link.worker_id.clone(), outbound.clone()),
            worker_id: link.worker_id,
            file: link.file,
            outbound,
            options: Mutex::new(Some(options_rx)),
            peer_failed: watch::Sender::new(false),
            teardown: link.teardown,
            output: link.output,
            writer: tokio::sync::Mutex::new(link.writer),
        });

        inner.outbound.send(FromUnit::Starting);
        tokio::spawn(dispatch(Arc::clone(&inner), link.from_coordinator, options_tx));
        debug!(worker_id = %inner.worker_id, file = %inner.file, "Unit started");
        Self { inner }
    }

    /// Connect a process unit to the coordinator that spawned it.
    pub async fn connect_from_env() -> Result<Self, TransportError> {
        let addr = env::var(CONTROL_ADDR_ENV).map_err(|_| TransportError::MissingEnv(CONTROL_ADDR_ENV))?;
        let worker_id = env::var(WORKER_ID_ENV).map_err(|_| TransportError::MissingEnv(WORKER_ID_ENV))?;
        let file = env::var_os(TEST_FILE_ENV).ok_or(TransportError::MissingEnv(TEST_FILE_ENV))?;
        let file = TestFile::new(PathBuf::from(file)).map_err(|e| TransportError::Protocol(e.to_string()))?;

        info!(control_addr = %addr, worker_id = %worker_id, "Connecting to coordinator");
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();

        let (to_coordinator, outgoing) = mpsc::channel(DEFAULT_OUTBOUND_CAPACITY);
        let (incoming, from_coordinator) = mpsc::channel(DEFAULT_OUTBOUND_CAPACITY);
        let shutdown = CancellationToken::new();
        let writer = tokio::spawn(pump_to_coordinator(write, outgoing, shutdown.clone()));
        tokio::spawn(pump_from_coordinator(read, incoming));

        Ok(Self::start(UnitLink {
            worker_id: WorkerId::from(worker_id),
            file,
            to_coordinator,
            from_coordinator,
            teardown: CancellationToken::new(),
            output: OutputMode::Inherited,
            writer: Some(WriterTask {
                handle: writer,
                shutdown,
            }),
        }))
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.inner.worker_id
    }

    /// The test file this unit runs.
    pub fn test_file(&self) -> &TestFile {
        &self.inner.file
    }

    /// Ask the coordinator for the worker options. Can be called once.
    pub async fn options(&self) -> Result<WorkerOptions, TransportError> {
        let rx = lock(&self.inner.options)
            .take()
            .ok_or_else(|| TransportError::Protocol("options were already requested".to_string()))?;
        self.inner.outbound.send(FromUnit::ReadyForOptions);
        rx.await.map_err(|_| TransportError::ChannelClosed)
    }

    /// Report a state change for this unit's file.
    pub fn emit(&self, change: StateChange) {
        trace!(worker_id = %self.inner.worker_id, change = change.kind(), "Emitting state change");
        self.inner.outbound.send(FromUnit::StateChange { change });
    }

    /// Announce that the running test needs longer than the default timeout.
    pub fn announce_timeout(&self, period: Duration) {
        self.emit(StateChange::TestTimeoutConfigured {
            period_ms: duration_ms(period),
        });
    }

    /// Returns true once the coordinator reported a failing peer under fail-fast.
    pub fn peer_failed(&self) -> bool {
        *self.inner.peer_failed.borrow()
    }

    /// Resolve once the coordinator reports a failing peer.
    pub async fn peer_failure(&self) {
        let mut peer_failed = self.inner.peer_failed.subscribe();
        let _ = peer_failed.wait_for(|failed| *failed).await;
    }

    /// Returns true once a thread unit has been force-exited.
    pub fn is_torn_down(&self) -> bool {
        self.inner.teardown.is_cancelled()
    }

    /// Writer for the unit's standard output.
    pub fn stdout(&self) -> UnitOutput {
        UnitOutput::new(self, false)
    }

    /// Writer for the unit's standard error.
    pub fn stderr(&self) -> UnitOutput {
        UnitOutput::new(self, true)
    }

    /// Open a channel to the shared worker registered as `filename`.
    pub fn open_shared_worker(&self, filename: impl Into<String>, initial_data: Value) -> Connection {
        self.inner.channels.open(filename.into(), initial_data)
    }

    /// Number of shared-worker channels keeping the unit alive.
    pub fn liveness_refs(&self) -> usize {
        self.inner.channels.liveness_refs()
    }

    /// Resolve once no shared-worker channel keeps the unit alive.
    pub async fn idle(&self) {
        self.inner.channels.idle().await
    }

    /// Release every channel, deliver what is still buffered and close the link.
    pub async fn finish(&self) {
        self.inner.channels.force_unref_all();
        self.inner.outbound.flushed().await;

        let writer = self.inner.writer.lock().await.take();
        if let Some(writer) = writer {
            writer.shutdown.cancel();
            match writer.handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to flush control connection"),
                Err(e) => warn!(error = %e, "Control writer task failed"),
            }
        }
        debug!(worker_id = %self.inner.worker_id, "Unit finished");
    }
}

/// Run `entry` as a process unit spawned by `ProcessTransport`.
pub async fn serve_from_env(entry: impl UnitEntry) -> Result<(), TransportError> {
    let unit = Unit::connect_from_env().await?;
    entry.run(unit.clone()).await;
    unit.idle().await;
    unit.finish().await;
    Ok(())
}

/// Thread-unit body: run until the entry and its channels are done, or until torn down.
pub(crate) async fn run_entry(entry: Arc<dyn UnitEntry>, link: UnitLink) {
    let teardown = link.teardown.clone();
    let unit = Unit::start(link);
    tokio::select! {
        _ = async {
            entry.run(unit.clone()).await;
            unit.idle().await;
        } => unit.finish().await,
        _ = teardown.cancelled() => debug!(worker_id = %unit.worker_id(), "Unit torn down"),
    }
}

async fn dispatch(
    inner: Arc<UnitInner>,
    mut from_coordinator: mpsc::Receiver<ToUnit>,
    options_tx: oneshot::Sender<WorkerOptions>,
) {
    let mut options_tx = Some(options_tx);

    while let Some(message) = from_coordinator.recv().await {
        trace!(worker_id = %inner.worker_id, message_type = message.kind(), "Coordinator message");

        match message {
            ToUnit::Options { options } => match options_tx.take() {
                Some(tx) => {
                    let _ = tx.send(options);
                }
                None => warn!("Ignoring duplicate options"),
            },
            ToUnit::Ping => inner.outbound.send(FromUnit::Pong),
            ToUnit::PeerFailed => {
                info!(worker_id = %inner.worker_id, "A peer worker failed");
                inner.peer_failed.send_replace(true);
            }
            ToUnit::SharedWorkerReady { channel_id } => inner.channels.ready(&channel_id),
            ToUnit::SharedWorkerMessage { channel_id, message } => {
                // One scheduler turn before delivery, so a subscription created
                // while handling the previous message still sees this one.
                tokio::task::yield_now().await;
                inner.channels.deliver(&channel_id, message);
            }
            ToUnit::SharedWorkerError { channel_id } => inner.channels.error(&channel_id),
        }
    }

    debug!(worker_id = %inner.worker_id, "Coordinator closed the control channel");
    inner.channels.error_all();
}

async fn pump_to_coordinator(
    mut write: OwnedWriteHalf,
    mut outgoing: mpsc::Receiver<FromUnit>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    loop {
        tokio::select! {
            biased;

            message = outgoing.recv() => match message {
                Some(message) => wire::write_message(&mut write, &message).await?,
                None => break,
            },
            _ = shutdown.cancelled() => {
                while let Ok(message) = outgoing.try_recv() {
                    wire::write_message(&mut write, &message).await?;
                }
                break;
            }
        }
    }
    write.shutdown().await?;
    Ok(())
}

async fn pump_from_coordinator(read: OwnedReadHalf, incoming: mpsc::Sender<ToUnit>) {
    let mut lines = BufReader::new(read).lines();
    loop {
        match wire::next_message::<_, ToUnit>(&mut lines).await {
            Ok(Some(message)) => {
                if incoming.send(message).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Control connection failed");
                break;
            }
        }
    }
}

enum OutputTarget {
    Captured { outbound: Outbound<FromUnit>, stderr: bool },
    Stdout(io::Stdout),
    Stderr(io::Stderr),
}

/// Standard output or error of a unit.
pub struct UnitOutput {
    target: OutputTarget,
}

impl UnitOutput {
    fn new(unit: &Unit, stderr: bool) -> Self {
        let target = match (unit.inner.output, stderr) {
            (OutputMode::Captured, stderr) => OutputTarget::Captured {
                outbound: unit.inner.outbound.clone(),
                stderr,
            },
            (OutputMode::Inherited, false) => OutputTarget::Stdout(io::stdout()),
            (OutputMode::Inherited, true) => OutputTarget::Stderr(io::stderr()),
        };
        Self { target }
    }
}

impl Write for UnitOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.target {
            OutputTarget::Captured { outbound, stderr } => {
                let chunk = buf.to_vec();
                let change = if *stderr {
                    StateChange::WorkerStderr { chunk }
                } else {
                    StateChange::WorkerStdout { chunk }
                };
                outbound.send(FromUnit::StateChange { change });
                Ok(buf.len())
            }
            OutputTarget::Stdout(out) => out.write(buf),
            OutputTarget::Stderr(err) => err.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.target {
            OutputTarget::Captured { .. } => Ok(()),
            OutputTarget::Stdout(out) => out.flush(),
            OutputTarget::Stderr(err) => err.flush(),
        }
    }
}
