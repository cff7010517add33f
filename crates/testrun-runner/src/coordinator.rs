//! Run coordinator.
//!
//! Drives one run: selects and orders files, keeps at most `concurrency`
//! workers pending, merges their event streams, and reacts to failures,
//! the inactivity watchdog and interruption. All run state is owned by a
//! single task; nothing here is shared or locked.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use testrun_core::{
    duration_ms, RunEvent, RunEventKind, Shard, StateChange, TestFile, WorkerFailure, WorkerId,
    WorkerOptions,
};
use testrun_ipc::{SharedWorkerHost, Transport, WorkerEvent, WorkerHandle};

use crate::config::RunConfig;
use crate::error::RunError;
use crate::run_status::RunStatus;
use crate::scheduler::SchedulerCache;
use crate::shard::{select_shard, FileOrder};
use crate::timeout::TimeoutTrigger;

/// Capacity of the run event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Runs test files through a transport.
pub struct Coordinator {
    config: RunConfig,
    transport: Arc<dyn Transport>,
    host: Option<Arc<dyn SharedWorkerHost>>,
    events: broadcast::Sender<RunEvent>,
}

impl Coordinator {
    /// Create a coordinator launching units through `transport`.
    pub fn new(config: RunConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            transport,
            host: None,
            events,
        }
    }

    /// Serve shared-worker channels with `host`. Without one every channel errors.
    pub fn with_shared_worker_host(mut self, host: Arc<dyn SharedWorkerHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Subscribe to run events. Subscribe before calling [`run`](Self::run).
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Run `files` to completion.
    ///
    /// Only problems found before dispatch are returned as errors; everything
    /// after that is reported as events and reflected in the status.
    pub async fn run(
        &self,
        files: Vec<TestFile>,
        interrupt: CancellationToken,
    ) -> Result<RunStatus, RunError> {
        let total_files = files.len();
        let selected = self.select(files)?;
        let no_op = selected.is_empty();

        let selected_files = selected.len();
        let mut dispatch = Dispatch::new(self, selected.clone());
        dispatch.emit(RunEvent::now(RunEventKind::Starting {
            files: selected,
            total_files,
            selected_files,
            no_op,
            shard: self.config.shard,
        }));

        if no_op {
            info!(total_files, "Shard selected no test files");
        } else {
            dispatch.drive(&interrupt).await;
        }

        dispatch.teardown().await;
        Ok(dispatch.status)
    }

    fn cache(&self) -> SchedulerCache {
        SchedulerCache::new(
            self.config.cache_dir.clone(),
            self.config.cache_enabled,
            self.config.ci,
        )
    }

    fn select(&self, files: Vec<TestFile>) -> Result<Vec<TestFile>, RunError> {
        if files.is_empty() {
            return Err(RunError::NoTestFiles);
        }

        let mut seen = HashSet::new();
        for file in &files {
            if !seen.insert(file) {
                return Err(RunError::DuplicateTestFile(file.clone()));
            }
        }

        let files = match self.config.shard {
            Some(shard) => {
                let shard = Shard::new(shard.index, shard.total)?;
                let order = self.config.sort.clone().unwrap_or_default();
                let selected = select_shard(files, shard, &order);
                info!(shard = %shard, selected = selected.len(), "Selected shard");
                selected
            }
            None => files,
        };

        Ok(self.cache().reorder(files))
    }
}

enum Inbound {
    Event(WorkerEvent),
    Closed,
}

type InboundStream = Pin<Box<dyn Stream<Item = Inbound> + Send>>;

/// State of one run.
struct Dispatch<'a> {
    coordinator: &'a Coordinator,
    concurrency: usize,
    queue: VecDeque<TestFile>,
    pending: HashMap<WorkerId, WorkerHandle>,
    files: HashMap<WorkerId, TestFile>,
    streams: StreamMap<WorkerId, InboundStream>,
    timed_out: HashSet<WorkerId>,
    trigger: Option<TimeoutTrigger>,
    bailed: bool,
    interrupted: bool,
    status: RunStatus,
}

impl<'a> Dispatch<'a> {
    fn new(coordinator: &'a Coordinator, files: Vec<TestFile>) -> Self {
        let config = &coordinator.config;
        Self {
            coordinator,
            concurrency: config.resolve_concurrency(),
            queue: files.into(),
            pending: HashMap::new(),
            files: HashMap::new(),
            streams: StreamMap::new(),
            timed_out: HashSet::new(),
            trigger: config.effective_timeout().map(TimeoutTrigger::new),
            bailed: false,
            interrupted: false,
            status: RunStatus::new(),
        }
    }

    async fn drive(&mut self, interrupt: &CancellationToken) {
        info!(
            files = self.queue.len(),
            concurrency = self.concurrency,
            transport = %self.coordinator.transport.kind(),
            "Starting run"
        );

        if interrupt.is_cancelled() {
            self.on_interrupt();
        }
        self.fill().await;

        while !self.pending.is_empty() {
            tokio::select! {
                Some((worker_id, inbound)) = self.streams.next() => {
                    self.on_inbound(worker_id, inbound).await;
                }
                period = fired(&mut self.trigger) => self.on_timeout(period),
                _ = interrupt.cancelled(), if !self.interrupted => self.on_interrupt(),
                else => {
                    error!(pending = self.pending.len(), "No worker streams left while workers are pending");
                    break;
                }
            }
            self.fill().await;
        }

        if !self.queue.is_empty() {
            info!(skipped = self.queue.len(), "Test files were not started");
        }
    }

    /// Start workers until the pending set is full or the queue is empty.
    async fn fill(&mut self) {
        while !self.bailed && self.pending.len() < self.concurrency {
            let Some(file) = self.queue.pop_front() else {
                break;
            };
            self.spawn(file).await;
        }
    }

    async fn spawn(&mut self, file: TestFile) {
        let config = &self.coordinator.config;
        let worker_id = WorkerId::generate();
        let options = WorkerOptions {
            worker_id: worker_id.clone(),
            file: file.clone(),
            kind: self.coordinator.transport.kind(),
            fail_fast: config.fail_fast,
            extra: config.worker_options.clone(),
        };

        self.files.insert(worker_id.clone(), file.clone());
        if let Some(trigger) = &mut self.trigger {
            trigger.debounce();
        }

        let mut handle = match self.coordinator.transport.spawn(&file, options).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(file = %file, error = %e, "Failed to start worker");
                let failure = WorkerFailure::TransportError { cause: e.to_string() };
                self.on_state_change(worker_id, file, StateChange::WorkerFailed { failure });
                return;
            }
        };

        let Some(events) = handle.take_events() else {
            error!(worker_id = %worker_id, "Worker events already taken");
            handle.exit();
            self.emit(RunEvent::internal_error(format!(
                "Worker for {file} has no event stream"
            )));
            return;
        };

        info!(worker_id = %worker_id, file = %file, "Dispatched test file");
        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(events)
            .map(Inbound::Event)
            .chain(tokio_stream::once(Inbound::Closed));
        self.streams.insert(worker_id.clone(), Box::pin(stream));
        self.pending.insert(worker_id, handle);
    }

    async fn on_inbound(&mut self, worker_id: WorkerId, inbound: Inbound) {
        let Some(file) = self.files.get(&worker_id).cloned() else {
            warn!(worker_id = %worker_id, "Event from unknown worker");
            return;
        };

        match inbound {
            Inbound::Event(WorkerEvent::StateChange(change)) => {
                self.on_state_change(worker_id, file, change);
            }
            Inbound::Event(WorkerEvent::SharedWorkerConnect(mut port)) => {
                self.debounce(&worker_id);
                match &self.coordinator.host {
                    Some(host) => host.attach(port).await,
                    None => {
                        warn!(worker_id = %worker_id, filename = %port.filename(), "No shared worker host configured");
                        port.fail();
                    }
                }
            }
            Inbound::Event(WorkerEvent::SharedWorkerError(channel_id)) => {
                self.emit(RunEvent::now(RunEventKind::SharedWorkerError { file, channel_id }));
            }
            Inbound::Closed => {
                if self.pending.remove(&worker_id).is_some() {
                    error!(worker_id = %worker_id, file = %file, "Worker stream ended without an exit");
                    self.emit(RunEvent::internal_error(format!(
                        "Worker for {file} stopped without reporting how it exited"
                    )));
                }
            }
        }
    }

    fn on_state_change(&mut self, worker_id: WorkerId, file: TestFile, change: StateChange) {
        self.debounce(&worker_id);
        if let StateChange::TestTimeoutConfigured { period_ms } = &change {
            if let Some(trigger) = &mut self.trigger {
                trigger.ignore_for(Duration::from_millis(*period_ms));
            }
        }

        let terminal = change.is_terminal();
        let bail = self.coordinator.config.fail_fast && change.triggers_bail();
        debug!(worker_id = %worker_id, change = change.kind(), "State change");
        self.emit(RunEvent::state_change(file, worker_id.clone(), change));

        if terminal {
            self.pending.remove(&worker_id);
        }
        if bail && !self.bailed {
            self.bail();
        }
    }

    fn debounce(&mut self, worker_id: &WorkerId) {
        if self.timed_out.contains(worker_id) {
            return;
        }
        if let Some(trigger) = &mut self.trigger {
            trigger.debounce();
        }
    }

    fn bail(&mut self) {
        self.bailed = true;
        info!(
            pending = self.pending.len(),
            remaining = self.queue.len(),
            "Failure with fail-fast enabled; not starting more test files"
        );
        for handle in self.pending.values() {
            handle.notify_of_peer_failure();
        }
    }

    fn on_timeout(&mut self, period: Duration) {
        if self.coordinator.config.fail_fast {
            self.bailed = true;
        }

        let mut pending_files: Vec<TestFile> =
            self.pending.values().map(|handle| handle.file().clone()).collect();
        pending_files.sort();
        warn!(
            period_ms = duration_ms(period),
            pending = pending_files.len(),
            "Timed out while running tests"
        );
        self.emit(RunEvent::timeout(period, pending_files));

        for (worker_id, handle) in &self.pending {
            self.timed_out.insert(worker_id.clone());
            handle.exit();
        }
    }

    fn on_interrupt(&mut self) {
        info!(pending = self.pending.len(), "Run interrupted");
        self.interrupted = true;
        self.bailed = true;
        if let Some(trigger) = &mut self.trigger {
            trigger.discard();
        }

        self.emit(RunEvent::now(RunEventKind::Interrupt));
        for handle in self.pending.values() {
            handle.exit();
        }
    }

    /// Wait for shared workers, then record which files failed.
    async fn teardown(&mut self) {
        if let Some(host) = &self.coordinator.host {
            for e in host.teardown().await {
                error!(error = %e, "Shared worker teardown failed");
                self.emit(RunEvent::internal_error(e.to_string()));
            }
        }

        let cache = self.coordinator.cache();
        let failing = self.status.failing_files();
        if let Err(e) = tokio::task::spawn_blocking(move || cache.persist(&failing)).await {
            warn!(error = %e, "Failed to persist failing tests");
        }
    }

    fn emit(&mut self, event: RunEvent) {
        self.status.record(&event);
        // No subscribers is fine.
        let _ = self.coordinator.events.send(event);
    }
}

async fn fired(trigger: &mut Option<TimeoutTrigger>) -> Duration {
    match trigger {
        Some(trigger) => trigger.fired().await,
        None => std::future::pending().await,
    }
}
