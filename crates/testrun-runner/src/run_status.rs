//! Aggregated outcome of a run.

use std::collections::HashMap;

use serde::Serialize;

use testrun_core::{RunEvent, RunEventKind, StateChange, TestFile};

/// Per-file counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileStats {
    pub declared_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub skipped_tests: usize,
    pub todo_tests: usize,
    pub failed_hooks: usize,
    pub uncaught_exceptions: usize,
    pub unhandled_rejections: usize,
    pub worker_failed: bool,
    pub timed_out: bool,
    pub finished: bool,
}

impl FileStats {
    /// Returns true if anything in this file counts as a failure.
    pub fn has_failure(&self) -> bool {
        self.failed_tests > 0
            || self.failed_hooks > 0
            || self.uncaught_exceptions > 0
            || self.unhandled_rejections > 0
            || self.worker_failed
            || self.timed_out
    }

    fn tests_reported(&self) -> usize {
        self.passed_tests + self.failed_tests + self.skipped_tests + self.todo_tests
    }
}

/// Run-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub selected_files: usize,
    pub finished_files: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub skipped_tests: usize,
    pub todo_tests: usize,
    pub failed_hooks: usize,
    pub uncaught_exceptions: usize,
    pub unhandled_rejections: usize,
    pub worker_failures: usize,
    pub timeouts: usize,
    pub internal_errors: usize,
    pub shared_worker_errors: usize,
    pub interrupted: bool,
}

/// Outcome of a run, built from the run's events.
#[derive(Debug, Clone, Default)]
pub struct RunStatus {
    selected: Vec<TestFile>,
    files: HashMap<TestFile, FileStats>,
    stats: RunStats,
    no_op: bool,
}

impl RunStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the status.
    pub fn record(&mut self, event: &RunEvent) {
        match &event.kind {
            RunEventKind::Starting {
                files,
                selected_files,
                no_op,
                ..
            } => {
                self.selected = files.clone();
                self.stats.selected_files = *selected_files;
                self.no_op = *no_op;
            }
            RunEventKind::StateChange { file, change, .. } => self.record_change(file, change),
            RunEventKind::Timeout { pending_files, .. } => {
                self.stats.timeouts += 1;
                for file in pending_files {
                    self.files.entry(file.clone()).or_default().timed_out = true;
                }
            }
            RunEventKind::Interrupt => self.stats.interrupted = true,
            RunEventKind::InternalError { .. } => self.stats.internal_errors += 1,
            RunEventKind::SharedWorkerError { .. } => self.stats.shared_worker_errors += 1,
        }
    }

    fn record_change(&mut self, file: &TestFile, change: &StateChange) {
        let entry = self.files.entry(file.clone()).or_default();
        let stats = &mut self.stats;

        match change {
            StateChange::DeclaredTest { .. } => entry.declared_tests += 1,
            StateChange::TestPassed { .. } => {
                entry.passed_tests += 1;
                stats.passed_tests += 1;
            }
            StateChange::TestFailed { .. } => {
                entry.failed_tests += 1;
                stats.failed_tests += 1;
            }
            StateChange::TestSkipped { .. } => {
                entry.skipped_tests += 1;
                stats.skipped_tests += 1;
            }
            StateChange::TestTodo { .. } => {
                entry.todo_tests += 1;
                stats.todo_tests += 1;
            }
            StateChange::HookFailed { .. } => {
                entry.failed_hooks += 1;
                stats.failed_hooks += 1;
            }
            StateChange::UncaughtException { .. } => {
                entry.uncaught_exceptions += 1;
                stats.uncaught_exceptions += 1;
            }
            StateChange::UnhandledRejection { .. } => {
                entry.unhandled_rejections += 1;
                stats.unhandled_rejections += 1;
            }
            StateChange::WorkerFailed { .. } => {
                entry.worker_failed = true;
                stats.worker_failures += 1;
            }
            StateChange::WorkerFinished { .. } => {
                entry.finished = true;
                stats.finished_files += 1;
            }
            StateChange::TestTimeoutConfigured { .. }
            | StateChange::WorkerStdout { .. }
            | StateChange::WorkerStderr { .. } => {}
        }
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Counters for one file, if it produced any event.
    pub fn file(&self, file: &TestFile) -> Option<&FileStats> {
        self.files.get(file)
    }

    /// The files this run selected, in dispatch order.
    pub fn selected_files(&self) -> &[TestFile] {
        &self.selected
    }

    /// Returns true when sharding left nothing to run.
    pub fn is_no_op(&self) -> bool {
        self.no_op
    }

    /// Files with any failure, in dispatch order.
    pub fn failing_files(&self) -> Vec<TestFile> {
        self.selected
            .iter()
            .filter(|file| self.files.get(*file).is_some_and(FileStats::has_failure))
            .cloned()
            .collect()
    }

    /// Selected files whose worker never reported anything.
    pub fn skipped_files(&self) -> Vec<TestFile> {
        self.selected
            .iter()
            .filter(|file| !self.files.contains_key(*file))
            .cloned()
            .collect()
    }

    /// Returns true when anything failed, timed out or was interrupted.
    pub fn has_failures(&self) -> bool {
        let stats = &self.stats;
        stats.failed_tests > 0
            || stats.failed_hooks > 0
            || stats.uncaught_exceptions > 0
            || stats.unhandled_rejections > 0
            || stats.worker_failures > 0
            || stats.timeouts > 0
            || stats.internal_errors > 0
            || stats.shared_worker_errors > 0
            || stats.interrupted
    }

    /// Process exit code: 0 on success, 1 on any failure or when no test ran.
    pub fn exit_code(&self) -> i32 {
        if self.has_failures() {
            return 1;
        }
        let tests_reported: usize = self.files.values().map(FileStats::tests_reported).sum();
        if tests_reported == 0 && !self.no_op {
            return 1;
        }
        0
    }
}
