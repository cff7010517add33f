//! State changes reported by units and run-level events emitted by the coordinator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::{ChannelId, WorkerId};
use crate::status::{Shard, WorkerExit, WorkerFailure};
use crate::test_file::TestFile;

/// Whole milliseconds in `period`, saturating at `u64::MAX`.
pub fn duration_ms(period: Duration) -> u64 {
    u64::try_from(period.as_millis()).unwrap_or(u64::MAX)
}

/// A state change reported for one test file.
///
/// Units send most of these over the control channel; the transport adds the
/// output chunks and the terminal `WorkerFailed` / `WorkerFinished`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StateChange {
    /// A test was registered.
    DeclaredTest {
        title: String,
        #[serde(default)]
        skip: bool,
        #[serde(default)]
        todo: bool,
    },

    /// A test passed.
    TestPassed {
        title: String,
        #[serde(default)]
        duration_ms: Option<u64>,
    },

    /// A test failed.
    TestFailed {
        title: String,
        error: String,
        #[serde(default)]
        duration_ms: Option<u64>,
    },

    /// A test was skipped.
    TestSkipped { title: String },

    /// A test is marked todo.
    TestTodo { title: String },

    /// A hook (before/after) failed.
    HookFailed { title: String, error: String },

    /// A test configured a timeout longer than the default.
    TestTimeoutConfigured { period_ms: u64 },

    /// An exception escaped the test code.
    UncaughtException { error: String },

    /// An async failure nobody awaited.
    UnhandledRejection { error: String },

    /// Bytes the unit wrote to standard output.
    WorkerStdout { chunk: Vec<u8> },

    /// Bytes the unit wrote to standard error.
    WorkerStderr { chunk: Vec<u8> },

    /// The unit terminated unsuccessfully.
    WorkerFailed { failure: WorkerFailure },

    /// The unit terminated cleanly or was force-exited.
    WorkerFinished { forced_exit: bool },
}

impl StateChange {
    /// Convert an exit classification into its terminal state change.
    pub fn from_exit(exit: &WorkerExit) -> Self {
        match exit {
            WorkerExit::Finished => Self::WorkerFinished { forced_exit: false },
            WorkerExit::ForcedExit => Self::WorkerFinished { forced_exit: true },
            WorkerExit::Failed { failure } => Self::WorkerFailed {
                failure: failure.clone(),
            },
        }
    }

    /// Returns true for failures that trigger fail-fast bailing.
    pub fn triggers_bail(&self) -> bool {
        matches!(
            self,
            Self::TestFailed { .. } | Self::HookFailed { .. } | Self::WorkerFailed { .. }
        )
    }

    /// Returns true for the change that ends a worker's lifetime.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::WorkerFailed { .. } | Self::WorkerFinished { .. })
    }

    /// Short stable name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeclaredTest { .. } => "declared-test",
            Self::TestPassed { .. } => "test-passed",
            Self::TestFailed { .. } => "test-failed",
            Self::TestSkipped { .. } => "test-skipped",
            Self::TestTodo { .. } => "test-todo",
            Self::HookFailed { .. } => "hook-failed",
            Self::TestTimeoutConfigured { .. } => "test-timeout-configured",
            Self::UncaughtException { .. } => "uncaught-exception",
            Self::UnhandledRejection { .. } => "unhandled-rejection",
            Self::WorkerStdout { .. } => "worker-stdout",
            Self::WorkerStderr { .. } => "worker-stderr",
            Self::WorkerFailed { .. } => "worker-failed",
            Self::WorkerFinished { .. } => "worker-finished",
        }
    }
}

/// A run-level event, broadcast to reporters.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    /// Unix timestamp (milliseconds) when the event was emitted.
    pub timestamp_ms: i64,
    /// What happened.
    pub kind: RunEventKind,
}

/// Type of run-level event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunEventKind {
    /// The run resolved its file list and is about to dispatch.
    Starting {
        files: Vec<TestFile>,
        total_files: usize,
        selected_files: usize,
        no_op: bool,
        shard: Option<Shard>,
    },

    /// A worker reported a state change for its file.
    StateChange {
        file: TestFile,
        worker_id: WorkerId,
        change: StateChange,
    },

    /// The global watchdog fired.
    Timeout {
        period_ms: u64,
        pending_files: Vec<TestFile>,
    },

    /// The run was interrupted from outside.
    Interrupt,

    /// A coordinator-level failure not attributable to one file.
    InternalError { message: String },

    /// A shared-worker connection transitioned to errored.
    SharedWorkerError {
        file: TestFile,
        channel_id: ChannelId,
    },
}

impl RunEvent {
    /// Create an event stamped with the current time.
    pub fn now(kind: RunEventKind) -> Self {
        Self {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            kind,
        }
    }

    /// Create a StateChange event.
    pub fn state_change(file: TestFile, worker_id: WorkerId, change: StateChange) -> Self {
        Self::now(RunEventKind::StateChange {
            file,
            worker_id,
            change,
        })
    }

    /// Create a Timeout event.
    pub fn timeout(period: Duration, pending_files: Vec<TestFile>) -> Self {
        Self::now(RunEventKind::Timeout {
            period_ms: duration_ms(period),
            pending_files,
        })
    }

    /// Create an InternalError event.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::now(RunEventKind::InternalError {
            message: message.into(),
        })
    }

    /// The test file this event is associated with, if any.
    pub fn test_file(&self) -> Option<&TestFile> {
        match &self.kind {
            RunEventKind::StateChange { file, .. } | RunEventKind::SharedWorkerError { file, .. } => {
                Some(file)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duration_ms_saturates() {
        assert_eq!(duration_ms(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_ms(Duration::MAX), u64::MAX);

        let event = RunEvent::timeout(Duration::MAX, Vec::new());
        assert!(matches!(
            event.kind,
            RunEventKind::Timeout { period_ms: u64::MAX, .. }
        ));
    }

    #[test]
    fn test_state_change_wire_format() {
        let change: StateChange = serde_json::from_value(json!({
            "type": "test-failed",
            "title": "adds numbers",
            "error": "expected 4"
        }))
        .unwrap();

        assert_eq!(change.kind(), "test-failed");
        assert!(change.triggers_bail());
    }

    #[test]
    fn test_from_exit() {
        assert_eq!(
            StateChange::from_exit(&WorkerExit::ForcedExit),
            StateChange::WorkerFinished { forced_exit: true }
        );
        let failed = StateChange::from_exit(&WorkerExit::from(WorkerFailure::Signal {
            name: "SIGSEGV".to_string(),
        }));
        assert!(failed.triggers_bail());
        assert!(failed.is_terminal());
        assert!(!StateChange::TestPassed {
            title: "ok".to_string(),
            duration_ms: None
        }
        .triggers_bail());
    }

    #[test]
    fn test_timeout_event() {
        let event = RunEvent::timeout(Duration::from_millis(100), Vec::new());
        assert!(event.timestamp_ms > 0);
        match event.kind {
            RunEventKind::Timeout { period_ms, .. } => assert_eq!(period_ms, 100),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
