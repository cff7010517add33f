//! Transport kinds, exit classification and shard descriptors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// How an execution unit is isolated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// A separate OS process.
    #[default]
    Process,
    /// A separate native thread inside the coordinator process.
    Thread,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => f.write_str("process"),
            Self::Thread => f.write_str("thread"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(Self::Process),
            "thread" => Ok(Self::Thread),
            other => Err(CoreError::UnknownTransportKind(other.to_string())),
        }
    }
}

/// Why a unit terminated unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkerFailure {
    /// The process exited with a non-zero code.
    NonzeroExit { code: i32 },
    /// The process was killed by a signal it did not expect.
    Signal { name: String },
    /// Spawning, the control channel, or the thread itself failed.
    TransportError { cause: String },
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonzeroExit { code } => write!(f, "exited with code {code}"),
            Self::Signal { name } => write!(f, "killed by {name}"),
            Self::TransportError { cause } => write!(f, "transport error: {cause}"),
        }
    }
}

/// Exit classification of a unit. Produced exactly once per worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum WorkerExit {
    /// Clean exit.
    Finished,
    /// The coordinator terminated the unit.
    ForcedExit,
    /// The unit failed.
    Failed { failure: WorkerFailure },
}

impl WorkerExit {
    /// Returns true if the unit failed on its own.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Returns true if the coordinator forced the exit.
    pub fn is_forced(&self) -> bool {
        matches!(self, Self::ForcedExit)
    }
}

impl From<WorkerFailure> for WorkerExit {
    fn from(failure: WorkerFailure) -> Self {
        Self::Failed { failure }
    }
}

/// Availability of a shared-worker connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Availability {
    /// Waiting for the host to signal ready.
    #[default]
    Pending,
    /// Ready for traffic.
    Available,
    /// Terminal. The connection can never become useful again.
    Errored,
}

impl Availability {
    /// Returns true once the connection left `Pending`.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One shard of a parallel run: this process runs part `index` (0-based) of `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shard {
    pub index: usize,
    pub total: usize,
}

impl Shard {
    /// Create a shard descriptor, validating `index < total`.
    pub fn new(index: usize, total: usize) -> Result<Self, CoreError> {
        if total == 0 || index >= total {
            return Err(CoreError::InvalidShard { index, total });
        }
        Ok(Self { index, total })
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index + 1, self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("thread".parse::<TransportKind>().unwrap(), TransportKind::Thread);
        assert!("fiber".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_shard_validation() {
        assert!(Shard::new(0, 0).is_err());
        assert!(Shard::new(3, 3).is_err());
        let shard = Shard::new(1, 3).unwrap();
        assert_eq!(shard.to_string(), "2/3");
    }

    #[test]
    fn test_worker_exit_serialization() {
        let exit = WorkerExit::from(WorkerFailure::NonzeroExit { code: 3 });
        let json = serde_json::to_string(&exit).unwrap();
        assert!(json.contains("\"outcome\":\"failed\""));
        assert!(json.contains("\"kind\":\"nonzero-exit\""));
        assert!(exit.is_failure());
        assert!(!exit.is_forced());
    }
}
