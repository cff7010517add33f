//! Envelopes exchanged between the coordinator and an execution unit.
//!
//! Process units receive these as newline-delimited JSON over their control
//! connection; thread units receive the values directly. Every envelope carries
//! a `type` tag.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::StateChange;
use crate::ids::{ChannelId, MessageId, WorkerId};
use crate::status::TransportKind;
use crate::test_file::TestFile;

/// Options delivered to a unit once it reports `ready-for-options`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOptions {
    pub worker_id: WorkerId,
    pub file: TestFile,
    pub kind: TransportKind,
    #[serde(default)]
    pub fail_fast: bool,
    /// Opaque configuration for whatever loads the test code.
    #[serde(default)]
    pub extra: Value,
}

/// A message posted on a shared-worker channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedMessage {
    pub message_id: MessageId,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    pub data: Value,
}

/// Coordinator to unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ToUnit {
    /// Full options, sent only after `ready-for-options`.
    Options { options: WorkerOptions },

    /// Flush request; answered with `pong`.
    Ping,

    /// Another worker failed and fail-fast is on: finish the current test, start no more.
    PeerFailed,

    /// The shared-worker host accepted the channel.
    SharedWorkerReady { channel_id: ChannelId },

    /// A message from the shared worker.
    SharedWorkerMessage {
        channel_id: ChannelId,
        message: SharedMessage,
    },

    /// The channel is dead.
    SharedWorkerError { channel_id: ChannelId },
}

/// Unit to coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FromUnit {
    /// The unit is up. Thread units must not be torn down before this arrives.
    Starting,

    /// The unit listens for its options.
    ReadyForOptions,

    /// Answer to `ping`.
    Pong,

    /// A state change for the unit's file.
    StateChange { change: StateChange },

    /// Open a channel to a shared worker.
    SharedWorkerConnect {
        channel_id: ChannelId,
        filename: String,
        #[serde(default)]
        initial_data: Value,
    },

    /// A message for the shared worker.
    SharedWorkerMessage {
        channel_id: ChannelId,
        message: SharedMessage,
    },
}

impl FromUnit {
    /// Short stable name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::ReadyForOptions => "ready-for-options",
            Self::Pong => "pong",
            Self::StateChange { .. } => "state-change",
            Self::SharedWorkerConnect { .. } => "shared-worker-connect",
            Self::SharedWorkerMessage { .. } => "shared-worker-message",
        }
    }
}

impl ToUnit {
    /// Short stable name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Options { .. } => "options",
            Self::Ping => "ping",
            Self::PeerFailed => "peer-failed",
            Self::SharedWorkerReady { .. } => "shared-worker-ready",
            Self::SharedWorkerMessage { .. } => "shared-worker-message",
            Self::SharedWorkerError { .. } => "shared-worker-error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_unit_serialization() {
        let json = serde_json::to_string(&ToUnit::PeerFailed).unwrap();
        assert_eq!(json, r#"{"type":"peer-failed"}"#);

        let json = serde_json::to_string(&ToUnit::SharedWorkerError {
            channel_id: ChannelId::from("w/channel/1"),
        })
        .unwrap();
        assert!(json.contains("shared-worker-error"));
        assert!(json.contains("w/channel/1"));
    }

    #[test]
    fn test_from_unit_parses_nested_state_change() {
        let message: FromUnit = serde_json::from_value(json!({
            "type": "state-change",
            "change": { "type": "test-passed", "title": "works" }
        }))
        .unwrap();

        match message {
            FromUnit::StateChange {
                change: StateChange::TestPassed { title, duration_ms },
            } => {
                assert_eq!(title, "works");
                assert!(duration_ms.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_connect_defaults_initial_data() {
        let message: FromUnit = serde_json::from_value(json!({
            "type": "shared-worker-connect",
            "channel_id": "w/channel/1",
            "filename": "db"
        }))
        .unwrap();
        assert_eq!(message.kind(), "shared-worker-connect");
        assert!(matches!(
            message,
            FromUnit::SharedWorkerConnect { initial_data: Value::Null, .. }
        ));
    }
}
