//! Error types for transports, shared-worker channels and hosts.

use thiserror::Error;

use testrun_core::ChannelId;

/// Errors that can occur while spawning or talking to an execution unit.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to spawn the unit process or thread, or to open its control channel.
    #[error("Failed to spawn unit: {0}")]
    Spawn(#[from] std::io::Error),

    /// JSON serialization/deserialization error on the control channel.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer violated the control protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A required environment variable is missing in a process unit.
    #[error("Missing environment variable {0}; was this process started by testrun?")]
    MissingEnv(&'static str),

    /// The control channel is gone.
    #[error("Channel closed")]
    ChannelClosed,
}

/// Errors surfaced by a shared-worker connection inside a unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The connection errored; it can never become useful again.
    #[error("The shared worker is no longer available")]
    Unavailable,

    /// The host has not signalled ready yet.
    #[error("Shared worker is not yet available")]
    NotYetAvailable,
}

/// Errors reported by a shared-worker host.
#[derive(Debug, Error)]
pub enum HostError {
    /// No shared worker is registered under the requested filename.
    #[error("No shared worker registered for '{0}'")]
    UnknownWorker(String),

    /// A shared worker failed while serving a channel.
    #[error("Shared worker '{filename}' failed on {channel_id}: {message}")]
    Failed {
        filename: String,
        channel_id: ChannelId,
        message: String,
    },

    /// A shared worker task panicked or was cancelled.
    #[error("Shared worker task aborted: {0}")]
    Aborted(String),
}
