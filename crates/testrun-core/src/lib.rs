//! testrun Core Domain Types
//!
//! This crate contains the types shared by the coordinator and the execution
//! units it spawns, with no dependency on:
//! - An async runtime
//! - Process or thread management
//! - The filesystem
//!
//! The wire protocol between coordinator and unit lives in [`message`].

pub mod error;
pub mod event;
pub mod ids;
pub mod message;
pub mod status;
pub mod test_file;

// Re-export commonly used types
pub use error::CoreError;
pub use event::{duration_ms, RunEvent, RunEventKind, StateChange};
pub use ids::{ChannelId, MessageId, WorkerId};
pub use message::{FromUnit, SharedMessage, ToUnit, WorkerOptions};
pub use status::{Availability, Shard, TransportKind, WorkerExit, WorkerFailure};
pub use test_file::TestFile;
