//! testrun worker plumbing.
//!
//! This crate moves messages between the coordinator and its execution units:
//! - [`relay`]: ordered, loss-free sends over a channel that signals backpressure
//! - [`transport`]: launching units as child processes or threads
//! - [`unit`]: the handle test code uses inside a unit
//! - [`host`]: serving shared-worker channels on the coordinator side

pub mod error;
pub mod host;
pub mod relay;
pub mod transport;
pub mod unit;
pub mod wire;

pub use error::{ChannelError, HostError, TransportError};
pub use host::{BoxError, RegistryHost, SharedWorker, SharedWorkerHost, SharedWorkerPort};
pub use relay::{Delivery, Outbound, RawSend, Relay};
pub use transport::{ProcessTransport, ThreadTransport, Transport, WorkerEvent, WorkerHandle};
pub use unit::{serve_from_env, Connection, Subscription, Unit, UnitEntry, UnitOutput};
