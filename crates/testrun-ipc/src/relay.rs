//! Flow-controlled outbound relay.
//!
//! [`Relay`] turns a raw send primitive that can signal backpressure into an
//! ordered, loss-free queue: while the peer keeps up, messages go straight
//! through; once it signals backpressure, later messages wait in a FIFO
//! backlog until [`Relay::drained`] is called. A dead peer clears the backlog
//! and every later message is dropped.
//!
//! [`Outbound`] is the runtime-backed form used by both ends of a worker's
//! control channel: a relay over a bounded tokio channel plus a drain watcher.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Outcome of one raw send attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery<M> {
    /// Accepted, and the sink has room for more.
    Ready,
    /// Accepted, but the sink asks the caller to wait for a drain.
    Saturated,
    /// Not accepted. The message is handed back and must be retried after a drain.
    Full(M),
    /// The peer is gone.
    Closed,
}

/// A send primitive that can signal backpressure.
pub trait RawSend<M> {
    /// Try to hand `message` to the peer.
    fn raw_send(&mut self, message: M) -> Delivery<M>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Immediate,
    Buffering,
    Closed,
}

/// Ordered relay over a [`RawSend`] sink.
pub struct Relay<M, S> {
    sink: S,
    backlog: VecDeque<M>,
    mode: Mode,
}

impl<M, S: RawSend<M>> Relay<M, S> {
    /// Create a relay in immediate mode.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            backlog: VecDeque::new(),
            mode: Mode::Immediate,
        }
    }

    /// Submit a message.
    pub fn send(&mut self, message: M) {
        match self.mode {
            Mode::Immediate => {
                self.deliver(message);
            }
            Mode::Buffering => self.backlog.push_back(message),
            Mode::Closed => trace!("Dropping message for closed peer"),
        }
    }

    /// The sink drained: flush the backlog until it is empty or backpressure returns.
    pub fn drained(&mut self) {
        if self.mode != Mode::Buffering {
            return;
        }
        self.mode = Mode::Immediate;
        while let Some(message) = self.backlog.pop_front() {
            if !self.deliver(message) {
                return;
            }
        }
    }

    /// The peer errored or disconnected. Clears the backlog; later sends are dropped.
    pub fn close(&mut self) {
        if self.mode != Mode::Closed {
            debug!(dropped = self.backlog.len(), "Closing relay");
        }
        self.backlog.clear();
        self.mode = Mode::Closed;
    }

    /// Returns true while messages are held back.
    pub fn is_buffering(&self) -> bool {
        self.mode == Mode::Buffering
    }

    /// Returns true once the peer is known to be dead.
    pub fn is_closed(&self) -> bool {
        self.mode == Mode::Closed
    }

    /// Number of messages waiting for a drain.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Access the underlying sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Returns false when delivery must stop (backpressure or closed).
    fn deliver(&mut self, message: M) -> bool {
        match self.sink.raw_send(message) {
            Delivery::Ready => true,
            Delivery::Saturated => {
                self.mode = Mode::Buffering;
                false
            }
            Delivery::Full(message) => {
                self.backlog.push_front(message);
                self.mode = Mode::Buffering;
                false
            }
            Delivery::Closed => {
                self.close();
                false
            }
        }
    }
}

/// [`RawSend`] over a bounded tokio channel.
///
/// Filling the last slot reports [`Delivery::Saturated`]; a full channel hands
/// the message back.
pub struct ChannelSink<M>(mpsc::Sender<M>);

impl<M> RawSend<M> for ChannelSink<M> {
    fn raw_send(&mut self, message: M) -> Delivery<M> {
        match self.0.try_send(message) {
            Ok(()) if self.0.capacity() == 0 => Delivery::Saturated,
            Ok(()) => Delivery::Ready,
            Err(TrySendError::Full(message)) => Delivery::Full(message),
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

struct OutboundState<M> {
    relay: Relay<M, ChannelSink<M>>,
    watching: bool,
}

struct OutboundShared<M> {
    state: Mutex<OutboundState<M>>,
    drained: Notify,
    runtime: Handle,
}

/// Shared handle to a relay feeding a bounded channel.
///
/// While the relay buffers, a background task waits for channel capacity and
/// flushes the backlog. Cloning shares the same relay.
pub struct Outbound<M> {
    shared: Arc<OutboundShared<M>>,
}

impl<M> Clone for Outbound<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M> fmt::Debug for Outbound<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Outbound")
            .field("buffering", &state.relay.is_buffering())
            .field("closed", &state.relay.is_closed())
            .field("backlog", &state.relay.backlog_len())
            .finish()
    }
}

impl<M: Send + 'static> Outbound<M> {
    /// Wrap `tx` in a relay. Must be called from within a tokio runtime.
    pub fn new(tx: mpsc::Sender<M>) -> Self {
        Self {
            shared: Arc::new(OutboundShared {
                state: Mutex::new(OutboundState {
                    relay: Relay::new(ChannelSink(tx)),
                    watching: false,
                }),
                drained: Notify::new(),
                runtime: Handle::current(),
            }),
        }
    }

    /// Submit a message. Never blocks.
    pub fn send(&self, message: M) {
        let mut state = lock(&self.shared.state);
        let was_closed = state.relay.is_closed();
        state.relay.send(message);
        if !was_closed && state.relay.is_closed() {
            drop(state);
            self.shared.drained.notify_waiters();
            return;
        }
        if state.relay.is_buffering() && !state.watching {
            state.watching = true;
            let tx = state.relay.sink().0.clone();
            let shared = Arc::clone(&self.shared);
            self.shared.runtime.spawn(watch_drain(shared, tx));
        }
    }

    /// Mark the peer dead: drop the backlog and every later message.
    pub fn close(&self) {
        lock(&self.shared.state).relay.close();
        self.shared.drained.notify_waiters();
    }

    /// Returns true once the peer is known to be dead.
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).relay.is_closed()
    }

    /// Resolves once the peer is known to be dead.
    pub async fn closed(&self) {
        loop {
            let notified = self.shared.drained.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once nothing is held back in the backlog.
    pub async fn flushed(&self) {
        loop {
            let notified = self.shared.drained.notified();
            if !lock(&self.shared.state).relay.is_buffering() {
                return;
            }
            notified.await;
        }
    }
}

async fn watch_drain<M: Send + 'static>(shared: Arc<OutboundShared<M>>, tx: mpsc::Sender<M>) {
    loop {
        // Waiting for one free slot is the drain signal; the permit is released
        // immediately so the relay can use the slot itself.
        let drained = tx.reserve().await.map(drop).is_ok();

        let mut state = lock(&shared.state);
        if drained {
            state.relay.drained();
        } else {
            state.relay.close();
        }
        if !state.relay.is_buffering() {
            state.watching = false;
            drop(state);
            shared.drained.notify_waiters();
            return;
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
