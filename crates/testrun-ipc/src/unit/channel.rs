//! Unit side of shared-worker channels.
//!
//! A channel keeps the unit alive while it can still be useful: it holds a
//! reference from creation until availability settles, plus one per live
//! subscription. An errored channel drops every reference at once and no
//! later release can take liveness below what it should be.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use testrun_core::{Availability, ChannelId, FromUnit, MessageId, SharedMessage, WorkerId};

use crate::error::ChannelError;
use crate::relay::{lock, Outbound};

/// Reference count with a terminal force-unreffed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefState {
    Idle,
    Referenced(usize),
    ForceUnreffed,
}

impl RefState {
    /// Returns true when the channel started keeping the unit alive.
    pub(crate) fn acquire(&mut self) -> bool {
        match *self {
            Self::Idle => {
                *self = Self::Referenced(1);
                true
            }
            Self::Referenced(n) => {
                *self = Self::Referenced(n + 1);
                false
            }
            Self::ForceUnreffed => false,
        }
    }

    /// Returns true when the channel stopped keeping the unit alive.
    pub(crate) fn release(&mut self) -> bool {
        match *self {
            Self::Referenced(1) => {
                *self = Self::Idle;
                true
            }
            Self::Referenced(n) => {
                *self = Self::Referenced(n - 1);
                false
            }
            Self::Idle | Self::ForceUnreffed => false,
        }
    }

    /// Returns true when the channel was keeping the unit alive until now.
    pub(crate) fn force_unref(&mut self) -> bool {
        let was_referenced = matches!(self, Self::Referenced(_));
        *self = Self::ForceUnreffed;
        was_referenced
    }
}

type SubscriberTx = mpsc::UnboundedSender<Result<SharedMessage, ChannelError>>;

struct ChannelInner {
    refs: RefState,
    subscribers: Vec<(u64, SubscriberTx)>,
    next_subscriber: u64,
    next_message: u64,
}

pub(crate) struct ChannelState {
    id: ChannelId,
    availability: watch::Sender<Availability>,
    inner: Mutex<ChannelInner>,
    liveness: Arc<watch::Sender<usize>>,
}

impl ChannelState {
    fn new(id: ChannelId, liveness: Arc<watch::Sender<usize>>) -> Self {
        Self {
            id,
            availability: watch::Sender::new(Availability::Pending),
            inner: Mutex::new(ChannelInner {
                refs: RefState::Idle,
                subscribers: Vec::new(),
                next_subscriber: 0,
                next_message: 0,
            }),
            liveness,
        }
    }

    fn acquire(&self) {
        if lock(&self.inner).refs.acquire() {
            self.liveness.send_modify(|refs| *refs += 1);
        }
    }

    fn release(&self) {
        if lock(&self.inner).refs.release() {
            self.liveness.send_modify(|refs| *refs = refs.saturating_sub(1));
        }
    }

    fn force_unref(&self) {
        if lock(&self.inner).refs.force_unref() {
            self.liveness.send_modify(|refs| *refs = refs.saturating_sub(1));
        }
    }

    fn availability(&self) -> Availability {
        *self.availability.borrow()
    }

    fn ready(&self) {
        let became_available = self.availability.send_if_modified(|availability| {
            if *availability == Availability::Pending {
                *availability = Availability::Available;
                true
            } else {
                false
            }
        });
        if became_available {
            debug!(channel_id = %self.id, "Shared worker available");
            // The reference taken at creation only covers the pending phase.
            self.release();
        }
    }

    fn deliver(&self, message: SharedMessage) {
        let inner = lock(&self.inner);
        trace!(channel_id = %self.id, subscribers = inner.subscribers.len(), "Delivering shared worker message");
        for (_, tx) in &inner.subscribers {
            let _ = tx.send(Ok(message.clone()));
        }
    }

    fn error(&self) {
        // Availability flips before subscribers are taken: a concurrent
        // `receive` either sees Errored or registers in time to be notified.
        self.availability.send_replace(Availability::Errored);
        let subscribers = std::mem::take(&mut lock(&self.inner).subscribers);
        self.force_unref();

        debug!(channel_id = %self.id, subscribers = subscribers.len(), "Shared worker channel errored");
        for (_, tx) in subscribers {
            let _ = tx.send(Err(ChannelError::Unavailable));
        }
    }

    fn next_message_id(&self) -> MessageId {
        let mut inner = lock(&self.inner);
        inner.next_message += 1;
        MessageId::new(&self.id, inner.next_message)
    }
}

/// Registry of the channels one unit opened.
pub(crate) struct Channels {
    worker_id: WorkerId,
    outbound: Outbound<FromUnit>,
    sequence: AtomicU64,
    open: Mutex<HashMap<ChannelId, Arc<ChannelState>>>,
    liveness: Arc<watch::Sender<usize>>,
}

impl Channels {
    pub(crate) fn new(worker_id: WorkerId, outbound: Outbound<FromUnit>) -> Self {
        Self {
            worker_id,
            outbound,
            sequence: AtomicU64::new(0),
            open: Mutex::new(HashMap::new()),
            liveness: Arc::new(watch::Sender::new(0)),
        }
    }

    pub(crate) fn open(&self, filename: String, initial_data: Value) -> Connection {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let channel_id = ChannelId::new(&self.worker_id, sequence);
        let state = Arc::new(ChannelState::new(channel_id.clone(), Arc::clone(&self.liveness)));
        state.acquire();
        lock(&self.open).insert(channel_id.clone(), Arc::clone(&state));

        debug!(channel_id = %channel_id, filename = %filename, "Opening shared worker channel");
        self.outbound.send(FromUnit::SharedWorkerConnect {
            channel_id,
            filename,
            initial_data,
        });
        Connection {
            state,
            outbound: self.outbound.clone(),
        }
    }

    fn get(&self, channel_id: &ChannelId) -> Option<Arc<ChannelState>> {
        let state = lock(&self.open).get(channel_id).cloned();
        if state.is_none() {
            debug!(channel_id = %channel_id, "Message for unknown shared worker channel");
        }
        state
    }

    pub(crate) fn ready(&self, channel_id: &ChannelId) {
        if let Some(state) = self.get(channel_id) {
            state.ready();
        }
    }

    pub(crate) fn deliver(&self, channel_id: &ChannelId, message: SharedMessage) {
        if let Some(state) = self.get(channel_id) {
            state.deliver(message);
        }
    }

    pub(crate) fn error(&self, channel_id: &ChannelId) {
        let state = lock(&self.open).remove(channel_id);
        match state {
            Some(state) => state.error(),
            None => debug!(channel_id = %channel_id, "Error for unknown shared worker channel"),
        }
    }

    /// The coordinator is gone: every channel is dead.
    pub(crate) fn error_all(&self) {
        let states: Vec<_> = lock(&self.open).drain().map(|(_, state)| state).collect();
        for state in states {
            state.error();
        }
    }

    /// Stop every channel from keeping the unit alive.
    pub(crate) fn force_unref_all(&self) {
        let states: Vec<_> = lock(&self.open).values().cloned().collect();
        for state in states {
            state.force_unref();
        }
    }

    pub(crate) fn liveness_refs(&self) -> usize {
        *self.liveness.borrow()
    }

    pub(crate) async fn idle(&self) {
        let mut refs = self.liveness.subscribe();
        let _ = refs.wait_for(|refs| *refs == 0).await;
    }
}

/// A unit's connection to a shared worker.
pub struct Connection {
    state: Arc<ChannelState>,
    outbound: Outbound<FromUnit>,
}

impl Connection {
    pub fn channel_id(&self) -> &ChannelId {
        &self.state.id
    }

    /// Current availability.
    pub fn availability(&self) -> Availability {
        self.state.availability()
    }

    /// Returns true while the channel is ready for posts.
    pub fn currently_available(&self) -> bool {
        self.state.availability() == Availability::Available
    }

    /// Resolve once the shared worker is ready; fail if the channel errors first.
    pub async fn available(&self) -> Result<(), ChannelError> {
        let mut availability = self.state.availability.subscribe();
        let settled = availability
            .wait_for(Availability::is_settled)
            .await
            .map(|availability| *availability);
        match settled {
            Ok(Availability::Available) => Ok(()),
            _ => Err(ChannelError::Unavailable),
        }
    }

    /// Post a message to the shared worker.
    pub fn post(&self, data: Value, reply_to: Option<MessageId>) -> Result<MessageId, ChannelError> {
        match self.state.availability() {
            Availability::Errored => return Err(ChannelError::Unavailable),
            Availability::Pending => return Err(ChannelError::NotYetAvailable),
            Availability::Available => {}
        }

        let message_id = self.state.next_message_id();
        self.outbound.send(FromUnit::SharedWorkerMessage {
            channel_id: self.state.id.clone(),
            message: SharedMessage {
                message_id: message_id.clone(),
                reply_to,
                data,
            },
        });
        Ok(message_id)
    }

    /// Subscribe to messages from the shared worker.
    ///
    /// The subscription keeps the unit alive until it is dropped or the
    /// channel errors.
    pub fn receive(&self) -> Result<Subscription, ChannelError> {
        let (id, rx) = {
            let mut inner = lock(&self.state.inner);
            if self.state.availability() == Availability::Errored {
                return Err(ChannelError::Unavailable);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.push((id, tx));
            (id, rx)
        };
        self.state.acquire();

        Ok(Subscription {
            state: Arc::clone(&self.state),
            id,
            rx,
        })
    }
}

/// A stream of messages from a shared worker.
pub struct Subscription {
    state: Arc<ChannelState>,
    id: u64,
    rx: mpsc::UnboundedReceiver<Result<SharedMessage, ChannelError>>,
}

impl Subscription {
    /// Next message. Yields `Err(Unavailable)` once if the channel errors, then `None`.
    pub async fn recv(&mut self) -> Option<Result<SharedMessage, ChannelError>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        lock(&self.state.inner)
            .subscribers
            .retain(|(id, _)| *id != self.id);
        self.state.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channels() -> (Channels, mpsc::Receiver<FromUnit>) {
        let (tx, rx) = mpsc::channel(16);
        (Channels::new(WorkerId::new("w"), Outbound::new(tx)), rx)
    }

    fn message(channel: &ChannelId, n: u64) -> SharedMessage {
        SharedMessage {
            message_id: MessageId::from_host(channel, n),
            reply_to: None,
            data: json!(n),
        }
    }

    #[test]
    fn test_ref_state_transitions() {
        let mut refs = RefState::Idle;
        assert!(refs.acquire());
        assert!(!refs.acquire());
        assert!(!refs.release());
        assert!(refs.release());
        assert_eq!(refs, RefState::Idle);
        assert!(!refs.release());

        assert!(refs.acquire());
        assert!(refs.force_unref());
        assert!(!refs.acquire());
        assert!(!refs.release());
        assert!(!refs.force_unref());
        assert_eq!(refs, RefState::ForceUnreffed);
    }

    #[tokio::test]
    async fn test_pending_channel_keeps_unit_alive_until_ready() {
        let (channels, mut rx) = channels();
        let connection = channels.open("store".to_string(), json!({"a": 1}));
        assert_eq!(channels.liveness_refs(), 1);
        assert_eq!(connection.channel_id().as_str(), "w/channel/1");
        assert!(matches!(
            rx.recv().await,
            Some(FromUnit::SharedWorkerConnect { .. })
        ));

        assert_eq!(connection.post(Value::Null, None), Err(ChannelError::NotYetAvailable));

        channels.ready(connection.channel_id());
        connection.available().await.unwrap();
        assert!(connection.currently_available());
        assert_eq!(channels.liveness_refs(), 0);

        let id = connection.post(json!("hi"), None).unwrap();
        assert_eq!(id.as_str(), "w/channel/1/message/1");
        assert!(matches!(
            rx.recv().await,
            Some(FromUnit::SharedWorkerMessage { .. })
        ));
    }

    #[tokio::test]
    async fn test_subscription_holds_reference() {
        let (channels, _rx) = channels();
        let connection = channels.open("store".to_string(), Value::Null);
        channels.ready(connection.channel_id());

        let mut subscription = connection.receive().unwrap();
        assert_eq!(channels.liveness_refs(), 1);

        channels.deliver(connection.channel_id(), message(connection.channel_id(), 1));
        let received = subscription.recv().await.unwrap().unwrap();
        assert_eq!(received.data, json!(1));

        drop(subscription);
        assert_eq!(channels.liveness_refs(), 0);
        channels.idle().await;
    }

    #[tokio::test]
    async fn test_error_releases_everything_once() {
        let (channels, _rx) = channels();
        let connection = channels.open("store".to_string(), Value::Null);
        let mut first = connection.receive().unwrap();
        let second = connection.receive().unwrap();
        assert_eq!(channels.liveness_refs(), 1);

        channels.error(connection.channel_id());
        assert_eq!(channels.liveness_refs(), 0);
        assert_eq!(first.recv().await, Some(Err(ChannelError::Unavailable)));
        assert_eq!(first.recv().await, None);

        // Late releases must not touch liveness.
        drop(second);
        assert_eq!(channels.liveness_refs(), 0);

        assert_eq!(connection.available().await, Err(ChannelError::Unavailable));
        assert_eq!(connection.post(Value::Null, None), Err(ChannelError::Unavailable));
        assert!(matches!(connection.receive(), Err(ChannelError::Unavailable)));
        assert_eq!(connection.availability(), Availability::Errored);
    }

    #[tokio::test]
    async fn test_ready_after_error_is_ignored() {
        let (channels, _rx) = channels();
        let connection = channels.open("store".to_string(), Value::Null);
        let other = channels.open("store".to_string(), Value::Null);
        assert_eq!(channels.liveness_refs(), 2);
        assert_ne!(connection.channel_id(), other.channel_id());

        channels.error_all();
        channels.ready(connection.channel_id());
        assert_eq!(connection.availability(), Availability::Errored);
        assert_eq!(channels.liveness_refs(), 0);
    }

    #[tokio::test]
    async fn test_force_unref_all_lets_unit_exit() {
        let (channels, _rx) = channels();
        let connection = channels.open("store".to_string(), Value::Null);
        let _subscription = connection.receive().unwrap();
        assert_eq!(channels.liveness_refs(), 1);

        channels.force_unref_all();
        assert_eq!(channels.liveness_refs(), 0);
        channels.idle().await;
    }
}
