//! Coordinator side of a unit's control protocol.

use std::collections::HashMap;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use testrun_core::{
    ChannelId, FromUnit, SharedMessage, StateChange, TestFile, ToUnit, WorkerExit, WorkerId,
    WorkerOptions,
};

use super::{PongQueue, WorkerEvent};
use crate::host::SharedWorkerPort;
use crate::relay::{lock, Outbound};

/// Routes one unit's messages and owns its exit notification.
pub(crate) struct Session {
    worker_id: WorkerId,
    file: TestFile,
    options: Option<WorkerOptions>,
    outbound: Outbound<ToUnit>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    pongs: PongQueue,
    channels: HashMap<ChannelId, mpsc::UnboundedSender<SharedMessage>>,
    force_exit: CancellationToken,
    exit: watch::Sender<Option<WorkerExit>>,
    started: bool,
}

impl Session {
    pub(crate) fn new(
        file: TestFile,
        options: WorkerOptions,
        outbound: Outbound<ToUnit>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        pongs: PongQueue,
        force_exit: CancellationToken,
        exit: watch::Sender<Option<WorkerExit>>,
    ) -> Self {
        Self {
            worker_id: options.worker_id.clone(),
            file,
            options: Some(options),
            outbound,
            events,
            pongs,
            channels: HashMap::new(),
            force_exit,
            exit,
            started: false,
        }
    }

    pub(crate) fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Token cancelled when the coordinator asks for a forced exit.
    pub(crate) fn force_exit_token(&self) -> CancellationToken {
        self.force_exit.clone()
    }

    /// Sender for transport-produced events such as output chunks.
    pub(crate) fn events(&self) -> mpsc::UnboundedSender<WorkerEvent> {
        self.events.clone()
    }

    /// Returns true once the unit reported `starting`.
    pub(crate) fn is_started(&self) -> bool {
        self.started
    }

    /// Dispatch one message from the unit.
    pub(crate) fn handle(&mut self, message: FromUnit) {
        trace!(worker_id = %self.worker_id, message_type = message.kind(), "Unit message");

        match message {
            FromUnit::Starting => {
                debug!(worker_id = %self.worker_id, "Unit starting");
                self.started = true;
            }
            FromUnit::ReadyForOptions => match self.options.take() {
                Some(options) => self.outbound.send(ToUnit::Options { options }),
                None => warn!(worker_id = %self.worker_id, "Unit asked for options twice"),
            },
            FromUnit::Pong => lock(&self.pongs).resolve_next(),
            FromUnit::StateChange { change } => {
                // Only the transport decides how a worker ended.
                if change.is_terminal() {
                    warn!(
                        worker_id = %self.worker_id,
                        change = change.kind(),
                        "Ignoring terminal state change sent by unit"
                    );
                    return;
                }
                self.emit(WorkerEvent::StateChange(change));
            }
            FromUnit::SharedWorkerConnect {
                channel_id,
                filename,
                initial_data,
            } => {
                if self.channels.contains_key(&channel_id) {
                    warn!(worker_id = %self.worker_id, channel_id = %channel_id, "Duplicate shared worker channel");
                    return;
                }
                info!(
                    worker_id = %self.worker_id,
                    channel_id = %channel_id,
                    filename = %filename,
                    "Unit connecting to shared worker"
                );
                let (tx, rx) = mpsc::unbounded_channel();
                self.channels.insert(channel_id.clone(), tx);
                let port = SharedWorkerPort::new(
                    channel_id,
                    self.worker_id.clone(),
                    self.file.clone(),
                    filename,
                    initial_data,
                    self.outbound.clone(),
                    rx,
                    self.events.downgrade(),
                );
                self.emit(WorkerEvent::SharedWorkerConnect(port));
            }
            FromUnit::SharedWorkerMessage { channel_id, message } => {
                let delivered = self
                    .channels
                    .get(&channel_id)
                    .map(|tx| tx.send(message).is_ok());
                match delivered {
                    Some(true) => {}
                    Some(false) => {
                        debug!(channel_id = %channel_id, "Shared worker port dropped; forgetting channel");
                        self.channels.remove(&channel_id);
                    }
                    None => warn!(channel_id = %channel_id, "Message for unknown shared worker channel"),
                }
            }
        }
    }

    /// Publish the terminal change and the exit classification.
    ///
    /// Consumes the session: once every port drops, the event stream ends.
    pub(crate) fn finish(self, exit: WorkerExit) {
        info!(worker_id = %self.worker_id, file = %self.file, exit = ?exit, "Worker exited");

        self.outbound.close();
        lock(&self.pongs).close();
        self.emit(WorkerEvent::StateChange(StateChange::from_exit(&exit)));
        self.exit.send_replace(Some(exit));
    }

    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            trace!(worker_id = %self.worker_id, "Worker events receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::open_session;
    use serde_json::json;
    use testrun_core::{MessageId, TransportKind};

    fn open() -> (
        crate::transport::WorkerHandle,
        Session,
        mpsc::Receiver<ToUnit>,
    ) {
        let file = TestFile::new("/tmp/session.test").unwrap();
        let options = WorkerOptions {
            worker_id: WorkerId::new("w1"),
            file: file.clone(),
            kind: TransportKind::Process,
            fail_fast: true,
            extra: json!({"require": []}),
        };
        open_session(&file, options, 8)
    }

    #[tokio::test]
    async fn test_options_sent_once() {
        let (_handle, mut session, mut to_unit) = open();
        assert!(!session.is_started());
        session.handle(FromUnit::Starting);
        assert!(session.is_started());

        session.handle(FromUnit::ReadyForOptions);
        session.handle(FromUnit::ReadyForOptions);

        match to_unit.recv().await {
            Some(ToUnit::Options { options }) => assert!(options.fail_fast),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(to_unit.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unit_cannot_report_its_own_exit() {
        let (mut handle, mut session, _to_unit) = open();
        let mut events = handle.take_events().unwrap();

        session.handle(FromUnit::StateChange {
            change: StateChange::WorkerFinished { forced_exit: false },
        });
        session.handle(FromUnit::StateChange {
            change: StateChange::TestSkipped {
                title: "later".to_string(),
            },
        });

        assert!(matches!(
            events.recv().await,
            Some(WorkerEvent::StateChange(StateChange::TestSkipped { .. }))
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shared_worker_messages_reach_port() {
        let (mut handle, mut session, mut to_unit) = open();
        let mut events = handle.take_events().unwrap();
        let channel_id = ChannelId::from("w1/channel/1");

        session.handle(FromUnit::SharedWorkerConnect {
            channel_id: channel_id.clone(),
            filename: "store".to_string(),
            initial_data: json!({"seed": 1}),
        });
        let mut port = match events.recv().await {
            Some(WorkerEvent::SharedWorkerConnect(port)) => port,
            other => panic!("unexpected event: {other:?}"),
        };
        assert_eq!(port.filename(), "store");
        assert_eq!(port.initial_data(), &json!({"seed": 1}));

        session.handle(FromUnit::SharedWorkerMessage {
            channel_id: channel_id.clone(),
            message: SharedMessage {
                message_id: MessageId::new(&channel_id, 1),
                reply_to: None,
                data: json!("hello"),
            },
        });
        let message = port.recv().await.unwrap();
        assert_eq!(message.data, json!("hello"));

        port.ready();
        assert_eq!(
            to_unit.recv().await,
            Some(ToUnit::SharedWorkerReady { channel_id })
        );
    }
}
