//! Driver session: connect, log in, serve actions, reconnect

use crate::context::SessionContext;
use crate::dispatcher::{DispatchOutcome, Dispatcher, Fault};
use crate::recording::RecordingControl;
use crate::transport::{Transport, TransportEvent, TransportSender};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use synctap_common::{ConnectionState, OutboundMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sends the crash notification straight to the driver, bypassing the UI queue
#[derive(Clone)]
pub struct CrashReporter {
    sender: Arc<RwLock<Option<TransportSender>>>,
    recording: Arc<RecordingControl>,
    flush_timeout: Duration,
}

impl CrashReporter {
    fn new(recording: Arc<RecordingControl>, flush_timeout: Duration) -> Self {
        Self {
            sender: Arc::new(RwLock::new(None)),
            recording,
            flush_timeout,
        }
    }

    fn attach(&self, sender: TransportSender) {
        *self.sender.write() = Some(sender);
    }

    fn detach(&self) {
        *self.sender.write() = None;
    }

    /// Flush recording within the configured bound, then report the crash.
    ///
    /// Returns whether the report was handed to a live connection.
    pub async fn notify_on_crash(&self, details: Value) -> bool {
        error!("Application will terminate: {}", details);
        self.recording.stop_within(self.flush_timeout).await;

        let sender = self.sender.read().clone();
        match sender {
            Some(sender) => sender.send(OutboundMessage::crash_report(details)).is_ok(),
            None => {
                warn!("No driver connection, crash report dropped");
                false
            }
        }
    }
}

/// One agent session with the driver
pub struct Session {
    dispatcher: Dispatcher,
    transport: Transport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    faults_tx: mpsc::UnboundedSender<Fault>,
    faults: mpsc::UnboundedReceiver<Fault>,
    crash: CrashReporter,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let config = dispatcher.context().config();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (faults_tx, faults) = mpsc::unbounded_channel();

        let transport = Transport::new(config.server.clone(), events_tx);
        let crash = CrashReporter::new(dispatcher.recording().clone(), config.crash_flush_timeout());

        Self {
            dispatcher,
            transport,
            events,
            faults_tx,
            faults,
            crash,
            cancel: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        self.dispatcher.context()
    }

    pub fn crash_reporter(&self) -> CrashReporter {
        self.crash.clone()
    }

    /// Token that ends `run` when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serve the driver until shutdown or a protocol fault
    pub async fn run(mut self) -> Result<(), Fault> {
        let context = self.dispatcher.context().clone();
        let reconnect_delay = context.config().reconnect_delay();
        let mut sender: Option<TransportSender> = None;

        info!("Session `{}` connecting to {}", context.session_id(), self.transport.server());
        context.set_connection_state(ConnectionState::Connecting);
        self.transport.connect();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Session shutting down");
                    if let Some(sender) = sender.take() {
                        sender.close();
                    }
                    self.teardown().await;
                    return Ok(());
                }

                Some(fault) = self.faults.recv() => {
                    return Err(self.fail(fault, sender.take()).await);
                }

                Some(event) = self.events.recv() => match event {
                    TransportEvent::Connected(new_sender) => {
                        context.set_connection_state(ConnectionState::Connected);
                        if let Err(e) = new_sender.send(OutboundMessage::login(&context.session_id())) {
                            warn!("Failed to send login: {}", e);
                        }
                        self.crash.attach(new_sender.clone());
                        sender = Some(new_sender);
                    }

                    TransportEvent::FailedToConnect(reason) => {
                        debug!("Connect failed ({}), retrying in {:?}", reason, reconnect_delay);
                        context.set_connection_state(ConnectionState::Disconnected);
                        if !self.reconnect_after(reconnect_delay).await {
                            return Ok(());
                        }
                    }

                    TransportEvent::ReceivedAction(message) => {
                        let Some(reply_to) = sender.clone() else {
                            warn!("Dropping `{}` received without a connection", message.action());
                            continue;
                        };

                        // Queued now so UI work keeps arrival order
                        let outcome = self.dispatcher.dispatch(message);
                        let faults = self.faults_tx.clone();
                        tokio::spawn(async move {
                            match outcome.await {
                                DispatchOutcome::Reply(reply) => {
                                    if let Err(e) = reply_to.send(reply) {
                                        debug!("Reply dropped: {}", e);
                                    }
                                }
                                DispatchOutcome::Fault(fault) => {
                                    let _ = faults.send(fault);
                                }
                            }
                        });
                    }

                    TransportEvent::Malformed(error) => {
                        let fault = Fault {
                            message_id: synctap_common::CRASH_REPORT_MESSAGE_ID,
                            action: "<malformed>".to_string(),
                            error,
                        };
                        return Err(self.fail(fault, sender.take()).await);
                    }

                    TransportEvent::Closed(reason) => {
                        info!("Driver connection lost ({}), reconnecting in {:?}", reason, reconnect_delay);
                        sender = None;
                        self.teardown().await;
                        if !self.reconnect_after(reconnect_delay).await {
                            return Ok(());
                        }
                    }
                },
            }
        }
    }

    async fn teardown(&self) {
        self.crash.detach();
        self.dispatcher.context().set_connection_state(ConnectionState::Disconnected);
        if let Err(e) = self.dispatcher.recording().stop().await {
            warn!("Failed to stop recording: {}", e);
        }
    }

    /// Wait out the reconnect delay, then start a new attempt; `false` on shutdown
    async fn reconnect_after(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => {
                self.dispatcher.context().set_connection_state(ConnectionState::Connecting);
                self.transport.connect();
                true
            }
        }
    }

    /// Report a fault as a crash and close the connection
    async fn fail(&mut self, fault: Fault, sender: Option<TransportSender>) -> Fault {
        error!("Shutting down session: {}", fault);
        self.crash
            .notify_on_crash(json!({
                "errorDetails": fault.to_string(),
                "messageId": fault.message_id,
            }))
            .await;

        if let Some(sender) = sender {
            sender.close();
            let flush = self.crash.flush_timeout;
            let closed = tokio::time::timeout(flush, async {
                while let Some(event) = self.events.recv().await {
                    if matches!(event, TransportEvent::Closed(_)) {
                        break;
                    }
                }
            })
            .await;
            if closed.is_err() {
                warn!("Driver did not acknowledge close within {:?}", flush);
            }
        }

        self.teardown().await;
        self.cancel.cancel();
        fault
    }
}
