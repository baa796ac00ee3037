//! WebSocket link to the driver
//!
//! Every connection attempt and everything a live connection receives is
//! reported as a `TransportEvent` on one channel owned by the session.

use futures::{SinkExt, StreamExt};
use synctap_common::{ActionMessage, Error, OutboundMessage, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Everything the transport reports to the session
#[derive(Debug)]
pub enum TransportEvent {
    /// Connection established; frames go out through the sender
    Connected(TransportSender),
    FailedToConnect(String),
    ReceivedAction(ActionMessage),
    /// Frame that could not be decoded into an action
    Malformed(Error),
    Closed(String),
}

enum Outgoing {
    Frame(OutboundMessage),
    Close,
}

/// Handle for sending frames on one connection
#[derive(Debug, Clone)]
pub struct TransportSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl std::fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outgoing::Frame(msg) => write!(f, "Frame({})", msg.action),
            Outgoing::Close => write!(f, "Close"),
        }
    }
}

impl TransportSender {
    /// Queue a frame; fails once the connection is gone
    pub fn send(&self, message: OutboundMessage) -> Result<()> {
        self.tx
            .send(Outgoing::Frame(message))
            .map_err(|_| Error::Transport("connection closed".to_string()))
    }

    /// Flush queued frames, then close the connection
    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

/// Opens connections to the driver
pub struct Transport {
    server: String,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Transport {
    pub fn new(server: impl Into<String>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            server: server.into(),
            events,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Start a connection attempt; the outcome arrives as an event
    pub fn connect(&self) {
        let server = self.server.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            debug!("Connecting to {}", server);
            match connect_async(server.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!("Connected to {}", server);
                    let (tx, rx) = mpsc::unbounded_channel();
                    if events.send(TransportEvent::Connected(TransportSender { tx })).is_ok() {
                        handle_websocket(ws_stream, rx, events).await;
                    }
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", server, e);
                    let _ = events.send(TransportEvent::FailedToConnect(e.to_string()));
                }
            }
        });
    }
}

async fn handle_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(item) = outgoing.recv().await {
            match item {
                Outgoing::Frame(message) => {
                    let text = match message.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode `{}`: {}", message.action, e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    let reason = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                let event = match ActionMessage::decode(&text) {
                    Ok(message) => TransportEvent::ReceivedAction(message),
                    Err(e) => {
                        error!("Malformed frame from driver: {}", e);
                        TransportEvent::Malformed(e)
                    }
                };
                if events.send(event).is_err() {
                    break "session gone".to_string();
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| format!("closed by driver: {}", f.reason))
                    .unwrap_or_else(|| "closed by driver".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        }
    };

    send_task.abort();
    info!("Connection closed: {}", reason);
    let _ = events.send(TransportEvent::Closed(reason));
}
