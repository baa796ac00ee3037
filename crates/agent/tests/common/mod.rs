//! In-process driver used by the session tests

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use synctap_agent::{AgentConfig, Dispatcher, IdleTracker, RecordingControl, Session, SessionContext, VirtualHost, VirtualRecorder};
use synctap_common::OutboundMessage;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts agent connections on a random local port
pub struct MockDriver {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<DriverConnection>,
}

impl MockDriver {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = accept_async(stream).await {
                    if tx.send(DriverConnection { ws }).is_err() {
                        break;
                    }
                }
            }
        });

        Self { addr, connections }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn accept(&mut self) -> DriverConnection {
        tokio::time::timeout(FRAME_TIMEOUT, self.connections.recv())
            .await
            .expect("agent did not connect")
            .expect("listener stopped")
    }
}

/// Driver side of one agent connection
pub struct DriverConnection {
    ws: WebSocketStream<TcpStream>,
}

impl DriverConnection {
    pub async fn send(&mut self, message_id: i64, action: &str, params: Value) {
        let frame = json!({ "type": action, "params": params, "messageId": message_id });
        self.send_raw(&frame.to_string()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    /// Next frame from the agent, `None` once it closed the connection
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        loop {
            let next = tokio::time::timeout(FRAME_TIMEOUT, self.ws.next())
                .await
                .expect("no frame from agent");

            match next {
                Some(Ok(Message::Text(text))) => return Some(OutboundMessage::decode(&text).unwrap()),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    pub async fn expect_login(&mut self) -> OutboundMessage {
        let login = self.recv().await.expect("connection closed before login");
        assert_eq!(login.action, "login");
        login
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

pub fn config_for(driver: &MockDriver) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.server = driver.url();
    config.session_id = Some("test-session".to_string());
    config.reconnect_delay_ms = 50;
    config.crash_flush_timeout_ms = 500;
    config
}

pub fn fixture() -> Value {
    json!({
        "screen": [400, 800],
        "surfaces": [{
            "identifier": "root",
            "frame": [0, 0, 400, 800],
            "children": [
                { "identifier": "submit", "frame": [0, 0, 100, 40], "text": "Submit", "traits": ["button"] },
                { "identifier": "email", "frame": [20, 100, 360, 44], "editable": true, "text": "" }
            ]
        }]
    })
}

/// Session plus handles the tests poke at directly
pub struct Agent {
    pub session: Session,
    pub context: Arc<SessionContext>,
    pub tracker: IdleTracker,
    pub host: Arc<VirtualHost>,
}

pub fn agent(config: AgentConfig) -> Agent {
    let host = Arc::new(VirtualHost::from_json(fixture()).unwrap());
    let context = SessionContext::new(config);
    let tracker = IdleTracker::new(context.clone());
    let recording = Arc::new(RecordingControl::new(Arc::new(VirtualRecorder::default())));
    let session = Session::new(Dispatcher::new(host.clone(), tracker.clone(), recording));

    Agent {
        session,
        context,
        tracker,
        host,
    }
}
