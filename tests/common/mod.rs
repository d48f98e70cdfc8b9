#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use paicord_core::config::GatewayConfig;
use paicord_core::error::TransportError;
use paicord_core::gateway::{EventStream, GatewayManager};
use paicord_core::transport::{CloseInfo, Connection, Connector, Inbound};

/// How long a scripted server waits for the client before failing the test.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// The server side of one fake transport. Dropping it ends the client's
/// stream as an abnormal close.
pub struct ServerEnd {
    pub url: String,
    to_client: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    pub fn send(&self, frame: Value) {
        let _ = self.to_client.send(Ok(Inbound::Text(frame.to_string())));
    }

    pub fn close(&self, info: CloseInfo) {
        let _ = self.to_client.send(Ok(Inbound::Closed(info)));
    }

    pub fn hello(&self, heartbeat_interval_ms: u64) {
        self.send(json!({ "op": 10, "d": { "heartbeat_interval": heartbeat_interval_ms } }));
    }

    pub fn dispatch(&self, seq: u64, name: &str, d: Value) {
        self.send(json!({ "op": 0, "s": seq, "t": name, "d": d }));
    }

    pub fn ready(&self, seq: u64, session_id: &str) {
        self.dispatch(
            seq,
            "READY",
            json!({ "session_id": session_id, "resume_gateway_url": "ws://resume.test" }),
        );
    }

    /// Next frame the client wrote, or `None` once the client released the
    /// transport.
    pub async fn recv(&mut self) -> Option<Value> {
        let text = tokio::time::timeout(STEP_TIMEOUT, self.from_client.recv())
            .await
            .expect("client did not write in time")?;
        Some(serde_json::from_str(&text).expect("client wrote invalid json"))
    }

    /// Skips frames until one with gateway opcode `op` arrives.
    pub async fn recv_op(&mut self, op: u64) -> Value {
        loop {
            let frame = self.recv().await.expect("client closed the transport");
            if frame["op"] == op {
                return frame;
            }
        }
    }

    /// Skips frames until one with pairing op name `op` arrives.
    pub async fn recv_named(&mut self, op: &str) -> Value {
        loop {
            let frame = self.recv().await.expect("client closed the transport");
            if frame["op"] == op {
                return frame;
            }
        }
    }

    /// Waits for the client to drop its half of the transport.
    pub async fn closed_by_client(&mut self) {
        while self.recv().await.is_some() {}
    }
}

/// In-memory [`Connector`]. Every `connect` hands a fresh [`ServerEnd`] to
/// the test through the receiver returned by [`fake_transport`].
#[derive(Clone)]
pub struct FakeConnector {
    servers: mpsc::UnboundedSender<ServerEnd>,
    refuse: Arc<AtomicBool>,
    urls: Arc<Mutex<Vec<String>>>,
}

impl FakeConnector {
    /// Makes every following `connect` fail.
    pub fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

pub fn fake_transport() -> (FakeConnector, mpsc::UnboundedReceiver<ServerEnd>) {
    let (servers, rx) = mpsc::unbounded_channel();
    let connector = FakeConnector {
        servers,
        refuse: Arc::new(AtomicBool::new(false)),
        urls: Arc::new(Mutex::new(Vec::new())),
    };
    (connector, rx)
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        self.urls.lock().unwrap().push(url.to_string());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel::<String>();

        let sink = futures_util::sink::unfold(outbound, |tx, text: String| async move {
            tx.send(text)
                .map_err(|_| TransportError::Send("server end dropped".to_string()))?;
            Ok::<_, TransportError>(tx)
        });
        let stream = futures_util::stream::unfold(inbound, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        self.servers
            .send(ServerEnd {
                url: url.to_string(),
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::Connect {
                url: url.to_string(),
                reason: "test harness gone".to_string(),
            })?;

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Config with short timings so failure paths resolve quickly.
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        url: "ws://gateway.test".to_string(),
        hello_timeout: Duration::from_millis(500),
        max_reconnect_attempts: 3,
        reconnect_base: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(40),
        consumer_grace_period: Duration::from_secs(1),
        ..GatewayConfig::default()
    }
}

/// Accepts the next transport and walks it through HELLO, IDENTIFY and READY.
pub async fn serve_identify(
    servers: &mut mpsc::UnboundedReceiver<ServerEnd>,
    heartbeat_interval_ms: u64,
    session_id: &str,
) -> (ServerEnd, Value) {
    let mut server = tokio::time::timeout(STEP_TIMEOUT, servers.recv())
        .await
        .expect("client did not connect in time")
        .expect("connector dropped");
    server.hello(heartbeat_interval_ms);
    let identify = server.recv_op(2).await;
    server.ready(1, session_id);
    (server, identify)
}

/// Connects `manager` against a scripted server and returns once READY has
/// been delivered.
pub async fn connect_ready(
    manager: &mut GatewayManager,
    servers: &mut mpsc::UnboundedReceiver<ServerEnd>,
    heartbeat_interval_ms: u64,
) -> (EventStream, ServerEnd) {
    let (events, (server, _identify)) = tokio::join!(
        manager.connect("test-token"),
        serve_identify(servers, heartbeat_interval_ms, "session-1"),
    );
    (events.expect("connect failed"), server)
}

/// Next event, failing the test if none arrives in time.
pub async fn next_event(events: &mut EventStream) -> paicord_core::gateway::EventResult {
    tokio::time::timeout(STEP_TIMEOUT, events.next_event())
        .await
        .expect("no event in time")
        .expect("event stream ended")
}
