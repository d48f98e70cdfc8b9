pub mod events;
pub mod heartbeat;
pub mod session;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, TransportError};
use crate::transport::{CloseInfo, Connector, FrameSink, FrameStream, Inbound};
use events::{
    opcode, Event, EventKind, GatewayPayload, HelloData, IdentifyData, ReadyData, ResumeData,
};
use heartbeat::HeartbeatTimer;
use session::{Phase, Session};

pub type EventResult = Result<Event, GatewayError>;

/// How long `disconnect()` waits for the worker to close the transport.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns one logical gateway connection and the background task that keeps
/// it alive.
pub struct GatewayManager {
    config: GatewayConfig,
    connector: Arc<dyn Connector>,
    session: Arc<Mutex<Session>>,
    commands: Option<mpsc::UnboundedSender<GatewayPayload>>,
    shutdown: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
}

impl GatewayManager {
    pub fn new(config: GatewayConfig, connector: impl Connector + 'static) -> Self {
        Self {
            config,
            connector: Arc::new(connector),
            session: Arc::new(Mutex::new(Session::new())),
            commands: None,
            shutdown: None,
            worker: None,
        }
    }

    /// Opens the gateway and identifies with `token`. Returns once the
    /// session is ready; the READY event is the first item of the stream.
    ///
    /// # Errors
    ///
    /// Any failure before READY is returned here and no worker is left
    /// running.
    pub async fn connect(&mut self, token: &str) -> Result<EventStream, GatewayError> {
        if self.worker.as_ref().is_some_and(|w| !w.is_finished()) {
            return Err(GatewayError::AlreadyConnected);
        }
        self.disconnect().await;
        *self.session.lock().await = Session::new();

        let (events_tx, events_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            backoff: self.config.reconnect_base,
            config: self.config.clone(),
            connector: self.connector.clone(),
            session: self.session.clone(),
            token: token.to_string(),
            events: events_tx,
            commands: commands_rx,
            shutdown: shutdown_rx,
            ready: Some(ready_tx),
            pending: VecDeque::new(),
            parked: VecDeque::new(),
            resync_pending: false,
            stalled_since: None,
            consumer_closed: false,
            failed_attempts: 0,
        };
        self.worker = Some(tokio::spawn(worker.run()));
        self.shutdown = Some(shutdown_tx);
        self.commands = Some(commands_tx);

        match ready_rx.await {
            Ok(Ok(())) => Ok(EventStream { rx: events_rx }),
            Ok(Err(err)) => {
                self.disconnect().await;
                Err(err)
            }
            Err(_) => {
                self.disconnect().await;
                Err(GatewayError::NotConnected)
            }
        }
    }

    /// Stops the worker and releases the transport. Safe to call any number
    /// of times.
    pub async fn disconnect(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.commands = None;
        if let Some(mut worker) = self.worker.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut worker).await.is_err() {
                tracing::warn!("gateway worker did not stop in time, aborting it");
                worker.abort();
            }
        }
        let mut session = self.session.lock().await;
        session.invalidate();
        session.set_phase(Phase::Disconnected);
    }

    pub async fn phase(&self) -> Phase {
        self.session.lock().await.phase()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session.lock().await.session_id().map(str::to_string)
    }

    pub async fn last_sequence(&self) -> Option<u64> {
        self.session.lock().await.sequence()
    }

    pub async fn heartbeat_interval(&self) -> Option<Duration> {
        self.session.lock().await.heartbeat_interval()
    }

    /// Queues an arbitrary command frame. Commands are written only while the
    /// session is ready.
    pub fn send_command(&self, op: u8, d: Value) -> Result<(), GatewayError> {
        let commands = self.commands.as_ref().ok_or(GatewayError::NotConnected)?;
        commands
            .send(GatewayPayload::command(op, d))
            .map_err(|_| GatewayError::NotConnected)
    }

    pub fn update_presence(&self, status: &str, afk: bool, activities: Value) -> Result<(), GatewayError> {
        self.send_command(
            opcode::PRESENCE_UPDATE,
            json!({ "status": status, "since": 0, "afk": afk, "activities": activities }),
        )
    }

    pub fn update_voice_state(
        &self,
        guild_id: Option<&str>,
        channel_id: Option<&str>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), GatewayError> {
        self.send_command(
            opcode::VOICE_STATE_UPDATE,
            json!({
                "guild_id": guild_id,
                "channel_id": channel_id,
                "self_mute": self_mute,
                "self_deaf": self_deaf,
            }),
        )
    }

    pub fn request_guild_members(&self, guild_id: &str, query: &str, limit: u32) -> Result<(), GatewayError> {
        self.send_command(
            opcode::REQUEST_GUILD_MEMBERS,
            json!({ "guild_id": guild_id, "query": query, "limit": limit }),
        )
    }
}

impl Drop for GatewayManager {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// Ordered, single-consumer sequence of gateway events for one `connect()`.
/// Ends after `disconnect()`; a terminal failure is delivered as a final
/// `Err` item.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<EventResult>,
}

impl EventStream {
    pub async fn next_event(&mut self) -> Option<EventResult> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = EventResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

enum Exit {
    Shutdown,
    ConsumerGone,
    Fatal(GatewayError),
    Reconnect(GatewayError),
}

enum Flow {
    Continue,
    Exit(Exit),
}

struct Worker {
    config: GatewayConfig,
    connector: Arc<dyn Connector>,
    session: Arc<Mutex<Session>>,
    token: String,
    events: mpsc::Sender<EventResult>,
    commands: mpsc::UnboundedReceiver<GatewayPayload>,
    shutdown: watch::Receiver<bool>,
    /// Present until the first READY; failures before that are fatal.
    ready: Option<oneshot::Sender<Result<(), GatewayError>>>,
    /// Events decoded but not yet taken by the consumer.
    pending: VecDeque<Event>,
    /// Dispatch frames read while `pending` was non-empty. They are decoded
    /// and sequenced only once the consumer catches up, so control frames
    /// keep flowing while dispatch processing is suspended.
    parked: VecDeque<GatewayPayload>,
    resync_pending: bool,
    stalled_since: Option<Instant>,
    consumer_closed: bool,
    failed_attempts: u32,
    backoff: Duration,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let url = self.next_url().await;
            match self.run_connection(&url).await {
                Exit::Shutdown => {
                    tracing::info!("gateway disconnected");
                    break;
                }
                Exit::ConsumerGone => {
                    tracing::info!("event consumer stopped reading, disconnecting");
                    break;
                }
                Exit::Fatal(err) => {
                    self.unpark().await;
                    self.fail(err).await;
                    break;
                }
                Exit::Reconnect(err) => {
                    self.unpark().await;
                    if self.ready.is_some() {
                        self.fail(err).await;
                        break;
                    }
                    self.failed_attempts += 1;
                    if self.failed_attempts > self.config.max_reconnect_attempts {
                        tracing::error!(attempts = self.failed_attempts - 1, "giving up on reconnecting");
                        self.fail(err).await;
                        break;
                    }

                    self.session.lock().await.set_phase(Phase::Resuming);
                    let delay = self.backoff;
                    self.backoff = (self.backoff * 2).min(self.config.reconnect_max);
                    tracing::warn!("gateway connection lost: {err}, reconnecting in {delay:?}");
                    tokio::select! {
                        _ = wait_shutdown(&mut self.shutdown) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.session.lock().await.set_phase(Phase::Disconnected);
    }

    async fn next_url(&self) -> String {
        let session = self.session.lock().await;
        let base = session.resume_url().unwrap_or(&self.config.url);
        self.config.connect_url(base)
    }

    async fn run_connection(&mut self, url: &str) -> Exit {
        {
            let mut session = self.session.lock().await;
            if session.phase() == Phase::Disconnected {
                session.set_phase(Phase::Connecting);
            }
        }

        tracing::debug!(url, "opening gateway transport");
        let connection = tokio::select! {
            _ = wait_shutdown(&mut self.shutdown) => return Exit::Shutdown,
            result = self.connector.connect(url) => match result {
                Ok(connection) => connection,
                Err(e) => return Exit::Reconnect(e.into()),
            },
        };

        let mut sink = connection.sink;
        let mut stream = connection.stream;
        let exit = self.drive(&mut sink, &mut stream).await;
        if let Err(e) = sink.close().await {
            tracing::debug!("error closing gateway transport: {e}");
        }
        exit
    }

    async fn drive(&mut self, sink: &mut FrameSink, stream: &mut FrameStream) -> Exit {
        let first = tokio::select! {
            _ = wait_shutdown(&mut self.shutdown) => return Exit::Shutdown,
            frame = tokio::time::timeout(self.config.hello_timeout, stream.next()) => frame,
        };
        let hello = match first {
            Ok(Some(Ok(Inbound::Text(text)))) => match parse_hello(&text) {
                Ok(hello) => hello,
                Err(e) => return Exit::Fatal(e),
            },
            Ok(Some(Ok(Inbound::Closed(info)))) => return closed_exit(info),
            Ok(Some(Err(e))) => return Exit::Reconnect(e.into()),
            Ok(None) => return Exit::Reconnect(closed(None, "transport ended before HELLO")),
            Err(_) => {
                return Exit::Fatal(GatewayError::ProtocolViolation(format!(
                    "no HELLO within {:?}",
                    self.config.hello_timeout
                )))
            }
        };

        let interval = Duration::from_millis(hello.heartbeat_interval);
        tracing::debug!(interval_ms = hello.heartbeat_interval, "received HELLO");
        let mut timer = HeartbeatTimer::start(interval);
        let mut live = false;

        let handshake = {
            let session = self.session.clone();
            let mut session = session.lock().await;
            session.on_hello(interval);
            match session.take_resume() {
                Some(resume) => {
                    session.set_phase(Phase::Resuming);
                    tracing::info!(session_id = %resume.session_id, seq = ?resume.seq, "resuming gateway session");
                    GatewayPayload::command(
                        opcode::RESUME,
                        json!(ResumeData {
                            token: self.token.clone(),
                            session_id: resume.session_id,
                            seq: resume.seq,
                        }),
                    )
                }
                None => self.identify(&mut session),
            }
        };
        if let Err(e) = send_payload(sink, &handshake).await {
            return Exit::Reconnect(e.into());
        }

        let grace = self.config.consumer_grace_period;
        loop {
            while self.pending.is_empty() {
                let Some(payload) = self.parked.pop_front() else {
                    break;
                };
                if let Flow::Exit(exit) = self.handle_dispatch(payload, &mut live).await {
                    return exit;
                }
            }

            let events = self.events.clone();
            tokio::select! {
                _ = wait_shutdown(&mut self.shutdown) => return Exit::Shutdown,

                _ = tokio::time::sleep_until(timer.deadline()) => {
                    let beat = self.session.lock().await.beat();
                    match beat {
                        Ok(seq) => {
                            tracing::trace!(?seq, "sending heartbeat");
                            let frame = GatewayPayload::command(opcode::HEARTBEAT, json!(seq));
                            if let Err(e) = send_payload(sink, &frame).await {
                                return Exit::Reconnect(e.into());
                            }
                            timer.reset();
                        }
                        Err(missed) => {
                            return Exit::Fatal(GatewayError::Timeout(format!(
                                "{missed} consecutive heartbeats went unacknowledged"
                            )));
                        }
                    }
                }

                permit = events.reserve(), if !self.pending.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(event) = self.pending.pop_front() {
                            permit.send(Ok(event));
                        }
                        self.stalled_since = if self.pending.is_empty() { None } else { Some(Instant::now()) };
                    }
                    Err(_) => self.consumer_lost(),
                },

                _ = events.closed(), if !self.consumer_closed => self.consumer_lost(),

                _ = tokio::time::sleep_until(self.stalled_since.unwrap_or_else(Instant::now) + grace),
                    if self.stalled_since.is_some() => return Exit::ConsumerGone,

                Some(command) = self.commands.recv(), if live => {
                    tracing::debug!(op = command.op, "sending gateway command");
                    if let Err(e) = send_payload(sink, &command).await {
                        return Exit::Reconnect(e.into());
                    }
                }

                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Inbound::Text(text))) => text,
                        Some(Ok(Inbound::Closed(info))) => return closed_exit(info),
                        Some(Err(e)) => return Exit::Reconnect(e.into()),
                        None => return Exit::Reconnect(closed(None, "transport ended")),
                    };
                    let payload: GatewayPayload = match serde_json::from_str(&text) {
                        Ok(payload) => payload,
                        Err(e) => {
                            return Exit::Fatal(GatewayError::ProtocolViolation(format!(
                                "undecodable frame: {e}"
                            )))
                        }
                    };
                    let behind = !(self.pending.is_empty() && self.parked.is_empty());
                    if payload.op == opcode::DISPATCH && behind {
                        self.parked.push_back(payload);
                    } else if let Flow::Exit(exit) = self.handle_frame(payload, sink, &mut timer, &mut live).await {
                        return exit;
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        payload: GatewayPayload,
        sink: &mut FrameSink,
        timer: &mut HeartbeatTimer,
        live: &mut bool,
    ) -> Flow {
        match payload.op {
            opcode::DISPATCH => self.handle_dispatch(payload, live).await,
            opcode::HEARTBEAT => {
                let seq = self.session.lock().await.sequence();
                let frame = GatewayPayload::command(opcode::HEARTBEAT, json!(seq));
                if let Err(e) = send_payload(sink, &frame).await {
                    return Flow::Exit(Exit::Reconnect(e.into()));
                }
                timer.reset();
                Flow::Continue
            }
            opcode::HEARTBEAT_ACK => {
                self.session.lock().await.ack();
                Flow::Continue
            }
            opcode::RECONNECT => {
                tracing::info!("server requested reconnect");
                Flow::Exit(Exit::Reconnect(closed(None, "server requested reconnect")))
            }
            opcode::INVALID_SESSION => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                let session = self.session.clone();
                let mut session = session.lock().await;
                if self.ready.is_some() {
                    return Flow::Exit(Exit::Fatal(GatewayError::ProtocolViolation(
                        "session rejected during IDENTIFY".to_string(),
                    )));
                }
                if resumable {
                    tracing::info!("session invalidated but resumable, reconnecting");
                    session.rearm_resume();
                    return Flow::Exit(Exit::Reconnect(closed(None, "invalid session")));
                }

                tracing::warn!("session invalidated, identifying from scratch");
                if !self.parked.is_empty() {
                    tracing::debug!(dropped = self.parked.len(), "discarding dispatches of the invalidated session");
                    self.parked.clear();
                }
                *live = false;
                let frame = self.identify(&mut session);
                drop(session);
                if let Err(e) = send_payload(sink, &frame).await {
                    return Flow::Exit(Exit::Reconnect(e.into()));
                }
                Flow::Continue
            }
            opcode::HELLO => {
                tracing::debug!("ignoring repeated HELLO");
                Flow::Continue
            }
            other => {
                tracing::debug!(op = other, "ignoring unhandled gateway opcode");
                Flow::Continue
            }
        }
    }

    async fn handle_dispatch(&mut self, payload: GatewayPayload, live: &mut bool) -> Flow {
        let name = payload.t.unwrap_or_default();
        let session = self.session.clone();
        let mut session = session.lock().await;

        if let Some(seq) = payload.s {
            if !session.record_sequence(seq) {
                tracing::debug!(seq, event = %name, "dropping replayed dispatch");
                return Flow::Continue;
            }
        }

        let kind = EventKind::from_dispatch(&name, payload.d);
        let mut first_ready = false;
        match &kind {
            EventKind::Ready(data) => {
                let ready = match ReadyData::deserialize(data) {
                    Ok(ready) => ready,
                    Err(e) => {
                        return Flow::Exit(Exit::Fatal(GatewayError::ProtocolViolation(format!(
                            "malformed READY: {e}"
                        ))))
                    }
                };
                tracing::info!(session_id = %ready.session_id, "gateway session ready");
                session.on_ready(ready.session_id, ready.resume_gateway_url);
                self.mark_live(live);
                if std::mem::take(&mut self.resync_pending) {
                    self.enqueue(Event {
                        kind: EventKind::ResyncRequired,
                        sequence: None,
                    });
                }
                first_ready = self.ready.is_some();
            }
            EventKind::Resumed => {
                tracing::info!(seq = ?session.sequence(), "gateway session resumed");
                session.on_resumed();
                self.mark_live(live);
            }
            _ => {}
        }
        drop(session);

        self.enqueue(Event {
            kind,
            sequence: payload.s,
        });

        if first_ready {
            if let Some(ready) = self.ready.take() {
                if ready.send(Ok(())).is_err() {
                    return Flow::Exit(Exit::ConsumerGone);
                }
            }
        }
        Flow::Continue
    }

    /// Builds an IDENTIFY frame and resets the session for it. A session
    /// that was ready before loses its state, so consumers are told to
    /// resync ahead of the next READY.
    fn identify(&mut self, session: &mut Session) -> GatewayPayload {
        if self.ready.is_none() {
            self.resync_pending = true;
        }
        session.invalidate();
        session.set_phase(Phase::Identifying);
        tracing::debug!("sending IDENTIFY");
        GatewayPayload::command(
            opcode::IDENTIFY,
            json!(IdentifyData {
                token: self.token.clone(),
                capabilities: self.config.capabilities,
                properties: self.config.properties.clone(),
                compress: false,
            }),
        )
    }

    fn mark_live(&mut self, live: &mut bool) {
        *live = true;
        self.failed_attempts = 0;
        self.backoff = self.config.reconnect_base;
    }

    fn enqueue(&mut self, event: Event) {
        if self.consumer_closed {
            tracing::trace!(event = event.kind.name(), "no consumer, dropping event");
            return;
        }
        self.pending.push_back(event);
        self.stalled_since.get_or_insert_with(Instant::now);
    }

    /// Sequences whatever was parked when a transport ends, so the consumer
    /// still gets everything the server sent before it and a resume asks
    /// only for what came after.
    async fn unpark(&mut self) {
        let mut live = false;
        while let Some(payload) = self.parked.pop_front() {
            if let Flow::Exit(_) = self.handle_dispatch(payload, &mut live).await {
                break;
            }
        }
        self.parked.clear();
    }

    fn consumer_lost(&mut self) {
        if !self.consumer_closed {
            tracing::debug!("event stream dropped by consumer");
        }
        self.consumer_closed = true;
        self.pending.clear();
        self.parked.clear();
        self.stalled_since.get_or_insert_with(Instant::now);
    }

    /// Ends the session: pending events are flushed, then the error.
    async fn fail(&mut self, err: GatewayError) {
        tracing::error!("gateway session failed: {err}");
        self.session.lock().await.invalidate();

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(err));
            return;
        }

        let pending = std::mem::take(&mut self.pending);
        let events = self.events.clone();
        let delivered = tokio::time::timeout(self.config.consumer_grace_period, async move {
            for event in pending {
                events.send(Ok(event)).await?;
            }
            events.send(Err(err)).await
        })
        .await;
        if !matches!(delivered, Ok(Ok(()))) {
            tracing::debug!("consumer did not take the terminal error");
        }
    }
}

fn parse_hello(text: &str) -> Result<HelloData, GatewayError> {
    let payload: GatewayPayload = serde_json::from_str(text)
        .map_err(|e| GatewayError::ProtocolViolation(format!("undecodable first frame: {e}")))?;
    if payload.op != opcode::HELLO {
        return Err(GatewayError::ProtocolViolation(format!(
            "expected HELLO, got opcode {}",
            payload.op
        )));
    }
    let hello: HelloData = serde_json::from_value(payload.d)
        .map_err(|e| GatewayError::ProtocolViolation(format!("malformed HELLO: {e}")))?;
    if hello.heartbeat_interval == 0 {
        return Err(GatewayError::ProtocolViolation(
            "HELLO with zero heartbeat interval".to_string(),
        ));
    }
    Ok(hello)
}

fn closed(code: Option<u16>, reason: &str) -> GatewayError {
    TransportError::Closed {
        code,
        reason: reason.to_string(),
    }
    .into()
}

fn closed_exit(info: CloseInfo) -> Exit {
    if info.resumable {
        Exit::Reconnect(closed(info.code, &info.reason))
    } else {
        Exit::Fatal(GatewayError::SessionClosed {
            code: info.code.unwrap_or_default(),
            reason: info.reason,
        })
    }
}

async fn send_payload(sink: &mut FrameSink, payload: &GatewayPayload) -> Result<(), TransportError> {
    let text = serde_json::to_string(payload).map_err(|e| TransportError::Send(e.to_string()))?;
    sink.send(text).await
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
