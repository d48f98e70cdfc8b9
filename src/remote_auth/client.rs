use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{Instant, Interval};

use super::messages::{ClientMessage, ServerMessage, UserPreview};
use super::{qr_url, Credential, Effect, PairingPhase, PairingSession};
use crate::config::RemoteAuthConfig;
use crate::error::PairingError;
use crate::transport::{Connector, FrameSink, FrameStream, Inbound};

/// Trades a ticket for the encrypted token.
#[async_trait]
pub trait CredentialExchanger: Send + Sync {
    /// Returns the `encrypted_token` of the platform's reply, still base64.
    async fn exchange(&self, ticket: &str, proof: &str) -> Result<String, PairingError>;
}

/// Receives what the user needs to see during pairing.
pub trait PairingObserver: Send {
    fn show_fingerprint(&mut self, fingerprint: &str, qr_url: &str);
    fn show_preview(&mut self, preview: &UserPreview);
}

#[derive(Debug)]
pub enum PairingOutcome {
    Succeeded(Credential),
    Cancelled,
}

pub struct HttpExchanger {
    client: Client,
    api_base: String,
}

impl HttpExchanger {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.into(),
        }
    }
}

#[derive(Deserialize)]
struct ExchangeResponse {
    encrypted_token: String,
}

#[async_trait]
impl CredentialExchanger for HttpExchanger {
    async fn exchange(&self, ticket: &str, proof: &str) -> Result<String, PairingError> {
        let url = format!("{}/users/@me/remote-auth/login", self.api_base);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "ticket": ticket, "proof": proof }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let reason = resp.text().await.unwrap_or_default();
            return Err(PairingError::ExchangeRejected { status, reason });
        }

        let body: ExchangeResponse = resp
            .json()
            .await
            .map_err(|e| PairingError::ProtocolViolation(format!("malformed exchange response: {e}")))?;
        Ok(body.encrypted_token)
    }
}

/// Runs one pairing attempt over the signaling channel. There is no retry:
/// a failed attempt needs a fresh [`PairingSession`].
pub struct RemoteAuthClient<C, E> {
    config: RemoteAuthConfig,
    connector: C,
    exchanger: E,
}

impl<C: Connector, E: CredentialExchanger> RemoteAuthClient<C, E> {
    pub fn new(config: RemoteAuthConfig, connector: C, exchanger: E) -> Self {
        Self {
            config,
            connector,
            exchanger,
        }
    }

    pub async fn pair(&self, observer: &mut dyn PairingObserver) -> Result<PairingOutcome, PairingError> {
        self.run(PairingSession::new(), observer).await
    }

    pub async fn run(
        &self,
        mut session: PairingSession,
        observer: &mut dyn PairingObserver,
    ) -> Result<PairingOutcome, PairingError> {
        let mut queued = Vec::new();
        for effect in session.start()? {
            match effect {
                Effect::ShowFingerprint(fp) => {
                    observer.show_fingerprint(&fp, &qr_url(&self.config.qr_base_url, &fp))
                }
                Effect::Send(msg) => queued.push(msg),
                _ => {}
            }
        }

        let Some(url) = self.config.url.as_deref() else {
            return Err(session.fail(PairingError::NotConfigured("remote auth url")));
        };
        let connection = match self.connector.connect(url).await {
            Ok(connection) => connection,
            Err(e) => return Err(session.fail(e.into())),
        };
        let mut sink = connection.sink;
        let mut stream = connection.stream;

        let result = self
            .drive(&mut session, &mut sink, &mut stream, queued, observer)
            .await
            .map_err(|e| session.fail(e));
        if let Err(e) = sink.close().await {
            tracing::debug!("error closing signaling channel: {e}");
        }
        result
    }

    async fn drive(
        &self,
        session: &mut PairingSession,
        sink: &mut FrameSink,
        stream: &mut FrameStream,
        queued: Vec<ClientMessage>,
        observer: &mut dyn PairingObserver,
    ) -> Result<PairingOutcome, PairingError> {
        let idle = self.config.inactivity_timeout;
        let mut deadline = Instant::now() + idle;
        let mut heartbeat: Option<Interval> = None;
        // init must wait for the server's hello
        let mut queued = Some(queued);

        loop {
            let beat = async {
                match heartbeat.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Err(session.expire(idle)),

                _ = beat => send(sink, &ClientMessage::Heartbeat).await?,

                frame = stream.next() => {
                    deadline = Instant::now() + idle;
                    let text = match frame {
                        Some(Ok(Inbound::Text(text))) => text,
                        Some(Ok(Inbound::Closed(info))) => {
                            return Err(PairingError::TransportFailure(format!(
                                "signaling channel closed (code {:?}): {}",
                                info.code, info.reason
                            )));
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(PairingError::TransportFailure("signaling channel ended".to_string())),
                    };
                    let msg: ServerMessage = serde_json::from_str(&text)
                        .map_err(|e| PairingError::ProtocolViolation(format!("undecodable message: {e}")))?;
                    if msg == ServerMessage::Unrecognized {
                        tracing::warn!(op = %raw_op(&text), "ignoring unrecognized pairing message");
                    } else {
                        tracing::trace!(op = msg.op(), "pairing message");
                    }

                    if let ServerMessage::Hello { heartbeat_interval, timeout_ms } = &msg {
                        tracing::debug!(
                            heartbeat_interval = *heartbeat_interval,
                            timeout_ms = *timeout_ms,
                            "signaling channel ready"
                        );
                        let period = Duration::from_millis((*heartbeat_interval).max(1));
                        heartbeat = Some(tokio::time::interval_at(Instant::now() + period, period));
                        for msg in queued.take().unwrap_or_default() {
                            send(sink, &msg).await?;
                        }
                    }

                    for effect in session.handle(msg)? {
                        match effect {
                            Effect::Send(msg) => send(sink, &msg).await?,
                            Effect::ShowFingerprint(fp) => {
                                observer.show_fingerprint(&fp, &qr_url(&self.config.qr_base_url, &fp))
                            }
                            Effect::ShowPreview(preview) => observer.show_preview(&preview),
                            Effect::PerformExchange { ticket, proof } => {
                                tracing::info!("login approved on companion device, exchanging ticket");
                                let encrypted = self.exchanger.exchange(&ticket, &proof).await?;
                                let credential = session.complete_exchange(&encrypted)?;
                                tracing::info!("pairing succeeded");
                                return Ok(PairingOutcome::Succeeded(credential));
                            }
                        }
                    }

                    if session.phase() == PairingPhase::Cancelled {
                        return Ok(PairingOutcome::Cancelled);
                    }
                }
            }
        }
    }
}

/// The `op` of a frame that only decoded as [`ServerMessage::Unrecognized`].
fn raw_op(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("op").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

async fn send(sink: &mut FrameSink, msg: &ClientMessage) -> Result<(), PairingError> {
    let text = serde_json::to_string(msg)
        .map_err(|e| PairingError::ProtocolViolation(format!("unencodable message: {e}")))?;
    sink.send(text).await.map_err(PairingError::from)
}
