//! Duplex text-frame transport shared by the gateway and the pairing channel.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::future::ready;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;
use crate::gateway::events::close_code;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Inbound, TransportError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Closed(CloseInfo),
}

/// A close frame as seen by the session layer. `resumable` is decided by the
/// transport and not reinterpreted above it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
    pub resumable: bool,
}

impl CloseInfo {
    pub fn resumable(code: u16) -> Self {
        Self {
            code: Some(code),
            reason: String::new(),
            resumable: true,
        }
    }

    pub fn fatal(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
            resumable: false,
        }
    }
}

/// One open duplex stream. Dropping both halves releases it.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError>;
}

/// WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy)]
pub struct WsConnector {
    classify: fn(u16) -> bool,
}

impl WsConnector {
    /// `classify` decides whether a close code allows resuming.
    pub fn new(classify: fn(u16) -> bool) -> Self {
        Self { classify }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(close_code::is_resumable)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(url, "websocket connected");

        let (ws_sink, ws_stream) = ws.split();

        let sink = ws_sink
            .sink_map_err(|e| TransportError::Send(e.to_string()))
            .with(|text: String| ready(Ok::<_, TransportError>(Message::Text(text.into()))));

        let classify = self.classify;
        let stream = ws_stream.filter_map(move |msg| {
            ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text.as_str().to_owned()))),
                Ok(Message::Close(frame)) => {
                    let code = frame.as_ref().map(|f| u16::from(f.code));
                    let reason = frame
                        .as_ref()
                        .map(|f| f.reason.as_str().to_owned())
                        .unwrap_or_default();
                    Some(Ok(Inbound::Closed(CloseInfo {
                        code,
                        reason,
                        resumable: code.map(classify).unwrap_or(true),
                    })))
                }
                // ping/pong are answered by tungstenite; binary frames are not used
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
            })
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
