use thiserror::Error;

/// Failures of the duplex transport underneath the gateway and the pairing
/// signaling channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("transport receive failed: {0}")]
    Receive(String),
    #[error("connection closed (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("session closed by server (code {code}): {reason}")]
    SessionClosed { code: u16, reason: String },
    #[error("gateway is already connected")]
    AlreadyConnected,
    #[error("gateway is not connected")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("pairing timed out after {0:?} of inactivity")]
    Timeout(std::time::Duration),
    /// The platform refused the ticket. `reason` is the response body as sent.
    #[error("credential exchange rejected ({status}): {reason}")]
    ExchangeRejected { status: u16, reason: String },
    #[error("unexpected {op} message in phase {phase}")]
    UnexpectedMessage { op: String, phase: String },
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

impl From<TransportError> for PairingError {
    fn from(err: TransportError) -> Self {
        PairingError::TransportFailure(err.to_string())
    }
}

impl From<reqwest::Error> for PairingError {
    fn from(err: reqwest::Error) -> Self {
        PairingError::TransportFailure(err.to_string())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("truncated frame: needed {needed} bytes, got {available}")]
    TruncatedFrame { needed: usize, available: usize },
    #[error("length mismatch: declared {declared} bytes, {available} available")]
    LengthMismatch { declared: usize, available: usize },
}

/// Errors from a [`VoiceCipher`](crate::voice::cipher::VoiceCipher).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("voice payload encryption failed")]
    EncryptionFailed,
    #[error("voice payload decryption failed")]
    DecryptionFailed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}
