//! Cross-device pairing ("remote auth" / QR login).
//!
//! [`PairingSession`] is a pure state machine: it consumes signaling
//! messages and returns [`Effect`]s for the caller to carry out. The network
//! driver lives in [`client`].

pub mod client;
pub mod crypto;
pub mod messages;

use std::fmt;

use data_encoding::BASE64URL_NOPAD;

use crate::error::PairingError;
use crypto::{decode_field, PairingKeys, PublicIdentity, SessionKey};
use messages::{ClientMessage, ServerMessage, UserPreview};

pub use client::{CredentialExchanger, HttpExchanger, PairingObserver, PairingOutcome, RemoteAuthClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPhase {
    Idle,
    AwaitingFingerprintDisplay,
    AwaitingUserPreview,
    AwaitingTicket,
    Exchanging,
    Succeeded,
    Cancelled,
    Failed,
}

impl PairingPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PairingPhase::Succeeded | PairingPhase::Cancelled | PairingPhase::Failed
        )
    }
}

impl fmt::Display for PairingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Something the caller must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Render the fingerprint as a scannable code.
    ShowFingerprint(String),
    Send(ClientMessage),
    ShowPreview(UserPreview),
    /// Submit the ticket and proof to the credential exchange, then call
    /// [`PairingSession::complete_exchange`] with the result.
    PerformExchange { ticket: String, proof: String },
}

/// The token a successful pairing yields.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential([REDACTED])")
    }
}

/// URL a companion device opens after scanning.
pub fn qr_url(base: &str, fingerprint: &str) -> String {
    format!("{base}{fingerprint}")
}

#[derive(Debug)]
pub struct PairingSession {
    keys: PairingKeys,
    identity: PublicIdentity,
    fingerprint: String,
    session_key: Option<SessionKey>,
    phase: PairingPhase,
    ticket: Option<String>,
}

impl Default for PairingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingSession {
    pub fn new() -> Self {
        Self::with_keys(PairingKeys::generate())
    }

    pub fn with_keys(keys: PairingKeys) -> Self {
        let identity = keys.public_identity();
        let fingerprint = identity.fingerprint();
        Self {
            keys,
            identity,
            fingerprint,
            session_key: None,
            phase: PairingPhase::Idle,
            ticket: None,
        }
    }

    pub fn phase(&self) -> PairingPhase {
        self.phase
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn public_identity(&self) -> &PublicIdentity {
        &self.identity
    }

    pub fn pending_ticket(&self) -> Option<&str> {
        self.ticket.as_deref()
    }

    /// Emits the fingerprint and the `init` message. No network round trip
    /// is needed to get here.
    pub fn start(&mut self) -> Result<Vec<Effect>, PairingError> {
        if self.phase != PairingPhase::Idle {
            return Err(PairingError::UnexpectedMessage {
                op: "start".to_string(),
                phase: self.phase.to_string(),
            });
        }
        self.transition(PairingPhase::AwaitingFingerprintDisplay);
        Ok(vec![
            Effect::ShowFingerprint(self.fingerprint.clone()),
            Effect::Send(ClientMessage::Init {
                encoded_public_key: self.identity.encode(),
            }),
        ])
    }

    /// Feeds one inbound message. Messages that do not fit the current phase
    /// are logged and ignored. Any returned error has already moved the
    /// session to [`PairingPhase::Failed`].
    pub fn handle(&mut self, msg: ServerMessage) -> Result<Vec<Effect>, PairingError> {
        match self.step(msg) {
            Ok(effects) => Ok(effects),
            Err(PairingError::UnexpectedMessage { op, phase }) => {
                tracing::warn!(op = %op, phase = %phase, "ignoring unexpected pairing message");
                Ok(Vec::new())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn step(&mut self, msg: ServerMessage) -> Result<Vec<Effect>, PairingError> {
        use PairingPhase::*;

        match (self.phase, msg) {
            (phase, ServerMessage::Cancel) if !phase.is_terminal() => {
                tracing::info!(%phase, "pairing cancelled by remote");
                self.cancel();
                Ok(Vec::new())
            }
            (_, ServerMessage::Heartbeat) => Ok(vec![Effect::Send(ClientMessage::Heartbeat)]),
            (_, ServerMessage::Hello { .. } | ServerMessage::HeartbeatAck) => Ok(Vec::new()),
            (phase, ServerMessage::Unrecognized) => {
                tracing::debug!(%phase, "skipping unrecognized pairing message");
                Ok(Vec::new())
            }

            (AwaitingFingerprintDisplay, ServerMessage::NonceProof { encrypted_nonce }) => {
                let sealed = decode_field("encrypted_nonce", &encrypted_nonce)?;
                let nonce = self.keys.open_sealed(&sealed)?;
                Ok(vec![Effect::Send(ClientMessage::NonceProof {
                    nonce: BASE64URL_NOPAD.encode(&nonce),
                })])
            }

            (AwaitingFingerprintDisplay, ServerMessage::PendingRemoteInit { fingerprint }) => {
                if fingerprint != self.fingerprint {
                    return Err(PairingError::ProtocolViolation(
                        "companion reported a different fingerprint".to_string(),
                    ));
                }
                self.transition(AwaitingUserPreview);
                Ok(Vec::new())
            }

            (
                AwaitingUserPreview,
                ServerMessage::PendingTicket {
                    encrypted_session_key,
                    encrypted_user_payload,
                },
            ) => {
                let sealed = decode_field("encrypted_session_key", &encrypted_session_key)?;
                let session_key = SessionKey::from_bytes(&self.keys.open_sealed(&sealed)?)?;

                let mut effects = Vec::new();
                if let Some(payload) = encrypted_user_payload {
                    let plain = session_key.open(&decode_field("encrypted_user_payload", &payload)?)?;
                    let text = String::from_utf8(plain).map_err(|_| {
                        PairingError::DecryptionFailed("user payload is not UTF-8".to_string())
                    })?;
                    let preview = UserPreview::parse(&text)?;
                    tracing::debug!(user_id = %preview.id, "decrypted pairing preview");
                    effects.push(Effect::ShowPreview(preview));
                }

                self.session_key = Some(session_key);
                self.transition(AwaitingTicket);
                Ok(effects)
            }

            (AwaitingTicket, ServerMessage::PendingLogin { ticket }) => {
                let proof = self.keys.prove(ticket.as_bytes());
                self.ticket = Some(ticket.clone());
                self.transition(Exchanging);
                Ok(vec![Effect::PerformExchange { ticket, proof }])
            }

            (phase, msg) => Err(PairingError::UnexpectedMessage {
                op: msg.op().to_string(),
                phase: phase.to_string(),
            }),
        }
    }

    /// Finishes the exchange with the encrypted token the platform returned.
    /// The ticket is consumed whether or not this succeeds.
    pub fn complete_exchange(&mut self, encrypted_token: &str) -> Result<Credential, PairingError> {
        let result = self.open_token(encrypted_token);
        match result {
            Ok(credential) => {
                self.transition(PairingPhase::Succeeded);
                Ok(credential)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn open_token(&mut self, encrypted_token: &str) -> Result<Credential, PairingError> {
        if self.phase != PairingPhase::Exchanging {
            return Err(PairingError::ProtocolViolation(format!(
                "no exchange in progress (phase {})",
                self.phase
            )));
        }
        if self.ticket.take().is_none() {
            return Err(PairingError::ProtocolViolation("ticket already used".to_string()));
        }
        let key = self.session_key.as_ref().ok_or_else(|| {
            PairingError::ProtocolViolation("no session key established".to_string())
        })?;

        let plain = key.open(&decode_field("encrypted_token", encrypted_token)?)?;
        let token = String::from_utf8(plain)
            .map_err(|_| PairingError::DecryptionFailed("token is not UTF-8".to_string()))?;
        if token.is_empty() {
            return Err(PairingError::DecryptionFailed("token is empty".to_string()));
        }
        Ok(Credential(token))
    }

    /// User-initiated cancel. No-op once the session has ended.
    pub fn cancel(&mut self) {
        if !self.phase.is_terminal() {
            self.ticket = None;
            self.transition(PairingPhase::Cancelled);
        }
    }

    /// The signaling channel went quiet for too long.
    pub fn expire(&mut self, after: std::time::Duration) -> PairingError {
        self.fail(PairingError::Timeout(after))
    }

    /// Moves to [`PairingPhase::Failed`] and hands the error back.
    pub fn fail(&mut self, err: PairingError) -> PairingError {
        if !self.phase.is_terminal() {
            tracing::warn!(phase = %self.phase, "pairing failed: {err}");
            self.ticket = None;
            self.transition(PairingPhase::Failed);
        }
        err
    }

    fn transition(&mut self, to: PairingPhase) {
        tracing::debug!(from = %self.phase, %to, "pairing phase change");
        self.phase = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto::seal;
    use data_encoding::BASE64;

    const SESSION_KEY: [u8; 32] = [0x42; 32];

    fn session() -> PairingSession {
        PairingSession::with_keys(PairingKeys::from_secret_bytes([1u8; 32], [2u8; 32]))
    }

    fn pending_ticket(session: &PairingSession, preview: Option<&str>) -> ServerMessage {
        let sealed_key = seal(session.public_identity(), [7u8; 32], [3u8; 12], &SESSION_KEY).unwrap();
        let key = SessionKey::from_bytes(&SESSION_KEY).unwrap();
        ServerMessage::PendingTicket {
            encrypted_session_key: BASE64.encode(&sealed_key),
            encrypted_user_payload: preview
                .map(|p| BASE64.encode(&key.seal([5u8; 12], p.as_bytes()).unwrap())),
        }
    }

    fn advance_to_ticket(session: &mut PairingSession) {
        session.start().unwrap();
        session
            .handle(ServerMessage::PendingRemoteInit {
                fingerprint: session.fingerprint().to_string(),
            })
            .unwrap();
        let msg = pending_ticket(session, Some("1:0:0:alice"));
        session.handle(msg).unwrap();
    }

    #[test]
    fn test_start_emits_fingerprint_and_init() {
        let mut s = session();
        let effects = s.start().unwrap();
        assert_eq!(s.phase(), PairingPhase::AwaitingFingerprintDisplay);
        assert_eq!(effects[0], Effect::ShowFingerprint(s.fingerprint().to_string()));
        assert!(matches!(&effects[1], Effect::Send(ClientMessage::Init { encoded_public_key })
            if *encoded_public_key == s.public_identity().encode()));
        assert!(s.start().is_err());
    }

    #[test]
    fn test_nonce_proof_answered() {
        let mut s = session();
        s.start().unwrap();
        let sealed = seal(s.public_identity(), [8u8; 32], [1u8; 12], b"challenge").unwrap();
        let effects = s
            .handle(ServerMessage::NonceProof {
                encrypted_nonce: BASE64.encode(&sealed),
            })
            .unwrap();
        assert_eq!(
            effects,
            vec![Effect::Send(ClientMessage::NonceProof {
                nonce: BASE64URL_NOPAD.encode(b"challenge"),
            })]
        );
        assert_eq!(s.phase(), PairingPhase::AwaitingFingerprintDisplay);
    }

    #[test]
    fn test_fingerprint_mismatch_fails() {
        let mut s = session();
        s.start().unwrap();
        let err = s
            .handle(ServerMessage::PendingRemoteInit {
                fingerprint: "nope".into(),
            })
            .unwrap_err();
        assert!(matches!(err, PairingError::ProtocolViolation(_)));
        assert_eq!(s.phase(), PairingPhase::Failed);
    }

    #[test]
    fn test_preview_decrypted() {
        let mut s = session();
        s.start().unwrap();
        s.handle(ServerMessage::PendingRemoteInit {
            fingerprint: s.fingerprint().to_string(),
        })
        .unwrap();
        let msg = pending_ticket(&s, Some("80351110224678912:1337:8342729096ea3675442027381ff50dfe:Nelly"));
        let effects = s.handle(msg).unwrap();
        assert_eq!(s.phase(), PairingPhase::AwaitingTicket);
        let Effect::ShowPreview(preview) = &effects[0] else {
            panic!("expected preview, got {effects:?}");
        };
        assert_eq!(preview.username, "Nelly");
        assert_eq!(preview.discriminator, "1337");
    }

    #[test]
    fn test_tampered_preview_is_fatal() {
        let mut s = session();
        s.start().unwrap();
        s.handle(ServerMessage::PendingRemoteInit {
            fingerprint: s.fingerprint().to_string(),
        })
        .unwrap();
        let ServerMessage::PendingTicket {
            encrypted_session_key,
            encrypted_user_payload: Some(payload),
        } = pending_ticket(&s, Some("1:0:0:alice"))
        else {
            unreachable!()
        };
        let mut raw = BASE64.decode(payload.as_bytes()).unwrap();
        raw[14] ^= 0xFF;
        let err = s
            .handle(ServerMessage::PendingTicket {
                encrypted_session_key,
                encrypted_user_payload: Some(BASE64.encode(&raw)),
            })
            .unwrap_err();
        assert!(matches!(err, PairingError::DecryptionFailed(_)));
        assert_eq!(s.phase(), PairingPhase::Failed);
    }

    #[test]
    fn test_exchange_yields_credential_once() {
        let mut s = session();
        advance_to_ticket(&mut s);
        let effects = s
            .handle(ServerMessage::PendingLogin {
                ticket: "ticket-1".into(),
            })
            .unwrap();
        let Effect::PerformExchange { ticket, proof } = &effects[0] else {
            panic!("expected exchange, got {effects:?}");
        };
        assert_eq!(ticket, "ticket-1");
        assert!(s.public_identity().verify(b"ticket-1", proof));
        assert_eq!(s.phase(), PairingPhase::Exchanging);

        let key = SessionKey::from_bytes(&SESSION_KEY).unwrap();
        let encrypted = BASE64.encode(&key.seal([9u8; 12], b"mfa.secret-token").unwrap());
        let credential = s.complete_exchange(&encrypted).unwrap();
        assert_eq!(credential.expose(), "mfa.secret-token");
        assert_eq!(s.phase(), PairingPhase::Succeeded);
        assert_eq!(format!("{credential:?}"), "Credential([REDACTED])");

        assert!(s.complete_exchange(&encrypted).is_err());
        assert_eq!(s.phase(), PairingPhase::Succeeded);
    }

    #[test]
    fn test_empty_token_rejected() {
        let mut s = session();
        advance_to_ticket(&mut s);
        s.handle(ServerMessage::PendingLogin { ticket: "t".into() }).unwrap();
        let key = SessionKey::from_bytes(&SESSION_KEY).unwrap();
        let encrypted = BASE64.encode(&key.seal([9u8; 12], b"").unwrap());
        assert!(matches!(
            s.complete_exchange(&encrypted),
            Err(PairingError::DecryptionFailed(_))
        ));
        assert_eq!(s.phase(), PairingPhase::Failed);
    }

    #[test]
    fn test_unexpected_message_ignored() {
        let mut s = session();
        s.start().unwrap();
        let effects = s
            .handle(ServerMessage::PendingLogin { ticket: "early".into() })
            .unwrap();
        assert!(effects.is_empty());
        assert_eq!(s.phase(), PairingPhase::AwaitingFingerprintDisplay);
        assert_eq!(s.pending_ticket(), None);
    }

    #[test]
    fn test_server_heartbeat_answered() {
        let mut s = session();
        s.start().unwrap();
        let effects = s.handle(ServerMessage::Heartbeat).unwrap();
        assert_eq!(effects, vec![Effect::Send(ClientMessage::Heartbeat)]);
        assert!(s.handle(ServerMessage::HeartbeatAck).unwrap().is_empty());
        assert_eq!(s.phase(), PairingPhase::AwaitingFingerprintDisplay);
    }

    #[test]
    fn test_unrecognized_message_keeps_phase() {
        let mut s = session();
        advance_to_ticket(&mut s);
        assert!(s.handle(ServerMessage::Unrecognized).unwrap().is_empty());
        assert_eq!(s.phase(), PairingPhase::AwaitingTicket);
    }

    #[test]
    fn test_cancel_from_every_live_phase() {
        let steps: [fn(&mut PairingSession); 5] = [
            |_| {},
            |s| {
                s.start().unwrap();
            },
            |s| {
                s.start().unwrap();
                s.handle(ServerMessage::PendingRemoteInit {
                    fingerprint: s.fingerprint().to_string(),
                })
                .unwrap();
            },
            advance_to_ticket,
            |s| {
                advance_to_ticket(s);
                s.handle(ServerMessage::PendingLogin { ticket: "t".into() }).unwrap();
            },
        ];

        for step in steps {
            let mut s = session();
            step(&mut s);
            assert!(!s.phase().is_terminal());
            let effects = s.handle(ServerMessage::Cancel).unwrap();
            assert!(effects.is_empty());
            assert_eq!(s.phase(), PairingPhase::Cancelled);
            assert_eq!(s.pending_ticket(), None);
        }
    }

    #[test]
    fn test_expire_fails_with_timeout() {
        let mut s = session();
        s.start().unwrap();
        let err = s.expire(std::time::Duration::from_secs(5));
        assert!(matches!(err, PairingError::Timeout(_)));
        assert_eq!(s.phase(), PairingPhase::Failed);
    }
}
