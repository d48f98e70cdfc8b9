use serde::{Deserialize, Serialize};

use crate::error::PairingError;

/// Messages pushed by the remote-auth gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        heartbeat_interval: u64,
        timeout_ms: u64,
    },
    /// Challenge sealed to our public key; answered with the plain nonce.
    NonceProof {
        encrypted_nonce: String,
    },
    /// A companion device scanned the code.
    PendingRemoteInit {
        fingerprint: String,
    },
    /// The companion sent the session key and, usually, who is signing in.
    PendingTicket {
        encrypted_session_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypted_user_payload: Option<String>,
    },
    /// The user approved the login on the companion device.
    PendingLogin {
        ticket: String,
    },
    Cancel,
    Heartbeat,
    HeartbeatAck,
    /// Any op this client does not know.
    #[serde(other)]
    Unrecognized,
}

impl ServerMessage {
    pub fn op(&self) -> &'static str {
        match self {
            ServerMessage::Hello { .. } => "hello",
            ServerMessage::NonceProof { .. } => "nonce_proof",
            ServerMessage::PendingRemoteInit { .. } => "pending_remote_init",
            ServerMessage::PendingTicket { .. } => "pending_ticket",
            ServerMessage::PendingLogin { .. } => "pending_login",
            ServerMessage::Cancel => "cancel",
            ServerMessage::Heartbeat => "heartbeat",
            ServerMessage::HeartbeatAck => "heartbeat_ack",
            ServerMessage::Unrecognized => "unrecognized",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    Init { encoded_public_key: String },
    NonceProof { nonce: String },
    Heartbeat,
}

/// Who is about to be signed in, as shown before the user confirms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPreview {
    pub id: String,
    pub discriminator: String,
    pub avatar: Option<String>,
    pub username: String,
}

impl UserPreview {
    /// Parses `id:discriminator:avatar:username`. The username may itself
    /// contain colons.
    pub fn parse(raw: &str) -> Result<Self, PairingError> {
        let mut parts = raw.splitn(4, ':');
        let (Some(id), Some(discriminator), Some(avatar), Some(username)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(PairingError::ProtocolViolation(
                "user payload does not have four fields".to_string(),
            ));
        };

        let avatar = match avatar {
            "" | "0" => None,
            hash => Some(hash.to_string()),
        };
        Ok(Self {
            id: id.to_string(),
            discriminator: discriminator.to_string(),
            avatar,
            username: username.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_messages() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"op":"hello","heartbeat_interval":41250,"timeout_ms":120000}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Hello {
                heartbeat_interval: 41250,
                timeout_ms: 120000
            }
        );

        let msg: ServerMessage =
            serde_json::from_str(r#"{"op":"pending_ticket","encrypted_session_key":"abc"}"#).unwrap();
        assert!(matches!(
            msg,
            ServerMessage::PendingTicket { encrypted_user_payload: None, .. }
        ));

        let msg: ServerMessage = serde_json::from_str(r#"{"op":"cancel"}"#).unwrap();
        assert_eq!(msg.op(), "cancel");
    }

    #[test]
    fn test_unknown_op_is_unrecognized() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"op":"pending_finish","user_id":"1"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Unrecognized);

        // a known op with missing fields is still an error
        assert!(serde_json::from_str::<ServerMessage>(r#"{"op":"pending_login"}"#).is_err());
        assert!(serde_json::from_str::<ServerMessage>(r#"{"ticket":"t"}"#).is_err());
    }

    #[test]
    fn test_client_message_shape() {
        let init = ClientMessage::Init {
            encoded_public_key: "KEY".into(),
        };
        assert_eq!(
            serde_json::to_string(&init).unwrap(),
            r#"{"op":"init","encoded_public_key":"KEY"}"#
        );
        assert_eq!(
            serde_json::to_string(&ClientMessage::Heartbeat).unwrap(),
            r#"{"op":"heartbeat"}"#
        );
    }

    #[test]
    fn test_user_preview_parse() {
        let preview = UserPreview::parse("123:0:abcdef:some:name").unwrap();
        assert_eq!(preview.id, "123");
        assert_eq!(preview.avatar.as_deref(), Some("abcdef"));
        assert_eq!(preview.username, "some:name");

        let preview = UserPreview::parse("123:0001:0:alice").unwrap();
        assert_eq!(preview.avatar, None);

        assert!(UserPreview::parse("123:0001").is_err());
    }
}
