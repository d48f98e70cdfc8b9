use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opcodes for gateway messages.
pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const PRESENCE_UPDATE: u8 = 3;
    pub const VOICE_STATE_UPDATE: u8 = 4;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Close codes.
pub mod close_code {
    pub const UNKNOWN_ERROR: u16 = 4000;
    pub const UNKNOWN_OPCODE: u16 = 4001;
    pub const DECODE_ERROR: u16 = 4002;
    pub const NOT_AUTHENTICATED: u16 = 4003;
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    pub const INVALID_SEQ: u16 = 4007;
    pub const RATE_LIMITED: u16 = 4008;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    pub const INVALID_API_VERSION: u16 = 4012;
    pub const INVALID_INTENTS: u16 = 4013;
    pub const DISALLOWED_INTENTS: u16 = 4014;

    /// Whether the server allows a resume after closing with `code`.
    pub fn is_resumable(code: u16) -> bool {
        !matches!(
            code,
            AUTHENTICATION_FAILED
                | INVALID_SHARD
                | SHARDING_REQUIRED
                | INVALID_API_VERSION
                | INVALID_INTENTS
                | DISALLOWED_INTENTS
        )
    }
}

/// Gateway payload envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn command(op: u8, d: Value) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }
}

/// HELLO (opcode 10) payload data.
#[derive(Debug, Deserialize)]
pub struct HelloData {
    pub heartbeat_interval: u64,
}

/// IDENTIFY (opcode 2) payload data.
#[derive(Debug, Serialize)]
pub struct IdentifyData {
    pub token: String,
    pub capabilities: u64,
    pub properties: ClientProperties,
    pub compress: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
    pub client_launch_id: String,
}

impl Default for ClientProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "Discord Client".to_string(),
            device: String::new(),
            client_launch_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// RESUME (opcode 6) payload data.
#[derive(Debug, Serialize)]
pub struct ResumeData {
    pub token: String,
    pub session_id: String,
    pub seq: Option<u64>,
}

/// The fields of READY the session itself needs. The full payload is still
/// handed to consumers.
#[derive(Debug, Deserialize)]
pub struct ReadyData {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// Capability bits sent with IDENTIFY.
pub mod capability {
    pub const LAZY_USER_NOTES: u64 = 1 << 0;
    pub const NO_AFFINE_USER_IDS: u64 = 1 << 1;
    pub const VERSIONED_READ_STATES: u64 = 1 << 2;
    pub const VERSIONED_USER_GUILD_SETTINGS: u64 = 1 << 3;
    pub const DEDUPE_USER_OBJECTS: u64 = 1 << 4;
    pub const PRIORITIZED_READY_PAYLOAD: u64 = 1 << 5;
    pub const MULTIPLE_GUILD_EXPERIMENT_POPULATIONS: u64 = 1 << 6;
    pub const NON_CHANNEL_READ_STATES: u64 = 1 << 7;
    pub const AUTH_TOKEN_REFRESH: u64 = 1 << 8;
    pub const USER_SETTINGS_PROTO: u64 = 1 << 9;
    pub const CLIENT_STATE_V2: u64 = 1 << 10;
    pub const PASSIVE_GUILD_UPDATE: u64 = 1 << 11;
    pub const DEBOUNCE_MESSAGE_REACTIONS: u64 = 1 << 13;

    pub const DEFAULT: u64 = LAZY_USER_NOTES
        | NON_CHANNEL_READ_STATES
        | AUTH_TOKEN_REFRESH
        | USER_SETTINGS_PROTO
        | DEBOUNCE_MESSAGE_REACTIONS;
}

/// One event delivered to the consumer of an [`EventStream`](super::EventStream).
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    /// Sequence number the server assigned to the frame, if any. Synthetic
    /// events such as [`EventKind::ResyncRequired`] carry none.
    pub sequence: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Ready(Value),
    Resumed,
    /// The previous session was invalidated and a new one identified. Any
    /// state built from earlier events is stale.
    ResyncRequired,
    MessageCreate(Value),
    MessageUpdate(Value),
    MessageDelete(Value),
    TypingStart(Value),
    PresenceUpdate(Value),
    GuildCreate(Value),
    ChannelCreate(Value),
    VoiceStateUpdate(Value),
    VoiceServerUpdate(Value),
    Unrecognized { name: String, data: Value },
}

impl EventKind {
    /// Decodes a dispatch frame by its `t` field.
    pub fn from_dispatch(name: &str, data: Value) -> Self {
        match name {
            "READY" => EventKind::Ready(data),
            "RESUMED" => EventKind::Resumed,
            "MESSAGE_CREATE" => EventKind::MessageCreate(data),
            "MESSAGE_UPDATE" => EventKind::MessageUpdate(data),
            "MESSAGE_DELETE" => EventKind::MessageDelete(data),
            "TYPING_START" => EventKind::TypingStart(data),
            "PRESENCE_UPDATE" => EventKind::PresenceUpdate(data),
            "GUILD_CREATE" => EventKind::GuildCreate(data),
            "CHANNEL_CREATE" => EventKind::ChannelCreate(data),
            "VOICE_STATE_UPDATE" => EventKind::VoiceStateUpdate(data),
            "VOICE_SERVER_UPDATE" => EventKind::VoiceServerUpdate(data),
            other => EventKind::Unrecognized {
                name: other.to_string(),
                data,
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EventKind::Ready(_) => "READY",
            EventKind::Resumed => "RESUMED",
            EventKind::ResyncRequired => "RESYNC_REQUIRED",
            EventKind::MessageCreate(_) => "MESSAGE_CREATE",
            EventKind::MessageUpdate(_) => "MESSAGE_UPDATE",
            EventKind::MessageDelete(_) => "MESSAGE_DELETE",
            EventKind::TypingStart(_) => "TYPING_START",
            EventKind::PresenceUpdate(_) => "PRESENCE_UPDATE",
            EventKind::GuildCreate(_) => "GUILD_CREATE",
            EventKind::ChannelCreate(_) => "CHANNEL_CREATE",
            EventKind::VoiceStateUpdate(_) => "VOICE_STATE_UPDATE",
            EventKind::VoiceServerUpdate(_) => "VOICE_SERVER_UPDATE",
            EventKind::Unrecognized { name, .. } => name,
        }
    }
}
