use std::time::Duration;

use crate::gateway::events::{capability, ClientProperties};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub api_version: u8,
    pub capabilities: u64,
    pub properties: ClientProperties,
    /// How long to wait for HELLO after the transport opens.
    pub hello_timeout: Duration,
    /// Consecutive failed reconnects tolerated before the stream ends.
    pub max_reconnect_attempts: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// How long an undelivered event may wait on a consumer that is not
    /// reading before the manager disconnects.
    pub consumer_grace_period: Duration,
}

impl GatewayConfig {
    /// Gateway URL with the query string the server expects.
    pub fn connect_url(&self, base: &str) -> String {
        let sep = if base.contains('?') { '&' } else { '?' };
        format!("{base}{sep}v={}&encoding=json", self.api_version)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "wss://gateway.discord.gg".to_string(),
            api_version: 9,
            capabilities: capability::DEFAULT,
            properties: ClientProperties::default(),
            hello_timeout: Duration::from_secs(20),
            max_reconnect_attempts: 5,
            reconnect_base: Duration::from_millis(1000),
            reconnect_max: Duration::from_secs(60),
            consumer_grace_period: Duration::from_secs(60),
        }
    }
}

/// Endpoints for the pairing handshake.
///
/// The handshake seals data with X25519 and proves ticket possession with an
/// Ed25519 signature. The platform's own remote-auth gateway speaks a
/// different (RSA-OAEP) scheme, so there are no built-in endpoints: `url`
/// and `api_base` must point at a service that speaks this one.
#[derive(Debug, Clone)]
pub struct RemoteAuthConfig {
    /// Signaling websocket.
    pub url: Option<String>,
    /// Base of the HTTP API that trades tickets for tokens.
    pub api_base: Option<String>,
    pub qr_base_url: String,
    /// The handshake fails if the signaling channel stays silent this long.
    pub inactivity_timeout: Duration,
}

impl Default for RemoteAuthConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_base: None,
            qr_base_url: "https://discord.com/ra/".to_string(),
            inactivity_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub remote_auth: RemoteAuthConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source, falling back to
    /// defaults for anything missing or unparsable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let gw = GatewayConfig::default();
        let ra = RemoteAuthConfig::default();

        let parse_u64 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let gateway = GatewayConfig {
            url: lookup("PAICORD_GATEWAY_URL").unwrap_or(gw.url),
            api_version: lookup("PAICORD_API_VERSION")
                .and_then(|v| v.parse().ok())
                .unwrap_or(gw.api_version),
            capabilities: parse_u64("PAICORD_CAPABILITIES").unwrap_or(gw.capabilities),
            properties: gw.properties,
            hello_timeout: parse_u64("PAICORD_HELLO_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(gw.hello_timeout),
            max_reconnect_attempts: lookup("PAICORD_MAX_RECONNECT_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(gw.max_reconnect_attempts),
            reconnect_base: parse_u64("PAICORD_RECONNECT_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(gw.reconnect_base),
            reconnect_max: parse_u64("PAICORD_RECONNECT_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(gw.reconnect_max),
            consumer_grace_period: parse_u64("PAICORD_CONSUMER_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(gw.consumer_grace_period),
        };

        let remote_auth = RemoteAuthConfig {
            url: lookup("PAICORD_REMOTE_AUTH_URL").or(ra.url),
            api_base: lookup("PAICORD_API_BASE")
                .map(|v| v.trim_end_matches('/').to_string())
                .or(ra.api_base),
            qr_base_url: lookup("PAICORD_QR_BASE_URL").unwrap_or(ra.qr_base_url),
            inactivity_timeout: parse_u64("PAICORD_PAIRING_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(ra.inactivity_timeout),
        };

        Config {
            gateway,
            remote_auth,
        }
    }
}
