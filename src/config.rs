//! Typed, environment-overridable settings for the relay.
//!
//! Loaded via the `config` crate layered over `dotenv`: JWT secret/
//! algorithm/expiry, device HMAC secret, WS heartbeat/timeout, max frame
//! size, TURN credentials/ttl, plus rate-limit and grace-period knobs.

use std::time::Duration;

use serde::Deserialize;
use smart_default::SmartDefault;

/// Root settings object, populated from (in increasing priority) built-in
/// defaults, an optional config file, and environment variables prefixed
/// with `RELAY_` (e.g. `RELAY_WS__PING_INTERVAL=15`).
#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct Settings {
    #[default(Settings::default_app_name())]
    pub app_name: String,

    #[default(false)]
    pub debug: bool,

    #[default(SocketSettings::default())]
    pub socket: SocketSettings,

    #[default(AuthSettings::default())]
    pub auth: AuthSettings,

    #[default(WsSettings::default())]
    pub ws: WsSettings,

    #[default(RateLimitSettings::default())]
    pub rate_limit: RateLimitSettings,

    #[default(GraceSettings::default())]
    pub grace: GraceSettings,

    #[default(TurnSettings::default())]
    pub turn: TurnSettings,
}

impl Settings {
    fn default_app_name() -> String {
        "Cloud Relay".to_owned()
    }

    /// Loads settings from `./config.toml` (if present), `.env`, and the
    /// process environment (`RELAY_*`), falling back to the hard-coded
    /// defaults above for anything unset.
    ///
    /// # Errors
    ///
    /// Errors if a present config source fails to parse or a `RELAY_*`
    /// variable can't be coerced into its target field's type.
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();

        let mut cfg = config::Config::new();
        cfg.merge(config::File::with_name("config").required(false))?;
        cfg.merge(config::Environment::with_prefix("relay").separator("__"))?;
        cfg.try_into()
    }
}

/// Listen address for the HTTP/WS server.
#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct SocketSettings {
    #[default("0.0.0.0".to_owned())]
    pub host: String,

    #[default(8080)]
    pub port: u16,
}

impl SocketSettings {
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Device-HMAC and bearer-token settings.
#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct AuthSettings {
    #[default("change-this-device-secret-in-production".to_owned())]
    pub device_secret: String,

    #[default("change-this-to-a-secure-secret-key-in-production".to_owned())]
    pub token_secret: String,

    #[default("HS256".to_owned())]
    pub token_algorithm: String,

    /// Token lifetime in minutes, matching the Python's
    /// `jwt_expire_minutes`.
    #[default(1440)]
    pub token_expire_minutes: i64,
}

/// WebSocket transport tunables.
#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct WsSettings {
    #[default(Duration::from_secs(30))]
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,

    #[default(Duration::from_secs(60))]
    #[serde(with = "humantime_serde")]
    pub pong_timeout: Duration,

    /// Absolute transport-level cap (20 MiB), matching
    /// `ws_max_message_size` in the Python settings.
    #[default(20 * 1024 * 1024)]
    pub max_frame_size: usize,

    /// Soft cap enforced by the router on app-sent command frames (§4.2.1).
    #[default(1024 * 1024)]
    pub max_command_size: usize,

    /// Command staleness threshold in milliseconds (§4.2.1 step 3).
    #[default(2_000)]
    pub stale_command_ms: i64,
}

/// Rate-limiter tunables. Thresholds are independent: the count-based limit
/// rejects, the diversity check only warns.
#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct RateLimitSettings {
    #[default(30)]
    pub max_commands: usize,

    #[default(60)]
    pub window_seconds: u64,

    #[default(5)]
    pub diversity_threshold: usize,

    #[default(10)]
    pub diversity_window_seconds: u64,
}

/// Grace-period tunables.
#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct GraceSettings {
    #[default(600)]
    pub period_seconds: u64,
}

/// TURN credential provider settings.
#[derive(Clone, Debug, Deserialize, SmartDefault)]
#[serde(default)]
pub struct TurnSettings {
    #[default(None)]
    pub key_id: Option<String>,

    #[default(None)]
    pub api_token: Option<String>,

    #[default("https://rtc.live.cloudflare.com/v1/turn/keys".to_owned())]
    pub base_url: String,

    /// Default TTL minted for a session's ICE credentials, in seconds.
    #[default(86_400)]
    pub default_ttl_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_any_config_source() {
        let settings = Settings::default();
        assert_eq!(settings.socket.bind_addr(), "0.0.0.0:8080");
        assert_eq!(settings.ws.ping_interval, Duration::from_secs(30));
        assert_eq!(settings.rate_limit.max_commands, 30);
        assert!(settings.turn.key_id.is_none());
    }
}
