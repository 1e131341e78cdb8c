//! Server configuration.
//!
//! Configuration is read from the first TOML file found in the default
//! locations and then overlaid with `VIGIL_*` environment variables, where
//! `__` separates nested keys (`VIGIL_AUTH__JWT_SECRET`).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use vigil_core::{CallConfig, RouterConfig};

const CONFIG_PATHS: [&str; 3] = [
    "vigil.toml",
    "/etc/vigil/vigil.toml",
    "~/.config/vigil/vigil.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub calls: CallsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent sockets.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum group rooms one user may subscribe to.
    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_user: usize,

    /// Messages kept in memory per conversation.
    #[serde(default = "default_retained_messages")]
    pub retained_messages: usize,

    /// Evict conversations untouched for this many seconds.
    #[serde(default = "default_idle_conversation")]
    pub idle_conversation_secs: u64,

    /// Seconds between sweeps of idle state.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between server pings in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Close the socket after this long without client traffic.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port of the Prometheus exporter.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Bearer token verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the token issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,

    /// Required `iss` claim, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

/// Call settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsConfig {
    /// Application id on the RTC network.
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Upper bound for group call size.
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,

    /// How long a one-on-one call rings before it is given up.
    #[serde(default = "default_ring_timeout")]
    pub ring_timeout_ms: u64,

    /// How long an ended call still answers `CallEnded` before it is forgotten.
    #[serde(default = "default_ended_retention")]
    pub ended_retention_secs: u64,

    /// Secret for signing RTC tokens. Tokens are unsigned when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtc_secret: Option<String>,

    /// Lifetime of an RTC token in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_rooms() -> usize {
    100
}

fn default_retained_messages() -> usize {
    vigil_core::DEFAULT_RETAINED_MESSAGES
}

fn default_idle_conversation() -> u64 {
    1_800
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_app_id() -> String {
    "vigil".to_string()
}

fn default_max_participants() -> usize {
    16
}

fn default_ring_timeout() -> u64 {
    30_000
}

fn default_ended_retention() -> u64 {
    3_600
}

fn default_token_ttl() -> u64 {
    3_600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
            calls: CallsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            max_rooms_per_user: default_max_rooms(),
            retained_messages: default_retained_messages(),
            idle_conversation_secs: default_idle_conversation(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            app_id: default_app_id(),
            max_participants: default_max_participants(),
            ring_timeout_ms: default_ring_timeout(),
            ended_retention_secs: default_ended_retention(),
            rtc_secret: None,
            token_ttl_secs: default_token_ttl(),
        }
    }
}

impl Config {
    /// Load configuration from the default locations and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, an
    /// environment override has the wrong type, or the result is invalid.
    pub fn load() -> Result<Self> {
        let mut base = Self::default();
        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                base = Self::from_file(expanded.as_ref())?;
                break;
            }
        }

        let config = base.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Overlay `VIGIL_*` environment variables.
    fn with_env_overrides(self) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&self).context("Failed to stage configuration")?)
            .add_source(
                config::Environment::with_prefix("VIGIL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read environment overrides")?;

        settings
            .try_deserialize()
            .context("Invalid configuration override")
    }

    /// Reject configurations the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        match &self.auth.jwt_secret {
            None => bail!("auth.jwt_secret must be set (VIGIL_AUTH__JWT_SECRET)"),
            Some(secret) if secret.len() < 16 => {
                bail!("auth.jwt_secret must be at least 16 bytes")
            }
            Some(_) => {}
        }
        if !self.transport.websocket_path.starts_with('/') {
            bail!("transport.websocket_path must start with '/'");
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            bail!("heartbeat.timeout_ms must exceed a non-zero heartbeat.interval_ms");
        }
        if self.limits.retained_messages == 0 || self.limits.sweep_interval_secs == 0 {
            bail!("limits.retained_messages and limits.sweep_interval_secs must be non-zero");
        }
        if self.calls.max_participants < 2 {
            bail!("calls.max_participants must be at least 2");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Settings for the realtime core.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            calls: CallConfig {
                app_id: self.calls.app_id.clone(),
                max_participants: self.calls.max_participants,
                ring_timeout: Duration::from_millis(self.calls.ring_timeout_ms),
                ended_retention: Duration::from_secs(self.calls.ended_retention_secs),
            },
            max_rooms_per_user: self.limits.max_rooms_per_user,
            retained_messages: self.limits.retained_messages,
            idle_conversation: Duration::from_secs(self.limits.idle_conversation_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.calls.ring_timeout_ms, 30_000);
        // No secret, no server.
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let broken = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(broken.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000
            retained_messages = 200

            [auth]
            jwt_secret = "0123456789abcdef0123"
            issuer = "vigil-auth"

            [calls]
            ring_timeout_ms = 45000
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.auth.issuer.as_deref(), Some("vigil-auth"));
        assert!(config.validate().is_ok());

        let router = config.router_config();
        assert_eq!(router.calls.ring_timeout, Duration::from_secs(45));
        assert_eq!(router.calls.app_id, "vigil");
        assert_eq!(router.calls.ended_retention, Duration::from_secs(3600));
        assert_eq!(router.retained_messages, 200);
        assert_eq!(router.idle_conversation, Duration::from_secs(1800));
    }

    #[test]
    fn test_validate_rejects_short_secret() {
        let mut config = Config::default();
        config.auth.jwt_secret = Some("short".into());
        assert!(config.validate().is_err());

        config.auth.jwt_secret = Some("a-long-enough-secret".into());
        assert!(config.validate().is_ok());

        config.heartbeat.timeout_ms = config.heartbeat.interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_staged_config_round_trips() {
        let mut config = Config::default();
        config.auth.jwt_secret = Some("a-long-enough-secret".into());
        config.calls.rtc_secret = Some("rtc".into());

        let staged = config::Config::try_from(&config).unwrap();
        let restored: Config = staged.try_deserialize().unwrap();
        assert_eq!(restored.auth.jwt_secret, config.auth.jwt_secret);
        assert_eq!(restored.calls.rtc_secret.as_deref(), Some("rtc"));
        assert_eq!(restored.port, 8080);
    }
}
