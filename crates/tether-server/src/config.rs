//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - TOML configuration file (first one found)
//! - Environment variables (`TETHER_*`, `__` between nested keys, e.g.
//!   `TETHER_NOTIFICATIONS__COOLDOWN_SECS=600`)

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core::{DeliveryMode, PipelineConfig, RouterConfig, UserProfile};
use tracing::info;

const CONFIG_PATHS: [&str; 3] = [
    "tether.toml",
    "/etc/tether/tether.toml",
    "~/.config/tether/tether.toml",
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

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Offline notifications.
    #[serde(default)]
    pub notifications: NotificationsConfig,

    #[serde(default)]
    pub uploads: UploadsConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Profiles loaded into the in-memory store at startup.
    #[serde(default)]
    pub users: Vec<UserProfile>,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum WebSocket frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum uploaded attachment size in bytes.
    #[serde(default = "default_max_attachment_size")]
    pub max_attachment_size: usize,

    /// Maximum message text length in characters.
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Token verification.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the identity provider.
    #[serde(default)]
    pub jwt_secret: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub mode: DeliveryMode,
}

/// Offline notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Minimum seconds between notifications for one conversation.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Upper bound on one notification send, in milliseconds.
    #[serde(default = "default_notification_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_subject")]
    pub subject: String,

    /// HTTP mail relay endpoint. Notifications are only logged when unset.
    #[serde(default)]
    pub relay_url: Option<String>,

    /// Sender address.
    #[serde(default = "default_from")]
    pub from: String,

    /// Link placed in the notification body.
    #[serde(default = "default_app_url")]
    pub app_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadsConfig {
    /// Directory attachments are written to.
    #[serde(default = "default_uploads_dir")]
    pub dir: PathBuf,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
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

fn default_max_attachment_size() -> usize {
    5 * 1024 * 1024 // 5 MiB
}

fn default_max_text_length() -> usize {
    4000
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_cooldown_secs() -> u64 {
    tether_core::notify::DEFAULT_COOLDOWN_SECS
}

fn default_notification_timeout() -> u64 {
    10_000
}

fn default_subject() -> String {
    "New Message on Tether".to_string()
}

fn default_from() -> String {
    "Tether <no-reply@tether.local>".to_string()
}

fn default_app_url() -> String {
    "http://localhost:5173/".to_string()
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            auth: AuthConfig::default(),
            delivery: DeliveryConfig::default(),
            notifications: NotificationsConfig::default(),
            uploads: UploadsConfig::default(),
            metrics: MetricsConfig::default(),
            users: Vec::new(),
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
            max_attachment_size: default_max_attachment_size(),
            max_text_length: default_max_text_length(),
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

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            timeout_ms: default_notification_timeout(),
            subject: default_subject(),
            relay_url: None,
            from: default_from(),
            app_url: default_app_url(),
        }
    }
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            dir: default_uploads_dir(),
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

impl Config {
    /// Load configuration from the first config file found, with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or the
    /// result is invalid.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).into_owned()))
            .find(|path| path.exists());

        Self::build(file.as_deref())
    }

    /// Load configuration from a specific file, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = path.as_ref().to_string_lossy();
        let expanded = PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned());
        if !expanded.exists() {
            bail!("Config file not found: {}", expanded.display());
        }
        Self::build(Some(&expanded))
    }

    fn build(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            info!(path = %path.display(), "Loading config file");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Toml),
            );
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("TETHER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            bail!("auth.jwt_secret must be set (TETHER_AUTH__JWT_SECRET)");
        }
        if self.heartbeat.interval_ms == 0 {
            bail!("heartbeat.interval_ms must be greater than zero");
        }
        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            bail!("heartbeat.timeout_ms must be greater than heartbeat.interval_ms");
        }
        if self.limits.max_text_length == 0 {
            bail!("limits.max_text_length must be greater than zero");
        }
        if !self.transport.websocket_path.starts_with('/') {
            bail!("transport.websocket_path must start with '/'");
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

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms)
    }

    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            max_connections: self.limits.max_connections,
        }
    }

    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            delivery_mode: self.delivery.mode,
            max_text_length: self.limits.max_text_length,
            notification_subject: self.notifications.subject.clone(),
            notification_timeout: Duration::from_millis(self.notifications.timeout_ms),
            cooldown_secs: self.notifications.cooldown_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.limits.max_text_length, 4000);
        assert_eq!(config.limits.max_attachment_size, 5 * 1024 * 1024);
        assert_eq!(config.notifications.cooldown_secs, 3600);
        assert_eq!(config.delivery.mode, DeliveryMode::Room);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [auth]
            jwt_secret = "s3cret"

            [delivery]
            mode = "global_degraded"

            [notifications]
            cooldown_secs = 600
            relay_url = "http://mail.internal/send"

            [[users]]
            id = "alice"
            firstName = "Alice"
            email = "alice@example.com"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.delivery.mode, DeliveryMode::GlobalDegraded);
        assert_eq!(config.notifications.cooldown_secs, 600);
        assert_eq!(config.notifications.timeout_ms, 10_000);
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.users[0].first_name, "Alice");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_applies_file_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "port = 9100\n[auth]\njwt_secret = \"abc\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.auth.jwt_secret, "abc");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::from_file("/definitely/not/here/tether.toml").is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_err(), "empty secret must be rejected");

        config.auth.jwt_secret = "s3cret".into();
        assert!(config.validate().is_ok());

        config.heartbeat.timeout_ms = config.heartbeat.interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secret_is_redacted() {
        let auth = AuthConfig {
            jwt_secret: "hunter2".into(),
        };
        assert!(!format!("{:?}", auth).contains("hunter2"));
    }

    #[test]
    fn test_pipeline_config_mapping() {
        let mut config = Config::default();
        config.notifications.timeout_ms = 2500;
        config.limits.max_text_length = 10;

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.notification_timeout, Duration::from_millis(2500));
        assert_eq!(pipeline.max_text_length, 10);
        assert_eq!(pipeline.notification_subject, "New Message on Tether");
    }
}
