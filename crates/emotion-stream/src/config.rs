//! # Configuration
//!
//! [`GatewayConfig`] holds everything the gateway needs at startup.
//!
//! ## Loading Priority
//!
//! Configuration is loaded from the first source that provides a value:
//!
//! 1. Explicit struct fields (programmatic construction)
//! 2. TOML config file at an explicit path
//! 3. File named by the `EMOTION_GATEWAY_CONFIG` environment variable
//! 4. `./emotion-gateway.toml` in the current directory
//! 5. `~/.config/emotion-gateway/emotion-gateway.toml`
//! 6. Defaults
//!
//! Individual fields are always overridden by environment variables
//! (`EMOTION_UPSTREAM_API_KEY`, `EMOTION_FORWARD_INTERVAL_MS`, ...),
//! even when loading from a file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{StreamError, StreamResult};

/// Default ingress bind address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";

/// Default ingress WebSocket path.
pub const DEFAULT_STREAM_PATH: &str = "/api/emotion/stream";

/// Default upstream inference endpoint (face model stream).
pub const DEFAULT_UPSTREAM_URL: &str = "wss://api.hume.ai/v0/stream/models?models=face";

/// Default upstream keepalive ping interval in milliseconds.
const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;

/// Default forwarding interval in milliseconds.
const DEFAULT_FORWARD_INTERVAL_MS: u64 = 2_000;

/// Default reconnect base delay in milliseconds.
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// Default reconnect max delay in milliseconds.
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Default liveness sweep interval in milliseconds.
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Default number of observations retained per session.
pub const DEFAULT_HISTORY_CAPACITY: usize = 300;

/// Config file name searched for in the working and config directories.
const CONFIG_FILE_NAME: &str = "emotion-gateway.toml";

/// Configuration for the emotion streaming gateway.
///
/// # Examples
///
/// ```
/// use emotion_stream::config::GatewayConfig;
///
/// let mut config = GatewayConfig::default();
/// config.upstream.api_key = Some("secret".into());
/// assert_eq!(config.stream_path, "/api/emotion/stream");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Socket address the ingress listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// The only request path accepted for WebSocket upgrades.
    #[serde(default = "default_stream_path")]
    pub stream_path: String,

    /// Upstream inference provider settings.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Frame forwarding settings.
    #[serde(default)]
    pub forwarding: ForwardingConfig,

    /// Upstream reconnect backoff.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Client liveness sweep.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Per-session bookkeeping.
    #[serde(default)]
    pub session: SessionConfig,
}

/// How frames are wrapped when sent to the upstream provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameEncoding {
    /// Raw JPEG bytes in a binary message.
    #[default]
    Binary,
    /// `{"models":{"face":{}},"data":"<base64>"}` text message.
    Base64Json,
}

/// Upstream inference provider connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// WebSocket URL of the inference stream.
    #[serde(default = "default_upstream_url")]
    pub url: String,

    /// Bearer credential. Sent as `Authorization: Bearer <key>` when present.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Interval between keepalive pings on an open upstream connection.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Frame wrapping expected by the provider.
    #[serde(default)]
    pub frame_encoding: FrameEncoding,
}

/// Frame forwarding (Forwarding Scheduler) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    /// Interval between scheduler ticks. At most one frame is forwarded per tick.
    #[serde(default = "default_forward_interval")]
    pub interval_ms: u64,
}

/// Exponential backoff for upstream reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    #[serde(default = "default_reconnect_base_delay")]
    pub base_delay_ms: u64,

    /// Maximum delay between reconnect attempts (exponential backoff cap).
    #[serde(default = "default_reconnect_max_delay")]
    pub max_delay_ms: u64,
}

/// Client liveness sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between liveness sweeps.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
}

/// Per-session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Observations retained per session; older ones are dropped first.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

// ─── Defaults ───────────────────────────────────────────────────────────

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}

fn default_stream_path() -> String {
    DEFAULT_STREAM_PATH.to_string()
}

fn default_upstream_url() -> String {
    DEFAULT_UPSTREAM_URL.to_string()
}

fn default_ping_interval() -> u64 {
    DEFAULT_PING_INTERVAL_MS
}

fn default_forward_interval() -> u64 {
    DEFAULT_FORWARD_INTERVAL_MS
}

fn default_reconnect_base_delay() -> u64 {
    DEFAULT_RECONNECT_BASE_DELAY_MS
}

fn default_reconnect_max_delay() -> u64 {
    DEFAULT_RECONNECT_MAX_DELAY_MS
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

// ─── Default impls ──────────────────────────────────────────────────────

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            stream_path: default_stream_path(),
            upstream: UpstreamConfig::default(),
            forwarding: ForwardingConfig::default(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            api_key: None,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            frame_encoding: FrameEncoding::default(),
        }
    }
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_FORWARD_INTERVAL_MS,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

// ─── Duration accessors ─────────────────────────────────────────────────

impl UpstreamConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

impl ForwardingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ─── GatewayConfig impl ─────────────────────────────────────────────────

impl GatewayConfig {
    /// Load config from defaults plus environment variables.
    ///
    /// Recognized: `EMOTION_BIND_ADDR`, `EMOTION_STREAM_PATH`,
    /// `EMOTION_UPSTREAM_URL`, `EMOTION_UPSTREAM_API_KEY` (or `HUME_API_KEY`),
    /// `EMOTION_FORWARD_INTERVAL_MS`, `EMOTION_HEARTBEAT_INTERVAL_MS`,
    /// `EMOTION_RECONNECT_BASE_MS`, `EMOTION_RECONNECT_MAX_MS`.
    pub fn from_env() -> StreamResult<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Load config from a TOML file, with environment variable overrides.
    #[cfg(feature = "config-toml")]
    pub fn from_file(path: impl AsRef<Path>) -> StreamResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| StreamError::ConfigError {
            reason: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;
        let config: Self = toml::from_str(&contents)?;
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Without the `config-toml` feature only environment configuration is
    /// available.
    #[cfg(not(feature = "config-toml"))]
    pub fn from_file(path: impl AsRef<Path>) -> StreamResult<Self> {
        Err(StreamError::ConfigError {
            reason: format!(
                "Cannot load '{}': built without the `config-toml` feature",
                path.as_ref().display()
            ),
        })
    }

    /// Discover and load config from the standard search path:
    ///
    /// 1. Explicit path (if `Some`)
    /// 2. `EMOTION_GATEWAY_CONFIG` environment variable
    /// 3. `./emotion-gateway.toml`
    /// 4. `~/.config/emotion-gateway/emotion-gateway.toml`
    ///
    /// Falls back to environment-variable-only config if no file is found.
    pub fn discover(explicit_path: Option<&Path>) -> StreamResult<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var("EMOTION_GATEWAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        let local_path = PathBuf::from(CONFIG_FILE_NAME);
        if local_path.exists() {
            return Self::from_file(&local_path);
        }

        if let Some(config_path) = dirs_config_path() {
            if config_path.exists() {
                return Self::from_file(&config_path);
            }
        }

        Self::from_env()
    }

    /// Apply environment overrides using `lookup` to resolve variable names.
    ///
    /// Numeric variables that fail to parse are reported as
    /// [`StreamError::ConfigError`] instead of being ignored.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> StreamResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("EMOTION_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(path) = lookup("EMOTION_STREAM_PATH") {
            self.stream_path = path;
        }
        if let Some(url) = lookup("EMOTION_UPSTREAM_URL") {
            self.upstream.url = url;
        }
        if let Some(key) = lookup("EMOTION_UPSTREAM_API_KEY").or_else(|| lookup("HUME_API_KEY")) {
            self.upstream.api_key = Some(key);
        }
        if let Some(ms) = parse_ms(&lookup, "EMOTION_FORWARD_INTERVAL_MS")? {
            self.forwarding.interval_ms = ms;
        }
        if let Some(ms) = parse_ms(&lookup, "EMOTION_HEARTBEAT_INTERVAL_MS")? {
            self.heartbeat.interval_ms = ms;
        }
        if let Some(ms) = parse_ms(&lookup, "EMOTION_RECONNECT_BASE_MS")? {
            self.reconnect.base_delay_ms = ms;
        }
        if let Some(ms) = parse_ms(&lookup, "EMOTION_RECONNECT_MAX_MS")? {
            self.reconnect.max_delay_ms = ms;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values that would make the timers spin or the path unmatchable.
    pub fn validate(&self) -> StreamResult<()> {
        if !self.stream_path.starts_with('/') {
            return Err(StreamError::ConfigError {
                reason: format!("stream_path '{}' must start with '/'", self.stream_path),
            });
        }
        if self.forwarding.interval_ms == 0 {
            return Err(StreamError::ConfigError {
                reason: "forwarding.interval_ms must be greater than zero".into(),
            });
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(StreamError::ConfigError {
                reason: "heartbeat.interval_ms must be greater than zero".into(),
            });
        }
        if self.upstream.ping_interval_ms == 0 {
            return Err(StreamError::ConfigError {
                reason: "upstream.ping_interval_ms must be greater than zero".into(),
            });
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(StreamError::ConfigError {
                reason: "reconnect.max_delay_ms must not be below base_delay_ms".into(),
            });
        }
        Ok(())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn parse_ms<F>(lookup: &F, key: &str) -> StreamResult<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| StreamError::ConfigError {
                reason: format!("{key}='{raw}' is not a number of milliseconds: {e}"),
            }),
    }
}

/// Platform-appropriate config directory path.
fn dirs_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .ok()
            .map(|dir| PathBuf::from(dir).join("emotion-gateway").join(CONFIG_FILE_NAME))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(|dir| {
            PathBuf::from(dir)
                .join(".config")
                .join("emotion-gateway")
                .join(CONFIG_FILE_NAME)
        })
    }
}
