//! Configuration system for meshpage.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MESHPAGE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meshpage/config.toml
//!   3. ~/.config/meshpage/config.toml
//!
//! Secrets (channel key, MQTT and gateway passwords) are usually supplied
//! through `MESHPAGE_*` variables rather than the file.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::crypto::{ChannelKey, KeyError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub channel: ChannelConfig,
    pub mqtt: MqttConfig,
    pub gateway: GatewayConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel name, e.g. "LongFast". Part of the MQTT topic and the
    /// directory key.
    pub name: String,
    /// Base64 pre-shared key. URL-safe alphabet and missing padding are accepted.
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Topic prefix; the channel name and `/#` are appended.
    pub root_topic: String,
    pub keepalive_secs: u64,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Paging endpoint, e.g. "https://hampager.de/api/calls".
    pub url: String,
    /// Recipient call sign. Also the basic-auth user name.
    pub callsign: String,
    pub password: String,
    pub transmitter_group: String,
    pub timeout_secs: u64,
    /// Total delivery attempts per message.
    pub max_retries: u32,
    /// Base backoff; attempt N waits `retry_delay_secs * 2^N`.
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Optional log file, written in addition to stdout.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Packet workers. Packets are sharded to workers by sender id.
    pub workers: usize,
    /// Per-worker inbound queue depth.
    pub queue_depth: usize,
    /// Pending paging requests.
    pub forward_queue_depth: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "LongFast".to_string(),
            key: String::new(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: String::new(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            root_topic: "msh/MY_919/2/e/".to_string(),
            keepalive_secs: 60,
            client_id: format!("meshpage-{}", std::process::id()),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            callsign: String::new(),
            password: String::new(),
            transmitter_group: String::new(),
            timeout_secs: 30,
            max_retries: 5,
            retry_delay_secs: 5,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: data_dir().join("meshtastic.db"),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 256,
            forward_queue_depth: 64,
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl MqttConfig {
    /// Subscription filter: `{root_topic}{channel}/#`.
    pub fn subscribe_topic(&self, channel: &str) -> String {
        format!("{}{}/#", self.root_topic, channel)
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("meshpage")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("meshpage")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("missing required settings: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid setting: {0}")]
    Invalid(String),
    #[error("invalid channel key: {0}")]
    Key(#[from] KeyError),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl RelayConfig {
    /// Load from the process environment and the resolved config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(env_var)
    }

    /// Load with an injectable environment. The file named by
    /// `MESHPAGE_CONFIG` (or the XDG default) is optional; env values win.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let path = Self::resolve_path(&lookup);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RelayConfig::default(),
            Err(e) => return Err(ConfigError::ReadFailed(path, e)),
        };
        config.apply_env_overrides(lookup);
        Ok(config)
    }

    /// Config file path for this process.
    pub fn file_path() -> PathBuf {
        Self::resolve_path(env_var)
    }

    fn resolve_path(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
        match lookup("MESHPAGE_CONFIG") {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => config_dir().join("config.toml"),
        }
    }

    /// Write the default config if no file exists yet. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if path.exists() {
            return Ok(path);
        }
        let text =
            toml::to_string_pretty(&RelayConfig::default()).map_err(ConfigError::SerializeFailed)?;
        let write = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::write(&path, text));
        write.map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        Ok(path)
    }

    /// Apply MESHPAGE_* overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let text = |name: &str, field: &mut String| {
            if let Some(v) = lookup(name) {
                *field = v;
            }
        };
        text("MESHPAGE_CHANNEL__NAME", &mut self.channel.name);
        text("MESHPAGE_CHANNEL__KEY", &mut self.channel.key);
        text("MESHPAGE_MQTT__BROKER", &mut self.mqtt.broker);
        text("MESHPAGE_MQTT__USERNAME", &mut self.mqtt.username);
        text("MESHPAGE_MQTT__PASSWORD", &mut self.mqtt.password);
        text("MESHPAGE_MQTT__ROOT_TOPIC", &mut self.mqtt.root_topic);
        text("MESHPAGE_GATEWAY__URL", &mut self.gateway.url);
        text("MESHPAGE_GATEWAY__CALLSIGN", &mut self.gateway.callsign);
        text("MESHPAGE_GATEWAY__PASSWORD", &mut self.gateway.password);
        text(
            "MESHPAGE_GATEWAY__TRANSMITTER_GROUP",
            &mut self.gateway.transmitter_group,
        );

        if let Some(p) = lookup("MESHPAGE_MQTT__PORT").and_then(|v| v.parse().ok()) {
            self.mqtt.port = p;
        }
        if let Some(n) = lookup("MESHPAGE_GATEWAY__MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.gateway.max_retries = n;
        }
        if let Some(n) = lookup("MESHPAGE_GATEWAY__RETRY_DELAY_SECS").and_then(|v| v.parse().ok())
        {
            self.gateway.retry_delay_secs = n;
        }
        if let Some(n) = lookup("MESHPAGE_GATEWAY__TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.gateway.timeout_secs = n;
        }
        if let Some(v) = lookup("MESHPAGE_STORAGE__DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MESHPAGE_LOGGING__FILE") {
            self.logging.file = (!v.is_empty()).then(|| PathBuf::from(v));
        }
    }

    /// Check that everything the relay needs at startup is present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (self.channel.key.as_str(), "channel.key"),
            (self.mqtt.broker.as_str(), "mqtt.broker"),
            (self.mqtt.username.as_str(), "mqtt.username"),
            (self.mqtt.password.as_str(), "mqtt.password"),
            (self.gateway.url.as_str(), "gateway.url"),
            (self.gateway.callsign.as_str(), "gateway.callsign"),
            (self.gateway.password.as_str(), "gateway.password"),
            (
                self.gateway.transmitter_group.as_str(),
                "gateway.transmitter_group",
            ),
        ];
        let missing: Vec<&'static str> = required
            .iter()
            .filter(|(value, _)| value.trim().is_empty())
            .map(|(_, name)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        if self.mqtt.port == 0 {
            return Err(ConfigError::Invalid("mqtt.port must be 1-65535".into()));
        }
        if self.gateway.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "gateway.max_retries must be greater than 0".into(),
            ));
        }
        if self.gateway.retry_delay_secs == 0 {
            return Err(ConfigError::Invalid(
                "gateway.retry_delay_secs must be greater than 0".into(),
            ));
        }
        if self.gateway.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "gateway.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.pipeline.workers == 0
            || self.pipeline.queue_depth == 0
            || self.pipeline.forward_queue_depth == 0
        {
            return Err(ConfigError::Invalid(
                "pipeline sizes must be greater than 0".into(),
            ));
        }

        self.channel_key()?;
        Ok(())
    }

    /// Decode the configured channel key.
    pub fn channel_key(&self) -> Result<ChannelKey, ConfigError> {
        Ok(ChannelKey::from_base64(&self.channel.key)?)
    }
}
