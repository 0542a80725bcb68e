use anyhow::{bail, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level switchyard configuration, loaded from `config.toml`.
///
/// Resolution order: `--config` flag → `~/.switchyard/config.toml` → built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct Config {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Logging and counter sink configuration (`[observability]`).
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Channels served by the broker (`[[channels]]`). One queue engine each.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Access rules (`[[rules]]`). A client with no rule at all is allowed everywhere.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

// ── Observability ─────────────────────────────────────────────────

fn default_observability_backend() -> String {
    "memory".into()
}

fn default_log_level() -> String {
    "info".into()
}

/// Observability configuration (`[observability]`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ObservabilityConfig {
    /// Counter sink backend: `"memory"` | `"prometheus"`. Default: `"memory"`.
    #[serde(default = "default_observability_backend")]
    pub backend: String,
    /// Default `tracing` filter when `RUST_LOG` is unset. Default: `"info"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: default_observability_backend(),
            log_level: default_log_level(),
        }
    }
}

// ── Channels ──────────────────────────────────────────────────────

fn default_max_items_in_queue() -> usize {
    1000
}

fn default_requeue_limit() -> u32 {
    5
}

fn default_requeue_interval_secs() -> u64 {
    30
}

fn default_prefetch() -> usize {
    1
}

/// One `endpoint/version` channel (`[[channels]]`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ChannelConfig {
    pub endpoint: String,
    pub version: String,
    /// Overflow bound per correlation key. Default: `1000`.
    #[serde(default = "default_max_items_in_queue")]
    pub max_items_in_queue: usize,
    /// Delivery attempts before an unacked message is dropped. Default: `5`.
    #[serde(default = "default_requeue_limit")]
    pub requeue_limit: u32,
    /// Seconds a delivery may stay unacked before it is resent. Default: `30`.
    #[serde(default = "default_requeue_interval_secs")]
    pub requeue_interval_secs: u64,
    /// Queue settings replaceable at runtime (`[channels.queue]`).
    #[serde(default)]
    pub queue: QueueConfig,
}

impl ChannelConfig {
    pub fn new(endpoint: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            version: version.into(),
            max_items_in_queue: default_max_items_in_queue(),
            requeue_limit: default_requeue_limit(),
            requeue_interval_secs: default_requeue_interval_secs(),
            queue: QueueConfig::default(),
        }
    }

    /// Registry key, `endpoint/version`.
    pub fn name(&self) -> String {
        channel_name(&self.endpoint, &self.version)
    }
}

/// Registry key of a channel.
pub fn channel_name(endpoint: &str, version: &str) -> String {
    format!("{endpoint}/{version}")
}

/// Per-queue settings (`[channels.queue]`), swapped wholesale by `reload`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct QueueConfig {
    /// Maximum unacknowledged deliveries in flight. Default: `1`.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    /// Seconds an overflow entry is kept before it expires. Unset: never.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Fields every item's `data` must carry (`[channels.queue.map]`).
    #[serde(default)]
    pub map: BTreeMap<String, FieldRule>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefetch: default_prefetch(),
            ttl_secs: None,
            map: BTreeMap::new(),
        }
    }
}

/// Type constraint of one mapped field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        };
        f.write_str(name)
    }
}

/// One entry of a queue field map.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub struct FieldRule {
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

// ── Access rules ──────────────────────────────────────────────────

/// Read/write grants for one client pattern (`[[rules]]`).
///
/// A `client` ending in `*` matches every client id with that prefix. Paths
/// are `endpoint/version/id`; missing trailing segments mean `*`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RuleConfig {
    pub client: String,
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
}

// ── Loading ───────────────────────────────────────────────────────

impl Config {
    /// `~/.switchyard/config.toml`.
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::UserDirs::new().context("Could not determine home directory")?;
        Ok(dirs.home_dir().join(".switchyard").join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`. A missing
    /// default file yields the built-in defaults; a missing explicit file is
    /// an error.
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from(path).await;
        }

        let default_path = Self::default_config_path()?;
        if fs::try_exists(&default_path).await.unwrap_or(false) {
            return Self::load_from(&default_path).await;
        }

        let mut config = Config::default();
        config.config_path = default_path;
        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            initialized = false,
            "No config file found; using defaults"
        );
        Ok(config)
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&contents).context("Failed to parse config file")?;
        config.config_path = path.to_path_buf();
        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            channels = config.channels.len(),
            rules = config.rules.len(),
            "Config loaded"
        );
        Ok(config)
    }

    /// Apply `SWITCHYARD_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SWITCHYARD_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.observability.log_level = level.trim().to_string();
            }
        }
        if let Ok(backend) = std::env::var("SWITCHYARD_OBSERVABILITY_BACKEND") {
            if !backend.trim().is_empty() {
                self.observability.backend = backend.trim().to_string();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for channel in &self.channels {
            let name = channel.name();
            if channel.endpoint.trim().is_empty() || channel.version.trim().is_empty() {
                bail!("Channel '{name}' needs a non-empty endpoint and version");
            }
            if channel.endpoint.contains('/') || channel.version.contains('/') {
                bail!("Channel '{name}': endpoint and version must not contain '/'");
            }
            if !seen.insert(name.clone()) {
                bail!("Channel '{name}' is declared more than once");
            }
            if channel.max_items_in_queue == 0 {
                bail!("Channel '{name}': max_items_in_queue must be at least 1");
            }
            if channel.requeue_limit == 0 {
                bail!("Channel '{name}': requeue_limit must be at least 1");
            }
            if channel.requeue_interval_secs == 0 {
                bail!("Channel '{name}': requeue_interval_secs must be at least 1");
            }
            validate_queue(&name, &channel.queue)?;
        }

        for rule in &self.rules {
            if rule.client.trim().is_empty() {
                bail!("Access rule with an empty client pattern");
            }
            for path in rule.read.iter().chain(rule.write.iter()) {
                crate::security::rules::parse_path(path)
                    .with_context(|| format!("Invalid access rule for '{}'", rule.client))?;
            }
        }
        Ok(())
    }

    pub fn channel(&self, endpoint: &str, version: &str) -> Option<&ChannelConfig> {
        self.channels
            .iter()
            .find(|channel| channel.endpoint == endpoint && channel.version == version)
    }

    /// JSON schema of the configuration file.
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(Config)).unwrap_or_default()
    }
}

/// Checks applied both at load time and on `reload`.
pub fn validate_queue(channel: &str, queue: &QueueConfig) -> Result<()> {
    if queue.prefetch == 0 {
        bail!("Channel '{channel}': prefetch must be at least 1");
    }
    if queue.ttl_secs == Some(0) {
        bail!("Channel '{channel}': ttl_secs must be at least 1 when set");
    }
    if queue.map.keys().any(|field| field.trim().is_empty()) {
        bail!("Channel '{channel}': field map contains an empty field name");
    }
    Ok(())
}
