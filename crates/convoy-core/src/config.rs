use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const MAX_PAYLOAD_BYTES: usize = 128 * 1024; // 128 KB hard cap per inbound frame
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256; // per-connection send queue
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Close code sent when the upgrade request carries no `projectId`.
pub const CLOSE_MISSING_PROJECT: u16 = 4400;
/// Close code sent when the auth token does not match.
pub const CLOSE_INVALID_TOKEN: u16 = 4401;
/// Close code (1013, try again later) for a client that fell behind its
/// outbound queue. Reconnecting replays the in-flight buffer.
pub const CLOSE_SLOW_CONSUMER: u16 = 1013;

pub const DEFAULT_COMPACTION_THRESHOLD: u64 = 150_000;
pub const DEFAULT_KEEP_RECENT: usize = 20;

/// Top-level config (convoy.toml + CONVOY_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvoyConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    Token,
    #[default]
    None,
}

/// Liveness sweep cadence. A connection that misses one full interval is terminated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: HEARTBEAT_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// SQLite file backing the durable snapshots. `:memory:` is accepted.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Cumulative recorded token usage that triggers compaction.
    #[serde(default = "default_threshold")]
    pub threshold_tokens: u64,
    /// Most recent non-system messages that are always kept verbatim.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// Model used for the summarization call (cheaper than the chat model).
    #[serde(default = "default_compaction_model")]
    pub model: String,
    #[serde(default = "default_summary_tokens")]
    pub max_summary_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold_tokens: DEFAULT_COMPACTION_THRESHOLD,
            keep_recent: DEFAULT_KEEP_RECENT,
            model: default_compaction_model(),
            max_summary_tokens: default_summary_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub anthropic: Option<AnthropicConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_heartbeat_interval() -> u64 {
    HEARTBEAT_INTERVAL_SECS
}
fn default_threshold() -> u64 {
    DEFAULT_COMPACTION_THRESHOLD
}
fn default_keep_recent() -> usize {
    DEFAULT_KEEP_RECENT
}
fn default_compaction_model() -> String {
    "claude-haiku-4-5".to_string()
}
fn default_summary_tokens() -> u32 {
    1024
}
fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.convoy/convoy.db", home)
}

impl ConvoyConfig {
    /// Load config from a TOML file with CONVOY_* env var overrides.
    ///
    /// Falls back to `~/.convoy/convoy.toml` when no path is given. A missing
    /// file is not an error: every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ConvoyConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CONVOY_").split("__"))
            .extract()
            .map_err(|e| crate::error::ConvoyError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Parse config from an inline TOML string (no env merge).
    pub fn from_toml_str(toml: &str) -> crate::error::Result<Self> {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| crate::error::ConvoyError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.convoy/convoy.toml", home)
}
