use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::AgentKind;

/// Top-level configuration loaded from `~/.agentmux/config.toml`.
///
/// Every section is optional; missing sections and fields fall back to
/// their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub worktrees: WorktreesConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

impl Config {
    /// Load config from `~/.agentmux/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.terminal.validate()?;
        self.snapshot.validate()?;
        Ok(())
    }

    /// The agentmux data directory (`~/.agentmux`).
    pub fn data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agentmux")
    }

    fn default_path() -> PathBuf {
        Self::data_dir().join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `"pretty"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    7681
}

/// Output batching and backpressure tuning for terminal connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Chunks at or below this size are coalesced into batches.
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold_bytes: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Only chunks at least this large can trigger a backpressure pause.
    #[serde(default = "default_large_chunk")]
    pub large_chunk_bytes: usize,
    #[serde(default = "default_high_water")]
    pub high_water_bytes: usize,
    #[serde(default = "default_low_water")]
    pub low_water_bytes: usize,
    #[serde(default = "default_backpressure_timeout")]
    pub backpressure_timeout_secs: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            default_cols: default_cols(),
            default_rows: default_rows(),
            batch_threshold_bytes: default_batch_threshold(),
            batch_delay_ms: default_batch_delay_ms(),
            large_chunk_bytes: default_large_chunk(),
            high_water_bytes: default_high_water(),
            low_water_bytes: default_low_water(),
            backpressure_timeout_secs: default_backpressure_timeout(),
        }
    }
}

impl TerminalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_cols == 0 || self.default_rows == 0 {
            return Err(ConfigError::Validation(
                "terminal.default_cols and terminal.default_rows must be non-zero".into(),
            ));
        }
        if self.batch_threshold_bytes == 0 {
            return Err(ConfigError::Validation(
                "terminal.batch_threshold_bytes must be non-zero".into(),
            ));
        }
        if self.low_water_bytes >= self.high_water_bytes {
            return Err(ConfigError::Validation(format!(
                "terminal.low_water_bytes ({}) must be below terminal.high_water_bytes ({})",
                self.low_water_bytes, self.high_water_bytes
            )));
        }
        Ok(())
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_secs(self.backpressure_timeout_secs)
    }
}

fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_batch_threshold() -> usize {
    512
}
fn default_batch_delay_ms() -> u64 {
    4
}
fn default_large_chunk() -> usize {
    10 * 1024
}
fn default_high_water() -> usize {
    1024 * 1024
}
fn default_low_water() -> usize {
    512 * 1024
}
fn default_backpressure_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// A session disconnected for longer than this is an orphan.
    #[serde(default = "default_orphan_timeout")]
    pub orphan_timeout_secs: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
    /// Destroy orphans automatically on each sweep. When false the sweep
    /// only reports them.
    #[serde(default)]
    pub reap_orphans: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            orphan_timeout_secs: default_orphan_timeout(),
            reap_interval_secs: default_reap_interval(),
            reap_orphans: false,
        }
    }
}

impl SessionsConfig {
    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_secs(self.orphan_timeout_secs)
    }
}

fn default_orphan_timeout() -> u64 {
    3600
}
fn default_reap_interval() -> u64 {
    300
}

/// Periodic scrollback snapshots. Off by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_snapshot_interval")]
    pub interval_secs: u64,
    /// Directory for snapshot files; `~/.agentmux/snapshots` when unset.
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_snapshot_interval(),
            dir: None,
        }
    }
}

impl SnapshotConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "snapshot.interval_secs must be non-zero when snapshots are enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn resolved_dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => PathBuf::from(dir),
            None => Config::data_dir().join("snapshots"),
        }
    }
}

fn default_snapshot_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorktreesConfig {
    /// Directory that work keys are resolved against. Current directory
    /// when unset.
    #[serde(default)]
    pub root: Option<String>,
}

/// Command line used to launch one agent kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCommandConfig {
    /// Executable name or path. Empty means the user's login shell.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl AgentCommandConfig {
    fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_claude")]
    pub claude: AgentCommandConfig,
    #[serde(default = "default_codex")]
    pub codex: AgentCommandConfig,
    #[serde(default = "default_gemini")]
    pub gemini: AgentCommandConfig,
    #[serde(default = "default_open_code", rename = "opencode")]
    pub open_code: AgentCommandConfig,
    #[serde(default = "default_shell")]
    pub shell: AgentCommandConfig,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            claude: default_claude(),
            codex: default_codex(),
            gemini: default_gemini(),
            open_code: default_open_code(),
            shell: default_shell(),
        }
    }
}

impl AgentsConfig {
    pub fn command_for(&self, kind: AgentKind) -> &AgentCommandConfig {
        match kind {
            AgentKind::Claude => &self.claude,
            AgentKind::Codex => &self.codex,
            AgentKind::Gemini => &self.gemini,
            AgentKind::OpenCode => &self.open_code,
            AgentKind::Shell => &self.shell,
        }
    }
}

fn default_claude() -> AgentCommandConfig {
    AgentCommandConfig::new("claude", &[])
}
fn default_codex() -> AgentCommandConfig {
    AgentCommandConfig::new("codex", &[])
}
fn default_gemini() -> AgentCommandConfig {
    AgentCommandConfig::new("gemini", &[])
}
fn default_open_code() -> AgentCommandConfig {
    AgentCommandConfig::new("opencode", &[])
}
fn default_shell() -> AgentCommandConfig {
    AgentCommandConfig::new("", &["-l"])
}
