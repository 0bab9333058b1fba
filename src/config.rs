use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agents::detect::DetectedAgent;
use crate::agents::{AgentDescriptor, AgentKind, AgentTable};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::retry::RetryPolicy;

pub const CONFIG_DIR_NAME: &str = ".cortex";
pub const CONFIG_FILE_NAME: &str = "config.toml";

const DEFAULT_CONFIG_TOML: &str = "\
# Cortex configuration
# Primary orchestrator agent (brain)
primary = \"claude\"

# Global settings
parallel_timeout = 600
json_output = true

# Rate limit retry settings
max_retries = 3
retry_base_delay = 5.0
retry_max_delay = 60.0

[agents.claude]
auto_approve = true
timeout = 300
max_turns = 15

[agents.gemini]
auto_approve = true
timeout = 300

[agents.codex]
auto_approve = true
timeout = 300
extra_args = [\"--skip-git-repo-check\"]
";

/// Per-agent overrides from the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSettings {
    pub binary_path: Option<String>,
    pub default_model: Option<String>,
    #[serde(default = "default_true")]
    pub auto_approve: bool,
    #[serde(default = "default_agent_timeout")]
    pub timeout: u64,
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            binary_path: None,
            default_model: None,
            auto_approve: true,
            timeout: default_agent_timeout(),
            max_turns: None,
            extra_args: Vec::new(),
        }
    }
}

impl AgentSettings {
    /// Builtin defaults applied when the config file has no entry for the
    /// agent.
    pub fn default_for(kind: AgentKind) -> Self {
        let mut settings = Self::default();
        match kind {
            AgentKind::Claude => settings.max_turns = Some(15),
            AgentKind::Codex => settings.extra_args = vec!["--skip-git-repo-check".to_string()],
            AgentKind::Gemini => {}
        }
        settings
    }
}

/// On-disk configuration (`~/.cortex/config.toml`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default = "default_primary")]
    pub primary: String,
    /// Primary acts as coordinator only and never answers worker
    /// subtasks itself. Defaults to true for claude.
    pub coordinator_only_primary: Option<bool>,
    #[serde(default = "default_parallel_timeout")]
    pub parallel_timeout: u64,
    #[serde(default = "default_true")]
    pub json_output: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay: f64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: f64,
    #[serde(default)]
    pub telemetry_enabled: bool,
    pub telemetry_path: Option<String>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentSettings>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG_TOML).unwrap_or(Self {
            primary: default_primary(),
            coordinator_only_primary: None,
            parallel_timeout: default_parallel_timeout(),
            json_output: true,
            max_retries: default_max_retries(),
            retry_base_delay: default_retry_base_delay(),
            retry_max_delay: default_retry_max_delay(),
            telemetry_enabled: false,
            telemetry_path: None,
            agents: BTreeMap::new(),
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_primary() -> String {
    "claude".to_string()
}

fn default_parallel_timeout() -> u64 {
    600
}

fn default_agent_timeout() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> f64 {
    5.0
}

fn default_retry_max_delay() -> f64 {
    60.0
}

pub fn config_dir() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(CONFIG_DIR_NAME)
}

pub fn default_config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE_NAME)
}

/// Load the config file, writing the commented default file on first run.
/// A malformed file logs a warning and falls back to defaults rather than
/// aborting the run.
pub fn load_config(path: Option<&Path>) -> Result<ConfigFile> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file found, writing defaults");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
        std::fs::write(&path, DEFAULT_CONFIG_TOML)
            .with_context(|| format!("failed to write '{}'", path.display()))?;
        return Ok(ConfigFile::default());
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    match toml::from_str::<ConfigFile>(&raw) {
        Ok(file) => Ok(file),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to parse config, using defaults");
            Ok(ConfigFile::default())
        }
    }
}

/// Resolved engine configuration. Built once at startup and passed into
/// the engine explicitly; there is no process-wide mutable config.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub primary: String,
    pub coordinator_only: bool,
    pub global_timeout: Duration,
    pub json_output: bool,
    pub retry: RetryPolicy,
    pub event_capacity: usize,
    pub telemetry_enabled: bool,
    pub telemetry_path: PathBuf,
}

impl OrchestratorConfig {
    pub fn from_file(file: &ConfigFile) -> Self {
        Self {
            primary: file.primary.clone(),
            coordinator_only: file
                .coordinator_only_primary
                .unwrap_or(file.primary == "claude"),
            global_timeout: Duration::from_secs(file.parallel_timeout.max(1)),
            json_output: file.json_output,
            retry: RetryPolicy {
                max_retries: file.max_retries,
                base_delay: Duration::from_secs_f64(file.retry_base_delay.max(0.0)),
                max_delay: Duration::from_secs_f64(
                    file.retry_max_delay.max(file.retry_base_delay.max(0.0)),
                ),
                jitter: true,
            },
            event_capacity: DEFAULT_EVENT_CAPACITY,
            telemetry_enabled: file.telemetry_enabled,
            telemetry_path: file
                .telemetry_path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| config_dir().join("telemetry.jsonl")),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_file(&ConfigFile::default())
    }
}

/// Merge detection results with config overrides into the descriptor
/// table. Only detected agents are registered; configuration alone does
/// not conjure an installed tool.
pub fn build_table(
    detected: &BTreeMap<String, DetectedAgent>,
    file: &ConfigFile,
) -> AgentTable {
    let mut table = AgentTable::new();
    for agent in detected.values() {
        let settings = file
            .agents
            .get(agent.kind.name())
            .cloned()
            .unwrap_or_else(|| AgentSettings::default_for(agent.kind));
        let mut descriptor = AgentDescriptor::new(
            agent.kind,
            settings
                .binary_path
                .clone()
                .unwrap_or_else(|| agent.binary_path.clone()),
        );
        descriptor.version = agent.version.clone();
        descriptor.timeout = Duration::from_secs(settings.timeout.max(1));
        descriptor.auto_approve = settings.auto_approve;
        descriptor.default_model = settings.default_model.clone();
        descriptor.max_turns = settings.max_turns;
        descriptor.extra_args = settings.extra_args.clone();
        table.insert(descriptor);
    }
    table
}
