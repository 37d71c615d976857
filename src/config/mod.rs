use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_exit_grace_secs")]
    pub exit_grace_secs: u64,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_exit_grace_secs() -> u64 {
    5
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            skip_permissions: true,
            extra_args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            exit_grace_secs: default_exit_grace_secs(),
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_secs(self.exit_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_path")]
    pub path: PathBuf,
}

fn default_workspace_path() -> PathBuf {
    PathBuf::from("./workspace")
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            path: default_workspace_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_grace_window_secs")]
    pub grace_window_secs: i64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: i64,
    #[serde(default = "default_heartbeat_soon_hours")]
    pub heartbeat_soon_hours: i64,
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_grace_window_secs() -> i64 {
    61
}

fn default_workers() -> usize {
    2
}

fn default_log_retention_days() -> i64 {
    14
}

fn default_heartbeat_soon_hours() -> i64 {
    24
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval_secs(),
            grace_window_secs: default_grace_window_secs(),
            workers: default_workers(),
            log_retention_days: default_log_retention_days(),
            heartbeat_soon_hours: default_heartbeat_soon_hours(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn grace_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_window_secs)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    pub fn soon_hours(&self) -> i64 {
        self.heartbeat_soon_hours.max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub allowed_users: Vec<i64>,
    #[serde(default = "default_true")]
    pub progress: bool,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
}

fn default_max_message_len() -> usize {
    3800
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            allowed_users: Vec::new(),
            progress: true,
            max_message_len: default_max_message_len(),
        }
    }
}

impl TelegramConfig {
    pub fn has_token(&self) -> bool {
        !self.token.is_empty() && self.token != "YOUR_BOT_TOKEN_HERE"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyProvider {
    #[default]
    Telegram,
    Slack,
    None,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub provider: NotifyProvider,
    #[serde(default)]
    pub default_chat_id: Option<i64>,
    #[serde(default)]
    pub slack_token: String,
    #[serde(default)]
    pub slack_default_target: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub recall: bool,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

fn default_max_results() -> usize {
    10
}

fn default_max_context_chars() -> usize {
    2000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            recall: true,
            max_results: default_max_results(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!(
                "Config file not found: {}\nCopy config.example.yaml to config.yaml and edit it.",
                path.display()
            );
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).with_context(|| "Failed to parse config YAML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_use_defaults() {
        let config = Config::parse("telegram:\n  token: abc\n").unwrap();
        assert_eq!(config.telegram.token, "abc");
        assert_eq!(config.telegram.max_message_len, 3800);
        assert_eq!(config.agent.command, "claude");
        assert_eq!(config.scheduler.poll_interval_secs, 60);
        assert_eq!(config.scheduler.grace_window_secs, 61);
        assert_eq!(config.scheduler.log_retention_days, 14);
        assert_eq!(config.notify.provider, NotifyProvider::Telegram);
        assert_eq!(config.workspace.path, PathBuf::from("./workspace"));
    }

    #[test]
    fn clamps_worker_and_heartbeat_values() {
        let config = Config::parse(
            "scheduler:\n  workers: 0\n  heartbeat_soon_hours: 0\nnotify:\n  provider: slack\n",
        )
        .unwrap();
        assert_eq!(config.scheduler.worker_count(), 1);
        assert_eq!(config.scheduler.soon_hours(), 1);
        assert_eq!(config.notify.provider, NotifyProvider::Slack);
    }

    #[test]
    fn missing_file_is_only_an_error_for_strict_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        assert!(Config::load(&path).is_err());
        assert_eq!(Config::load_or_default(&path).unwrap().agent.timeout_secs, 300);
    }
}
