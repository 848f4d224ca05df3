use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bearer token for authentication (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_port() -> u16 {
    3000
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            auth_token: None,
        }
    }
}

/// Crontab access configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronConfig {
    /// Users whose crontabs are managed. Empty means discover them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
    /// Force bridged (container) mode on or off. Detected when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<bool>,
    /// Location of the logging wrapper script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapper_path: Option<PathBuf>,
    /// Root directory of per-job run logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// Directory receiving per-job JSON snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
    /// Crontab spool directory used to discover users.
    #[serde(default = "default_spool_dir")]
    pub crontab_spool_dir: PathBuf,
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/var/spool/cron/crontabs")
}

impl CronConfig {
    /// Whether crontab access must go through the host bridge.
    pub fn is_bridged(&self) -> bool {
        self.docker
            .unwrap_or_else(|| Path::new("/.dockerenv").exists())
    }

    pub fn wrapper_path(&self) -> PathBuf {
        self.wrapper_path
            .clone()
            .unwrap_or_else(|| data_dir().join("scripts").join("cron-log-wrapper.sh"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("logs"))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("backup"))
    }
}

/// On-demand execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Foreground run timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Captured output is truncated past this many characters.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_output_chars() -> usize {
    200_000
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

/// Live event stream tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Heartbeat interval per subscriber.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Reconnect hint sent to clients on open.
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
    /// Per-subscriber queue depth before it is considered stalled.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_retry_ms() -> u64 {
    3000
}

fn default_buffer_size() -> usize {
    256
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            retry_ms: default_retry_ms(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Top-level cronpilot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronPilotConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

impl CronPilotConfig {
    /// Apply `CRONPILOT_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("CRONPILOT_DOCKER") {
            match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.cron.docker = Some(true),
                "0" | "false" | "no" => self.cron.docker = Some(false),
                other => tracing::warn!("Ignoring invalid CRONPILOT_DOCKER value: {other}"),
            }
        }
        if let Ok(value) = std::env::var("CRONPILOT_PORT") {
            match value.parse() {
                Ok(port) => self.gateway.port = port,
                Err(e) => tracing::warn!("Ignoring invalid CRONPILOT_PORT value: {e}"),
            }
        }
        if let Ok(token) = std::env::var("CRONPILOT_AUTH_TOKEN") {
            if !token.is_empty() {
                self.gateway.auth_token = Some(token);
            }
        }
        if let Ok(users) = std::env::var("CRONPILOT_USERS") {
            let users: Vec<String> = users
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
            if !users.is_empty() {
                self.cron.users = users;
            }
        }
    }
}

/// Resolve the cronpilot config directory (~/.cronpilot/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".cronpilot"))
        .ok_or(ConfigError::NoDirFound)
}

/// Base directory for scripts, logs and backups.
pub fn data_dir() -> PathBuf {
    config_dir().unwrap_or_else(|_| PathBuf::from("/var/lib/cronpilot"))
}

/// Resolve the config file path (~/.cronpilot/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<CronPilotConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    let mut config = load_config_from(&path)?;
    config.apply_env_overrides();
    Ok(config)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<CronPilotConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(CronPilotConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: CronPilotConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CronPilotConfig::default();
        assert_eq!(config.gateway.port, 3000);
        assert!(config.cron.users.is_empty());
        assert_eq!(config.events.heartbeat_secs, 30);
        assert_eq!(config.exec.timeout_secs, 300);
        assert_eq!(
            config.cron.crontab_spool_dir,
            PathBuf::from("/var/spool/cron/crontabs")
        );
    }

    #[test]
    fn test_json5_parse() {
        let json5_str = r#"{
            gateway: { port: 8080, auth_token: "secret" },
            cron: {
                users: ["root", "deploy"],
                docker: true,
                log_dir: "/data/logs",
            },
            events: { heartbeat_secs: 10 },
        }"#;
        let config: CronPilotConfig = json5::from_str(json5_str).unwrap();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.cron.users, vec!["root", "deploy"]);
        assert!(config.cron.is_bridged());
        assert_eq!(config.cron.log_dir(), PathBuf::from("/data/logs"));
        assert_eq!(config.events.heartbeat_secs, 10);
        assert_eq!(config.events.retry_ms, 3000);
    }

    #[test]
    fn test_explicit_host_mode() {
        let config: CronPilotConfig = json5::from_str("{ cron: { docker: false } }").unwrap();
        assert!(!config.cron.is_bridged());
    }

    #[test]
    fn test_default_paths_under_data_dir() {
        let cron = CronConfig::default();
        assert!(cron.wrapper_path().ends_with("scripts/cron-log-wrapper.sh"));
        assert!(cron.log_dir().ends_with("logs"));
        assert!(cron.backup_dir().ends_with("backup"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = load_config_from(Path::new("/nonexistent/cronpilot.json5")).unwrap();
        assert_eq!(config.gateway.host, "0.0.0.0");
    }
}
