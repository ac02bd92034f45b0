//! Process-level configuration, loaded from a `.reverser.toml` file next
//! to where the binary is run plus per-field environment overrides.
//!
//! Per-Target/Provider configuration (credentials, branch allow-lists,
//! watch rules) lives in Kubernetes custom resources and is owned by
//! `reverser-controllers`; this crate only covers the knobs that apply to
//! the process as a whole: the admission server, the Router's dead-letter
//! handling, and the defaults a Branch Worker falls back to when a Target
//! doesn't override them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reverser_retry::RetryStrategyConfig;
use reverser_types::PushPolicy;
use serde::{Deserialize, Serialize};

/// Default configuration file name, looked for in the current directory.
pub const CONFIG_FILE: &str = ".reverser.toml";

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Complete process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub worker_defaults: WorkerDefaultsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen_addr(&self) -> &str {
        &self.server.listen_addr
    }

    pub fn tls_cert_path(&self) -> Option<&Path> {
        self.server.tls_cert_path.as_deref()
    }

    pub fn tls_key_path(&self) -> Option<&Path> {
        self.server.tls_key_path.as_deref()
    }

    pub fn dead_letter_log_path(&self) -> &Path {
        &self.router.dead_letter_log_path
    }

    pub fn default_push_policy(&self) -> PushPolicy {
        self.worker_defaults.push_policy
    }

    pub fn default_retry_policy(&self) -> &RetryStrategyConfig {
        &self.worker_defaults.retry_policy
    }

    pub fn reconcile_interval(&self) -> Duration {
        self.worker_defaults.reconcile_interval
    }

    pub fn log_level(&self) -> &str {
        &self.logging.level
    }

    pub fn log_json(&self) -> bool {
        self.logging.json
    }
}

/// Admission webhook server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen_addr: default_listen_addr(), tls_cert_path: None, tls_key_path: None }
    }
}

/// Event Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Where route-miss events are appended as a durable audit trail:
    /// events with no matching Target are logged, not dropped.
    #[serde(default = "default_dead_letter_path")]
    pub dead_letter_log_path: PathBuf,
}

fn default_dead_letter_path() -> PathBuf {
    PathBuf::from("dead-letter.jsonl")
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { dead_letter_log_path: default_dead_letter_path() }
    }
}

/// Defaults a Branch Worker uses unless its owning Target overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDefaultsConfig {
    #[serde(default)]
    pub push_policy: PushPolicy,
    #[serde(default)]
    pub retry_policy: RetryStrategyConfig,
    /// How often a Ready worker re-fetches and reconciles against the
    /// live cluster.
    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(300)
}

impl Default for WorkerDefaultsConfig {
    fn default() -> Self {
        Self {
            push_policy: PushPolicy::default(),
            retry_policy: RetryStrategyConfig::default(),
            reconcile_interval: default_reconcile_interval(),
        }
    }
}

/// Logging configuration, consumed by the binary's `tracing-subscriber`
/// setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), json: false }
    }
}

/// Load configuration from `<dir>/.reverser.toml`, falling back to
/// defaults if the file doesn't exist.
pub fn load_config(dir: &Path) -> Result<AppConfig> {
    load_config_from_file(&config_path(dir))
}

pub fn load_config_from_file(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    toml::from_str(&content).with_context(|| format!("failed to parse config file: {}", path.display()))
}

pub fn save_config(dir: &Path, config: &AppConfig) -> Result<()> {
    let path = config_path(dir);
    let content = toml::to_string_pretty(config).context("failed to serialize config to TOML")?;
    std::fs::write(&path, content).with_context(|| format!("failed to write config file: {}", path.display()))
}

/// Walk up from `start_dir` looking for `.reverser.toml`.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir;
    loop {
        let candidate = current.join(CONFIG_FILE);
        if candidate.exists() {
            return Some(candidate);
        }
        current = current.parent()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_expected_values() {
        let config = AppConfig::new();
        assert_eq!(config.listen_addr(), "0.0.0.0:8443");
        assert_eq!(config.log_level(), "info");
        assert_eq!(config.reconcile_interval(), Duration::from_secs(300));
        assert!(!config.default_retry_policy().is_exhausted(1000));
    }

    #[test]
    fn load_missing_config_returns_default() {
        let td = tempdir().unwrap();
        let config = load_config(td.path()).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:8443");
    }

    #[test]
    fn save_and_load_roundtrip() {
        let td = tempdir().unwrap();
        let mut config = AppConfig::new();
        config.server.listen_addr = "127.0.0.1:9443".to_string();
        config.logging.level = "debug".to_string();

        save_config(td.path(), &config).unwrap();
        let loaded = load_config(td.path()).unwrap();
        assert_eq!(loaded.listen_addr(), "127.0.0.1:9443");
        assert_eq!(loaded.log_level(), "debug");
    }

    #[test]
    fn parse_partial_toml_uses_defaults_for_rest() {
        let td = tempdir().unwrap();
        let path = td.path().join(CONFIG_FILE);
        std::fs::write(&path, "[logging]\nlevel = \"trace\"\n").unwrap();

        let config = load_config(td.path()).unwrap();
        assert_eq!(config.log_level(), "trace");
        assert_eq!(config.listen_addr(), "0.0.0.0:8443");
    }

    #[test]
    fn find_config_walks_up_directory_tree() {
        let td = tempdir().unwrap();
        let nested = td.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        let path = td.path().join(CONFIG_FILE);
        std::fs::write(&path, "").unwrap();

        assert_eq!(find_config(&nested), Some(path));
    }

    #[test]
    fn find_config_returns_none_when_absent() {
        let td = tempdir().unwrap();
        let nested = td.path().join("a");
        std::fs::create_dir_all(&nested).unwrap();
        assert!(find_config(&nested).is_none());
    }
}
