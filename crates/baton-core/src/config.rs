//! Configuration (`baton.yml`).
//!
//! Every section and field has a default, so an empty file is a valid
//! config. Keys are kebab-case.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::DEFAULT_MAX_RETRIES;

pub const DEFAULT_CONFIG_FILE: &str = "baton.yml";

/// Configuration could not be read, parsed or accepted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration. Every section and key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BatonConfig {
    pub store: StoreConfig,
    pub dispatcher: DispatcherConfig,
    pub watcher: WatcherConfig,
}

/// `store:` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StoreConfig {
    /// Directory holding the buckets, the lock and the audit log.
    pub root: PathBuf,

    /// Age after which a Lock Token is considered abandoned.
    pub stale_lock_secs: u64,

    /// `max_retries` for envelopes that do not carry their own.
    pub default_max_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("store"),
            stale_lock_secs: 60,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl StoreConfig {
    pub fn stale_lock(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }
}

/// `dispatcher:` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DispatcherConfig {
    /// Sleep after a tick that found nothing to do.
    pub idle_poll_ms: u64,

    /// Sleep after a tick that found the lock held elsewhere.
    pub busy_poll_ms: u64,

    pub handler_timeout_secs: u64,

    /// Recipient of task notifications. None disables them.
    pub observer: Option<String>,

    /// `from` of envelopes the dispatcher produces itself.
    pub sender: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: 500,
            busy_poll_ms: 200,
            handler_timeout_secs: 30,
            observer: None,
            sender: "baton".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn busy_poll(&self) -> Duration {
        Duration::from_millis(self.busy_poll_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

/// `watcher:` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WatcherConfig {
    pub enabled: bool,

    /// Parent of the per-recipient inbox directories.
    pub inbox_root: PathBuf,

    pub poll_interval_ms: u64,

    /// Recipients to watch. Empty means every subdirectory of `inbox-root`.
    pub recipients: Vec<String>,

    /// Defaults to `<store.root>/quarantine`.
    pub quarantine_dir: Option<PathBuf>,

    /// Keep ingested files here instead of deleting them.
    pub archive_dir: Option<PathBuf>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            inbox_root: PathBuf::from("inbox"),
            poll_interval_ms: 1000,
            recipients: Vec::new(),
            quarantine_dir: None,
            archive_dir: None,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl BatonConfig {
    /// Explicit path, else `./baton.yml`, else defaults.
    ///
    /// An explicit path must load. A broken `./baton.yml` is logged and
    /// skipped.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }

        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(local) {
                Ok(config) => return Ok(config),
                Err(e) => warn!(error = %e, "ignoring local config"),
            }
        }

        info!("using default config");
        Ok(Self::default())
    }

    /// Parse one YAML file. Missing keys take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Reject settings the runtime cannot honour: zero durations, empty names,
    /// or a handler timeout that would let a live holder look stale.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.stale_lock_secs == 0 {
            return Err(ConfigError::Invalid("store.stale-lock-secs must be > 0".into()));
        }
        if self.dispatcher.handler_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.handler-timeout-secs must be > 0".into(),
            ));
        }
        if self.dispatcher.handler_timeout_secs >= self.store.stale_lock_secs {
            return Err(ConfigError::Invalid(
                "dispatcher.handler-timeout-secs must be shorter than store.stale-lock-secs"
                    .into(),
            ));
        }
        if self.dispatcher.sender.trim().is_empty() {
            return Err(ConfigError::Invalid("dispatcher.sender must not be empty".into()));
        }
        if let Some(observer) = &self.dispatcher.observer
            && observer.trim().is_empty()
        {
            return Err(ConfigError::Invalid("dispatcher.observer must not be empty".into()));
        }
        Ok(())
    }

    /// Quarantine directory, resolved against the store root.
    pub fn quarantine_dir(&self) -> PathBuf {
        self.watcher
            .quarantine_dir
            .clone()
            .unwrap_or_else(|| self.store.root.join("quarantine"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BatonConfig::default();
        config.validate().unwrap();
        assert_eq!(config.store.default_max_retries, 3);
        assert_eq!(config.dispatcher.handler_timeout(), Duration::from_secs(30));
        assert_eq!(config.quarantine_dir(), PathBuf::from("store/quarantine"));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = r#"
store:
  root: /var/lib/baton
dispatcher:
  observer: reviewer
watcher:
  recipients: [agent-1, agent-2]
"#;
        let config: BatonConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.store.root, PathBuf::from("/var/lib/baton"));
        assert_eq!(config.store.stale_lock_secs, 60);
        assert_eq!(config.dispatcher.observer.as_deref(), Some("reviewer"));
        assert_eq!(config.dispatcher.idle_poll(), Duration::from_millis(500));
        assert_eq!(config.watcher.recipients, vec!["agent-1", "agent-2"]);
        assert!(config.watcher.enabled);
    }

    #[test]
    fn timeout_must_be_shorter_than_staleness() {
        let mut config = BatonConfig::default();
        config.dispatcher.handler_timeout_secs = 120;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn explicit_path_must_load() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yml");
        assert!(matches!(
            BatonConfig::load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));

        let broken = dir.path().join("broken.yml");
        fs::write(&broken, "store: [").unwrap();
        assert!(matches!(
            BatonConfig::load(Some(&broken)),
            Err(ConfigError::Parse { .. })
        ));

        let good = dir.path().join("good.yml");
        fs::write(&good, "store:\n  stale-lock-secs: 90\n").unwrap();
        assert_eq!(BatonConfig::load(Some(&good)).unwrap().store.stale_lock_secs, 90);
    }
}
