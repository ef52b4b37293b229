//! Configuration management for the failover agent.
//!
//! Loads a TOML file through the `config` crate, layered with `FAILOVER__*`
//! environment overrides (`FAILOVER__SYNC__BATCH_SIZE=500`). Every section
//! is optional and falls back to its defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fs::ExclusionRegistry;
use crate::utils::errors::{AgentError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub listener: ListenerConfig,
    pub api: ApiConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub receiver: ReceiverConfig,
    pub transport: TransportConfig,
    pub scheduler: SchedulerConfig,
    pub watchdog: WatchdogConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// This server's name in the inventory
    pub server_name: String,

    /// State directory; never replicated and never deleted on a mirror
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub enabled: bool,
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Inventory database. Source and destination agents must open the same
    /// file (a shared mount), since tokens issued on one are checked on the other.
    pub db_path: PathBuf,
    pub pool_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Tree replicated when this server is a source
    pub root: PathBuf,

    /// Entries per batch
    pub batch_size: usize,

    /// Additional wire-path prefixes never replicated
    pub extra_exclusions: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Compare content, not just size and mtime, before skipping a file
    pub verify_content: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub max_connections_per_destination: usize,

    /// zstd level for compressed sessions
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub startup_interval_secs: u64,
    pub tick_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub run_ceiling_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Single-line output without span context, for journald.
    pub compact: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/failover-agent")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_name: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string()),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:7420".to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:7421".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("inventory.db"),
            pool_size: 4,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            batch_size: 1000,
            extra_exclusions: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_connections_per_destination: 4,
            compression_level: crate::transfer::compression::DEFAULT_ZSTD_LEVEL,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            startup_interval_secs: 60,
            tick_interval_secs: 900,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            run_ceiling_secs: 4 * 3600,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            compact: false,
        }
    }
}

impl Config {
    /// Load from `path` (if given) and the environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("FAILOVER")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("sync.extra_exclusions")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| AgentError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.server_name.is_empty() {
            return Err(AgentError::Config("agent.server_name must not be empty".into()));
        }
        if !self.sync.root.is_absolute() {
            return Err(AgentError::Config(format!(
                "sync.root must be absolute, got {}",
                self.sync.root.display()
            )));
        }
        if self.sync.batch_size == 0 {
            return Err(AgentError::Config("sync.batch_size must be at least 1".into()));
        }
        if self.transport.max_connections_per_destination == 0 {
            return Err(AgentError::Config(
                "transport.max_connections_per_destination must be at least 1".into(),
            ));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(AgentError::Config("scheduler.tick_interval_secs must be positive".into()));
        }
        if let Some(bad) = self.sync.extra_exclusions.iter().find(|p| !p.is_absolute()) {
            return Err(AgentError::Config(format!(
                "sync.extra_exclusions entries must be absolute wire paths, got {}",
                bad.display()
            )));
        }
        Ok(())
    }

    /// Built-in no-copy prefixes plus the configured extras.
    pub fn exclusions(&self) -> ExclusionRegistry {
        ExclusionRegistry::with_defaults().with_prefixes(self.sync.extra_exclusions.iter().cloned())
    }

    pub fn startup_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.startup_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.tick_interval_secs)
    }

    pub fn run_ceiling(&self) -> Duration {
        Duration::from_secs(self.watchdog.run_ceiling_secs)
    }
}
