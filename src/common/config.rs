//! Configuration for the deployctl server
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `DEPLOYCTL__SECTION__FIELD` environment variables. CLI flags applied by the
//! binaries win over all of these.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "deployctl.toml";

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Logging level (used when RUST_LOG is unset)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Grace period for in-flight requests on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Maximum accepted request body
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_shutdown_grace() -> u64 {
    30
}
fn default_body_limit() -> usize {
    4 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            log_level: default_log_level(),
            shutdown_grace_secs: default_shutdown_grace(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

/// Record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// RocksDB directory
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Concurrent store operations (pool size)
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,

    /// How long to wait for a pool slot before reporting the store unavailable
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// Deadline for a single store operation
    #[serde(default = "default_op_timeout")]
    pub op_timeout_ms: u64,

    /// Deadline for a whole ingestion batch
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_ms: u64,

    /// Deadline for the liveness probe
    #[serde(default = "default_health_timeout")]
    pub health_timeout_ms: u64,

    /// Attempts per create/update before a version conflict is surfaced
    #[serde(default = "default_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Artificial delay inside the create transaction (testing only)
    #[serde(default)]
    pub write_delay_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./deployctl-data")
}
fn default_max_conns() -> usize {
    100
}
fn default_acquire_timeout() -> u64 {
    5_000
}
fn default_op_timeout() -> u64 {
    10_000
}
fn default_batch_timeout() -> u64 {
    30_000
}
fn default_health_timeout() -> u64 {
    5_000
}
fn default_conflict_retries() -> u32 {
    8
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_conns: default_max_conns(),
            acquire_timeout_ms: default_acquire_timeout(),
            op_timeout_ms: default_op_timeout(),
            batch_timeout_ms: default_batch_timeout(),
            health_timeout_ms: default_health_timeout(),
            max_conflict_retries: default_conflict_retries(),
            write_delay_ms: 0,
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at `db_path`, handy for tests and tools
    pub fn with_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_conns == 0 {
            return Err(Error::InvalidConfig("store.max_conns must be > 0".into()));
        }
        if self.max_conflict_retries == 0 {
            return Err(Error::InvalidConfig(
                "store.max_conflict_retries must be > 0".into(),
            ));
        }
        if self.op_timeout_ms == 0 || self.batch_timeout_ms == 0 {
            return Err(Error::InvalidConfig("store timeouts must be > 0".into()));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from `path` (or `deployctl.toml` if present) and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("DEPLOYCTL")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.store.validate()?;
        Ok(config)
    }
}
