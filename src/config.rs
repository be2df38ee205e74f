//! WolfRepl Configuration
//!
//! This module provides configuration structures for the replication
//! control engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Fallback overall timeout for waits given a zero timeout
pub const DEFAULT_OVERALL_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Main WolfRepl configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WolfReplConfig {
    /// Connections to topology servers
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Replication control behavior
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Dry-run: mutating operations abort after their precondition checks
    #[serde(default)]
    pub noop: bool,
}

/// Topology connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// User for connecting to topology servers
    #[serde(default)]
    pub user: String,

    /// Password for connecting to topology servers
    #[serde(default)]
    pub password: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Connections kept per topology server
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Maximum concurrent operations across all topology servers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Query returning the promotion rule of the instance it runs on
    #[serde(default)]
    pub detect_promotion_rule_query: Option<String>,

    /// Query returning the semi-sync priority of the instance it runs on
    #[serde(default)]
    pub detect_semi_sync_priority_query: Option<String>,

    /// Query returning the cluster name of the instance it runs on
    #[serde(default)]
    pub detect_cluster_name_query: Option<String>,
}

/// Replication control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Default staleness timeout when waiting for the SQL thread to catch up
    #[serde(default = "default_reasonable_lag")]
    pub reasonable_replication_lag_secs: u64,

    /// Interval between polls while waiting on replication progress
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Overall limit when waiting for executed coordinates (0 = 24h)
    #[serde(default)]
    pub exec_coordinates_max_wait_secs: u64,

    /// Enable exactly the wait-for-count highest priority semi-sync replicas
    #[serde(default)]
    pub enforce_exact_semi_sync_replicas: bool,

    /// Enable enough semi-sync replicas to unlock a blocked master
    #[serde(default)]
    pub recover_locked_semi_sync_master: bool,

    /// Query returning user, password, ssl ca, ssl cert, ssl key for replication
    #[serde(default)]
    pub replication_credentials_query: Option<String>,

    /// Also toggle `super_read_only` along with `read_only`
    #[serde(default)]
    pub use_super_read_only: bool,

    /// Schema in which Pseudo-GTID entries are injected
    #[serde(default = "default_pseudo_gtid_schema")]
    pub pseudo_gtid_schema: String,

    /// How long a Pseudo-GTID grants check result is trusted
    #[serde(default = "default_grants_cache_secs")]
    pub grants_cache_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_connect_timeout() -> u64 {
    5
}

fn default_pool_size() -> u32 {
    2
}

fn default_concurrency() -> usize {
    crate::executor::DEFAULT_TOPOLOGY_CONCURRENCY
}

fn default_reasonable_lag() -> u64 {
    10
}

fn default_retry_interval_ms() -> u64 {
    500
}

fn default_pseudo_gtid_schema() -> String {
    "_pseudo_gtid_".to_string()
}

fn default_grants_cache_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: String::new(),
            connect_timeout_secs: default_connect_timeout(),
            pool_size: default_pool_size(),
            concurrency: default_concurrency(),
            detect_promotion_rule_query: None,
            detect_semi_sync_priority_query: None,
            detect_cluster_name_query: None,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            reasonable_replication_lag_secs: default_reasonable_lag(),
            retry_interval_ms: default_retry_interval_ms(),
            exec_coordinates_max_wait_secs: 0,
            enforce_exact_semi_sync_replicas: false,
            recover_locked_semi_sync_master: false,
            replication_credentials_query: None,
            use_super_read_only: false,
            pseudo_gtid_schema: default_pseudo_gtid_schema(),
            grants_cache_secs: default_grants_cache_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl ReplicationConfig {
    /// Staleness timeout used when a caller passes zero
    pub fn stale_coordinates_timeout(&self) -> Duration {
        Duration::from_secs(self.reasonable_replication_lag_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn exec_coordinates_max_wait(&self) -> Duration {
        if self.exec_coordinates_max_wait_secs == 0 {
            DEFAULT_OVERALL_TIMEOUT
        } else {
            Duration::from_secs(self.exec_coordinates_max_wait_secs)
        }
    }

    pub fn grants_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.grants_cache_secs)
    }

    /// Semi-sync decisions go through the topology analysis
    pub fn semi_sync_analysis_enabled(&self) -> bool {
        self.enforce_exact_semi_sync_replicas || self.recover_locked_semi_sync_master
    }
}

impl TopologyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl WolfReplConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfReplConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfReplConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.topology.concurrency == 0 {
            return Err(crate::Error::Config("topology.concurrency must be positive".into()));
        }

        if self.topology.pool_size == 0 {
            return Err(crate::Error::Config("topology.pool_size must be positive".into()));
        }

        if self.replication.retry_interval_ms == 0 {
            return Err(crate::Error::Config("replication.retry_interval_ms must be positive".into()));
        }

        if self.replication.pseudo_gtid_schema.is_empty() {
            return Err(crate::Error::Config("replication.pseudo_gtid_schema cannot be empty".into()));
        }

        Ok(())
    }
}
