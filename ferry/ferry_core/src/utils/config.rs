//! Configuration for pools and execution chains.
//!
//! Every pool and runner takes its settings as an explicit value at
//! construction. [`FerryConfig`] groups named pool settings with execution
//! defaults and can be loaded from a TOML file:
//!
//! ```toml
//! [execution]
//! default_parallelism = 4
//!
//! [pools.mongo]
//! capacity = 5
//! claim_timeout_ms = 3000
//!
//! [pools.mssql]
//! capacity = 2
//! init_policy = "fail_fast"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a pool does when some resources fail to open during initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitPolicy {
    /// Log the failure and continue with fewer resources
    #[default]
    Degrade,

    /// Close whatever opened and fail construction
    FailFast,
}

/// Settings for one resource pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name, used for logging and resource naming only
    #[serde(default)]
    pub name: String,

    /// Number of resources to create
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Emit per-claim detail at debug instead of trace
    #[serde(default)]
    pub debug_logging: bool,

    /// Timeout used by `claim_default`; 0 waits indefinitely
    #[serde(default)]
    pub claim_timeout_ms: u64,

    /// Interval between two stats reports
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,

    /// Behaviour on partial initialization failure
    #[serde(default)]
    pub init_policy: InitPolicy,
}

fn default_capacity() -> usize {
    5
}

fn default_stats_interval_ms() -> u64 {
    10_000
}

impl PoolConfig {
    /// Settings for a pool with the given name and capacity.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            debug_logging: false,
            claim_timeout_ms: 0,
            stats_interval_ms: default_stats_interval_ms(),
            init_policy: InitPolicy::default(),
        }
    }

    /// Set the default claim timeout.
    pub fn with_claim_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.claim_timeout_ms = timeout_ms;
        self
    }

    /// Set the stats reporting interval.
    pub fn with_stats_interval_ms(mut self, interval_ms: u64) -> Self {
        self.stats_interval_ms = interval_ms;
        self
    }

    /// Set the initialization policy.
    pub fn with_init_policy(mut self, policy: InitPolicy) -> Self {
        self.init_policy = policy;
        self
    }

    /// Toggle debug-level detail logging.
    pub fn with_debug_logging(mut self, debug: bool) -> Self {
        self.debug_logging = debug;
        self
    }

    /// Interval between two stats reports.
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Check the settings, reporting the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration(
                "Pool name could not be null or empty".to_string(),
            ));
        }
        if self.capacity < 1 {
            return Err(Error::Configuration(format!(
                "Pool {} capacity could not be less than 1",
                self.name
            )));
        }
        if self.stats_interval_ms == 0 {
            return Err(Error::Configuration(format!(
                "Pool {} stats interval could not be zero",
                self.name
            )));
        }
        Ok(())
    }
}

/// Defaults for execution chains and runners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Worker cap for parallel nodes created without an explicit capacity
    #[serde(default = "default_parallelism")]
    pub default_parallelism: usize,

    /// Emit per-task detail at debug instead of trace
    #[serde(default)]
    pub debug_logging: bool,
}

fn default_parallelism() -> usize {
    10
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_parallelism: default_parallelism(),
            debug_logging: false,
        }
    }
}

impl ExecutionConfig {
    /// Check the settings.
    pub fn validate(&self) -> Result<()> {
        if self.default_parallelism < 1 {
            return Err(Error::Configuration(
                "Default parallelism could not be less than 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration: named pools plus execution defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FerryConfig {
    /// Pool settings keyed by pool name
    #[serde(default)]
    pub pools: BTreeMap<String, PoolConfig>,

    /// Execution chain defaults
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl FerryConfig {
    /// Load configuration from a TOML file.
    ///
    /// Without a path, or when the file does not exist, the defaults are
    /// returned.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => {
                info!("No configuration file specified, using defaults");
                return Ok(Self::default());
            }
        };

        if !path.exists() {
            warn!("Configuration file not found: {}", path.display());
            return Ok(Self::default());
        }

        info!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)
            .map_err(|e| Error::Configuration(format!("Failed to parse configuration: {}", e)))?;

        for (name, pool) in config.pools.iter_mut() {
            if pool.name.is_empty() {
                pool.name = name.clone();
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate every pool and the execution defaults.
    pub fn validate(&self) -> Result<()> {
        for pool in self.pools.values() {
            pool.validate()?;
        }
        self.execution.validate()
    }

    /// Settings of the named pool.
    pub fn pool(&self, name: &str) -> Result<PoolConfig> {
        self.pools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("No configuration for pool {}", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
        [execution]
        default_parallelism = 4

        [pools.mongo]
        capacity = 3
        claim_timeout_ms = 2500

        [pools.mssql]
        capacity = 1
        init_policy = "fail_fast"
        debug_logging = true
    "#;

    #[test]
    fn test_parse_config() {
        let config = FerryConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.execution.default_parallelism, 4);

        let mongo = config.pool("mongo").unwrap();
        assert_eq!(mongo.name, "mongo");
        assert_eq!(mongo.capacity, 3);
        assert_eq!(mongo.claim_timeout_ms, 2500);
        assert_eq!(mongo.stats_interval_ms, 10_000);
        assert_eq!(mongo.init_policy, InitPolicy::Degrade);

        let mssql = config.pool("mssql").unwrap();
        assert_eq!(mssql.init_policy, InitPolicy::FailFast);
        assert!(mssql.debug_logging);

        assert!(config.pool("redis").is_err());
    }

    #[test]
    fn test_load_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = FerryConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.pools.len(), 2);
    }

    #[test]
    fn test_load_defaults() {
        let config = FerryConfig::load(None).unwrap();
        assert!(config.pools.is_empty());
        assert_eq!(config.execution.default_parallelism, 10);

        let missing = Path::new("/definitely/not/here/ferry.toml");
        let config = FerryConfig::load(Some(missing)).unwrap();
        assert_eq!(config, FerryConfig::default());
    }

    #[test]
    fn test_invalid_config() {
        let zero_capacity = "[pools.mongo]\ncapacity = 0\n";
        assert!(matches!(
            FerryConfig::from_toml_str(zero_capacity),
            Err(Error::Configuration(_))
        ));

        let garbage = "[pools.mongo\ncapacity = ";
        assert!(matches!(
            FerryConfig::from_toml_str(garbage),
            Err(Error::Configuration(_))
        ));

        assert!(PoolConfig::new("", 1).validate().is_err());
        assert!(PoolConfig::new("bikes", 1)
            .with_stats_interval_ms(0)
            .validate()
            .is_err());
        assert!(PoolConfig::new("bikes", 1).validate().is_ok());
    }
}
