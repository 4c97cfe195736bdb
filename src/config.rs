//! Configuration loading
//!
//! Layered: built-in defaults, then an optional TOML file, then
//! `STRAND_`-prefixed environment variables. Lock retry/backoff values live
//! here because they are tunable policy, not invariants.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub lock: LockConfig,
    pub run: RunConfig,
}

/// Database backend settings
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL; only required when the database controller is used
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

/// Item-lock policy shared by both controller backends
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Fixed backoff between acquisition attempts
    pub retry_ms: u64,
    /// Bounded wait before a `LockTimeout` is raised
    pub timeout_ms: u64,
}

/// Orchestration settings
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Poll interval while waiting for all threads to stop
    pub poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: DatabaseConfig {
                url: None,
                max_connections: 20,
                min_connections: 2,
                acquire_timeout_secs: 10,
            },
            lock: LockConfig {
                retry_ms: 25,
                timeout_ms: 2_000,
            },
            run: RunConfig {
                poll_interval_ms: 20,
            },
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional file, and environment.
    ///
    /// The file is taken from `STRAND_CONFIG_PATH` when set, otherwise
    /// `strand.toml` in the working directory (if present). Nested settings
    /// use double underscores in the environment (`STRAND_LOCK__TIMEOUT_MS`);
    /// `STRAND_DATABASE_URL` is honored directly as the common case.
    pub fn load() -> Result<Config> {
        let defaults = Config::default();

        let file_path = std::env::var("STRAND_CONFIG_PATH")
            .unwrap_or_else(|_| "strand".to_string());

        let mut config: Config = config::Config::builder()
            .set_default("database.max_connections", defaults.database.max_connections)?
            .set_default("database.min_connections", defaults.database.min_connections)?
            .set_default(
                "database.acquire_timeout_secs",
                defaults.database.acquire_timeout_secs,
            )?
            .set_default("lock.retry_ms", defaults.lock.retry_ms)?
            .set_default("lock.timeout_ms", defaults.lock.timeout_ms)?
            .set_default("run.poll_interval_ms", defaults.run.poll_interval_ms)?
            .add_source(config::File::with_name(&file_path).required(false))
            .add_source(config::Environment::with_prefix("STRAND").separator("__"))
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        if let Ok(url) = std::env::var("STRAND_DATABASE_URL") {
            config.database.url = Some(url);
        }

        Ok(config)
    }
}
