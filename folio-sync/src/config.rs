//! Engine configuration: production defaults overlaid with `FOLIO_*`
//! environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::compactor::RetentionPolicy;
use crate::lock::LockConfig;
use crate::relay::RelayConfig;
use crate::storage::StoreConfig;
use crate::worker::WorkerConfig;

pub const ENV_BIND_ADDR: &str = "FOLIO_BIND_ADDR";
pub const ENV_STORAGE_PATH: &str = "FOLIO_STORAGE_PATH";
pub const ENV_HEARTBEAT_SECS: &str = "FOLIO_HEARTBEAT_SECS";
pub const ENV_WORKER_CONCURRENCY: &str = "FOLIO_WORKER_CONCURRENCY";
pub const ENV_COLLECT_SCAN_SECS: &str = "FOLIO_COLLECT_SCAN_SECS";
pub const ENV_COMPACT_SCAN_SECS: &str = "FOLIO_COMPACT_SCAN_SECS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub relay: RelayConfig,
    pub store: StoreConfig,
    pub lock: LockConfig,
    pub worker: WorkerConfig,
    pub retention: RetentionPolicy,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from defaults plus whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            config.relay.bind_addr = addr;
        }
        if let Some(path) = lookup(ENV_STORAGE_PATH) {
            config.store.path = PathBuf::from(path);
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_HEARTBEAT_SECS)? {
            config.relay.heartbeat_interval = positive_secs(ENV_HEARTBEAT_SECS, secs)?;
        }
        if let Some(concurrency) = parse::<usize>(&lookup, ENV_WORKER_CONCURRENCY)? {
            if concurrency == 0 {
                return Err(invalid(ENV_WORKER_CONCURRENCY, "0", "must be at least 1"));
            }
            config.worker.concurrency = concurrency;
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_COLLECT_SCAN_SECS)? {
            config.worker.collect_scan_interval = positive_secs(ENV_COLLECT_SCAN_SECS, secs)?;
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_COMPACT_SCAN_SECS)? {
            config.worker.compact_scan_interval = positive_secs(ENV_COMPACT_SCAN_SECS, secs)?;
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
    }
}

fn positive_secs(key: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(invalid(key, "0", "must be positive"));
    }
    Ok(Duration::from_secs(secs))
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
