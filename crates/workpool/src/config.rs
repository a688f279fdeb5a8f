// Implements the pool configuration surface and its TOML loader.

use std::str::FromStr;
use std::{env, thread};

use derive_more::derive::From;
use serde::Deserialize;

/// Environment variable overriding the default worker count.
pub const WORKER_COUNT_ENV: &str = "TANDEM_WORKER_THREADS";

#[derive(Debug, From)]
pub enum ConfigError {
    #[from(ignore)]
    IOError(std::io::Error),

    #[from(ignore)]
    DeserializationFailed(toml::de::Error),

    InvalidPath(std::path::PathBuf),
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        Self::DeserializationFailed(value)
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl std::error::Error for ConfigError {}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// What the bounded queue does when a submission finds it full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Hold the submitting caller until a worker frees a slot.
    Block,

    /// Fail the submission immediately with a rejected condition.
    Reject,
}

/// Shape of the pending-task queue. A bounded queue must pick an
/// explicit [`OverflowPolicy`]; there is no implicit default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBehaviour {
    Unbounded,
    Bounded {
        capacity: usize,
        on_full: OverflowPolicy,
    },
}

impl Default for QueueBehaviour {
    fn default() -> Self {
        QueueBehaviour::Unbounded
    }
}

/// `PoolConfig` carries everything [`WorkPool::start`] needs.
///
/// [`WorkPool::start`]: crate::WorkPool::start
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// number of long lived workers the pool keeps alive.
    #[serde(default = "resolve_worker_count")]
    pub workers: usize,

    /// pending-task queue shape and overflow behaviour.
    #[serde(default)]
    pub queue: QueueBehaviour,

    /// prefix used when naming worker and supervisor threads.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: resolve_worker_count(),
            queue: QueueBehaviour::default(),
            name_prefix: default_name_prefix(),
        }
    }
}

impl PoolConfig {
    /// `with_workers` is the shorthand for a pool of `count` workers
    /// over an unbounded queue.
    #[must_use]
    pub fn with_workers(count: usize) -> Self {
        Self {
            workers: count,
            ..Self::default()
        }
    }
}

fn default_name_prefix() -> String {
    String::from("tandem")
}

/// `from_path` loads a [`PoolConfig`] from a TOML file.
pub fn from_path<V: Into<std::path::PathBuf>>(target: V) -> ConfigResult<PoolConfig> {
    let target_path = target.into();
    if !target_path.exists() {
        return Err(ConfigError::InvalidPath(target_path));
    }

    let config_content = std::fs::read_to_string(target_path)?;
    let config_obj: PoolConfig = toml::from_str(&config_content)?;
    Ok(config_obj)
}

/// [`resolve_worker_count`] will attempt to fetch the desired worker
/// count from the environment variable `TANDEM_WORKER_THREADS`
/// or gets the maximum allowed parallelism of the platform
/// via [`std::thread::available_parallelism`].
pub fn resolve_worker_count() -> usize {
    let worker_num = match env::var(WORKER_COUNT_ENV)
        .ok()
        .and_then(|s| usize::from_str(&s).ok())
    {
        Some(x @ 1..) => {
            tracing::debug!("Retrieved worker count from {}", WORKER_COUNT_ENV);
            x
        }
        _ => max_parallelism(),
    };

    tracing::debug!("Reporting workers available for use: {}", worker_num);

    worker_num
}

/// [`max_parallelism`] returns the max parallelism available
/// on the current system.
pub fn max_parallelism() -> usize {
    match thread::available_parallelism().ok().map(|s| s.get()) {
        Some(system_value) => {
            tracing::debug!(
                "thread::available_parallelism() reported: {}",
                system_value
            );
            system_value
        }
        None => 1,
    }
}
