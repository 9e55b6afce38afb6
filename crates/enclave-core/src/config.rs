//! Pool configuration.

use std::env;
use std::num::NonZeroUsize;
use std::thread;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the pool size.
pub const POOL_SIZE_ENV: &str = "ENCLAVE_POOL_SIZE";

/// Environment variable toggling parallel package loads.
pub const PARALLEL_LOAD_ENV: &str = "ENCLAVE_PARALLEL_LOAD";

/// Settings for a [`Pool`](crate::Pool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of instances.
    pub size: usize,
    /// Replay package loads on worker threads.
    pub parallel_load: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            parallel_load: true,
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by `ENCLAVE_POOL_SIZE` and `ENCLAVE_PARALLEL_LOAD`.
    pub fn from_env() -> Self {
        Self::default().overridden_by(|name| env::var(name).ok())
    }

    fn overridden_by(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(POOL_SIZE_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(size) if size > 0 => self.size = size,
                _ => tracing::warn!("ignoring {}={:?}: expected a positive integer", POOL_SIZE_ENV, raw),
            }
        }
        if let Some(raw) = lookup(PARALLEL_LOAD_ENV) {
            match parse_flag(&raw) {
                Some(flag) => self.parallel_load = flag,
                None => tracing::warn!("ignoring {}={:?}: expected true or false", PARALLEL_LOAD_ENV, raw),
            }
        }
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
