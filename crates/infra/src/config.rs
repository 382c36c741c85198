//! Ledger configuration from environment variables.

use std::env;
use std::time::Duration;

use thiserror::Error;

use atelier_orders::DEFAULT_ORDER_PREFIX;

pub const LOCK_TIMEOUT_VAR: &str = "ATELIER_LOCK_TIMEOUT_MS";
pub const MAX_CONFLICT_RETRIES_VAR: &str = "ATELIER_MAX_CONFLICT_RETRIES";
pub const ORDER_PREFIX_VAR: &str = "ATELIER_ORDER_PREFIX";
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value '{value}' for {var}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Longest wait for a per-key lock before failing with a retryable timeout.
    pub lock_timeout: Duration,

    /// Extra attempts after an optimistic concurrency conflict.
    pub max_conflict_retries: u32,

    pub order_prefix: String,

    /// Postgres connection string; in-memory stores when unset.
    pub database_url: Option<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(2_000),
            max_conflict_retries: 3,
            order_prefix: DEFAULT_ORDER_PREFIX.to_string(),
            database_url: None,
        }
    }
}

impl LedgerConfig {
    /// Defaults overridden by the process environment.
    ///
    /// - `ATELIER_LOCK_TIMEOUT_MS`: lock wait in milliseconds, > 0 (default 2000)
    /// - `ATELIER_MAX_CONFLICT_RETRIES`: conflict retries (default 3)
    /// - `ATELIER_ORDER_PREFIX`: ASCII alphanumeric order-number prefix (default CMD)
    /// - `DATABASE_URL`: Postgres URL (default: in-memory)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(LOCK_TIMEOUT_VAR) {
            let millis: u64 = raw.trim().parse().map_err(|_| ConfigError {
                var: LOCK_TIMEOUT_VAR,
                value: raw.clone(),
                reason: "expected a whole number of milliseconds",
            })?;
            if millis == 0 {
                return Err(ConfigError {
                    var: LOCK_TIMEOUT_VAR,
                    value: raw,
                    reason: "must be greater than zero",
                });
            }
            config.lock_timeout = Duration::from_millis(millis);
        }

        if let Some(raw) = lookup(MAX_CONFLICT_RETRIES_VAR) {
            config.max_conflict_retries = raw.trim().parse().map_err(|_| ConfigError {
                var: MAX_CONFLICT_RETRIES_VAR,
                value: raw.clone(),
                reason: "expected a non-negative integer",
            })?;
        }

        if let Some(raw) = lookup(ORDER_PREFIX_VAR) {
            let prefix = raw.trim();
            if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ConfigError {
                    var: ORDER_PREFIX_VAR,
                    value: raw.clone(),
                    reason: "expected ASCII letters and digits",
                });
            }
            config.order_prefix = prefix.to_string();
        }

        config.database_url = lookup(DATABASE_URL_VAR).filter(|url| !url.trim().is_empty());

        Ok(config)
    }
}
