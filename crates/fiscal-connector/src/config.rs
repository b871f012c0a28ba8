//! Connector server configuration.
//!
//! Configuration is loaded from environment variables with fallback to defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use fiscal_core::retry::DEFAULT_MAX_ATTEMPTS;
use fiscal_core::{DEFAULT_LEASE_SECS, DEFAULT_ONLINE_WINDOW_SECS};

/// Connector server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// HTTP listen port
    pub http_port: u16,

    /// HTTP bind address
    pub bind_addr: String,

    /// SQLite database file
    pub database_path: String,

    /// Lease granted to a connector on pull, in seconds
    pub lease_secs: i64,

    /// Period of the lease reclaim sweep, in seconds
    pub reclaim_interval_secs: u64,

    /// Attempt ceiling before a receipt is dead-lettered
    pub max_attempts: i64,

    /// A store is "online" if a device polled within this window, in seconds
    pub online_window_secs: i64,

    /// Pairing attempts allowed per client IP per minute
    pub pairing_attempts_per_minute: u32,

    /// Lifetime of an issued pairing code, in seconds
    pub pairing_code_ttl_secs: i64,

    /// Pull size when the agent does not ask for one
    pub default_pull_limit: u32,

    /// Largest pull size served
    pub max_pull_limit: u32,

    /// Upper bound of one ADAPTER-mode provider call, in seconds
    pub adapter_timeout_secs: u64,

    /// Argon2 memory cost for device token hashes, in KiB
    pub token_hash_memory_kib: u32,

    /// Argon2 iterations for device token hashes
    pub token_hash_iterations: u32,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig {
            http_port: 8080,
            bind_addr: "0.0.0.0".to_string(),
            database_path: "./fiscal.db".to_string(),
            lease_secs: DEFAULT_LEASE_SECS,
            reclaim_interval_secs: 30,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            online_window_secs: DEFAULT_ONLINE_WINDOW_SECS,
            pairing_attempts_per_minute: 10,
            pairing_code_ttl_secs: 600,
            default_pull_limit: 10,
            max_pull_limit: 50,
            adapter_timeout_secs: 30,
            // argon2 crate defaults
            token_hash_memory_kib: 19_456,
            token_hash_iterations: 2,
        }
    }
}

impl ConnectorConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ConnectorConfig::default();

        let config = ConnectorConfig {
            http_port: env_or("HTTP_PORT", defaults.http_port)?,
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_path: env::var("DATABASE_PATH").unwrap_or(defaults.database_path),
            lease_secs: env_or("LEASE_SECS", defaults.lease_secs)?,
            reclaim_interval_secs: env_or("RECLAIM_INTERVAL_SECS", defaults.reclaim_interval_secs)?,
            max_attempts: env_or("MAX_ATTEMPTS", defaults.max_attempts)?,
            online_window_secs: env_or("ONLINE_WINDOW_SECS", defaults.online_window_secs)?,
            pairing_attempts_per_minute: env_or(
                "PAIRING_ATTEMPTS_PER_MINUTE",
                defaults.pairing_attempts_per_minute,
            )?,
            pairing_code_ttl_secs: env_or("PAIRING_CODE_TTL_SECS", defaults.pairing_code_ttl_secs)?,
            default_pull_limit: env_or("DEFAULT_PULL_LIMIT", defaults.default_pull_limit)?,
            max_pull_limit: env_or("MAX_PULL_LIMIT", defaults.max_pull_limit)?,
            adapter_timeout_secs: env_or("ADAPTER_TIMEOUT_SECS", defaults.adapter_timeout_secs)?,
            token_hash_memory_kib: env_or("TOKEN_HASH_MEMORY_KIB", defaults.token_hash_memory_kib)?,
            token_hash_iterations: env_or("TOKEN_HASH_ITERATIONS", defaults.token_hash_iterations)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would disable a safety mechanism or overflow a
    /// duration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_secs("LEASE_SECS", self.lease_secs)?;
        check_secs("RECLAIM_INTERVAL_SECS", self.reclaim_interval_secs)?;
        check_secs("ONLINE_WINDOW_SECS", self.online_window_secs)?;
        check_secs("PAIRING_CODE_TTL_SECS", self.pairing_code_ttl_secs)?;
        check_secs("ADAPTER_TIMEOUT_SECS", self.adapter_timeout_secs)?;

        if self.max_attempts < 1 {
            return Err(ConfigError::InvalidValue("MAX_ATTEMPTS".to_string()));
        }
        if self.pairing_attempts_per_minute == 0 {
            return Err(ConfigError::InvalidValue("PAIRING_ATTEMPTS_PER_MINUTE".to_string()));
        }
        if self.max_pull_limit == 0 {
            return Err(ConfigError::InvalidValue("MAX_PULL_LIMIT".to_string()));
        }
        Ok(())
    }

    /// `bind_addr:http_port`
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.http_port)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs)
    }

    pub fn online_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.online_window_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    pub fn pairing_code_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pairing_code_ttl_secs)
    }
}

/// Longest duration setting accepted, in seconds (30 days).
pub const MAX_DURATION_SECS: i64 = 30 * 24 * 60 * 60;

/// Duration settings must lie in `1..=MAX_DURATION_SECS`.
fn check_secs<T: TryInto<i64>>(key: &str, secs: T) -> Result<(), ConfigError> {
    match secs.try_into() {
        Ok(secs) if (1..=MAX_DURATION_SECS).contains(&secs) => Ok(()),
        _ => Err(ConfigError::InvalidValue(key.to_string())),
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConnectorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lease(), chrono::Duration::seconds(120));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.pairing_attempts_per_minute, 10);
        assert_eq!(config.listen_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_zero_lease_rejected() {
        let config = ConnectorConfig {
            lease_secs: 0,
            ..ConnectorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(key)) if key == "LEASE_SECS"
        ));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let cases = [
            ("LEASE_SECS", ConnectorConfig { lease_secs: i64::MAX, ..ConnectorConfig::default() }),
            (
                "ONLINE_WINDOW_SECS",
                ConnectorConfig { online_window_secs: MAX_DURATION_SECS + 1, ..ConnectorConfig::default() },
            ),
            (
                "PAIRING_CODE_TTL_SECS",
                ConnectorConfig { pairing_code_ttl_secs: i64::MAX / 1000, ..ConnectorConfig::default() },
            ),
            (
                "RECLAIM_INTERVAL_SECS",
                ConnectorConfig { reclaim_interval_secs: u64::MAX, ..ConnectorConfig::default() },
            ),
            (
                "ADAPTER_TIMEOUT_SECS",
                ConnectorConfig { adapter_timeout_secs: u64::MAX, ..ConnectorConfig::default() },
            ),
        ];

        for (expected, config) in cases {
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidValue(key)) if key == expected
            ));
        }

        let longest = ConnectorConfig {
            lease_secs: MAX_DURATION_SECS,
            ..ConnectorConfig::default()
        };
        assert!(longest.validate().is_ok());
        assert_eq!(longest.lease(), chrono::Duration::days(30));
    }

    #[test]
    fn test_env_or_parses_and_rejects() {
        env::set_var("FISCAL_TEST_ENV_OR_OK", " 42 ");
        env::set_var("FISCAL_TEST_ENV_OR_BAD", "forty-two");

        assert_eq!(env_or("FISCAL_TEST_ENV_OR_OK", 1u32).unwrap(), 42);
        assert!(env_or("FISCAL_TEST_ENV_OR_BAD", 1u32).is_err());
        assert_eq!(env_or("FISCAL_TEST_ENV_OR_MISSING", 7u32).unwrap(), 7);
    }
}
