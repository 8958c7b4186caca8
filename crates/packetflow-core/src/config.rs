// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use packetflow_http::{PaginationClientConfig, RetryPolicy};

use crate::stale_monitor::StaleMonitorConfig;

/// Packetflow configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Packet size used when `start` is called with 0
    pub default_packet_size: u32,
    /// Retry ceiling copied onto every new record
    pub record_max_retries: u32,
    /// Pagination client connect timeout
    pub http_connect_timeout: Duration,
    /// Pagination client whole-request timeout
    pub http_read_timeout: Duration,
    /// Attempt ceiling for a single page fetch
    pub fetch_max_attempts: u32,
    /// Backoff base delay
    pub fetch_initial_delay: Duration,
    /// Backoff multiplier
    pub fetch_backoff_multiplier: f64,
    /// Backoff cap
    pub fetch_max_delay: Duration,
    /// Value of the `X-Packet-Client` header
    pub client_id: String,
    /// ACTIVE sessions idle longer than this are reported as stale
    pub stale_session_timeout: Duration,
    /// How often the stale monitor polls
    pub stale_check_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `PACKETFLOW_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `PACKETFLOW_DEFAULT_PACKET_SIZE` (default: 10)
    /// - `PACKETFLOW_RECORD_MAX_RETRIES` (default: 3)
    /// - `PACKETFLOW_HTTP_CONNECT_TIMEOUT_MS` (default: 5000)
    /// - `PACKETFLOW_HTTP_READ_TIMEOUT_MS` (default: 30000)
    /// - `PACKETFLOW_FETCH_MAX_ATTEMPTS` (default: 5)
    /// - `PACKETFLOW_FETCH_INITIAL_DELAY_MS` (default: 500)
    /// - `PACKETFLOW_FETCH_BACKOFF_MULTIPLIER` (default: 1.5)
    /// - `PACKETFLOW_FETCH_MAX_DELAY_MS` (default: 5000)
    /// - `PACKETFLOW_CLIENT_ID` (default: `packetflow`)
    /// - `PACKETFLOW_STALE_SESSION_TIMEOUT_SECS` (default: 600)
    /// - `PACKETFLOW_STALE_CHECK_INTERVAL_SECS` (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("PACKETFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("PACKETFLOW_DATABASE_URL"))?;

        let default_packet_size: u32 = parse_var(
            "PACKETFLOW_DEFAULT_PACKET_SIZE",
            "10",
            "must be a positive integer",
        )?;
        if default_packet_size == 0 {
            return Err(ConfigError::Invalid(
                "PACKETFLOW_DEFAULT_PACKET_SIZE",
                "must be a positive integer",
            ));
        }

        let record_max_retries: u32 = parse_var(
            "PACKETFLOW_RECORD_MAX_RETRIES",
            "3",
            "must be a non-negative integer",
        )?;

        let http_connect_timeout_ms: u64 = parse_var(
            "PACKETFLOW_HTTP_CONNECT_TIMEOUT_MS",
            "5000",
            "must be a duration in milliseconds",
        )?;
        let http_read_timeout_ms: u64 = parse_var(
            "PACKETFLOW_HTTP_READ_TIMEOUT_MS",
            "30000",
            "must be a duration in milliseconds",
        )?;

        let fetch_max_attempts: u32 = parse_var(
            "PACKETFLOW_FETCH_MAX_ATTEMPTS",
            "5",
            "must be a positive integer",
        )?;
        if fetch_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "PACKETFLOW_FETCH_MAX_ATTEMPTS",
                "must be a positive integer",
            ));
        }
        let fetch_initial_delay_ms: u64 = parse_var(
            "PACKETFLOW_FETCH_INITIAL_DELAY_MS",
            "500",
            "must be a duration in milliseconds",
        )?;
        let fetch_backoff_multiplier: f64 = parse_var(
            "PACKETFLOW_FETCH_BACKOFF_MULTIPLIER",
            "1.5",
            "must be a number >= 1.0",
        )?;
        if !fetch_backoff_multiplier.is_finite() || fetch_backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "PACKETFLOW_FETCH_BACKOFF_MULTIPLIER",
                "must be a number >= 1.0",
            ));
        }
        let fetch_max_delay_ms: u64 = parse_var(
            "PACKETFLOW_FETCH_MAX_DELAY_MS",
            "5000",
            "must be a duration in milliseconds",
        )?;

        let client_id =
            std::env::var("PACKETFLOW_CLIENT_ID").unwrap_or_else(|_| "packetflow".to_string());

        let stale_session_timeout_secs: u64 = parse_var(
            "PACKETFLOW_STALE_SESSION_TIMEOUT_SECS",
            "600",
            "must be a duration in seconds",
        )?;
        let stale_check_interval_secs: u64 = parse_var(
            "PACKETFLOW_STALE_CHECK_INTERVAL_SECS",
            "60",
            "must be a positive duration in seconds",
        )?;
        if stale_check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "PACKETFLOW_STALE_CHECK_INTERVAL_SECS",
                "must be a positive duration in seconds",
            ));
        }

        Ok(Self {
            database_url,
            default_packet_size,
            record_max_retries,
            http_connect_timeout: Duration::from_millis(http_connect_timeout_ms),
            http_read_timeout: Duration::from_millis(http_read_timeout_ms),
            fetch_max_attempts,
            fetch_initial_delay: Duration::from_millis(fetch_initial_delay_ms),
            fetch_backoff_multiplier,
            fetch_max_delay: Duration::from_millis(fetch_max_delay_ms),
            client_id,
            stale_session_timeout: Duration::from_secs(stale_session_timeout_secs),
            stale_check_interval: Duration::from_secs(stale_check_interval_secs),
        })
    }

    /// Pagination client settings derived from this configuration.
    pub fn pagination_client_config(&self) -> PaginationClientConfig {
        PaginationClientConfig {
            connect_timeout: self.http_connect_timeout,
            request_timeout: self.http_read_timeout,
            retry: RetryPolicy::new(
                self.fetch_max_attempts,
                self.fetch_initial_delay,
                self.fetch_backoff_multiplier,
                self.fetch_max_delay,
            ),
            client_id: self.client_id.clone(),
        }
    }

    /// Stale monitor settings derived from this configuration.
    pub fn stale_monitor_config(&self) -> StaleMonitorConfig {
        StaleMonitorConfig {
            poll_interval: self.stale_check_interval,
            stale_timeout: self.stale_session_timeout,
        }
    }
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, reason))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OPTIONAL_VARS: [&str; 11] = [
        "PACKETFLOW_DEFAULT_PACKET_SIZE",
        "PACKETFLOW_RECORD_MAX_RETRIES",
        "PACKETFLOW_HTTP_CONNECT_TIMEOUT_MS",
        "PACKETFLOW_HTTP_READ_TIMEOUT_MS",
        "PACKETFLOW_FETCH_MAX_ATTEMPTS",
        "PACKETFLOW_FETCH_INITIAL_DELAY_MS",
        "PACKETFLOW_FETCH_BACKOFF_MULTIPLIER",
        "PACKETFLOW_FETCH_MAX_DELAY_MS",
        "PACKETFLOW_CLIENT_ID",
        "PACKETFLOW_STALE_SESSION_TIMEOUT_SECS",
        "PACKETFLOW_STALE_CHECK_INTERVAL_SECS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_optional(&mut self) {
            for key in OPTIONAL_VARS {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("PACKETFLOW_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.default_packet_size, 10);
        assert_eq!(config.record_max_retries, 3);
        assert_eq!(config.http_connect_timeout, Duration::from_millis(5000));
        assert_eq!(config.http_read_timeout, Duration::from_millis(30000));
        assert_eq!(config.fetch_max_attempts, 5);
        assert_eq!(config.fetch_initial_delay, Duration::from_millis(500));
        assert_eq!(config.fetch_backoff_multiplier, 1.5);
        assert_eq!(config.fetch_max_delay, Duration::from_millis(5000));
        assert_eq!(config.client_id, "packetflow");
        assert_eq!(config.stale_session_timeout, Duration::from_secs(600));
        assert_eq!(config.stale_check_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("PACKETFLOW_DATABASE_URL", "sqlite:test.db");
        guard.set("PACKETFLOW_DEFAULT_PACKET_SIZE", "50");
        guard.set("PACKETFLOW_RECORD_MAX_RETRIES", "7");
        guard.set("PACKETFLOW_HTTP_CONNECT_TIMEOUT_MS", "1000");
        guard.set("PACKETFLOW_HTTP_READ_TIMEOUT_MS", "2000");
        guard.set("PACKETFLOW_FETCH_MAX_ATTEMPTS", "2");
        guard.set("PACKETFLOW_FETCH_INITIAL_DELAY_MS", "100");
        guard.set("PACKETFLOW_FETCH_BACKOFF_MULTIPLIER", "2.0");
        guard.set("PACKETFLOW_FETCH_MAX_DELAY_MS", "400");
        guard.set("PACKETFLOW_CLIENT_ID", "ingest-7");
        guard.set("PACKETFLOW_STALE_SESSION_TIMEOUT_SECS", "30");
        guard.set("PACKETFLOW_STALE_CHECK_INTERVAL_SECS", "5");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite:test.db");
        assert_eq!(config.default_packet_size, 50);
        assert_eq!(config.record_max_retries, 7);

        let client = config.pagination_client_config();
        assert_eq!(client.connect_timeout, Duration::from_millis(1000));
        assert_eq!(client.request_timeout, Duration::from_millis(2000));
        assert_eq!(client.client_id, "ingest-7");
        assert_eq!(
            client.retry,
            RetryPolicy::new(
                2,
                Duration::from_millis(100),
                2.0,
                Duration::from_millis(400)
            )
        );

        let monitor = config.stale_monitor_config();
        assert_eq!(monitor.stale_timeout, Duration::from_secs(30));
        assert_eq!(monitor.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("PACKETFLOW_DATABASE_URL");

        let result = Config::from_env();
        assert!(result.is_err());

        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::Missing("PACKETFLOW_DATABASE_URL")));
        assert!(err.to_string().contains("PACKETFLOW_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_packet_size() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("PACKETFLOW_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();
        guard.set("PACKETFLOW_DEFAULT_PACKET_SIZE", "abc");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("PACKETFLOW_DEFAULT_PACKET_SIZE", _)
        ));
    }

    #[test]
    fn test_config_zero_packet_size_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("PACKETFLOW_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();
        guard.set("PACKETFLOW_DEFAULT_PACKET_SIZE", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("PACKETFLOW_DEFAULT_PACKET_SIZE", _)
        ));
    }

    #[test]
    fn test_config_negative_retries_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("PACKETFLOW_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();
        guard.set("PACKETFLOW_RECORD_MAX_RETRIES", "-1");

        let result = Config::from_env();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_multiplier_below_one_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("PACKETFLOW_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();
        guard.set("PACKETFLOW_FETCH_BACKOFF_MULTIPLIER", "0.5");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("PACKETFLOW_FETCH_BACKOFF_MULTIPLIER", _)
        ));
    }

    #[test]
    fn test_config_zero_attempts_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("PACKETFLOW_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();
        guard.set("PACKETFLOW_FETCH_MAX_ATTEMPTS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("PACKETFLOW_FETCH_MAX_ATTEMPTS", _)
        ));
    }

    #[test]
    fn test_config_zero_stale_check_interval_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("PACKETFLOW_DATABASE_URL", "postgres://localhost/test");
        guard.clear_optional();
        guard.set("PACKETFLOW_STALE_CHECK_INTERVAL_SECS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("PACKETFLOW_STALE_CHECK_INTERVAL_SECS", _)
        ));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
