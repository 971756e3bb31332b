// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Soma configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Connection acquire and busy timeout
    pub database_timeout: Duration,
    /// Size of the shared read pool
    pub database_max_connections: u32,
    /// Default depth of handler input channels
    pub queue_length: usize,
    /// Load repositories but never process mutations
    pub observer: bool,
    /// Only start the TreeKeeper for this repository
    pub observer_repo: Option<String>,
    /// Do not register write handlers
    pub read_only: bool,
    /// Directory for rolling log files
    pub log_path: Option<PathBuf>,
    /// Grace period between the shutdown request and teardown
    pub shutdown_delay: Duration,
    /// Log leftover action and error stream contents after startup load
    pub print_channels: bool,
    /// Datacenter used when neither the server nor the datacenter table provides one
    pub default_datacenter: Option<String>,
    /// JobBlock timers
    pub job_block: JobBlockConfig,
    /// How often the lifecycle sweeper runs
    pub lifecycle_interval: Duration,
    /// Grace period a stopping TreeKeeper gets to drain in-flight work
    pub stop_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            database_timeout: Duration::from_secs(5),
            database_max_connections: 10,
            queue_length: 1024,
            observer: false,
            observer_repo: None,
            read_only: false,
            log_path: None,
            shutdown_delay: Duration::from_secs(5),
            print_channels: false,
            default_datacenter: None,
            job_block: JobBlockConfig::default(),
            lifecycle_interval: Duration::from_secs(30),
            stop_grace: Duration::from_millis(500),
        }
    }
}

/// Timers of the job rendezvous.
#[derive(Debug, Clone)]
pub struct JobBlockConfig {
    /// How often expired entries are swept.
    pub tick: Duration,
    /// How long a finished job id is remembered.
    pub done_ttl: Duration,
    /// How long a waiter may block before it is disconnected.
    pub wait_timeout: Duration,
}

impl Default for JobBlockConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            done_ttl: Duration::from_secs(2 * 3600),
            wait_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `SOMA_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `SOMA_DATABASE_TIMEOUT`: seconds (default: 5)
    /// - `SOMA_DATABASE_MAX_CONNECTIONS`: read pool size (default: 10)
    /// - `SOMA_QUEUE_LENGTH`: handler channel depth (default: 1024)
    /// - `SOMA_OBSERVER`: observer mode (default: false)
    /// - `SOMA_OBSERVER_REPO`: only load this repository
    /// - `SOMA_READ_ONLY`: skip write handlers (default: false)
    /// - `SOMA_LOG_PATH`: log directory
    /// - `SOMA_SHUTDOWN_DELAY`: seconds (default: 5)
    /// - `SOMA_PRINT_CHANNELS`: dump stream leftovers after load (default: false)
    /// - `SOMA_DEFAULT_DATACENTER`: datacenter fallback
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("SOMA_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("SOMA_DATABASE_URL"))?;

        let database_timeout: u64 = std::env::var("SOMA_DATABASE_TIMEOUT")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("SOMA_DATABASE_TIMEOUT", "must be a number of seconds")
            })?;

        let database_max_connections: u32 = std::env::var("SOMA_DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("SOMA_DATABASE_MAX_CONNECTIONS", "must be a positive integer")
            })?;

        let queue_length: usize = std::env::var("SOMA_QUEUE_LENGTH")
            .unwrap_or_else(|_| "1024".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "SOMA_QUEUE_LENGTH",
                "must be a positive integer",
            ))?;

        let shutdown_delay: u64 = std::env::var("SOMA_SHUTDOWN_DELAY")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("SOMA_SHUTDOWN_DELAY", "must be a number of seconds")
            })?;

        Ok(Self {
            database_url,
            database_timeout: Duration::from_secs(database_timeout),
            database_max_connections,
            queue_length,
            observer: flag("SOMA_OBSERVER")?,
            observer_repo: optional("SOMA_OBSERVER_REPO"),
            read_only: flag("SOMA_READ_ONLY")?,
            log_path: optional("SOMA_LOG_PATH").map(PathBuf::from),
            shutdown_delay: Duration::from_secs(shutdown_delay),
            print_channels: flag("SOMA_PRINT_CHANNELS")?,
            default_datacenter: optional("SOMA_DEFAULT_DATACENTER"),
            ..Self::default()
        })
    }
}

fn flag(key: &'static str) -> Result<bool, ConfigError> {
    match std::env::var(key).as_deref() {
        Err(_) | Ok("") | Ok("0") | Ok("false") => Ok(false),
        Ok("1") | Ok("true") => Ok(true),
        Ok(_) => Err(ConfigError::Invalid(key, "must be true, false, 1 or 0")),
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
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

    const ALL_KEYS: &[&str] = &[
        "SOMA_DATABASE_URL",
        "SOMA_DATABASE_TIMEOUT",
        "SOMA_DATABASE_MAX_CONNECTIONS",
        "SOMA_QUEUE_LENGTH",
        "SOMA_OBSERVER",
        "SOMA_OBSERVER_REPO",
        "SOMA_READ_ONLY",
        "SOMA_LOG_PATH",
        "SOMA_SHUTDOWN_DELAY",
        "SOMA_PRINT_CHANNELS",
        "SOMA_DEFAULT_DATACENTER",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in ALL_KEYS {
                guard.remove(key);
            }
            guard
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
        guard.set("SOMA_DATABASE_URL", "sqlite:soma.db");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite:soma.db");
        assert_eq!(config.database_timeout, Duration::from_secs(5));
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.queue_length, 1024);
        assert!(!config.observer);
        assert!(config.observer_repo.is_none());
        assert!(!config.read_only);
        assert!(config.log_path.is_none());
        assert_eq!(config.shutdown_delay, Duration::from_secs(5));
        assert_eq!(config.job_block.wait_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_config_from_env_with_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("SOMA_DATABASE_URL", "sqlite:soma.db");
        guard.set("SOMA_QUEUE_LENGTH", "16");
        guard.set("SOMA_OBSERVER", "true");
        guard.set("SOMA_OBSERVER_REPO", "alpha");
        guard.set("SOMA_READ_ONLY", "1");
        guard.set("SOMA_LOG_PATH", "/var/log/soma");
        guard.set("SOMA_DEFAULT_DATACENTER", "dc1");

        let config = Config::from_env().unwrap();

        assert_eq!(config.queue_length, 16);
        assert!(config.observer);
        assert_eq!(config.observer_repo.as_deref(), Some("alpha"));
        assert!(config.read_only);
        assert_eq!(config.log_path, Some(PathBuf::from("/var/log/soma")));
        assert_eq!(config.default_datacenter.as_deref(), Some("dc1"));
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::new();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SOMA_DATABASE_URL")));
    }

    #[test]
    fn test_config_rejects_zero_queue_length() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("SOMA_DATABASE_URL", "sqlite:soma.db");
        guard.set("SOMA_QUEUE_LENGTH", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("SOMA_QUEUE_LENGTH", _)));
    }

    #[test]
    fn test_config_rejects_bad_flag() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("SOMA_DATABASE_URL", "sqlite:soma.db");
        guard.set("SOMA_OBSERVER", "maybe");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("SOMA_OBSERVER", _)));
    }
}
