//! Configuration management for the box office.
//!
//! Loads configuration from environment variables with sensible defaults.
//! A value that is present but does not parse falls back to its default.

use crate::payment::SagaSettings;
use crate::queue::AdmissionSettings;
use box_office_runtime::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// `PostgreSQL` configuration
    pub database: DatabaseConfig,
    /// Seat lock configuration
    pub seat_lock: SeatLockConfig,
    /// Waiting-queue configuration
    pub waiting_queue: WaitingQueueConfig,
    /// Payment saga configuration
    pub payment: PaymentConfig,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
}

/// `PostgreSQL` configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL; `None` runs on the in-memory store
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Connection attempts at startup
    pub connect_attempts: u32,
}

/// Seat lock configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatLockConfig {
    /// Lock lifetime in minutes (default: 10)
    pub ttl_minutes: u32,
    /// Expired-lock reaper interval in seconds
    pub reaper_interval: u64,
}

/// Waiting-queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingQueueConfig {
    /// Time an admitted user has to enter, in seconds (default: 300)
    pub admission_window: u64,
    /// Users admitted per batch
    pub batch_size: u32,
    /// Seconds between admission batches
    pub admission_interval: u64,
    /// Stale-admission reaper interval in seconds
    pub reaper_interval: u64,
}

/// Payment saga configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Gateway attempts per payment (default: 5)
    pub max_attempts: u32,
    /// Backoff after the first failed attempt, in milliseconds
    pub initial_backoff_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Backoff cap, in milliseconds
    pub max_backoff_ms: u64,
    /// Pause between status polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Polls before an in-progress attempt counts as failed
    pub max_polls_per_attempt: u32,
    /// Time `cancel_payment` waits for the driver to stop, in milliseconds
    pub cancel_timeout_ms: u64,
    /// Success rate of the simulated gateway (0.0 - 1.0)
    pub simulated_success_rate: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let ttl_minutes = parsed(&lookup, "SEAT_LOCK_TTL_MINUTES", 10_u32);
        let batch_size = parsed(&lookup, "QUEUE_BATCH_SIZE", 100_u32);
        let max_attempts = parsed(&lookup, "PAYMENT_MAX_ATTEMPTS", 5_u32);
        let success_rate = parsed(&lookup, "PAYMENT_SIMULATED_SUCCESS_RATE", 0.8_f64);

        Self {
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
                max_connections: parsed(&lookup, "DATABASE_MAX_CONNECTIONS", 10),
                connect_timeout: parsed(&lookup, "DATABASE_CONNECT_TIMEOUT", 30),
                connect_attempts: parsed(&lookup, "DATABASE_CONNECT_ATTEMPTS", 5),
            },
            seat_lock: SeatLockConfig {
                ttl_minutes: if ttl_minutes == 0 { 10 } else { ttl_minutes },
                reaper_interval: parsed(&lookup, "SEAT_LOCK_REAPER_INTERVAL", 30),
            },
            waiting_queue: WaitingQueueConfig {
                admission_window: parsed(&lookup, "QUEUE_ADMISSION_WINDOW", 300),
                batch_size: if batch_size == 0 { 100 } else { batch_size },
                admission_interval: parsed(&lookup, "QUEUE_ADMISSION_INTERVAL", 10),
                reaper_interval: parsed(&lookup, "QUEUE_REAPER_INTERVAL", 30),
            },
            payment: PaymentConfig {
                max_attempts: if max_attempts == 0 { 5 } else { max_attempts },
                initial_backoff_ms: parsed(&lookup, "PAYMENT_INITIAL_BACKOFF_MS", 1_000),
                backoff_multiplier: parsed(&lookup, "PAYMENT_BACKOFF_MULTIPLIER", 2.0),
                max_backoff_ms: parsed(&lookup, "PAYMENT_MAX_BACKOFF_MS", 30_000),
                poll_interval_ms: parsed(&lookup, "PAYMENT_POLL_INTERVAL_MS", 2_000),
                max_polls_per_attempt: parsed(&lookup, "PAYMENT_MAX_POLLS_PER_ATTEMPT", 10),
                cancel_timeout_ms: parsed(&lookup, "PAYMENT_CANCEL_TIMEOUT_MS", 5_000),
                simulated_success_rate: if (0.0..=1.0).contains(&success_rate) {
                    success_rate
                } else {
                    0.8
                },
            },
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info,ticketing=debug".to_string()),
            shutdown_timeout: parsed(&lookup, "SHUTDOWN_TIMEOUT", 30),
        }
    }

    /// Graceful shutdown timeout.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

impl SeatLockConfig {
    /// Expired-lock reaper interval.
    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval)
    }
}

impl WaitingQueueConfig {
    /// Admission controller settings.
    #[must_use]
    pub fn admission_settings(&self) -> AdmissionSettings {
        AdmissionSettings {
            admission_window: chrono::Duration::seconds(i64::try_from(self.admission_window).unwrap_or(300)),
            default_batch_size: self.batch_size,
            admission_interval: Duration::from_secs(self.admission_interval),
        }
    }

    /// Stale-admission reaper interval.
    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval)
    }
}

impl PaymentConfig {
    /// Retry policy for gateway attempts.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .initial_delay(Duration::from_millis(self.initial_backoff_ms))
            .multiplier(self.backoff_multiplier)
            .max_delay(Duration::from_millis(self.max_backoff_ms))
            .build()
    }

    /// Saga settings.
    #[must_use]
    pub fn saga_settings(&self) -> SagaSettings {
        SagaSettings {
            retry: self.retry_policy(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_polls_per_attempt: self.max_polls_per_attempt,
            cancel_timeout: Duration::from_millis(self.cancel_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.database.url, None);
        assert_eq!(config.seat_lock.ttl_minutes, 10);
        assert_eq!(config.waiting_queue.admission_window, 300);
        assert_eq!(config.payment.max_attempts, 5);
        assert_eq!(config.payment.retry_policy().max_attempts, 5);
        assert_eq!(
            config.waiting_queue.admission_settings().admission_window,
            chrono::Duration::minutes(5)
        );
    }

    #[test]
    fn values_are_read_from_lookup() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/box_office"),
            ("SEAT_LOCK_TTL_MINUTES", "15"),
            ("PAYMENT_POLL_INTERVAL_MS", "250"),
        ]));
        assert_eq!(config.database.url.as_deref(), Some("postgres://db/box_office"));
        assert_eq!(config.seat_lock.ttl_minutes, 15);
        assert_eq!(config.payment.saga_settings().poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("SEAT_LOCK_TTL_MINUTES", "0"),
            ("QUEUE_BATCH_SIZE", "lots"),
            ("PAYMENT_MAX_ATTEMPTS", "-3"),
            ("PAYMENT_SIMULATED_SUCCESS_RATE", "1.5"),
        ]));
        assert_eq!(config.seat_lock.ttl_minutes, 10);
        assert_eq!(config.waiting_queue.batch_size, 100);
        assert_eq!(config.payment.max_attempts, 5);
        assert!((config.payment.simulated_success_rate - 0.8).abs() < f64::EPSILON);
    }
}
