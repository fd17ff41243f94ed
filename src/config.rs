//! Immutable configuration threaded into each subsystem at construction,
//! rather than read from module-global singletons.

use anyhow::{Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ThresholdConfig {
    pub hot: f64,
    pub hot_critical: f64,
    pub cold: f64,
    pub cold_critical: f64,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database_url: String,
    pub pool_min_connections: u32,
    pub pool_max_connections: u32,

    pub chunk_interval: Duration,
    pub lateness_horizon: Duration,
    pub closure_horizon: Duration,

    pub rapid_change_k: f64,
    pub rapid_change_k_critical: f64,
    pub hysteresis_minutes: i64,
    pub sustained_minutes: i64,

    pub dispatch_parallelism: usize,
    pub dispatch_retry: RetryConfig,
    pub sms_gateway_base_url: String,

    pub ingest_rate_mean_hz: f64,
    pub ingest_rate_burst: u32,

    pub eval_deadline: Duration,
    pub log_filter: String,
}

impl CoreConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("CORE_DATABASE_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .context("CORE_DATABASE_URL must be set")?;

        Ok(Self {
            database_url,
            pool_min_connections: env_u32("CORE_POOL_MIN_CONNECTIONS", 2),
            pool_max_connections: env_u32("CORE_POOL_MAX_CONNECTIONS", 10),

            chunk_interval: Duration::from_secs(env_u64("CORE_CHUNK_INTERVAL_SECONDS", 7 * 24 * 3600)),
            lateness_horizon: Duration::from_secs(env_u64("CORE_LATENESS_HORIZON_SECONDS", 24 * 3600)),
            closure_horizon: Duration::from_secs(env_u64("CORE_CLOSURE_HORIZON_SECONDS", 30 * 24 * 3600)),

            rapid_change_k: env_f64("CORE_RAPID_CHANGE_K", 3.0),
            rapid_change_k_critical: env_f64("CORE_RAPID_CHANGE_K_CRITICAL", 5.0),
            hysteresis_minutes: env_i64("CORE_HYSTERESIS_MINUTES", 10),
            sustained_minutes: env_i64("CORE_SUSTAINED_MINUTES", 5),

            dispatch_parallelism: env_u32("CORE_DISPATCH_PARALLELISM", 5) as usize,
            dispatch_retry: RetryConfig {
                base: Duration::from_millis(env_u64("CORE_DISPATCH_RETRY_BASE_MS", 2_000)),
                factor: env_f64("CORE_DISPATCH_RETRY_FACTOR", 2.0),
                jitter: env_f64("CORE_DISPATCH_RETRY_JITTER", 0.2),
                max_attempts: env_u32("CORE_DISPATCH_RETRY_MAX_ATTEMPTS", 5),
            },
            sms_gateway_base_url: env_string(
                "CORE_SMS_GATEWAY_BASE_URL",
                "http://127.0.0.1:8089/sms",
            ),

            ingest_rate_mean_hz: env_f64("CORE_INGEST_RATE_MEAN_HZ", 1.0),
            ingest_rate_burst: env_u32("CORE_INGEST_RATE_BURST", 10),

            eval_deadline: Duration::from_millis(env_u64("CORE_EVAL_DEADLINE_MS", 2_000)),
            log_filter: env_string("CORE_LOG_FILTER", "info"),
        })
    }

    pub fn threshold_for(&self, hot: f64, hot_critical: f64, cold: f64, cold_critical: f64) -> ThresholdConfig {
        ThresholdConfig {
            hot,
            hot_critical,
            cold,
            cold_critical,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_f64_falls_back_on_missing_or_invalid() {
        std::env::remove_var("CORE_TEST_F64");
        assert_eq!(env_f64("CORE_TEST_F64", 3.5), 3.5);
    }
}
