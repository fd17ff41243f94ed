//! Supervisor binary: builds the connection pool, wires every subsystem
//! through `Core::build`, starts background loops, and waits for a
//! shutdown signal. No HTTP surface; this binary is the background
//! supervisor only.

use sentinel_core::config::CoreConfig;
use sentinel_core::db::connect_lazy;
use sentinel_core::model::{RapidChangeRule, RuleConfig, SensorKind, ThresholdRule};
use sentinel_core::state::Core;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn default_rules(config: &CoreConfig) -> HashMap<SensorKind, RuleConfig> {
    let rapid_change = RapidChangeRule {
        k: config.rapid_change_k,
        k_critical: config.rapid_change_k_critical,
    };
    let mut rules = HashMap::new();
    rules.insert(
        SensorKind::Temperature,
        RuleConfig {
            heat: ThresholdRule {
                bound: 40.0,
                critical_bound: 50.0,
                sustained_minutes: config.sustained_minutes,
            },
            cold: ThresholdRule {
                bound: 0.0,
                critical_bound: -10.0,
                sustained_minutes: config.sustained_minutes,
            },
            rapid_change,
        },
    );
    rules
}

fn recipients_from_env() -> Vec<String> {
    std::env::var("CORE_ALERT_RECIPIENTS")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CoreConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_filter.clone()))
        .init();

    let pool = connect_lazy(&config)?;
    let rules = default_rules(&config);
    let recipients = recipients_from_env();

    let core = Core::build(pool, config, rules, recipients);

    let cancel = CancellationToken::new();
    core.load_and_run(cancel.clone()).await?;

    tracing::info!("sentinel-core supervisor running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, cancelling background loops");
    cancel.cancel();

    Ok(())
}
