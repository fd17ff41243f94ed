//! Pool construction: lazy connect so startup never blocks on the
//! database being reachable.

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;

use crate::config::CoreConfig;

pub fn connect_lazy(config: &CoreConfig) -> Result<PgPool, sqlx::Error> {
    let opts = PgConnectOptions::from_str(&config.database_url)?;
    Ok(PgPoolOptions::new()
        .min_connections(config.pool_min_connections)
        .max_connections(config.pool_max_connections)
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy_with(opts))
}
