//! TimeStore (C1): append-only, time-partitioned observation storage
//!.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use sqlx::PgPool;
use std::collections::HashMap;

use crate::config::CoreConfig;
use crate::error::TimeStoreError;
use crate::model::{Observation, Quality, Sensor, SensorKind};

pub struct TimeStore {
    pool: PgPool,
    lateness_horizon: ChronoDuration,
    closure_horizon: ChronoDuration,
    chunk_interval: ChronoDuration,
}

/// Outcome of an append, distinguishing the on-time/late split C4 needs to
/// decide whether a bucket recompute is owed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted,
    AcceptedLate,
}

impl TimeStore {
    pub fn new(pool: PgPool, config: &CoreConfig) -> Self {
        Self {
            pool,
            lateness_horizon: ChronoDuration::from_std(config.lateness_horizon)
                .unwrap_or(ChronoDuration::hours(24)),
            closure_horizon: ChronoDuration::from_std(config.closure_horizon)
                .unwrap_or(ChronoDuration::days(30)),
            chunk_interval: ChronoDuration::from_std(config.chunk_interval)
                .unwrap_or(ChronoDuration::days(7)),
        }
    }

    /// Resolves the owning chunk's start instant for a timestamp by
    /// flooring to a multiple of `chunk_interval` since the Unix epoch, so
    /// replaying the same observation always resolves the same chunk.
    fn chunk_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        floor_to_chunk(ts, self.chunk_interval)
    }

    /// Validates lateness/closure and writes the observation. The caller
    /// (IngestGateway) is responsible for sensor existence/range checks;
    /// this layer only enforces time-ordering invariants.
    pub async fn append(
        &self,
        sensor: &Sensor,
        ts: DateTime<Utc>,
        value: f64,
        quality: Quality,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, TimeStoreError> {
        let age = now - ts;
        if age > self.closure_horizon {
            return Err(TimeStoreError::StaleAppend);
        }
        // Anything already in the past on arrival is late; lateness_horizon
        // only bounds how far back a late point may still land before
        // closure_horizon rejects it outright.
        let late = age > ChronoDuration::zero();
        debug_assert!(self.lateness_horizon <= self.closure_horizon);

        let chunk_start = self.chunk_start(ts);

        // ON CONFLICT makes replay of the same (sensor, ts, chunk) a
        // no-op rather than a duplicate row.
        sqlx::query(
            "INSERT INTO observations \
             (sensor_id, ts, chunk_start, value, unit, quality, late, ambient_temp, humidity, battery_level, signal_strength, ingested_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, NULL, NULL, NULL, $8) \
             ON CONFLICT (sensor_id, ts, chunk_start) DO NOTHING",
        )
        .bind(sensor.id)
        .bind(ts)
        .bind(chunk_start)
        .bind(value)
        .bind(&sensor.unit)
        .bind(quality)
        .bind(late)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(if late {
            AppendOutcome::AcceptedLate
        } else {
            AppendOutcome::Accepted
        })
    }

    /// Queries raw observations for one or more sensors, optionally
    /// narrowed to a set of sensor kinds; chunks overlapping `[t0,t1]`
    /// are pruned by the `ts` range condition since chunk boundaries
    /// align to it.
    pub async fn range(
        &self,
        sensor_ids: &[i64],
        kinds: &[SensorKind],
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Observation>, TimeStoreError> {
        let rows = sqlx::query_as::<_, Observation>(
            "SELECT o.sensor_id, o.ts, o.value, o.unit, o.quality, o.late, o.ambient_temp, \
             o.humidity, o.battery_level, o.signal_strength, o.ingested_at \
             FROM observations o \
             JOIN sensors s ON s.id = o.sensor_id \
             WHERE o.sensor_id = ANY($1) AND o.ts >= $2 AND o.ts <= $3 \
             AND (array_length($4::text[], 1) IS NULL OR s.kind = ANY($4::text[])) \
             ORDER BY o.ts DESC, o.ingested_at DESC \
             LIMIT $5",
        )
        .bind(sensor_ids)
        .bind(t0)
        .bind(t1)
        .bind(kinds)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn latest(
        &self,
        sensor_ids: &[i64],
        within: ChronoDuration,
        now: DateTime<Utc>,
    ) -> Result<HashMap<i64, Observation>, TimeStoreError> {
        let since = now - within;
        let rows = sqlx::query_as::<_, Observation>(
            "SELECT DISTINCT ON (sensor_id) sensor_id, ts, value, unit, quality, late, \
             ambient_temp, humidity, battery_level, signal_strength, ingested_at \
             FROM observations \
             WHERE sensor_id = ANY($1) AND ts >= $2 \
             ORDER BY sensor_id, ts DESC, ingested_at DESC",
        )
        .bind(sensor_ids)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|o| (o.sensor_id, o)).collect())
    }

    /// Range of raw observations for a single bucket, used by the
    /// aggregator's full-rescan recompute.
    pub async fn bucket_observations(
        &self,
        sensor_id: i64,
        bucket_start: DateTime<Utc>,
        bucket_end: DateTime<Utc>,
    ) -> Result<Vec<Observation>, TimeStoreError> {
        let rows = sqlx::query_as::<_, Observation>(
            "SELECT sensor_id, ts, value, unit, quality, late, ambient_temp, humidity, \
             battery_level, signal_strength, ingested_at \
             FROM observations \
             WHERE sensor_id = $1 AND ts >= $2 AND ts < $3 \
             ORDER BY ts ASC, ingested_at ASC",
        )
        .bind(sensor_id)
        .bind(bucket_start)
        .bind(bucket_end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

fn floor_to_chunk(ts: DateTime<Utc>, interval: ChronoDuration) -> DateTime<Utc> {
    let interval_secs = interval.num_seconds().max(1);
    let floored = ts.timestamp().div_euclid(interval_secs) * interval_secs;
    Utc.timestamp_opt(floored, 0)
        .single()
        .expect("chunk floor stays within a valid Utc instant")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_is_strictly_in_the_past() {
        let now = Utc::now();
        assert!(now - (now - ChronoDuration::seconds(1)) > ChronoDuration::zero());
        assert!(!(now - now > ChronoDuration::zero()));
    }

    #[test]
    fn chunk_start_is_deterministic_and_epoch_aligned() {
        let interval = ChronoDuration::days(7);
        let ts = Utc.with_ymd_and_hms(2026, 3, 5, 12, 30, 0).unwrap();
        let start = floor_to_chunk(ts, interval);
        assert_eq!(floor_to_chunk(start, interval), start);
        assert_eq!(start.timestamp() % interval.num_seconds(), 0);
        assert!(start <= ts && ts < start + interval);
    }
}
