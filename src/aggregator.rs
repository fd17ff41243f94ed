//! AggregatorEngine (C4): hourly/daily rolling statistics, idempotent
//! under replay, tolerant of late points.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use dashmap::DashSet;
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::AggregatorError;
use crate::model::{DailyAggregate, HourlyAggregate, Observation};
use crate::time_store::TimeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub sensor_id: i64,
    pub bucket_start_unix: i64,
}

/// Welford's running mean/variance, applied per bucket rather than to a
/// single rolling window so hourly and daily statistics stay independent
/// and recomputable.
#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    count: i64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Moments {
    fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
    }

    fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }
}

pub struct AggregatorEngine {
    pool: PgPool,
    time_store: Arc<TimeStore>,
    dirty_hourly: DashSet<BucketKey>,
    dirty_daily: DashSet<BucketKey>,
}

impl AggregatorEngine {
    pub fn new(pool: PgPool, time_store: Arc<TimeStore>) -> Self {
        Self {
            pool,
            time_store,
            dirty_hourly: DashSet::new(),
            dirty_daily: DashSet::new(),
        }
    }

    /// Online update for a newly accepted, on-time observation.
    pub async fn feed(&self, obs: &Observation) -> Result<(), AggregatorError> {
        let hour_start = floor_to_hour(obs.ts);
        self.upsert_hourly_incremental(obs.sensor_id, hour_start, obs.value)
            .await?;
        let day_start = floor_to_day(obs.ts);
        self.upsert_daily_incremental(obs.sensor_id, day_start, obs.value, obs.ts)
            .await?;
        Ok(())
    }

    /// A late point schedules both the hourly and daily buckets it falls
    /// into for a full-rescan recompute instead of an incremental update,
    /// since Welford's running state cannot cheaply absorb an
    /// out-of-order sample.
    pub fn mark_dirty(&self, sensor_id: i64, ts: DateTime<Utc>) {
        self.dirty_hourly.insert(BucketKey {
            sensor_id,
            bucket_start_unix: floor_to_hour(ts).timestamp(),
        });
        self.dirty_daily.insert(BucketKey {
            sensor_id,
            bucket_start_unix: floor_to_day(ts).timestamp(),
        });
    }

    async fn upsert_hourly_incremental(
        &self,
        sensor_id: i64,
        bucket_start: DateTime<Utc>,
        value: f64,
    ) -> Result<(), AggregatorError> {
        let existing = sqlx::query_as::<_, HourlyAggregate>(
            "SELECT sensor_id, bucket_start, count, mean, variance, min, max, closed \
             FROM hourly_aggregates WHERE sensor_id = $1 AND bucket_start = $2",
        )
        .bind(sensor_id)
        .bind(bucket_start)
        .fetch_optional(&self.pool)
        .await?;

        let mut moments = Moments::default();
        if let Some(row) = &existing {
            moments.count = row.count;
            moments.mean = row.mean;
            moments.m2 = row.variance * row.count as f64;
            moments.min = row.min;
            moments.max = row.max;
        }
        moments.update(value);

        sqlx::query(
            "INSERT INTO hourly_aggregates (sensor_id, bucket_start, count, mean, variance, min, max, closed) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, false) \
             ON CONFLICT (sensor_id, bucket_start) DO UPDATE SET \
             count = EXCLUDED.count, mean = EXCLUDED.mean, variance = EXCLUDED.variance, \
             min = EXCLUDED.min, max = EXCLUDED.max, closed = false",
        )
        .bind(sensor_id)
        .bind(bucket_start)
        .bind(moments.count)
        .bind(moments.mean)
        .bind(moments.variance())
        .bind(moments.min)
        .bind(moments.max)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_daily_incremental(
        &self,
        sensor_id: i64,
        bucket_start: DateTime<Utc>,
        value: f64,
        ts: DateTime<Utc>,
    ) -> Result<(), AggregatorError> {
        let existing = sqlx::query_as::<_, DailyAggregate>(
            "SELECT sensor_id, bucket_start, count, mean, variance, min, max, min_at, max_at, \
             hours_over_threshold, closed FROM daily_aggregates WHERE sensor_id = $1 AND bucket_start = $2",
        )
        .bind(sensor_id)
        .bind(bucket_start)
        .fetch_optional(&self.pool)
        .await?;

        let mut moments = Moments::default();
        let (mut min_at, mut max_at) = (None, None);
        if let Some(row) = &existing {
            moments.count = row.count;
            moments.mean = row.mean;
            moments.m2 = row.variance * row.count as f64;
            moments.min = row.min;
            moments.max = row.max;
            min_at = row.min_at;
            max_at = row.max_at;
        }
        let prev_min = moments.min;
        let prev_max = moments.max;
        moments.update(value);
        // Ties keep the earliest sample; since samples feed in
        // timestamp order this means only strictly-better values replace
        // the recorded instant.
        if moments.count == 1 || value < prev_min {
            min_at = Some(ts);
        }
        if moments.count == 1 || value > prev_max {
            max_at = Some(ts);
        }

        let day_end = bucket_start + ChronoDuration::days(1);
        let hours_over = self.hours_over_threshold(sensor_id, bucket_start, day_end).await?;

        sqlx::query(
            "INSERT INTO daily_aggregates \
             (sensor_id, bucket_start, count, mean, variance, min, max, min_at, max_at, hours_over_threshold, closed) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, false) \
             ON CONFLICT (sensor_id, bucket_start) DO UPDATE SET \
             count = EXCLUDED.count, mean = EXCLUDED.mean, variance = EXCLUDED.variance, \
             min = EXCLUDED.min, max = EXCLUDED.max, min_at = EXCLUDED.min_at, max_at = EXCLUDED.max_at, \
             hours_over_threshold = EXCLUDED.hours_over_threshold, closed = false",
        )
        .bind(sensor_id)
        .bind(bucket_start)
        .bind(moments.count)
        .bind(moments.mean)
        .bind(moments.variance())
        .bind(moments.min)
        .bind(moments.max)
        .bind(min_at)
        .bind(max_at)
        .bind(hours_over)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The sensor's configured upper limit used to count "threshold
    /// hours"; reuses `range_max`, the same per-sensor bound ingest
    /// already validates observations against.
    async fn sensor_threshold_limit(&self, sensor_id: i64) -> Result<Option<f64>, AggregatorError> {
        let limit = sqlx::query_scalar::<_, f64>("SELECT range_max FROM sensors WHERE id = $1")
            .bind(sensor_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(limit)
    }

    /// Counts distinct UTC hours in `[day_start, day_end)` whose
    /// already-maintained hourly max exceeds the sensor's configured
    /// limit. Depends on `hourly_aggregates` being up to date for the
    /// day, so callers recompute the hourly buckets first.
    async fn hours_over_threshold(
        &self,
        sensor_id: i64,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<i32, AggregatorError> {
        let Some(limit) = self.sensor_threshold_limit(sensor_id).await? else {
            return Ok(0);
        };
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM hourly_aggregates \
             WHERE sensor_id = $1 AND bucket_start >= $2 AND bucket_start < $3 AND max > $4",
        )
        .bind(sensor_id)
        .bind(day_start)
        .bind(day_end)
        .bind(limit)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as i32)
    }

    pub async fn hourly(
        &self,
        sensor_id: i64,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<Vec<HourlyAggregate>, AggregatorError> {
        let rows = sqlx::query_as::<_, HourlyAggregate>(
            "SELECT sensor_id, bucket_start, count, mean, variance, min, max, closed \
             FROM hourly_aggregates WHERE sensor_id = $1 AND bucket_start >= $2 AND bucket_start <= $3 \
             ORDER BY bucket_start ASC",
        )
        .bind(sensor_id)
        .bind(t0)
        .bind(t1)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Single hourly bucket lookup, used by rapid-change evaluation
    /// against the last closed hour rather than a rolling window.
    pub async fn hourly_bucket(
        &self,
        sensor_id: i64,
        bucket_start: DateTime<Utc>,
    ) -> Result<Option<HourlyAggregate>, AggregatorError> {
        let row = sqlx::query_as::<_, HourlyAggregate>(
            "SELECT sensor_id, bucket_start, count, mean, variance, min, max, closed \
             FROM hourly_aggregates WHERE sensor_id = $1 AND bucket_start = $2",
        )
        .bind(sensor_id)
        .bind(bucket_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn daily(
        &self,
        sensor_id: i64,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<Vec<DailyAggregate>, AggregatorError> {
        let rows = sqlx::query_as::<_, DailyAggregate>(
            "SELECT sensor_id, bucket_start, count, mean, variance, min, max, min_at, max_at, \
             hours_over_threshold, closed FROM daily_aggregates \
             WHERE sensor_id = $1 AND bucket_start >= $2 AND bucket_start <= $3 \
             ORDER BY bucket_start ASC",
        )
        .bind(sensor_id)
        .bind(t0)
        .bind(t1)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Full rescan of a single hour bucket, replacing the row atomically.
    /// Idempotent: re-running against the same raw data yields the same
    /// stored aggregate (round-trip property).
    async fn recompute_bucket(&self, key: BucketKey) -> Result<(), AggregatorError> {
        let bucket_start = Utc
            .timestamp_opt(key.bucket_start_unix, 0)
            .single()
            .expect("bucket_start_unix was derived from a valid DateTime<Utc>");
        let bucket_end = bucket_start + ChronoDuration::hours(1);

        let observations = self
            .time_store
            .bucket_observations(key.sensor_id, bucket_start, bucket_end)
            .await?;

        let mut moments = Moments::default();
        for obs in &observations {
            moments.update(obs.value);
        }

        sqlx::query(
            "INSERT INTO hourly_aggregates (sensor_id, bucket_start, count, mean, variance, min, max, closed) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, false) \
             ON CONFLICT (sensor_id, bucket_start) DO UPDATE SET \
             count = EXCLUDED.count, mean = EXCLUDED.mean, variance = EXCLUDED.variance, \
             min = EXCLUDED.min, max = EXCLUDED.max, closed = false",
        )
        .bind(key.sensor_id)
        .bind(bucket_start)
        .bind(moments.count)
        .bind(moments.mean)
        .bind(moments.variance())
        .bind(moments.min)
        .bind(moments.max)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Full rescan of a single day bucket, mirroring `recompute_bucket`.
    /// Runs after the hourly pass so `hours_over_threshold` is derived
    /// from already-fresh hourly rows.
    async fn recompute_daily_bucket(&self, key: BucketKey) -> Result<(), AggregatorError> {
        let day_start = Utc
            .timestamp_opt(key.bucket_start_unix, 0)
            .single()
            .expect("bucket_start_unix was derived from a valid DateTime<Utc>");
        let day_end = day_start + ChronoDuration::days(1);

        let observations = self
            .time_store
            .bucket_observations(key.sensor_id, day_start, day_end)
            .await?;

        let mut moments = Moments::default();
        let (mut min_at, mut max_at) = (None, None);
        for obs in &observations {
            let prev_min = moments.min;
            let prev_max = moments.max;
            moments.update(obs.value);
            if moments.count == 1 || obs.value < prev_min {
                min_at = Some(obs.ts);
            }
            if moments.count == 1 || obs.value > prev_max {
                max_at = Some(obs.ts);
            }
        }

        let hours_over = self.hours_over_threshold(key.sensor_id, day_start, day_end).await?;

        sqlx::query(
            "INSERT INTO daily_aggregates \
             (sensor_id, bucket_start, count, mean, variance, min, max, min_at, max_at, hours_over_threshold, closed) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, false) \
             ON CONFLICT (sensor_id, bucket_start) DO UPDATE SET \
             count = EXCLUDED.count, mean = EXCLUDED.mean, variance = EXCLUDED.variance, \
             min = EXCLUDED.min, max = EXCLUDED.max, min_at = EXCLUDED.min_at, max_at = EXCLUDED.max_at, \
             hours_over_threshold = EXCLUDED.hours_over_threshold, closed = false",
        )
        .bind(key.sensor_id)
        .bind(day_start)
        .bind(moments.count)
        .bind(moments.mean)
        .bind(moments.variance())
        .bind(moments.min)
        .bind(moments.max)
        .bind(min_at)
        .bind(max_at)
        .bind(hours_over)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Background loop draining the dirty-bucket sets, the same
    /// `tokio::select!` shape the notification dispatcher and ingest
    /// gateway use for their own cancellable loops.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("aggregator recompute loop shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.drain_dirty().await;
                }
            }
        }
    }

    async fn drain_dirty(&self) {
        let hourly_keys: Vec<BucketKey> = self.dirty_hourly.iter().map(|e| *e).collect();
        for key in hourly_keys {
            // Multiple lates against the same bucket coalesce: removing the
            // entry before recompute means a late arriving mid-recompute
            // re-inserts and is picked up on the next tick instead of lost.
            self.dirty_hourly.remove(&key);
            if let Err(err) = self.recompute_bucket(key).await {
                tracing::warn!(sensor_id = key.sensor_id, error = %err, "hourly bucket recompute failed, will retry");
                self.dirty_hourly.insert(key);
            }
        }

        // Runs after the hourly drain above so hours_over_threshold sees
        // fresh hourly rows for the same late point.
        let daily_keys: Vec<BucketKey> = self.dirty_daily.iter().map(|e| *e).collect();
        for key in daily_keys {
            self.dirty_daily.remove(&key);
            if let Err(err) = self.recompute_daily_bucket(key).await {
                tracing::warn!(sensor_id = key.sensor_id, error = %err, "daily bucket recompute failed, will retry");
                self.dirty_daily.insert(key);
            }
        }
    }
}

pub(crate) fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive()
        .and_hms_opt(ts.hour(), 0, 0)
        .expect("valid hour")
        .and_utc()
}

fn floor_to_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_to_hour_is_idempotent_at_boundary() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(floor_to_hour(ts), ts);
    }

    #[test]
    fn floor_to_hour_truncates_minutes() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 10, 45, 30).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(floor_to_hour(ts), expected);
    }

    #[test]
    fn moments_running_mean_matches_batch_mean() {
        let mut m = Moments::default();
        for v in [10.0, 20.0, 30.0, 40.0] {
            m.update(v);
        }
        assert_eq!(m.mean, 25.0);
        assert_eq!(m.min, 10.0);
        assert_eq!(m.max, 40.0);
    }
}
