//! IngestGateway (C8): validation, per-sensor ordering, rate limiting,
//! fan-out to TimeStore/AggregatorEngine/AlertEvaluator.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::aggregator::{AggregatorEngine, AppendOutcome};
use crate::alert_evaluator::AlertEvaluator;
use crate::config::CoreConfig;
use crate::error::IngestError;
use crate::model::{Observation, Quality, Sensor, SensorState};
use crate::time_store::TimeStore;

/// Token bucket, one per sensor, guarding the ingest rate.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(mean_hz: f64, burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            capacity: burst as f64,
            refill_per_sec: mean_hz,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct SensorGate {
    /// Serializes evaluation per sensor so AlertEvaluator sees a monotonic
    /// stream, distinct from the rate-limiting token bucket below.
    order_lock: AsyncMutex<()>,
    bucket: std::sync::Mutex<TokenBucket>,
}

pub struct IngestOutcome {
    pub accepted: bool,
    pub assigned_timestamp: DateTime<Utc>,
    pub warnings: Vec<String>,
}

pub struct IngestGateway {
    time_store: Arc<TimeStore>,
    aggregator: Arc<AggregatorEngine>,
    evaluator: Arc<AlertEvaluator>,
    gates: DashMap<i64, Arc<SensorGate>>,
    ingest_rate_mean_hz: f64,
    ingest_rate_burst: u32,
    eval_deadline: Duration,
}

impl IngestGateway {
    pub fn new(
        time_store: Arc<TimeStore>,
        aggregator: Arc<AggregatorEngine>,
        evaluator: Arc<AlertEvaluator>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            time_store,
            aggregator,
            evaluator,
            gates: DashMap::new(),
            ingest_rate_mean_hz: config.ingest_rate_mean_hz,
            ingest_rate_burst: config.ingest_rate_burst,
            eval_deadline: config.eval_deadline,
        }
    }

    fn gate_for(&self, sensor_id: i64) -> Arc<SensorGate> {
        self.gates
            .entry(sensor_id)
            .or_insert_with(|| {
                Arc::new(SensorGate {
                    order_lock: AsyncMutex::new(()),
                    bucket: std::sync::Mutex::new(TokenBucket::new(
                        self.ingest_rate_mean_hz,
                        self.ingest_rate_burst,
                    )),
                })
            })
            .clone()
    }

    pub async fn ingest(
        &self,
        sensor: &Sensor,
        ts: Option<DateTime<Utc>>,
        value: f64,
    ) -> Result<IngestOutcome, IngestError> {
        if sensor.state != SensorState::Active {
            return Err(IngestError::UnknownSensor(sensor.id.to_string()));
        }

        let gate = self.gate_for(sensor.id);
        {
            let mut bucket = gate.bucket.lock().expect("token bucket mutex poisoned");
            if !bucket.try_consume() {
                return Err(IngestError::RateLimited);
            }
        }

        let mut quality = Quality::Good;
        if value < sensor.range_min || value > sensor.range_max {
            if sensor.strict_range {
                return Err(IngestError::OutOfRange);
            }
            quality = Quality::Suspect;
        }

        let now = Utc::now();
        let assigned_ts = ts.unwrap_or(now);

        // Per-sensor ordering lock: holds across the write + evaluate so
        // the evaluator observes a monotonic stream per sensor even under
        // concurrent ingest.
        let _order = gate.order_lock.lock().await;

        let outcome = self
            .time_store
            .append(sensor, assigned_ts, value, quality, now)
            .await?;

        let obs = Observation {
            sensor_id: sensor.id,
            ts: assigned_ts,
            value,
            unit: sensor.unit.clone(),
            quality,
            late: matches!(outcome, AppendOutcome::AcceptedLate),
            ambient_temp: None,
            humidity: None,
            battery_level: None,
            signal_strength: None,
            ingested_at: now,
        };

        let mut warnings = Vec::new();

        if matches!(outcome, AppendOutcome::AcceptedLate) {
            self.aggregator.mark_dirty(sensor.id, assigned_ts);
            warnings.push("late arrival scheduled for bucket recompute".to_string());
        } else {
            match tokio::time::timeout(self.eval_deadline, self.aggregator.feed(&obs)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "aggregator feed failed, deferring");
                    warnings.push("EvaluationDeferred: aggregator update deferred".to_string());
                }
                Err(_) => warnings.push("EvaluationDeferred: aggregator feed exceeded deadline".to_string()),
            }
        }

        match tokio::time::timeout(self.eval_deadline, self.evaluator.evaluate(sensor, &obs)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "alert evaluation failed, deferring");
                warnings.push("EvaluationDeferred: alert evaluation deferred".to_string());
            }
            Err(_) => warnings.push("EvaluationDeferred: alert evaluation exceeded deadline".to_string()),
        }

        Ok(IngestOutcome {
            accepted: true,
            assigned_timestamp: assigned_ts,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_exhausts_after_burst() {
        let mut bucket = TokenBucket::new(0.0, 2);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }
}
