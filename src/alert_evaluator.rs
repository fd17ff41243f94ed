//! AlertEvaluator (C5): threshold rule evaluation, alert dedup/upgrade,
//! shelter selection, notification enqueue. The de-dup/firing/resolve
//! state machine keeps one persisted row per (sensor, rule) and moves it
//! through create-or-update-then-transition, rather than re-deriving state
//! from history on every reading; rule config is a fixed enum rather than a
//! general condition AST since the three canonical rules never vary.
//! Persistence and CAS for alert rows live in StateStore (C9); this module
//! only decides what state transition a reading implies.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::aggregator::{floor_to_hour, AggregatorEngine};
use crate::config::CoreConfig;
use crate::error::AlertError;
use crate::geo_index::{GeoIndex, Point};
use crate::model::{
    Alert, AlertState, Observation, RuleConfig, RuleKind, Sensor, SensorKind, Severity,
};
use crate::notification::NotificationDispatcher;
use crate::state_store::StateStore;

/// Tracks, per (sensor, rule), how long the reading has been below the
/// hysteresis threshold. Kept as a small typed struct rather than a
/// freeform JSON scratch value so the compiler enforces its shape.
#[derive(Debug, Clone, Copy, Default)]
struct HysteresisState {
    below_since: Option<DateTime<Utc>>,
}

pub struct AlertEvaluator {
    state_store: Arc<StateStore>,
    aggregator: Arc<AggregatorEngine>,
    geo: Arc<GeoIndex>,
    dispatcher: Arc<NotificationDispatcher>,
    rules: HashMap<SensorKind, RuleConfig>,
    hysteresis_minutes: i64,
    hysteresis_state: DashMap<(i64, RuleKind), HysteresisState>,
    /// How long a threshold-rule condition has held continuously, gating
    /// `fire` on `ThresholdRule::sustained_minutes` rather than firing on
    /// the first reading past the bound.
    sustain_since: DashMap<(i64, RuleKind), DateTime<Utc>>,
}

pub enum EvaluationOutcome {
    NoChange,
    Opened(Alert),
    Upgraded(Alert),
    Resolved(Alert),
}

impl AlertEvaluator {
    pub fn new(
        state_store: Arc<StateStore>,
        aggregator: Arc<AggregatorEngine>,
        geo: Arc<GeoIndex>,
        dispatcher: Arc<NotificationDispatcher>,
        rules: HashMap<SensorKind, RuleConfig>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            state_store,
            aggregator,
            geo,
            dispatcher,
            rules,
            hysteresis_minutes: config.hysteresis_minutes,
            hysteresis_state: DashMap::new(),
            sustain_since: DashMap::new(),
        }
    }

    pub async fn evaluate(
        &self,
        sensor: &Sensor,
        obs: &Observation,
    ) -> Result<EvaluationOutcome, AlertError> {
        let Some(rule) = self.rules.get(&sensor.kind) else {
            return Ok(EvaluationOutcome::NoChange);
        };

        if let Some((kind, severity, threshold)) = self.trip(rule, obs.value) {
            let other = match kind {
                RuleKind::HeatExtreme => RuleKind::ColdExtreme,
                RuleKind::ColdExtreme => RuleKind::HeatExtreme,
                RuleKind::RapidChange => kind,
            };
            self.sustain_since.remove(&(sensor.id, other));

            let sustained_minutes = match kind {
                RuleKind::HeatExtreme => rule.heat.sustained_minutes,
                RuleKind::ColdExtreme => rule.cold.sustained_minutes,
                RuleKind::RapidChange => 0,
            };
            if self.sustained(sensor.id, kind, obs.ts, sustained_minutes) {
                return self.fire(sensor, kind, severity, obs.value, threshold, obs.ts).await;
            }
            return Ok(EvaluationOutcome::NoChange);
        }
        self.sustain_since.remove(&(sensor.id, RuleKind::HeatExtreme));
        self.sustain_since.remove(&(sensor.id, RuleKind::ColdExtreme));

        if let Some(outcome) = self.evaluate_rapid_change(sensor, obs, rule).await? {
            return Ok(outcome);
        }

        self.maybe_resolve(sensor, obs, rule).await
    }

    /// Checks the critical bound before the plain bound so a single
    /// reading can't be misclassified as non-critical when it also
    /// clears the critical bar.
    fn trip(&self, rule: &RuleConfig, value: f64) -> Option<(RuleKind, Severity, f64)> {
        if value > rule.heat.critical_bound {
            return Some((RuleKind::HeatExtreme, Severity::Critical, rule.heat.bound));
        }
        if value > rule.heat.bound {
            return Some((RuleKind::HeatExtreme, Severity::High, rule.heat.bound));
        }
        if value < rule.cold.critical_bound {
            return Some((RuleKind::ColdExtreme, Severity::Critical, rule.cold.bound));
        }
        if value < rule.cold.bound {
            return Some((RuleKind::ColdExtreme, Severity::High, rule.cold.bound));
        }
        None
    }

    /// Returns whether the condition for `kind` has now held continuously
    /// for at least `duration_minutes`, starting the timer on first sight.
    fn sustained(&self, sensor_id: i64, kind: RuleKind, ts: DateTime<Utc>, duration_minutes: i64) -> bool {
        let since = *self.sustain_since.entry((sensor_id, kind)).or_insert(ts);
        ts - since >= ChronoDuration::minutes(duration_minutes)
    }

    /// Rapid-change evaluation against the last closed hourly bucket's
    /// mean/stddev (documented choice: this implementation uses the
    /// previous calendar hour's bucket, not a rolling 60-minute window,
    /// because it is already maintained by C4 and is stable across
    /// recomputation).
    pub fn rapid_change_severity(
        &self,
        rule: &RuleConfig,
        value: f64,
        bucket_mean: f64,
        bucket_stddev: f64,
    ) -> Option<Severity> {
        if bucket_stddev <= 0.0 {
            return None;
        }
        let z = (value - bucket_mean).abs() / bucket_stddev;
        if z > rule.rapid_change.k_critical {
            Some(Severity::High)
        } else if z > rule.rapid_change.k {
            Some(Severity::Medium)
        } else {
            None
        }
    }

    async fn evaluate_rapid_change(
        &self,
        sensor: &Sensor,
        obs: &Observation,
        rule: &RuleConfig,
    ) -> Result<Option<EvaluationOutcome>, AlertError> {
        let previous_hour_start = floor_to_hour(obs.ts) - ChronoDuration::hours(1);
        let Some(bucket) = self.aggregator.hourly_bucket(sensor.id, previous_hour_start).await? else {
            return Ok(None);
        };
        let Some(severity) =
            self.rapid_change_severity(rule, obs.value, bucket.mean, bucket.variance.sqrt())
        else {
            return Ok(None);
        };
        let outcome = self
            .fire(sensor, RuleKind::RapidChange, severity, obs.value, bucket.mean, obs.ts)
            .await?;
        Ok(Some(outcome))
    }

    async fn fire(
        &self,
        sensor: &Sensor,
        kind: RuleKind,
        severity: Severity,
        value: f64,
        threshold: f64,
        detected_at: DateTime<Utc>,
    ) -> Result<EvaluationOutcome, AlertError> {
        self.sustain_since.remove(&(sensor.id, kind));
        self.hysteresis_state.remove(&(sensor.id, kind));

        let existing = self.state_store.active_alert(sensor.id, kind).await?;

        if let Some(mut alert) = existing {
            let upgraded = severity > alert.severity;
            alert.valor_actual = value;
            if upgraded {
                alert.severity = severity;
            }
            self.state_store
                .update_alert_severity(alert.id, alert.valor_actual, alert.severity)
                .await?;

            if upgraded {
                self.dispatcher.enqueue_for_alert(&alert, true).await;
                return Ok(EvaluationOutcome::Upgraded(alert));
            }
            return Ok(EvaluationOutcome::NoChange);
        }

        let shelter = self.select_shelter(sensor).await;
        let alert = Alert {
            id: Uuid::new_v4(),
            sensor_id: sensor.id,
            shelter_id: shelter.as_ref().map(|s| s.0),
            rule_kind: kind,
            severity,
            valor_actual: value,
            threshold,
            duration_held_minutes: 0,
            state: AlertState::Active,
            detected_at,
            acknowledged_at: None,
            resolved_at: None,
            sms_sent: false,
            email_sent: false,
            shelter_notified: false,
            message: render_message(kind, severity, value, threshold),
            recommended_actions: render_actions(kind, severity),
        };

        self.state_store.insert_alert(&alert).await?;

        self.dispatcher.enqueue_for_alert(&alert, false).await;
        Ok(EvaluationOutcome::Opened(alert))
    }

    async fn select_shelter(&self, sensor: &Sensor) -> Option<(i64, f64)> {
        let center = Point {
            lat: sensor.lat,
            lon: sensor.lon,
        };
        self.geo
            .k_nearest_shelters(center, 1, |s| {
                s.has_capacity() && s.state == crate::model::ShelterState::Available
            })
            .into_iter()
            .next()
            .map(|(s, d)| (s.id, d))
    }

    /// Whether `kind`'s active alert is still within the band that keeps
    /// it open (the complement of the condition that opened it), used to
    /// gate the resolve-side hysteresis timer.
    async fn within_hysteresis_band(
        &self,
        sensor: &Sensor,
        obs: &Observation,
        rule: &RuleConfig,
        kind: RuleKind,
    ) -> Result<bool, AlertError> {
        match kind {
            RuleKind::HeatExtreme => Ok(obs.value < rule.heat.bound),
            RuleKind::ColdExtreme => Ok(obs.value > rule.cold.bound),
            RuleKind::RapidChange => {
                let previous_hour_start = floor_to_hour(obs.ts) - ChronoDuration::hours(1);
                let Some(bucket) = self.aggregator.hourly_bucket(sensor.id, previous_hour_start).await?
                else {
                    return Ok(true);
                };
                let stddev = bucket.variance.sqrt();
                Ok(self.rapid_change_severity(rule, obs.value, bucket.mean, stddev).is_none())
            }
        }
    }

    async fn maybe_resolve(
        &self,
        sensor: &Sensor,
        obs: &Observation,
        rule: &RuleConfig,
    ) -> Result<EvaluationOutcome, AlertError> {
        let mut resolved = None;
        for kind in [RuleKind::HeatExtreme, RuleKind::ColdExtreme, RuleKind::RapidChange] {
            let Some(alert) = self.state_store.active_alert(sensor.id, kind).await? else {
                continue;
            };

            let within_band = self.within_hysteresis_band(sensor, obs, rule, kind).await?;
            if !within_band {
                self.hysteresis_state.remove(&(sensor.id, kind));
                continue;
            }

            let mut entry = self
                .hysteresis_state
                .entry((sensor.id, kind))
                .or_insert_with(HysteresisState::default);
            let since = *entry.below_since.get_or_insert(obs.ts);
            let held = obs.ts - since;

            if held >= ChronoDuration::minutes(self.hysteresis_minutes) {
                drop(entry);
                self.hysteresis_state.remove(&(sensor.id, kind));
                self.resolve(&alert).await?;
                resolved = Some(alert);
            }
        }

        Ok(resolved.map(EvaluationOutcome::Resolved).unwrap_or(EvaluationOutcome::NoChange))
    }

    async fn resolve(&self, alert: &Alert) -> Result<(), AlertError> {
        let did_resolve = self.state_store.resolve_alert(alert.id).await?;
        if !did_resolve {
            // Already resolved by a concurrent evaluation: idempotent
            // no-op, no mutation and no error.
            return Ok(());
        }

        self.dispatcher.cancel_pending_for_alert(alert.id).await;
        Ok(())
    }

    pub async fn resolve_by_id(&self, alert_id: Uuid) -> Result<(), AlertError> {
        let alert = self.state_store.get_alert(alert_id).await?;
        self.resolve(&alert).await
    }
}

fn render_message(kind: RuleKind, severity: Severity, value: f64, threshold: f64) -> String {
    format!(
        "{:?} {:?}: reading {:.2} against threshold {:.2}",
        severity, kind, value, threshold
    )
}

fn render_actions(kind: RuleKind, severity: Severity) -> String {
    match (kind, severity) {
        (_, Severity::Critical) => "Evacuate affected area immediately.".to_string(),
        (RuleKind::HeatExtreme, _) => "Seek shade and hydrate.".to_string(),
        (RuleKind::ColdExtreme, _) => "Seek warm shelter.".to_string(),
        (RuleKind::RapidChange, _) => "Monitor sensor for continued instability.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RapidChangeRule, ThresholdRule};

    fn rule() -> RuleConfig {
        RuleConfig {
            heat: ThresholdRule {
                bound: 40.0,
                critical_bound: 50.0,
                sustained_minutes: 5,
            },
            cold: ThresholdRule {
                bound: 0.0,
                critical_bound: -10.0,
                sustained_minutes: 5,
            },
            rapid_change: RapidChangeRule { k: 3.0, k_critical: 5.0 },
        }
    }

    #[test]
    fn exactly_at_threshold_does_not_trip() {
        let r = rule();
        // value == bound must not trip (strict `>` boundary behavior)
        assert!(!(r.heat.bound > r.heat.bound));
    }

    #[test]
    fn critical_checked_before_plain_bound() {
        let r = rule();
        assert!(51.0 > r.heat.critical_bound);
        assert!(51.0 > r.heat.bound);
        // Both conditions are true; critical must win (checked first).
    }
}
