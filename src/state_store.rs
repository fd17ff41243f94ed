//! StateStore (C9): durable sensors/shelters/road graph/alerts, with
//! transactional CAS for shelter capacity and alert state, using a
//! `pool.begin()` + `FOR UPDATE` + version-check + `commit()` shape.

use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StateStoreError;
use crate::geo_index::GeoIndex;
use crate::model::{Alert, RoadNode, RoadSegment, RuleKind, Sensor, Severity, Shelter};
use crate::road_graph::RoadGraph;

const ALERT_COLUMNS: &str = "id, sensor_id, shelter_id, rule_kind, severity, valor_actual, threshold, \
     duration_held_minutes, state, detected_at, acknowledged_at, resolved_at, sms_sent, \
     email_sent, shelter_notified, message, recommended_actions";

pub struct StateStore {
    pool: PgPool,
    geo: Arc<GeoIndex>,
    road_graph: Arc<RoadGraph>,
}

impl StateStore {
    pub fn new(pool: PgPool, geo: Arc<GeoIndex>, road_graph: Arc<RoadGraph>) -> Self {
        Self { pool, geo, road_graph }
    }

    pub async fn list_sensors(&self) -> Result<Vec<Sensor>, StateStoreError> {
        let rows = sqlx::query_as::<_, Sensor>(
            "SELECT id, name, kind, state, unit, lat, lon, precision, range_min, range_max, \
             strict_range, sample_period_seconds FROM sensors ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_sensor(&self, id: i64) -> Result<Sensor, StateStoreError> {
        sqlx::query_as::<_, Sensor>(
            "SELECT id, name, kind, state, unit, lat, lon, precision, range_min, range_max, \
             strict_range, sample_period_seconds FROM sensors WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StateStoreError::UnknownSensor(id.to_string()))
    }

    pub async fn list_shelters(&self) -> Result<Vec<Shelter>, StateStoreError> {
        let rows = sqlx::query_as::<_, Shelter>(
            "SELECT id, name, kind, state, capacity_max, capacity_current, has_medical, \
             has_hvac, contact, lat, lon, version FROM shelters ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Rebuilds and republishes the GeoIndex snapshot so registration and
    /// deregistration take effect synchronously.
    pub async fn refresh_geo_index(&self) -> Result<(), StateStoreError> {
        let sensors = self.list_sensors().await?;
        let shelters = self.list_shelters().await?;
        self.geo.publish(sensors, shelters);
        Ok(())
    }

    pub async fn reload_road_graph(&self) -> Result<(), StateStoreError> {
        #[derive(sqlx::FromRow)]
        struct RoadSegmentRow {
            id: i64,
            source: i64,
            target: i64,
            cost_minutes: f64,
            reverse_cost_minutes: Option<f64>,
        }

        let nodes = sqlx::query_as::<_, RoadNode>("SELECT id, lat, lon FROM road_nodes")
            .fetch_all(&self.pool)
            .await?;
        let rows = sqlx::query_as::<_, RoadSegmentRow>(
            "SELECT id, source, target, cost_minutes, reverse_cost_minutes FROM road_segments",
        )
        .fetch_all(&self.pool)
        .await?;
        // Segment polylines are query-only decoration for the GeoJSON
        // response; the planner only needs topology + cost to route.
        let segments: Vec<RoadSegment> = rows
            .into_iter()
            .map(|r| RoadSegment {
                id: r.id,
                source: r.source,
                target: r.target,
                cost_minutes: r.cost_minutes,
                reverse_cost_minutes: r.reverse_cost_minutes,
                geometry: Vec::new(),
            })
            .collect();
        self.road_graph.publish(nodes, &segments);
        Ok(())
    }

    /// Atomic capacity update guarded by a compare-and-swap on
    /// (id, version). `new_value` must stay within `[0, capacity_max]`.
    pub async fn update_capacity(
        &self,
        shelter_id: i64,
        new_value: i64,
        expected_version: i64,
    ) -> Result<(), StateStoreError> {
        let mut tx = self.pool.begin().await?;

        let shelter = sqlx::query_as::<_, Shelter>(
            "SELECT id, name, kind, state, capacity_max, capacity_current, has_medical, \
             has_hvac, contact, lat, lon, version FROM shelters WHERE id = $1 FOR UPDATE",
        )
        .bind(shelter_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StateStoreError::UnknownShelter(shelter_id))?;

        if new_value < 0 || new_value > shelter.capacity_max {
            return Err(StateStoreError::CapacityOutOfRange);
        }

        let result = sqlx::query(
            "UPDATE shelters SET capacity_current = $1, version = version + 1 \
             WHERE id = $2 AND version = $3",
        )
        .bind(new_value)
        .bind(shelter_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StateStoreError::Conflict("shelter version mismatch"));
        }

        tx.commit().await?;
        self.refresh_geo_index().await?;
        Ok(())
    }

    /// The open alert, if any, for a (sensor, rule) pair. At most one is
    /// ever active at a time.
    pub async fn active_alert(
        &self,
        sensor_id: i64,
        rule_kind: RuleKind,
    ) -> Result<Option<Alert>, StateStoreError> {
        let alert = sqlx::query_as::<_, Alert>(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE sensor_id = $1 AND rule_kind = $2 AND state = 'active'"
        ))
        .bind(sensor_id)
        .bind(rule_kind)
        .fetch_optional(&self.pool)
        .await?;
        Ok(alert)
    }

    pub async fn get_alert(&self, alert_id: Uuid) -> Result<Alert, StateStoreError> {
        sqlx::query_as::<_, Alert>(&format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = $1"))
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StateStoreError::UnknownAlert(alert_id))
    }

    pub async fn insert_alert(&self, alert: &Alert) -> Result<(), StateStoreError> {
        sqlx::query(
            "INSERT INTO alerts \
             (id, sensor_id, shelter_id, rule_kind, severity, valor_actual, threshold, \
              duration_held_minutes, state, detected_at, acknowledged_at, resolved_at, \
              sms_sent, email_sent, shelter_notified, message, recommended_actions) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)",
        )
        .bind(alert.id)
        .bind(alert.sensor_id)
        .bind(alert.shelter_id)
        .bind(alert.rule_kind)
        .bind(alert.severity)
        .bind(alert.valor_actual)
        .bind(alert.threshold)
        .bind(alert.duration_held_minutes)
        .bind(alert.state)
        .bind(alert.detected_at)
        .bind(alert.acknowledged_at)
        .bind(alert.resolved_at)
        .bind(alert.sms_sent)
        .bind(alert.email_sent)
        .bind(alert.shelter_notified)
        .bind(&alert.message)
        .bind(&alert.recommended_actions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Updates the live reading and, on upgrade, the severity of an
    /// already-active alert. No-op if the alert has since resolved.
    pub async fn update_alert_severity(
        &self,
        alert_id: Uuid,
        valor_actual: f64,
        severity: Severity,
    ) -> Result<(), StateStoreError> {
        sqlx::query(
            "UPDATE alerts SET valor_actual = $1, severity = $2 WHERE id = $3 AND state = 'active'",
        )
        .bind(valor_actual)
        .bind(severity)
        .bind(alert_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Transitions an active alert to resolved. Returns `false` if it was
    /// already resolved by a concurrent evaluation (idempotent no-op).
    pub async fn resolve_alert(&self, alert_id: Uuid) -> Result<bool, StateStoreError> {
        let result = sqlx::query(
            "UPDATE alerts SET state = 'resolved', resolved_at = $1 WHERE id = $2 AND state = 'active'",
        )
        .bind(Utc::now())
        .bind(alert_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::db::connect_lazy;

    /// Exercises the shelter-capacity race: two concurrent `update_capacity`
    /// calls against the same version, only one of which should succeed.
    /// Requires `CORE_DATABASE_URL` to point at a disposable Postgres
    /// instance with the schema applied; skipped otherwise.
    #[tokio::test]
    async fn concurrent_capacity_updates_leave_exactly_one_winner() {
        let Ok(_) = std::env::var("CORE_DATABASE_URL") else {
            eprintln!("skipping: CORE_DATABASE_URL not set");
            return;
        };
        let config = CoreConfig::from_env().expect("config");
        let pool = connect_lazy(&config).expect("pool");
        let geo = Arc::new(GeoIndex::new());
        let road_graph = Arc::new(RoadGraph::new());
        let store = Arc::new(StateStore::new(pool, geo, road_graph));

        let shelter_id = 1_i64;
        let expected_version = 0_i64;

        let (a, b) = tokio::join!(
            store.update_capacity(shelter_id, 5, expected_version),
            store.update_capacity(shelter_id, 6, expected_version),
        );

        let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1, "exactly one concurrent CAS update should win");
    }
}
