//! Shared data model. Kept free of persistence concerns; each
//! store maps its own row type to/from these.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum SensorKind {
    Temperature,
    Humidity,
    AirQuality,
    Noise,
    Occupancy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum SensorState {
    Active,
    Inactive,
    Maintenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Quality {
    Good,
    Fair,
    Poor,
    Suspect,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Sensor {
    pub id: i64,
    pub name: String,
    pub kind: SensorKind,
    pub state: SensorState,
    pub unit: String,
    pub lat: f64,
    pub lon: f64,
    pub precision: f64,
    pub range_min: f64,
    pub range_max: f64,
    pub strict_range: bool,
    pub sample_period_seconds: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Observation {
    pub sensor_id: i64,
    pub ts: DateTime<Utc>,
    pub value: f64,
    pub unit: String,
    pub quality: Quality,
    pub late: bool,
    pub ambient_temp: Option<f64>,
    pub humidity: Option<f64>,
    pub battery_level: Option<f64>,
    pub signal_strength: Option<f64>,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HourlyAggregate {
    pub sensor_id: i64,
    pub bucket_start: DateTime<Utc>,
    pub count: i64,
    pub mean: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DailyAggregate {
    pub sensor_id: i64,
    pub bucket_start: DateTime<Utc>,
    pub count: i64,
    pub mean: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
    pub min_at: Option<DateTime<Utc>>,
    pub max_at: Option<DateTime<Utc>>,
    pub hours_over_threshold: i32,
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ShelterState {
    Available,
    Full,
    Closed,
    Maintenance,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Shelter {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub state: ShelterState,
    pub capacity_max: i64,
    pub capacity_current: i64,
    pub has_medical: bool,
    pub has_hvac: bool,
    pub contact: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub version: i64,
}

impl Shelter {
    pub fn has_capacity(&self) -> bool {
        self.capacity_current < self.capacity_max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoadNode {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoadSegment {
    pub id: i64,
    pub source: i64,
    pub target: i64,
    pub cost_minutes: f64,
    /// `None` means one-way: traversable only `source -> target`.
    pub reverse_cost_minutes: Option<f64>,
    pub geometry: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum RuleKind {
    HeatExtreme,
    ColdExtreme,
    RapidChange,
}

/// Per-sensor-kind rule configuration. A fixed shape rather than
/// a generic condition AST, since the three canonical rules never vary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub bound: f64,
    pub critical_bound: f64,
    pub sustained_minutes: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RapidChangeRule {
    pub k: f64,
    pub k_critical: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RuleConfig {
    pub heat: ThresholdRule,
    pub cold: ThresholdRule,
    pub rapid_change: RapidChangeRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum AlertState {
    Active,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Alert {
    pub id: Uuid,
    pub sensor_id: i64,
    pub shelter_id: Option<i64>,
    pub rule_kind: RuleKind,
    pub severity: Severity,
    pub valor_actual: f64,
    pub threshold: f64,
    pub duration_held_minutes: i64,
    pub state: AlertState,
    pub detected_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub sms_sent: bool,
    pub email_sent: bool,
    pub shelter_notified: bool,
    pub message: String,
    pub recommended_actions: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum NotificationChannel {
    Sms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Delivered,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationJob {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub channel: NotificationChannel,
    pub recipient: String,
    pub body: String,
    pub attempt_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: NotificationStatus,
    pub provider_id: Option<String>,
}
