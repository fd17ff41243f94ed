//! Error taxonomy. Each component maps errors from the layer below
//! into its own vocabulary rather than letting storage/library errors leak
//! through unchanged.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimeStoreError {
    #[error("unknown sensor {0}")]
    UnknownSensor(String),
    #[error("observation value out of sensor range")]
    OutOfRange,
    #[error("append timestamp is beyond the closure horizon")]
    StaleAppend,
    #[error("time store backend unavailable: {0}")]
    BackendUnavailable(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("geo index backend unavailable: {0}")]
    BackendUnavailable(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum RoadGraphError {
    #[error("no path between the requested endpoints")]
    NoPath,
    #[error("endpoint could not be snapped to the road graph")]
    UnknownEndpoint,
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("aggregator backend unavailable: {0}")]
    BackendUnavailable(#[from] sqlx::Error),
    #[error("bucket recompute could not read raw observations: {0}")]
    RecomputeSourceUnavailable(#[from] TimeStoreError),
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert state store error: {0}")]
    StateStore(#[from] StateStoreError),
    #[error("could not read aggregate state for rapid-change evaluation: {0}")]
    Aggregator(#[from] AggregatorError),
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("permanent notification failure: {0}")]
    Permanent(String),
    #[error("notification job was cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error(transparent)]
    RoadGraph(#[from] RoadGraphError),
    #[error("unknown sensor or shelter endpoint")]
    UnknownEndpoint,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unknown sensor {0}")]
    UnknownSensor(String),
    #[error("unsupported sensor kind {0}")]
    UnsupportedKind(String),
    #[error("value outside sensor range and sensor is configured strict")]
    OutOfRange,
    #[error("rate limited")]
    RateLimited,
    #[error(transparent)]
    TimeStore(#[from] TimeStoreError),
}

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("unknown sensor {0}")]
    UnknownSensor(String),
    #[error("unknown shelter {0}")]
    UnknownShelter(i64),
    #[error("unknown alert {0}")]
    UnknownAlert(uuid::Uuid),
    #[error("capacity_current must satisfy 0 <= capacity_current <= capacity_max")]
    CapacityOutOfRange,
    #[error("compare-and-swap conflict: {0}")]
    Conflict(&'static str),
    #[error("state store backend unavailable: {0}")]
    BackendUnavailable(#[from] sqlx::Error),
}

/// Aggregates errors that cross component boundaries, e.g. `IngestGateway::ingest`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    TimeStore(#[from] TimeStoreError),
    #[error(transparent)]
    Alert(#[from] AlertError),
    #[error(transparent)]
    StateStore(#[from] StateStoreError),
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    RoadGraph(#[from] RoadGraphError),
}

pub type CoreResult<T> = Result<T, CoreError>;

pub fn log_backend_error(context: &str, err: &sqlx::Error) {
    tracing::error!(error = %err, context, "backend error");
}
