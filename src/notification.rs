//! NotificationDispatcher (C6): bounded-concurrency SMS fan-out with
//! retry/cancellation. A gateway trait decouples the HTTP provider from
//! dispatch logic; a per-alert lock keeps at most one delivery attempt
//! for a given alert in flight at a time.

use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use sqlx::PgPool;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::error::NotificationError;
use crate::model::{Alert, NotificationChannel, NotificationJob, NotificationStatus, Severity};

fn phone_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+[1-9]\d{1,14}$").expect("valid E.164 pattern"))
}

pub fn validate_phone(number: &str) -> bool {
    phone_pattern().is_match(number)
}

#[derive(Debug, Clone)]
pub struct ProviderId(pub String);

#[derive(Debug, Clone)]
pub struct SendError {
    pub message: String,
    pub permanent: bool,
}

/// External SMS gateway contract: `send(to, body) -> {provider_id}
/// | {error_code, permanent}`. Out of scope per §1; this trait is the
/// narrow seam this crate depends on.
#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<ProviderId, SendError>;
}

pub struct HttpSmsGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSmsGateway {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl SmsGateway for HttpSmsGateway {
    async fn send(&self, to: &str, body: &str) -> Result<ProviderId, SendError> {
        let resp = self
            .client
            .post(&self.base_url)
            .form(&[("to", to), ("body", body)])
            .send()
            .await
            .map_err(|e| SendError {
                message: e.to_string(),
                permanent: false,
            })?;

        if resp.status().is_client_error() {
            return Err(SendError {
                message: format!("gateway rejected request: {}", resp.status()),
                permanent: true,
            });
        }
        if !resp.status().is_success() {
            return Err(SendError {
                message: format!("gateway error: {}", resp.status()),
                permanent: false,
            });
        }

        #[derive(serde::Deserialize)]
        struct Ack {
            provider_id: String,
        }
        let ack: Ack = resp.json().await.map_err(|e| SendError {
            message: e.to_string(),
            permanent: false,
        })?;
        Ok(ProviderId(ack.provider_id))
    }
}

const MAX_SMS_LEN: usize = 1600;

fn build_message(alert: &Alert, severity_upgrade: bool, route_summary: Option<&str>) -> String {
    let mut body = if severity_upgrade {
        format!("[UPGRADED to {:?}] {}", alert.severity, alert.message)
    } else {
        format!("[{:?}] {}", alert.severity, alert.message)
    };
    // Appends shelter + ETA when a route has already been computed.
    if let Some(summary) = route_summary {
        body.push_str(" | ");
        body.push_str(summary);
    }
    body.truncate(MAX_SMS_LEN);
    body
}

pub struct NotificationDispatcher {
    pool: PgPool,
    gateway: Arc<dyn SmsGateway>,
    recipients: Vec<String>,
    retry_config: RetryConfig,
    parallelism: Arc<Semaphore>,
    in_flight: DashMap<Uuid, Arc<Mutex<()>>>,
    route_summaries: DashMap<(i64, i64), String>,
}

impl NotificationDispatcher {
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn SmsGateway>,
        recipients: Vec<String>,
        retry_config: RetryConfig,
        parallelism: usize,
    ) -> Self {
        Self {
            pool,
            gateway,
            recipients,
            retry_config,
            parallelism: Arc::new(Semaphore::new(parallelism)),
            in_flight: DashMap::new(),
            route_summaries: DashMap::new(),
        }
    }

    /// Supplemental (`send_evacuation_sms`): remember the last computed
    /// route for a (sensor, shelter) pair so future bodies can include it.
    pub fn record_route_summary(&self, sensor_id: i64, shelter_id: i64, summary: String) {
        self.route_summaries.insert((sensor_id, shelter_id), summary);
    }

    /// Enqueues one job per configured recipient, at most one job per
    /// (channel, recipient) for a given alert.
    pub async fn enqueue_for_alert(&self, alert: &Alert, severity_upgrade: bool) {
        let route_summary = alert
            .shelter_id
            .and_then(|sid| self.route_summaries.get(&(alert.sensor_id, sid)).map(|s| s.clone()));
        let body = build_message(alert, severity_upgrade, route_summary.as_deref());

        for recipient in &self.recipients {
            if !validate_phone(recipient) {
                tracing::warn!(recipient, "malformed recipient number, skipping enqueue");
                continue;
            }
            let job = NotificationJob {
                id: Uuid::new_v4(),
                alert_id: alert.id,
                channel: NotificationChannel::Sms,
                recipient: recipient.clone(),
                body: body.clone(),
                attempt_count: 0,
                next_attempt_at: Utc::now(),
                status: NotificationStatus::Pending,
                provider_id: None,
            };
            if let Err(err) = self.insert_job(&job).await {
                tracing::error!(error = %err, "failed to persist notification job");
                continue;
            }
            self.spawn_delivery(job);
        }
    }

    async fn insert_job(&self, job: &NotificationJob) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO notification_jobs \
             (id, alert_id, channel, recipient, body, attempt_count, next_attempt_at, status, provider_id) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
        )
        .bind(job.id)
        .bind(job.alert_id)
        .bind(job.channel)
        .bind(&job.recipient)
        .bind(&job.body)
        .bind(job.attempt_count)
        .bind(job.next_attempt_at)
        .bind(job.status)
        .bind(&job.provider_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn spawn_delivery(&self, job: NotificationJob) {
        let pool = self.pool.clone();
        let gateway = self.gateway.clone();
        let permits = self.parallelism.clone();
        let lock = self
            .in_flight
            .entry(job.alert_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let retry_config = self.retry_config.clone();

        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await;
            let _alert_lock = lock.lock().await;

            if is_cancelled(&pool, job.alert_id).await {
                let _ = mark_job(&pool, job.id, NotificationStatus::Cancelled, None).await;
                return;
            }

            let backoff_policy = ExponentialBackoff {
                initial_interval: retry_config.base,
                multiplier: retry_config.factor,
                randomization_factor: retry_config.jitter,
                max_elapsed_time: Some(retry_config.base * retry_config.max_attempts),
                ..ExponentialBackoff::default()
            };

            let gateway_ref = gateway.as_ref();
            let body = job.body.clone();
            let recipient = job.recipient.clone();
            let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
            let attempts_clone = attempts.clone();

            let outcome = retry(backoff_policy, || {
                let recipient = recipient.clone();
                let body = body.clone();
                let attempts_clone = attempts_clone.clone();
                async move {
                    attempts_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    gateway_ref.send(&recipient, &body).await.map_err(|e| {
                        if e.permanent {
                            backoff::Error::permanent(e)
                        } else {
                            backoff::Error::transient(e)
                        }
                    })
                }
            })
            .await;

            let attempt_count = attempts.load(std::sync::atomic::Ordering::SeqCst) as i32;

            match outcome {
                Ok(provider_id) => {
                    let _ = mark_job(
                        &pool,
                        job.id,
                        NotificationStatus::Delivered,
                        Some(provider_id.0),
                    )
                    .await;
                    let _ = mark_alert_sms_sent(&pool, job.alert_id).await;
                }
                Err(err) => {
                    tracing::warn!(
                        alert_id = %job.alert_id,
                        attempts = attempt_count,
                        error = %err.message,
                        "notification delivery failed permanently"
                    );
                    let _ = mark_job(&pool, job.id, NotificationStatus::Failed, None).await;
                }
            }
        });
    }

    /// Cancels any pending jobs for a resolved alert. The in-flight
    /// delivery task checks this flag itself before sending.
    pub async fn cancel_pending_for_alert(&self, alert_id: Uuid) {
        let _ = sqlx::query(
            "UPDATE notification_jobs SET status = 'cancelled' WHERE alert_id = $1 AND status = 'pending'",
        )
        .bind(alert_id)
        .execute(&self.pool)
        .await;
    }
}

async fn is_cancelled(pool: &PgPool, alert_id: Uuid) -> bool {
    sqlx::query_scalar::<_, bool>(
        "SELECT state = 'resolved' FROM alerts WHERE id = $1",
    )
    .bind(alert_id)
    .fetch_optional(pool)
    .await
    .ok()
    .flatten()
    .unwrap_or(false)
}

async fn mark_job(
    pool: &PgPool,
    job_id: Uuid,
    status: NotificationStatus,
    provider_id: Option<String>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE notification_jobs SET status = $1, provider_id = $2 WHERE id = $3")
        .bind(status)
        .bind(provider_id)
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn mark_alert_sms_sent(pool: &PgPool, alert_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE alerts SET sms_sent = true WHERE id = $1")
        .bind(alert_id)
        .execute(pool)
        .await?;
    Ok(())
}

impl From<NotificationError> for SendError {
    fn from(err: NotificationError) -> Self {
        SendError {
            message: err.to_string(),
            permanent: matches!(err, NotificationError::Permanent(_)),
        }
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SendError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_e164() {
        assert!(validate_phone("+14155552671"));
    }

    #[test]
    fn rejects_missing_plus() {
        assert!(!validate_phone("14155552671"));
    }

    #[test]
    fn rejects_leading_zero_country_code() {
        assert!(!validate_phone("+0123456789"));
    }

    #[test]
    fn message_truncates_to_1600_code_units() {
        let alert = test_alert();
        let long = "x".repeat(2000);
        let mut alert = alert;
        alert.message = long;
        let body = build_message(&alert, false, None);
        assert_eq!(body.len(), MAX_SMS_LEN);
    }

    fn test_alert() -> Alert {
        Alert {
            id: Uuid::new_v4(),
            sensor_id: 1,
            shelter_id: None,
            rule_kind: crate::model::RuleKind::HeatExtreme,
            severity: Severity::High,
            valor_actual: 41.0,
            threshold: 40.0,
            duration_held_minutes: 5,
            state: crate::model::AlertState::Active,
            detected_at: Utc::now(),
            acknowledged_at: None,
            resolved_at: None,
            sms_sent: false,
            email_sent: false,
            shelter_notified: false,
            message: String::new(),
            recommended_actions: String::new(),
        }
    }
}
