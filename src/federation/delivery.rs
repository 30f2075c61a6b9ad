//! Activity delivery
//!
//! Handles delivering signed activities to remote inboxes with bounded,
//! backing-off retries. Retry is an explicit state machine on the
//! delivery record, driven by worker loops that claim due records with
//! atomic state-guarded updates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::config::DeliveryConfig;
use crate::data::{Activity, Database, DeliveryRecord, DeliveryState, EntityId};
use crate::error::AppError;
use crate::interfaces::KeyProvider;
use crate::metrics::{DELIVERY_ATTEMPTS_TOTAL, DELIVERY_ATTEMPT_DURATION_SECONDS};

use super::signature::{SignatureHeaders, sign_request};

/// Fixed retry schedule, indexed by attempt number
///
/// A record exhausts after `delivery.max_attempts` transient failures.
const RETRY_BACKOFF_SECONDS: [i64; 5] = [60, 300, 900, 3600, 14_400];

/// Delay before the next attempt, given the failures so far
fn backoff_delay(attempts: i64) -> Duration {
    let index = (attempts - 1)
        .clamp(0, RETRY_BACKOFF_SECONDS.len() as i64 - 1) as usize;
    Duration::seconds(RETRY_BACKOFF_SECONDS[index])
}

/// Deduplicate identical inbox URLs while keeping distinct personal
/// inboxes on the same domain.
fn unique_inbox_targets(inbox_urls: Vec<String>) -> Vec<String> {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for inbox_url in inbox_urls {
        if seen.contains(&inbox_url) {
            continue;
        }
        seen.insert(inbox_url.clone());
        targets.push(inbox_url);
    }

    targets
}

/// Outcome of a transport-level delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportResult {
    /// The remote endpoint answered with this status code
    Status(u16),
    /// The request never produced a response (connect error, timeout)
    NetworkError(String),
}

/// Wire transport for signed deliveries
///
/// Production uses `HttpTransport`; tests substitute a scripted mock.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn post_signed(
        &self,
        endpoint: &str,
        headers: &SignatureHeaders,
        body: &[u8],
    ) -> TransportResult;
}

/// reqwest-backed transport
pub struct HttpTransport {
    http_client: Arc<reqwest::Client>,
}

impl HttpTransport {
    pub fn new(http_client: Arc<reqwest::Client>) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn post_signed(
        &self,
        endpoint: &str,
        headers: &SignatureHeaders,
        body: &[u8],
    ) -> TransportResult {
        let mut request = self
            .http_client
            .post(endpoint)
            .header("Content-Type", "application/activity+json")
            .header("Date", &headers.date)
            .header("Signature", &headers.signature);

        if let Some(ref digest) = headers.digest {
            request = request.header("Digest", digest);
        }

        match request.body(body.to_vec()).send().await {
            Ok(response) => TransportResult::Status(response.status().as_u16()),
            Err(e) => TransportResult::NetworkError(e.to_string()),
        }
    }
}

/// How a processed record ended this attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    Retrying,
    FailedPermanent,
    FailedExhausted,
}

impl AttemptOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Retrying => "transient",
            Self::FailedPermanent => "permanent",
            Self::FailedExhausted => "exhausted",
        }
    }
}

/// Outbound delivery scheduler
///
/// Owns the delivery queue, retry timing, and per-endpoint delivery
/// state. Workers claim the earliest-due pending record; the claim is
/// exclusive, so concurrent workers never double-deliver a record.
pub struct DeliveryScheduler {
    db: Arc<Database>,
    keys: Arc<dyn KeyProvider>,
    transport: Arc<dyn DeliveryTransport>,
    config: DeliveryConfig,
}

impl DeliveryScheduler {
    /// Create new delivery scheduler
    pub fn new(
        db: Arc<Database>,
        keys: Arc<dyn KeyProvider>,
        transport: Arc<dyn DeliveryTransport>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            db,
            keys,
            transport,
            config,
        }
    }

    /// Queue an activity for delivery to a set of endpoints
    ///
    /// Creates one pending record per deduplicated endpoint with
    /// `next_attempt_at = now`.
    ///
    /// # Returns
    /// Number of delivery records created.
    pub async fn publish(
        &self,
        activity: &Activity,
        endpoints: Vec<String>,
    ) -> Result<usize, AppError> {
        let total = endpoints.len();
        let targets = unique_inbox_targets(endpoints);
        let now = Utc::now();

        for endpoint in &targets {
            let record = DeliveryRecord {
                id: EntityId::new().0,
                activity_id: activity.id.clone(),
                actor: activity.actor.clone(),
                endpoint: endpoint.clone(),
                state: DeliveryState::Pending.as_str().to_string(),
                attempts: 0,
                next_attempt_at: Some(now),
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            self.db.insert_delivery_record(&record).await?;
        }

        tracing::info!(
            activity = %activity.uri,
            endpoints = targets.len(),
            deduplicated_from = total,
            "Queued activity for delivery"
        );

        Ok(targets.len())
    }

    /// Cancel all still-pending deliveries of an activity
    ///
    /// Cancelled records go directly to `failed_permanent` with reason
    /// "cancelled", regardless of their attempt count.
    pub async fn cancel(&self, activity_id: &str) -> Result<u64, AppError> {
        let cancelled = self
            .db
            .cancel_pending_deliveries(activity_id, Utc::now())
            .await?;

        if cancelled > 0 {
            tracing::info!(activity_id, cancelled, "Cancelled pending deliveries");
        }

        Ok(cancelled)
    }

    /// Claim and process one due record
    ///
    /// # Returns
    /// The outcome of the processed record, or None when nothing was due.
    pub async fn process_due_once(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<AttemptOutcome>, AppError> {
        let Some(record) = self.db.claim_due_delivery(now).await? else {
            return Ok(None);
        };

        let outcome = self.attempt_delivery(&record, now).await?;
        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&[outcome.as_str()])
            .inc();

        Ok(Some(outcome))
    }

    /// Perform one signed delivery attempt for a claimed record
    async fn attempt_delivery(
        &self,
        record: &DeliveryRecord,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, AppError> {
        let timer = DELIVERY_ATTEMPT_DURATION_SECONDS
            .with_label_values(&["all"])
            .start_timer();

        // The activity may have been deleted while this record waited.
        let Some(activity) = self.db.get_activity(&record.activity_id).await? else {
            self.db
                .mark_failed_permanent(&record.id, "activity no longer exists", now)
                .await?;
            timer.observe_duration();
            return Ok(AttemptOutcome::FailedPermanent);
        };

        // Signing failures during attempt construction are treated like
        // network errors for retry purposes.
        let result = match self.sign_attempt(&activity, &record.endpoint).await {
            Ok(headers) => {
                let body = activity.body.as_bytes();
                match tokio::time::timeout(
                    self.config.attempt_timeout(),
                    self.transport.post_signed(&record.endpoint, &headers, body),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => TransportResult::NetworkError("attempt timed out".to_string()),
                }
            }
            Err(e) => TransportResult::NetworkError(format!("attempt construction failed: {}", e)),
        };
        timer.observe_duration();

        match result {
            TransportResult::Status(status) if (200..300).contains(&status) => {
                self.db.mark_delivered(&record.id, now).await?;
                self.db
                    .note_endpoint_delivered(&record.endpoint, now)
                    .await?;
                tracing::info!(
                    endpoint = %record.endpoint,
                    activity = %activity.uri,
                    "Delivered activity"
                );
                Ok(AttemptOutcome::Delivered)
            }
            TransportResult::Status(status) if (400..500).contains(&status) => {
                // The remote party will never accept this exact message.
                self.db
                    .mark_failed_permanent(&record.id, &format!("HTTP {}", status), now)
                    .await?;
                tracing::warn!(
                    endpoint = %record.endpoint,
                    activity = %activity.uri,
                    status,
                    "Delivery rejected permanently"
                );
                Ok(AttemptOutcome::FailedPermanent)
            }
            TransportResult::Status(status) => {
                self.handle_transient(record, &format!("HTTP {}", status), now)
                    .await
            }
            TransportResult::NetworkError(error) => {
                self.handle_transient(record, &error, now).await
            }
        }
    }

    /// Reschedule or exhaust a record after a transient failure
    async fn handle_transient(
        &self,
        record: &DeliveryRecord,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome, AppError> {
        let attempts = record.attempts + 1;

        if attempts >= self.config.max_attempts {
            self.db
                .mark_exhausted(&record.id, attempts, error, now)
                .await?;
            tracing::warn!(
                endpoint = %record.endpoint,
                attempts,
                error,
                "Delivery retries exhausted"
            );
            self.note_exhausted_endpoint(&record.endpoint, now).await?;
            return Ok(AttemptOutcome::FailedExhausted);
        }

        let next_attempt_at = now + backoff_delay(attempts);
        self.db
            .reschedule_delivery(&record.id, attempts, next_attempt_at, error, now)
            .await?;
        tracing::debug!(
            endpoint = %record.endpoint,
            attempts,
            next_attempt_at = %next_attempt_at,
            error,
            "Delivery attempt failed, retrying"
        );

        Ok(AttemptOutcome::Retrying)
    }

    /// Track exhausted deliveries and flag endpoints for operators
    ///
    /// Flagging never blocks future publish attempts; endpoints recover
    /// by accepting a later delivery.
    async fn note_exhausted_endpoint(
        &self,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let window = Duration::seconds(self.config.unreachable_window_seconds);
        let streak = self
            .db
            .note_endpoint_exhausted(endpoint, now, window)
            .await?;

        if streak >= self.config.unreachable_threshold {
            self.db.flag_endpoint_unreachable(endpoint, now).await?;
            tracing::warn!(endpoint, streak, "Endpoint flagged unreachable");
        }

        Ok(())
    }

    async fn sign_attempt(
        &self,
        activity: &Activity,
        endpoint: &str,
    ) -> Result<SignatureHeaders, AppError> {
        let private_key_pem = self
            .keys
            .resolve_signing_key(&activity.actor)
            .await?
            .ok_or_else(|| AppError::KeyUnavailable(activity.actor.clone()))?;
        let key_id = format!("{}#main-key", activity.actor);

        sign_request(
            "POST",
            endpoint,
            Some(activity.body.as_bytes()),
            &private_key_pem,
            &key_id,
        )
    }

    /// Spawn the delivery worker pool
    ///
    /// Each worker drains due records, then idles for the poll interval.
    pub fn spawn_workers(self: Arc<Self>) {
        for worker_id in 0..self.config.workers {
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                tracing::info!(worker_id, "Delivery worker started");
                let mut interval = tokio::time::interval(scheduler.config.poll_interval());

                loop {
                    match scheduler.process_due_once(Utc::now()).await {
                        Ok(Some(_)) => {
                            // More work may be due; keep draining.
                            continue;
                        }
                        Ok(None) => {
                            interval.tick().await;
                        }
                        Err(e) => {
                            tracing::error!(worker_id, error = %e, "Delivery worker error");
                            interval.tick().await;
                        }
                    }
                }
            });
        }

        tracing::info!(workers = self.config.workers, "Delivery workers spawned");
    }
}
