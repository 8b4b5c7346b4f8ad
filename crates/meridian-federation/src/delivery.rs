//! Delivery guarantee engine.
//!
//! Every outbound federated message is tracked as one [`DeliveryReceipt`] per
//! target. Receipts move through
//!
//! ```text
//!   pending ──attempt ok──► delivered
//!      │  └──attempt err──► failed ──retry──► retrying ──attempt ok──► delivered
//!      └──retry──► retrying                      ▲   └──attempt err──► failed
//!                                                └───────────────────────┘
//! ```
//!
//! and every write is conditional on the status the writer read, so two
//! workers racing on one receipt can never both record an outcome.
//!
//! # Attempt counting
//! `attempts` counts logical tries. A try started from `pending` is counted
//! when its outcome is recorded. A try started by [`DeliveryEngine::retry`]
//! is counted by `retry` itself, so the attempt that follows does not count
//! it a second time.
//!
//! # Leases
//! A `retrying` receipt carries a lease in `next_attempt_at`: the attempt
//! timeout plus a grace period. A receipt still `pending` or `retrying`
//! after its lease (or, for a fresh `pending` one, that long after creation)
//! lost its attempt somewhere, and [`DeliveryEngine::reclaim`] puts it back
//! on the queue without counting a new try.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use meridian_common::config::FederationConfig;
use meridian_common::models::{
    DeliveryReceipt, DeliveryStatus, NewReceipt, ReceiptFilter, ReceiptUpdate,
};
use meridian_db::ReceiptStore;

use crate::error::{DeliveryError, FederationError};

// ─── Seams ───────────────────────────────────────────────────────────────────

/// Decides whether a target may receive user content right now.
#[async_trait]
pub trait TargetPolicy: Send + Sync {
    /// `Ok(())` if the target is federatable, otherwise the reason it is not.
    async fn check(&self, target: &str) -> Result<(), FederationError>;
}

/// Performs the network delivery of one receipt's payload.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(&self, receipt: &DeliveryReceipt) -> Result<(), DeliveryError>;
}

// ─── Retry policy ────────────────────────────────────────────────────────────

/// Automatic retry limits and backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// The scanner stops retrying once a receipt has this many attempts.
    pub max_attempts: i32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &FederationConfig) -> Self {
        Self {
            max_attempts: i32::try_from(cfg.max_attempts).unwrap_or(i32::MAX),
            base: cfg.backoff_base(),
            max: cfg.backoff_max(),
        }
    }

    /// `min(base · 2^(attempts−1), max)`.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exp = attempts.saturating_sub(1).clamp(0, 30) as u32;
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    /// When the next automatic retry is due, with up to 10 % jitter.
    pub fn next_attempt_at(&self, attempts: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.backoff(attempts);
        let jitter_ms = (delay.as_millis() / 10) as u64;
        let jitter = if jitter_ms > 0 { rand::rng().random_range(0..=jitter_ms) } else { 0 };
        let total = delay + Duration::from_millis(jitter);
        now + chrono::Duration::from_std(total).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    pub fn exhausted(&self, attempts: i32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 8, base: Duration::from_secs(30), max: Duration::from_secs(3600) }
    }
}

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// What one call to [`DeliveryEngine::attempt`] recorded.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Delivered(DeliveryReceipt),
    /// `retry_at` is set when the failure is eligible for an automatic retry.
    Failed { receipt: DeliveryReceipt, retry_at: Option<DateTime<Utc>> },
    /// The target stopped being federatable; failed permanently, nothing sent.
    Dropped(DeliveryReceipt),
    /// Another writer moved the receipt while this attempt was in flight.
    Superseded,
    /// The receipt was not `pending` or `retrying`.
    Skipped(DeliveryStatus),
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct DeliveryEngine {
    receipts: Arc<dyn ReceiptStore>,
    policy: Arc<dyn TargetPolicy>,
    transport: Arc<dyn DeliveryTransport>,
    source_instance: String,
    attempt_timeout: Duration,
    retry: RetryPolicy,
    lease_grace: Duration,
    jobs: Option<mpsc::Sender<Uuid>>,
}

/// Slack added to the attempt timeout before an in-flight receipt is
/// considered stranded.
pub const DEFAULT_LEASE_GRACE: Duration = Duration::from_secs(30);

impl DeliveryEngine {
    pub fn new(
        receipts: Arc<dyn ReceiptStore>,
        policy: Arc<dyn TargetPolicy>,
        transport: Arc<dyn DeliveryTransport>,
        source_instance: impl Into<String>,
        attempt_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            receipts,
            policy,
            transport,
            source_instance: source_instance.into(),
            attempt_timeout,
            retry,
            lease_grace: DEFAULT_LEASE_GRACE,
            jobs: None,
        }
    }

    pub fn with_lease_grace(mut self, grace: Duration) -> Self {
        self.lease_grace = grace;
        self
    }

    /// Hand new and retried receipts to a worker queue instead of leaving
    /// the `attempt` call to the caller.
    pub fn with_dispatcher(mut self, jobs: mpsc::Sender<Uuid>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn source_instance(&self) -> &str {
        &self.source_instance
    }

    fn lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.attempt_timeout + self.lease_grace).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    /// Whether an in-flight receipt outlived its lease without an outcome.
    pub fn is_stranded(&self, receipt: &DeliveryReceipt, now: DateTime<Utc>) -> bool {
        receipt.status.is_attemptable()
            && match receipt.next_attempt_at {
                Some(lease) => lease <= now,
                None => receipt.created_at + self.lease() <= now,
            }
    }

    // ── Operations ───────────────────────────────────────────────────────────

    /// Track `payload` for delivery to `target`.
    ///
    /// Fails with `PeerNotFederatable`, creating nothing, if the target may
    /// not receive user content. Enqueueing the same `(message_id, target)`
    /// twice returns the existing receipt.
    pub async fn enqueue(
        &self,
        message_id: &str,
        target: &str,
        payload: Value,
    ) -> Result<DeliveryReceipt, FederationError> {
        if message_id.is_empty() || target.is_empty() {
            return Err(FederationError::Validation("message id and target are required".into()));
        }

        match self.policy.check(target).await {
            Ok(()) => {}
            Err(FederationError::PeerNotFound(_) | FederationError::PeerNotFederatable(_)) => {
                info!(dest = target, message_id, "Refusing to enqueue for non-federatable target");
                return Err(FederationError::PeerNotFederatable(target.to_owned()));
            }
            Err(e) => return Err(e),
        }

        let (receipt, created) = self
            .receipts
            .insert_receipt(NewReceipt {
                message_id: message_id.to_owned(),
                source_instance: self.source_instance.clone(),
                target_instance: target.to_owned(),
                payload,
            })
            .await?;

        if created {
            debug!(receipt = %receipt.id, dest = target, message_id, "Receipt enqueued");
            self.dispatch(receipt.id).await;
        } else {
            debug!(receipt = %receipt.id, dest = target, message_id, "Receipt already exists");
        }
        Ok(receipt)
    }

    /// Perform one network delivery and record the outcome.
    pub async fn attempt(&self, id: Uuid) -> Result<AttemptOutcome, FederationError> {
        let receipt = self.get(id).await?;
        if !receipt.status.is_attemptable() {
            debug!(receipt = %id, status = %receipt.status, "Skipping attempt");
            return Ok(AttemptOutcome::Skipped(receipt.status));
        }

        let expected = receipt.status;
        let counts_try = expected == DeliveryStatus::Pending;
        let now = Utc::now();

        if let Err(reason) = self.policy.check(&receipt.target_instance).await {
            let mut update = ReceiptUpdate::to(DeliveryStatus::Failed);
            update.increment_attempts = counts_try;
            update.last_attempt_at = Some(now);
            update.error_message = Some(Some(reason.to_string()));
            update.permanent_failure = Some(true);
            update.next_attempt_at = Some(None);

            return Ok(match self.receipts.update_receipt_if(id, expected, &update).await? {
                Some(r) => {
                    warn!(receipt = %id, dest = %r.target_instance, %reason, "Dropping delivery to non-federatable target");
                    AttemptOutcome::Dropped(r)
                }
                None => AttemptOutcome::Superseded,
            });
        }

        debug!(receipt = %id, dest = %receipt.target_instance, attempts = receipt.attempts, "Attempting delivery");
        let result = match tokio::time::timeout(self.attempt_timeout, self.transport.deliver(&receipt)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Transient(format!(
                "timed out after {}s",
                self.attempt_timeout.as_secs_f32()
            ))),
        };
        let finished = Utc::now();

        match result {
            Ok(()) => {
                let mut update = ReceiptUpdate::to(DeliveryStatus::Delivered);
                update.increment_attempts = counts_try;
                update.last_attempt_at = Some(finished);
                update.delivered_at = Some(finished);
                update.error_message = Some(None);
                update.next_attempt_at = Some(None);

                match self.receipts.update_receipt_if(id, expected, &update).await? {
                    Some(r) => {
                        info!(receipt = %id, dest = %r.target_instance, attempts = r.attempts, "Delivered");
                        Ok(AttemptOutcome::Delivered(r))
                    }
                    None => {
                        debug!(receipt = %id, "Delivery succeeded but receipt moved underneath");
                        Ok(AttemptOutcome::Superseded)
                    }
                }
            }
            Err(err) => {
                let attempts_after = receipt.attempts + i32::from(counts_try);
                let retry_at = (err.is_transient() && !self.retry.exhausted(attempts_after))
                    .then(|| self.retry.next_attempt_at(attempts_after, finished));

                let mut update = ReceiptUpdate::to(DeliveryStatus::Failed);
                update.increment_attempts = counts_try;
                update.last_attempt_at = Some(finished);
                update.error_message = Some(Some(err.to_string()));
                update.permanent_failure = Some(!err.is_transient());
                update.next_attempt_at = Some(retry_at);

                match self.receipts.update_receipt_if(id, expected, &update).await? {
                    Some(r) => {
                        if err.is_transient() {
                            info!(receipt = %id, dest = %r.target_instance, attempts = r.attempts, error = %err, ?retry_at, "Delivery failed (transient)");
                        } else {
                            warn!(receipt = %id, dest = %r.target_instance, attempts = r.attempts, error = %err, "Delivery failed permanently");
                        }
                        Ok(AttemptOutcome::Failed { receipt: r, retry_at })
                    }
                    None => {
                        debug!(receipt = %id, "Failure not recorded; receipt moved underneath");
                        Ok(AttemptOutcome::Superseded)
                    }
                }
            }
        }
    }

    /// Start a new logical try: `pending | failed → retrying`.
    ///
    /// Counts the try, takes a lease and schedules an attempt. Fails with
    /// `ReceiptNotRetryable` if the receipt is delivered or already retrying.
    pub async fn retry(&self, id: Uuid) -> Result<DeliveryReceipt, FederationError> {
        let receipt = self.get(id).await?;
        if !receipt.status.is_retryable() {
            return Err(FederationError::ReceiptNotRetryable { id, status: receipt.status });
        }

        let mut update = ReceiptUpdate::to(DeliveryStatus::Retrying);
        update.increment_attempts = true;
        update.next_attempt_at = Some(Some(Utc::now() + self.lease()));

        let Some(updated) = self.receipts.update_receipt_if(id, receipt.status, &update).await? else {
            let current = self.get(id).await?;
            return Err(FederationError::ReceiptNotRetryable { id, status: current.status });
        };

        info!(receipt = %id, dest = %updated.target_instance, attempts = updated.attempts, "Retrying delivery");
        self.dispatch(id).await;
        Ok(updated)
    }

    /// Re-queue a stranded `pending` or `retrying` receipt under a fresh
    /// lease. Returns `false` if the receipt is not stranded at `now` or
    /// another writer moved it first. The try is not counted again.
    pub async fn reclaim(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, FederationError> {
        let receipt = self.get(id).await?;
        if !self.is_stranded(&receipt, now) {
            return Ok(false);
        }

        let mut update = ReceiptUpdate::to(receipt.status);
        update.next_attempt_at = Some(Some(now + self.lease()));
        if self.receipts.update_receipt_if(id, receipt.status, &update).await?.is_none() {
            return Ok(false);
        }

        warn!(receipt = %id, dest = %receipt.target_instance, status = %receipt.status, "Re-dispatching stranded delivery");
        self.dispatch(id).await;
        Ok(true)
    }

    /// Administratively terminate a `pending` or `failed` receipt, or a
    /// `retrying` one whose lease ran out.
    pub async fn abandon(&self, id: Uuid, reason: &str) -> Result<DeliveryReceipt, FederationError> {
        self.abandon_at(id, reason, Utc::now()).await
    }

    async fn abandon_at(&self, id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<DeliveryReceipt, FederationError> {
        let receipt = self.get(id).await?;
        let stranded_retry = receipt.status == DeliveryStatus::Retrying && self.is_stranded(&receipt, now);
        if !receipt.status.is_retryable() && !stranded_retry {
            return Err(FederationError::ReceiptNotAbandonable { id, status: receipt.status });
        }

        let mut update = ReceiptUpdate::to(DeliveryStatus::Failed);
        update.error_message = Some(Some(format!("abandoned: {reason}")));
        update.permanent_failure = Some(true);
        update.next_attempt_at = Some(None);

        match self.receipts.update_receipt_if(id, receipt.status, &update).await? {
            Some(r) => {
                warn!(receipt = %id, dest = %r.target_instance, reason, "Delivery abandoned");
                Ok(r)
            }
            None => {
                let current = self.get(id).await?;
                Err(FederationError::ReceiptNotAbandonable { id, status: current.status })
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<DeliveryReceipt, FederationError> {
        self.receipts.get_receipt(id).await?.ok_or(FederationError::ReceiptNotFound(id))
    }

    pub async fn list(&self, filter: &ReceiptFilter) -> Result<Vec<DeliveryReceipt>, FederationError> {
        Ok(self.receipts.list_receipts(filter).await?)
    }

    /// Receipts the scanner should retry now.
    pub async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<DeliveryReceipt>, FederationError> {
        Ok(self.receipts.due_receipts(now, self.retry.max_attempts, limit).await?)
    }

    /// In-flight receipts whose lease has run out at `now`, oldest first.
    pub async fn stranded(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<DeliveryReceipt>, FederationError> {
        Ok(self.receipts.stranded_receipts(now, now - self.lease(), limit).await?)
    }

    /// Queue an attempt for a receipt, if a dispatcher is attached.
    pub async fn dispatch(&self, id: Uuid) {
        if let Some(jobs) = &self.jobs {
            if jobs.send(id).await.is_err() {
                warn!(receipt = %id, "Delivery queue closed; attempt not scheduled");
            }
        }
    }
}
