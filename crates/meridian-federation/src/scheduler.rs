//! Background delivery: a bounded worker pool fed by the engine's dispatch
//! queue, and a periodic scanner that turns due failures into retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use meridian_common::models::{DeliveryStatus, ReceiptFilter};

use crate::delivery::{AttemptOutcome, DeliveryEngine};
use crate::error::FederationError;

/// Capacity of the dispatch queue between the engine and the workers.
pub const DISPATCH_QUEUE: usize = 4_096;

/// Build the dispatch channel to pass to [`DeliveryEngine::with_dispatcher`]
/// and [`spawn_workers`].
pub fn dispatch_channel() -> (mpsc::Sender<Uuid>, mpsc::Receiver<Uuid>) {
    mpsc::channel(DISPATCH_QUEUE)
}

/// Drain `jobs`, running at most `concurrency` attempts at once.
///
/// The returned task ends when every sender of the queue is dropped and all
/// in-flight attempts have finished.
pub fn spawn_workers(
    engine: Arc<DeliveryEngine>,
    mut jobs: mpsc::Receiver<Uuid>,
    concurrency: usize,
) -> JoinHandle<()> {
    let limit = Arc::new(Semaphore::new(concurrency.max(1)));
    tokio::spawn(async move {
        info!(concurrency, "Delivery workers started");
        let mut inflight = tokio::task::JoinSet::new();

        while let Some(id) = jobs.recv().await {
            let Ok(permit) = limit.clone().acquire_owned().await else {
                break;
            };
            let engine = engine.clone();
            inflight.spawn(async move {
                let _permit = permit;
                match engine.attempt(id).await {
                    Ok(AttemptOutcome::Superseded) => debug!(receipt = %id, "Attempt superseded"),
                    Ok(_) => {}
                    Err(e) => error!(receipt = %id, error = %e, "Delivery attempt failed to run"),
                }
            });
            // Reap finished attempts so the set does not grow unbounded.
            while inflight.try_join_next().is_some() {}
        }

        while inflight.join_next().await.is_some() {}
        info!("Delivery workers stopped");
    })
}

// ─── Retry scanner ───────────────────────────────────────────────────────────

/// Periodically retries `failed` receipts whose backoff has elapsed.
pub struct RetryScanner {
    engine: Arc<DeliveryEngine>,
    interval: Duration,
    batch: u32,
}

impl RetryScanner {
    pub fn new(engine: Arc<DeliveryEngine>, interval: Duration, batch: u32) -> Self {
        Self { engine, interval, batch }
    }

    /// Runs until the task is aborted.
    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch = self.batch,
            "Starting delivery retry scanner"
        );

        let mut interval = time::interval(self.interval);
        loop {
            interval.tick().await;
            match self.scan_once().await {
                Ok(0) => debug!("No deliveries due for retry"),
                Ok(n) => info!(retried = n, "Scheduled delivery retries"),
                Err(e) => error!(error = %e, "Retry scan failed"),
            }
        }
    }

    /// Retry every receipt due now and re-dispatch stranded ones, up to one
    /// batch each. Returns how many were scheduled.
    pub async fn scan_once(&self) -> Result<usize, FederationError> {
        self.scan_at(Utc::now()).await
    }

    pub async fn scan_at(&self, now: DateTime<Utc>) -> Result<usize, FederationError> {
        let due = self.engine.due(now, self.batch).await?;
        let mut retried = 0;
        for receipt in due {
            match self.engine.retry(receipt.id).await {
                Ok(_) => retried += 1,
                // An operator or another scanner moved it first.
                Err(FederationError::ReceiptNotRetryable { id, status }) => {
                    debug!(receipt = %id, %status, "Due receipt no longer retryable");
                }
                Err(e) => warn!(receipt = %receipt.id, error = %e, "Could not retry receipt"),
            }
        }

        for receipt in self.engine.stranded(now, self.batch).await? {
            match self.engine.reclaim(receipt.id, now).await {
                Ok(true) => retried += 1,
                Ok(false) => {}
                Err(e) => warn!(receipt = %receipt.id, error = %e, "Could not reclaim receipt"),
            }
        }
        Ok(retried)
    }
}

/// Re-dispatch receipts left `pending` or `retrying` by a previous process.
pub async fn recover_inflight(engine: &DeliveryEngine) -> Result<usize, FederationError> {
    let mut recovered = 0;
    for status in [DeliveryStatus::Pending, DeliveryStatus::Retrying] {
        let mut filter = ReceiptFilter {
            status: Some(status),
            limit: Some(ReceiptFilter::MAX_LIMIT),
            ..Default::default()
        };
        loop {
            let page = engine.list(&filter).await?;
            let Some(last) = page.last() else { break };
            filter = filter.after_page(last);
            let full = page.len() as u32 == ReceiptFilter::MAX_LIMIT;
            for receipt in &page {
                engine.dispatch(receipt.id).await;
            }
            recovered += page.len();
            if !full {
                break;
            }
        }
    }
    if recovered > 0 {
        info!(recovered, "Re-dispatched in-flight deliveries");
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryTransport, RetryPolicy, TargetPolicy};
    use crate::error::DeliveryError;
    use async_trait::async_trait;
    use meridian_common::models::DeliveryReceipt;
    use meridian_db::memory::MemoryStore;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AllowAll;

    #[async_trait]
    impl TargetPolicy for AllowAll {
        async fn check(&self, _target: &str) -> Result<(), FederationError> {
            Ok(())
        }
    }

    /// Fails the first `fail_first` calls with a transient error.
    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl DeliveryTransport for Flaky {
        async fn deliver(&self, _receipt: &DeliveryReceipt) -> Result<(), DeliveryError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                Err(DeliveryError::Transient("HTTP 503".into()))
            } else {
                Ok(())
            }
        }
    }

    fn engine(fail_first: usize, tx: Option<mpsc::Sender<Uuid>>) -> DeliveryEngine {
        let retry = RetryPolicy { max_attempts: 5, base: Duration::ZERO, max: Duration::ZERO };
        let e = DeliveryEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(AllowAll),
            Arc::new(Flaky { calls: AtomicUsize::new(0), fail_first }),
            "local.example",
            Duration::from_secs(5),
            retry,
        );
        match tx {
            Some(tx) => e.with_dispatcher(tx),
            None => e,
        }
    }

    #[tokio::test]
    async fn scanner_retries_due_failures() {
        let e = Arc::new(engine(1, None));
        let r = e.enqueue("m1", "p1.example", Value::Null).await.unwrap();
        assert!(matches!(e.attempt(r.id).await.unwrap(), AttemptOutcome::Failed { .. }));

        let scanner = RetryScanner::new(e.clone(), Duration::from_secs(60), 10);
        assert_eq!(scanner.scan_once().await.unwrap(), 1);
        assert_eq!(e.get(r.id).await.unwrap().status, DeliveryStatus::Retrying);

        assert!(matches!(e.attempt(r.id).await.unwrap(), AttemptOutcome::Delivered(_)));
        let done = e.get(r.id).await.unwrap();
        assert_eq!(done.attempts, 2);
        assert_eq!(scanner.scan_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn workers_deliver_dispatched_receipts() {
        let (tx, rx) = dispatch_channel();
        let e = Arc::new(engine(0, Some(tx)));
        let workers = spawn_workers(e.clone(), rx, 4);

        let r = e.enqueue("m1", "p1.example", Value::Null).await.unwrap();
        let mut status = DeliveryStatus::Pending;
        for _ in 0..100 {
            status = e.get(r.id).await.unwrap().status;
            if status == DeliveryStatus::Delivered {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, DeliveryStatus::Delivered);
        workers.abort();
    }

    #[tokio::test]
    async fn recovery_redispatches_pending_and_retrying() {
        let (tx, mut rx) = mpsc::channel(16);
        let e = engine(0, None);
        let a = e.enqueue("m1", "p1.example", Value::Null).await.unwrap();
        let b = e.enqueue("m2", "p1.example", Value::Null).await.unwrap();
        e.retry(b.id).await.unwrap();

        let e = e.with_dispatcher(tx);
        assert_eq!(recover_inflight(&e).await.unwrap(), 2);
        let mut seen = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
        seen.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn scanner_redispatches_stranded_receipts() {
        let (tx, mut rx) = mpsc::channel(16);
        let e = Arc::new(engine(0, Some(tx)));
        let lost = e.enqueue("m1", "p1.example", Value::Null).await.unwrap();
        let stuck = e.enqueue("m2", "p1.example", Value::Null).await.unwrap();
        e.retry(stuck.id).await.unwrap();
        while rx.try_recv().is_ok() {}

        let scanner = RetryScanner::new(e.clone(), Duration::from_secs(60), 10);
        assert_eq!(scanner.scan_once().await.unwrap(), 0);
        assert!(rx.try_recv().is_err());

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(scanner.scan_at(later).await.unwrap(), 2);
        let mut seen = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
        seen.sort();
        let mut expected = vec![lost.id, stuck.id];
        expected.sort();
        assert_eq!(seen, expected);

        // Reclaiming renews the lease rather than counting another try.
        assert_eq!(scanner.scan_at(later).await.unwrap(), 0);
        assert_eq!(e.get(stuck.id).await.unwrap().attempts, 1);
        assert_eq!(e.get(lost.id).await.unwrap().status, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn recovery_pages_past_a_full_batch() {
        let (tx, mut rx) = mpsc::channel(1024);
        let e = engine(0, None);
        for i in 0..(ReceiptFilter::MAX_LIMIT + 3) {
            e.enqueue(&format!("m{i}"), "p1.example", Value::Null).await.unwrap();
        }
        let e = e.with_dispatcher(tx);
        assert_eq!(recover_inflight(&e).await.unwrap(), ReceiptFilter::MAX_LIMIT as usize + 3);
        let mut seen = std::collections::HashSet::new();
        while let Ok(id) = rx.try_recv() {
            seen.insert(id);
        }
        assert_eq!(seen.len(), ReceiptFilter::MAX_LIMIT as usize + 3);
    }
}
