use std::sync::Arc;
use std::time;

use purchase_common::health::{HealthHandle, HealthRegistry};
use purchase_common::loyalty;
use purchase_common::metrics::{
    ENRICHMENT_BATCHES, ENRICHMENT_BATCH_DURATION, ENRICHMENT_ERRORS, ENRICHMENT_PURCHASES,
};
use purchase_common::purchase::Purchase;
use purchase_common::retry::{RetryError, RetryPolicy, Retryable};
use purchase_common::shutdown::drain_token;
use purchase_common::store::{ClaimedBatch, PurchaseStore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;

/// Tuning for an `EnrichmentPool`.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of concurrent workers. At least one always runs.
    pub workers: usize,
    /// Purchases claimed per batch. At least one is always claimed.
    pub batch_size: usize,
    /// How long a worker that found nothing to claim waits before trying again.
    pub poll_interval: time::Duration,
    /// How long in-flight batches may keep writing once shutdown was requested.
    pub shutdown_grace: time::Duration,
    /// Workers report healthy at least once per claim; this is how long a report lasts.
    pub liveness_deadline: time::Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            batch_size: 10,
            poll_interval: time::Duration::from_secs(1),
            shutdown_grace: time::Duration::from_secs(30),
            liveness_deadline: time::Duration::from_secs(60),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// A fixed set of workers crediting player loyalty for unprocessed purchases.
///
/// Workers share nothing but the store. Mutual exclusion comes entirely from
/// `PurchaseStore::claim_batch`: a claimed purchase is invisible to other workers until its
/// batch is committed or dropped.
pub struct EnrichmentPool<S> {
    store: Arc<S>,
    config: PoolConfig,
    liveness: HealthRegistry,
}

impl<S: PurchaseStore> EnrichmentPool<S> {
    pub fn new(store: S, config: PoolConfig, liveness: HealthRegistry) -> Self {
        Self {
            store: Arc::new(store),
            config,
            liveness,
        }
    }

    /// Run all workers until `shutdown` is cancelled or one of them fails.
    ///
    /// Once stopping, workers claim nothing new, and batches in flight get
    /// `shutdown_grace` to commit before they are abandoned and rolled back. Returns the
    /// first error that stopped a worker, if any.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let stop = shutdown.child_token();
        let drain = drain_token(&stop, self.config.shutdown_grace);
        let mut workers = JoinSet::new();

        for id in 0..self.config.workers.max(1) {
            let worker = Worker {
                id,
                store: self.store.clone(),
                config: self.config.clone(),
                liveness: self
                    .liveness
                    .register(format!("worker-{}", id), self.config.liveness_deadline),
            };
            workers.spawn(worker.run(stop.clone(), drain.clone()));
        }

        info!(workers = workers.len(), "enrichment pool started");

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(WorkerError::TaskPanicked(e.to_string())));

            if let Err(e) = result {
                error!("enrichment worker stopped: {}", e);
                if first_error.is_none() {
                    // Take the remaining workers down with it.
                    stop.cancel();
                    first_error = Some(e);
                }
            }
        }

        drain.cancel();
        info!("enrichment pool stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct Worker<S> {
    id: usize,
    store: Arc<S>,
    config: PoolConfig,
    liveness: HealthHandle,
}

impl<S: PurchaseStore> Worker<S> {
    /// Idle, claim, process, repeat. Returns `Ok` when stopped, the error otherwise.
    async fn run(self, stop: CancellationToken, drain: CancellationToken) -> Result<(), WorkerError> {
        debug!(worker = self.id, "enrichment worker started");

        loop {
            self.liveness.report_healthy();

            if stop.is_cancelled() {
                break;
            }

            let batch = match self
                .config
                .retry_policy
                .run(&stop, || self.store.claim_batch(self.config.batch_size.max(1)))
                .await
            {
                Ok(batch) => batch,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    metrics::counter!(ENRICHMENT_ERRORS, &[("stage", "claim")]).increment(1);
                    return Err(WorkerError::Claim(e));
                }
            };

            if batch.is_empty() {
                drop(batch);
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => continue,
                }
            }

            match self.process(batch, &drain).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    warn!(worker = self.id, "abandoned batch on shutdown: {}", e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        debug!(worker = self.id, "enrichment worker stopped");
        Ok(())
    }

    /// Credit loyalty for every purchase of `batch` and mark each processed, then commit.
    ///
    /// All writes go through the claim, so they land together on commit. Any failure drops the
    /// batch, which rolls back whatever it wrote and makes the purchases claimable again.
    async fn process(&self, batch: S::Batch, drain: &CancellationToken) -> Result<(), WorkerError> {
        let start = time::Instant::now();
        let size = batch.purchases().len();
        metrics::counter!(ENRICHMENT_BATCHES).increment(1);

        let result = self.enrich(&batch, drain).await;
        let result = match result {
            Ok(()) => self.commit(batch).await,
            // Retries inside a claim share its connection: once that is gone they all fail.
            // Rolling back releases the purchases for a fresh claim on a new connection.
            Err(WorkerError::Enrich {
                purchase_id,
                error: error @ RetryError::Exhausted { .. },
            }) => {
                drop(batch);
                warn!(
                    worker = self.id,
                    purchase_id, "abandoned batch, it will be claimed again: {}", error
                );
                Ok(false)
            }
            Err(e) => {
                drop(batch);
                Err(e)
            }
        };

        metrics::histogram!(ENRICHMENT_BATCH_DURATION).record(start.elapsed().as_secs_f64());

        match result {
            Ok(committed) => {
                let outcome = if committed { "committed" } else { "abandoned" };
                metrics::counter!(ENRICHMENT_PURCHASES, &[("outcome", outcome)])
                    .increment(size as u64);
                Ok(())
            }
            Err(e) => {
                metrics::counter!(ENRICHMENT_PURCHASES, &[("outcome", "abandoned")])
                    .increment(size as u64);
                Err(e)
            }
        }
    }

    async fn enrich(&self, batch: &S::Batch, drain: &CancellationToken) -> Result<(), WorkerError> {
        // Players' loyalty rows stay locked until commit: take them in one global order.
        let mut purchases: Vec<&Purchase> = batch.purchases().iter().collect();
        purchases.sort_by(|a, b| a.player_id.cmp(&b.player_id).then(a.id.cmp(&b.id)));

        let retry_policy = &self.config.retry_policy;

        for purchase in purchases {
            let points = loyalty::points_for(purchase.amount_cents, purchase.item_type);

            let loyalty = retry_policy
                .run(drain, || batch.award_loyalty(purchase, points))
                .await
                .map_err(|error| {
                    metrics::counter!(ENRICHMENT_ERRORS, &[("stage", "award_loyalty")])
                        .increment(1);
                    WorkerError::Enrich {
                        purchase_id: purchase.id,
                        error,
                    }
                })?;

            retry_policy
                .run(drain, || batch.mark_processed(purchase.id))
                .await
                .map_err(|error| {
                    metrics::counter!(ENRICHMENT_ERRORS, &[("stage", "mark_processed")])
                        .increment(1);
                    WorkerError::Enrich {
                        purchase_id: purchase.id,
                        error,
                    }
                })?;

            debug!(
                worker = self.id,
                transaction_id = purchase.transaction_id,
                player_id = loyalty.player_id,
                points,
                player_points = loyalty.loyalty_points,
                "enriched purchase"
            );
        }

        Ok(())
    }

    /// Commit is attempted once: after a failed commit the outcome is unknown, and the
    /// purchases are simply claimed again. Crediting is idempotent, so that is safe.
    /// Returns whether the batch was committed.
    async fn commit(&self, batch: S::Batch) -> Result<bool, WorkerError> {
        let size = batch.purchases().len();

        match batch.commit().await {
            Ok(()) => {
                info!(worker = self.id, purchases = size, "committed enriched batch");
                Ok(true)
            }
            Err(e) if e.is_retryable() => {
                metrics::counter!(ENRICHMENT_ERRORS, &[("stage", "commit")]).increment(1);
                warn!(worker = self.id, "failed to commit batch, it will be claimed again: {}", e);
                Ok(false)
            }
            Err(e) => {
                metrics::counter!(ENRICHMENT_ERRORS, &[("stage", "commit")]).increment(1);
                Err(WorkerError::Commit(e))
            }
        }
    }
}
