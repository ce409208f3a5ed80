//! Polling scheduler: drives batch runs on a timer and on demand.
//!
//! Each batch:
//! 1. Note the time the fetch is issued
//! 2. Fetch items newer than the watermark (failure aborts the batch)
//! 3. Dispatch every item through the pipeline and join
//! 4. Record failed items in the failure log
//! 5. Advance the watermark to the fetch time, whatever the item outcomes
//!
//! Batches run inline in the loop, so a new tick never overlaps a batch in
//! flight. Only a batch cancelled before its fetch leaves the watermark
//! alone; once items were fetched, the batch always checkpoints so anything
//! already booked is never fetched again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::BatchError;
use crate::pipeline::dispatcher::{Dispatcher, ItemHandler};
use crate::pipeline::outcome::BatchOutcome;
use crate::pipeline::types::ItemFetcher;
use crate::store::traits::{FailureLog, ItemFailure};
use crate::store::watermark::WatermarkStore;

/// Requests on-demand runs from outside the scheduler loop.
#[derive(Clone, Default)]
pub struct SchedulerHandle {
    trigger: Arc<Notify>,
}

impl SchedulerHandle {
    /// A handle not yet bound to a scheduler; see [`Scheduler::with_handle`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for an extra run. Queued behind a batch already in flight;
    /// repeated requests before it starts collapse into one.
    pub fn trigger_now(&self) {
        self.trigger.notify_one();
    }
}

pub struct Scheduler {
    fetcher: Arc<dyn ItemFetcher>,
    handler: Arc<dyn ItemHandler>,
    dispatcher: Dispatcher,
    watermark: WatermarkStore,
    failure_log: Option<Arc<dyn FailureLog>>,
    interval: Duration,
    trigger: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        fetcher: Arc<dyn ItemFetcher>,
        handler: Arc<dyn ItemHandler>,
        dispatcher: Dispatcher,
        watermark: WatermarkStore,
        interval: Duration,
    ) -> Self {
        Self {
            fetcher,
            handler,
            dispatcher,
            watermark,
            failure_log: None,
            interval,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Record failed items here after every batch.
    pub fn with_failure_log(mut self, log: Arc<dyn FailureLog>) -> Self {
        self.failure_log = Some(log);
        self
    }

    /// Answer triggers from a handle created before the scheduler.
    pub fn with_handle(mut self, handle: &SchedulerHandle) -> Self {
        self.trigger = Arc::clone(&handle.trigger);
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            trigger: Arc::clone(&self.trigger),
        }
    }

    pub fn watermark(&self) -> chrono::DateTime<Utc> {
        self.watermark.current()
    }

    /// Run until `cancel` fires: once immediately, then once per interval
    /// tick or on-demand trigger. Batch failures are logged, never fatal.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            source = self.fetcher.name(),
            concurrency = self.dispatcher.limit(),
            "Scheduler started"
        );

        let trigger = Arc::clone(&self.trigger);
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // First tick completes immediately.
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Scheduler shutting down");
                    return;
                }
                _ = tick.tick() => {}
                _ = trigger.notified() => {
                    info!("On-demand run requested");
                }
            }

            match self.run_once(&cancel).await {
                Ok(_) => {}
                Err(BatchError::Cancelled) => info!("Batch cancelled before fetch"),
                Err(e @ BatchError::ItemFailures { .. }) => warn!("{e}"),
                Err(e) => error!(error = %e, "Batch failed"),
            }
        }
    }

    /// Run exactly one batch.
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> Result<BatchOutcome, BatchError> {
        let batch_id = Uuid::new_v4();
        let since = self.watermark.current();
        let issued_at = Utc::now();

        if cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        info!(%batch_id, source = self.fetcher.name(), %since, "Fetching new items");

        let items = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BatchError::Cancelled),
            fetched = self.fetcher.fetch_since(since) => fetched?,
        };

        let total = items.len();
        if total > 0 {
            info!(%batch_id, total, "Dispatching items");
        }

        let outcome = self
            .dispatcher
            .run_batch(items, Arc::clone(&self.handler), cancel)
            .await;

        self.record_failures(batch_id, &outcome).await;

        let watermark = self.watermark.advance(issued_at).await?;

        info!(
            %batch_id,
            total,
            succeeded = outcome.succeeded().len(),
            neutral = outcome.neutral(),
            failed = outcome.failed(),
            %watermark,
            "Batch complete"
        );

        outcome.into_result()
    }

    async fn record_failures(&self, batch_id: Uuid, outcome: &BatchOutcome) {
        for (result, err) in outcome.failures() {
            warn!(
                %batch_id,
                item_id = %result.item_id,
                sender = %result.sender,
                subject = %result.subject,
                stage = err.stage(),
                error = %err,
                "Item failed"
            );

            let Some(log) = &self.failure_log else {
                continue;
            };
            let failure = ItemFailure {
                id: Uuid::new_v4(),
                batch_id,
                item_id: result.item_id.clone(),
                sender: result.sender.clone(),
                subject: result.subject.clone(),
                stage: err.stage().to_string(),
                reason: err.to_string(),
                failed_at: Utc::now(),
            };
            if let Err(e) = log.record_item_failure(&failure).await {
                warn!(item_id = %result.item_id, error = %e, "Failed to record item failure");
            }
        }
    }
}
