//! Bounded fan-out of per-item work.
//!
//! Every item in a batch is attempted exactly once. At most `limit` handler
//! invocations run at once, gated by a semaphore; the dispatcher joins all of
//! them before returning. One item's failure or panic never affects its
//! siblings.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ItemError;
use crate::pipeline::outcome::{BatchOutcome, ItemOutcome, ItemResult};
use crate::pipeline::types::{BookedDocument, CandidateItem};

/// Default number of concurrently active handler invocations.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Successful end states of a handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemDisposition {
    NotRelevant,
    Booked(BookedDocument),
}

/// Per-item work run by the dispatcher.
#[async_trait]
pub trait ItemHandler: Send + Sync {
    async fn handle(&self, item: &CandidateItem) -> Result<ItemDisposition, ItemError>;
}

/// Runs a batch of items under a concurrency cap. Holds no state across batches.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    limit: usize,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl Dispatcher {
    /// A limit of zero is raised to one.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `handler` over every item and collect results in submission order.
    ///
    /// On cancellation, items not yet started and items still in flight are
    /// reported as [`ItemError::Cancelled`]. Work already completed stays
    /// completed. A started task that dies without reporting is
    /// [`ItemError::Panicked`].
    pub async fn run_batch(
        &self,
        items: Vec<CandidateItem>,
        handler: Arc<dyn ItemHandler>,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let items: Vec<Arc<CandidateItem>> = items.into_iter().map(Arc::new).collect();
        let mut slots: Vec<Option<ItemOutcome>> = items.iter().map(|_| None).collect();

        let semaphore = Arc::new(Semaphore::new(self.limit));
        let mut join_set: JoinSet<(usize, ItemOutcome)> = JoinSet::new();
        let mut started = 0;

        for (index, item) in items.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(remaining = items.len() - index, "Batch cancelled before all items started");
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let item = Arc::clone(item);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let outcome = run_item(handler.as_ref(), &item, &cancel).await;
                (index, outcome)
            });
            started += 1;
        }

        let mut task_failures = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => {
                    warn!(error = %e, "Item task did not complete");
                    task_failures.push(e.to_string());
                }
            }
        }

        let results = items
            .iter()
            .zip(slots)
            .enumerate()
            .map(|(index, (item, slot))| {
                let outcome = match slot {
                    Some(outcome) => outcome,
                    None if index < started => {
                        ItemOutcome::Error(ItemError::Panicked(task_failures.join("; ")))
                    }
                    None => ItemOutcome::Error(ItemError::Cancelled),
                };
                ItemResult::new(item, outcome)
            })
            .collect();

        BatchOutcome { results }
    }
}

async fn run_item(
    handler: &dyn ItemHandler,
    item: &CandidateItem,
    cancel: &CancellationToken,
) -> ItemOutcome {
    let work = AssertUnwindSafe(handler.handle(item)).catch_unwind();

    tokio::select! {
        _ = cancel.cancelled() => ItemOutcome::Error(ItemError::Cancelled),
        result = work => match result {
            Ok(Ok(ItemDisposition::NotRelevant)) => ItemOutcome::Neutral,
            Ok(Ok(ItemDisposition::Booked(doc))) => ItemOutcome::Success(doc),
            Ok(Err(e)) => ItemOutcome::Error(e),
            Err(panic) => ItemOutcome::Error(ItemError::Panicked(panic_message(panic))),
        },
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
