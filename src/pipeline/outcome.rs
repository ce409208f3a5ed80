//! Per-item outcomes and batch aggregation.

use crate::error::{BatchError, ItemError};
use crate::pipeline::types::{BookedDocument, CandidateItem};

/// Terminal state of one item's pipeline run.
#[derive(Debug)]
pub enum ItemOutcome {
    /// Classified as not relevant. Handled, but nothing booked.
    Neutral,
    Success(BookedDocument),
    Error(ItemError),
}

/// One item's outcome, attributed to the item it came from.
#[derive(Debug)]
pub struct ItemResult {
    pub item_id: String,
    pub sender: String,
    pub subject: String,
    pub outcome: ItemOutcome,
}

impl ItemResult {
    pub fn new(item: &CandidateItem, outcome: ItemOutcome) -> Self {
        Self {
            item_id: item.id.clone(),
            sender: item.sender.clone(),
            subject: item.subject.clone(),
            outcome,
        }
    }

    pub fn error(&self) -> Option<&ItemError> {
        match &self.outcome {
            ItemOutcome::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// All results of one batch, in submission order.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<ItemResult>,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn failed(&self) -> usize {
        self.failures().count()
    }

    pub fn neutral(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ItemOutcome::Neutral))
            .count()
    }

    /// Ids of items that were booked.
    pub fn succeeded(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ItemOutcome::Success(_)))
            .map(|r| r.item_id.clone())
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ItemResult, &ItemError)> {
        self.results
            .iter()
            .filter_map(|r| r.error().map(|e| (r, e)))
    }

    /// `Ok` only when no item failed.
    pub fn into_result(self) -> Result<Self, BatchError> {
        let failed = self.failed();
        if failed == 0 {
            Ok(self)
        } else {
            Err(BatchError::ItemFailures {
                failed,
                total: self.total(),
                succeeded: self.succeeded(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    fn result(id: &str, outcome: ItemOutcome) -> ItemResult {
        ItemResult {
            item_id: id.into(),
            sender: "billing@example.com".into(),
            subject: "Invoice".into(),
            outcome,
        }
    }

    #[test]
    fn empty_batch_is_ok() {
        let outcome = BatchOutcome::default().into_result().unwrap();
        assert_eq!(outcome.total(), 0);
    }

    #[test]
    fn neutral_items_are_not_failures() {
        let outcome = BatchOutcome {
            results: vec![result("m1", ItemOutcome::Neutral)],
        };
        assert_eq!(outcome.neutral(), 1);
        assert_eq!(outcome.failed(), 0);
        assert!(outcome.succeeded().is_empty());
        assert!(outcome.into_result().is_ok());
    }

    #[test]
    fn failures_are_counted_and_successes_exposed() {
        let outcome = BatchOutcome {
            results: vec![
                result("m1", ItemOutcome::Success(BookedDocument { id: "d1".into() })),
                result(
                    "m2",
                    ItemOutcome::Error(ItemError::Validation(ValidationError::NoLineItems)),
                ),
                result("m3", ItemOutcome::Neutral),
                result("m4", ItemOutcome::Error(ItemError::Cancelled)),
            ],
        };

        let stages: Vec<_> = outcome.failures().map(|(_, e)| e.stage()).collect();
        assert_eq!(stages, ["validate", "cancelled"]);

        match outcome.into_result() {
            Err(BatchError::ItemFailures {
                failed,
                total,
                succeeded,
            }) => {
                assert_eq!(failed, 2);
                assert_eq!(total, 4);
                assert_eq!(succeeded, ["m1"]);
            }
            other => panic!("expected ItemFailures, got {other:?}"),
        }
    }
}
