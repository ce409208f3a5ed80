//! Invoice booking pipeline.
//!
//! Every batch flows through:
//! 1. `Scheduler` fetches items newer than the watermark via `ItemFetcher`
//! 2. `Dispatcher` fans them out under a concurrency cap
//! 3. `InvoicePipeline` classifies, validates, resolves the party, applies
//!    tax treatment and books each item
//! 4. `BatchOutcome` aggregates results; the watermark advances

pub mod dispatcher;
pub mod outcome;
pub mod party;
pub mod processor;
pub mod scheduler;
pub mod tax;
pub mod types;
pub mod validation;

pub use dispatcher::{Dispatcher, ItemDisposition, ItemHandler};
pub use outcome::{BatchOutcome, ItemOutcome, ItemResult};
pub use processor::InvoicePipeline;
pub use scheduler::{Scheduler, SchedulerHandle};
pub use tax::{TaxRate, TaxRateTable};
