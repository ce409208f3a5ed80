//! Persistence layer: libSQL-backed process state and item-failure log.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;
pub mod watermark;

pub use libsql_backend::LibSqlBackend;
pub use traits::{FailureLog, ItemFailure, StateStore};
pub use watermark::WatermarkStore;
