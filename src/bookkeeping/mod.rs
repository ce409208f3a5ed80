//! Bookkeeping backend adapters.

pub mod moneybird;

pub use moneybird::{DEFAULT_MONEYBIRD_BASE_URL, MoneybirdClient};
