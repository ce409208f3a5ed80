//! Error types for inbox-books.

use std::time::Duration;

use reqwest::StatusCode;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("File not found for {key}: {path}")]
    FileNotFound { key: String, path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mail-source errors. Any of these aborts the whole batch.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Mail source authentication failed: {0}")]
    Auth(String),

    #[error("Mail source returned HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("Mail source request failed: {0}")]
    Request(String),

    #[error("Failed to decode message {id}: {reason}")]
    Decode { id: String, reason: String },

    #[error("Token store error: {0}")]
    TokenStore(#[from] DatabaseError),
}

/// Extraction model errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Bookkeeping backend errors.
#[derive(Debug, thiserror::Error)]
pub enum BookkeepingError {
    #[error("Bookkeeping backend returned HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("Bookkeeping request failed: {0}")]
    Request(String),

    #[error("Failed to decode bookkeeping response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for BookkeepingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Structural validation failures of an extracted invoice.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("company name is required")]
    MissingPartyName,

    #[error("invoice number is required")]
    MissingDocumentNumber,

    #[error("invalid total amount: {0}")]
    NonPositiveTotal(String),

    #[error("at least one invoice item is required")]
    NoLineItems,

    #[error("invalid KVK number format: {0}")]
    InvalidRegistryId(String),

    #[error("invalid country code: {0}")]
    InvalidCountryCode(String),

    #[error("invalid item amount: {0}")]
    NonPositiveItemAmount(String),

    #[error("invalid tax rate: {0}")]
    NegativeTaxRate(String),

    #[error("total amount ({total}) does not match sum of items ({sum})")]
    TotalMismatch { total: String, sum: String },

    #[error("sum of item amounts overflows at item {0}")]
    AmountOverflow(usize),
}

/// Per-item pipeline failure. Contained by the dispatcher; never aborts siblings.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error("classification failed: {0}")]
    Classification(#[from] LlmError),

    #[error("invoice validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("party resolution failed: {0}")]
    PartyResolution(BookkeepingError),

    #[error("tax treatment failed: {0}")]
    TaxTreatment(String),

    #[error("booking failed: {0}")]
    Booking(BookkeepingError),

    #[error("cancelled before completion")]
    Cancelled,

    #[error("pipeline panicked: {0}")]
    Panicked(String),
}

impl ItemError {
    /// Short stage label for logging and the failure log.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Classification(_) => "classify",
            Self::Validation(_) => "validate",
            Self::PartyResolution(_) => "resolve_party",
            Self::TaxTreatment(_) => "tax",
            Self::Booking(_) => "book",
            Self::Cancelled => "cancelled",
            Self::Panicked(_) => "panicked",
        }
    }
}

/// Watermark persistence failure. Never swallowed.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to persist watermark: {0}")]
    Store(#[from] DatabaseError),

    #[error("stored watermark is not a valid RFC 3339 timestamp: {0}")]
    Corrupt(String),
}

/// Batch-level failure reported by the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("failed to fetch items: {0}")]
    Fetch(#[from] FetchError),

    #[error("{0}")]
    Persistence(#[from] PersistenceError),

    #[error("batch cancelled before completion")]
    Cancelled,

    #[error("encountered {failed} errors while processing {total} items")]
    ItemFailures {
        failed: usize,
        total: usize,
        /// Ids of the items that were booked successfully.
        succeeded: Vec<String>,
    },
}
