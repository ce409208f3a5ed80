//! Configuration types, read from the environment.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::bookkeeping::DEFAULT_MONEYBIRD_BASE_URL;
use crate::channels::gmail::DEFAULT_GMAIL_API_BASE;
use crate::error::ConfigError;
use crate::llm::{DEFAULT_MODEL, DEFAULT_OPENAI_BASE_URL, LlmConfig};
use crate::pipeline::dispatcher::DEFAULT_CONCURRENCY;

/// Moneybird administration access.
#[derive(Debug, Clone)]
pub struct MoneybirdConfig {
    pub token: SecretString,
    pub administration_id: String,
    /// Operating country of the administration (ISO alpha-2).
    pub country: String,
    pub base_url: String,
}

/// Gmail mail source.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    /// Google Cloud OAuth client credentials JSON.
    pub credentials_file: PathBuf,
    /// Only messages carrying this label are fetched.
    pub label: String,
    pub api_base: String,
}

/// Polling and concurrency settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Maximum items processed at once within a batch.
    pub concurrency: usize,
    /// Watermark to start from when none is persisted. Defaults to startup time.
    pub start_from: Option<DateTime<Utc>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300), // 5 minutes
            concurrency: DEFAULT_CONCURRENCY,
            start_from: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub moneybird: MoneybirdConfig,
    pub gmail: GmailConfig,
    pub scheduler: SchedulerConfig,
    pub db_path: PathBuf,
    /// Directory for daily-rolling log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Read and validate configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let llm = LlmConfig {
            api_key: SecretString::from(env.required("OPENAI_API_KEY")?),
            model: env.or("INBOX_BOOKS_MODEL", DEFAULT_MODEL),
            base_url: env.or("OPENAI_BASE_URL", DEFAULT_OPENAI_BASE_URL),
        };

        let country = env.or("MONEYBIRD_COUNTRY", "NL").to_ascii_uppercase();
        if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ConfigError::InvalidValue {
                key: "MONEYBIRD_COUNTRY".into(),
                message: format!("expected a two-letter country code, got {country:?}"),
            });
        }
        let moneybird = MoneybirdConfig {
            token: SecretString::from(env.required("MONEYBIRD_TOKEN")?),
            administration_id: env.required("MONEYBIRD_ADMIN_ID")?,
            country,
            base_url: env.or("MONEYBIRD_BASE_URL", DEFAULT_MONEYBIRD_BASE_URL),
        };

        let credentials_file = PathBuf::from(env.required("GMAIL_CREDENTIALS_FILE")?);
        if !credentials_file.is_file() {
            return Err(ConfigError::FileNotFound {
                key: "GMAIL_CREDENTIALS_FILE".into(),
                path: credentials_file.display().to_string(),
            });
        }
        let gmail = GmailConfig {
            credentials_file,
            label: env.required("GMAIL_SEARCH_LABEL")?,
            api_base: env.or("GMAIL_API_BASE", DEFAULT_GMAIL_API_BASE),
        };

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            poll_interval: Duration::from_secs(env.positive(
                "INBOX_BOOKS_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            concurrency: env.positive("INBOX_BOOKS_CONCURRENCY", defaults.concurrency as u64)?
                as usize,
            start_from: env
                .optional("INBOX_BOOKS_START_FROM")
                .map(|raw| {
                    DateTime::parse_from_rfc3339(&raw)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| ConfigError::InvalidValue {
                            key: "INBOX_BOOKS_START_FROM".into(),
                            message: format!("{raw:?} is not RFC 3339: {e}"),
                        })
                })
                .transpose()?,
        };

        Ok(Self {
            llm,
            moneybird,
            gmail,
            scheduler,
            db_path: PathBuf::from(env.or("INBOX_BOOKS_DB_PATH", "./data/inbox-books.db")),
            log_dir: env.optional("INBOX_BOOKS_LOG_DIR").map(PathBuf::from),
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn positive(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        let Some(raw) = self.optional(key) else {
            return Ok(default);
        };
        match raw.parse::<u64>() {
            Ok(n) if n >= 1 => Ok(n),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a whole number of at least 1, got {raw:?}"),
            }),
        }
    }
}
