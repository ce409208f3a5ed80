//! Party resolution: search by name, create when missing.
//!
//! Search-then-create is serialized per normalized company name, so two
//! items for the same new party in one process create it once. Other
//! processes can still race; duplicates across processes are left to the
//! bookkeeping backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::error::BookkeepingError;
use crate::pipeline::types::{Bookkeeper, InvoicePayload, NewParty, Party};

type KeyLock = Arc<tokio::sync::Mutex<()>>;

pub struct PartyResolver {
    bookkeeper: Arc<dyn Bookkeeper>,
    locks: Mutex<HashMap<String, KeyLock>>,
}

impl PartyResolver {
    pub fn new(bookkeeper: Arc<dyn Bookkeeper>) -> Self {
        Self {
            bookkeeper,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Return the first party matching the invoice's company name, or create one.
    pub async fn resolve(&self, invoice: &InvoicePayload) -> Result<Party, BookkeepingError> {
        let lease = self.lease(normalize_party_name(&invoice.company_name));
        let _guard = lease.lock.lock().await;

        let found = self.bookkeeper.search_parties(&invoice.company_name).await?;
        if let Some(party) = found.into_iter().next() {
            debug!(party_id = %party.id, company = %invoice.company_name, "Using existing party");
            return Ok(party);
        }

        let party = self
            .bookkeeper
            .create_party(&NewParty::from_invoice(invoice))
            .await?;
        info!(party_id = %party.id, company = %invoice.company_name, "Created party");
        Ok(party)
    }

    fn lease(&self, key: String) -> KeyLease<'_> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = Arc::clone(locks.entry(key.clone()).or_default());
        KeyLease {
            resolver: self,
            key,
            lock,
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Holds one reference to a per-key lock; drops the map entry when the last
/// holder goes away.
struct KeyLease<'a> {
    resolver: &'a PartyResolver,
    key: String,
    lock: KeyLock,
}

impl Drop for KeyLease<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .resolver
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Map entry plus this lease.
        if locks
            .get(&self.key)
            .is_some_and(|l| Arc::strong_count(l) == 2)
        {
            locks.remove(&self.key);
        }
    }
}

/// Trimmed and lower-cased.
pub fn normalize_party_name(name: &str) -> String {
    name.trim().to_lowercase()
}
