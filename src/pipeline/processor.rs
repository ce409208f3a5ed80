//! Invoice pipeline: the per-item work run by the dispatcher.
//!
//! Flow, stopping at the first failure:
//! 1. Classify: extraction model decides relevance and extracts fields
//! 2. Validate: structural checks, country normalization
//! 3. Resolve party: search by name, create when missing
//! 4. Tax treatment: resolve rate ids, reverse charge for foreign EU parties
//! 5. Book: create the purchase invoice
//!
//! Nothing is retried here. A failed item is reported to the batch and left
//! for manual follow-up.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::ItemError;
use crate::pipeline::dispatcher::{ItemDisposition, ItemHandler};
use crate::pipeline::party::PartyResolver;
use crate::pipeline::tax::{TaxRateTable, apply_tax_treatment, should_shift_vat};
use crate::pipeline::types::{
    Bookkeeper, CandidateItem, ExtractionResult, Extractor, PurchaseInvoice,
};
use crate::pipeline::validation::validate_invoice;

pub struct InvoicePipeline {
    extractor: Arc<dyn Extractor>,
    bookkeeper: Arc<dyn Bookkeeper>,
    parties: PartyResolver,
    tax_rates: Arc<TaxRateTable>,
    /// Operating country of the administration, e.g. "NL".
    home_country: String,
}

impl InvoicePipeline {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        bookkeeper: Arc<dyn Bookkeeper>,
        tax_rates: Arc<TaxRateTable>,
        home_country: impl Into<String>,
    ) -> Self {
        Self {
            extractor,
            parties: PartyResolver::new(Arc::clone(&bookkeeper)),
            bookkeeper,
            tax_rates,
            home_country: home_country.into(),
        }
    }
}

#[async_trait]
impl ItemHandler for InvoicePipeline {
    async fn handle(&self, item: &CandidateItem) -> Result<ItemDisposition, ItemError> {
        info!(
            item_id = %item.id,
            sender = %item.sender,
            subject = %item.subject,
            attachments = item.attachments.len(),
            "Processing item"
        );

        // Stage 1: classify
        let mut invoice = match self.extractor.classify(&item.body, &item.attachments).await? {
            ExtractionResult::NotRelevant => {
                debug!(item_id = %item.id, "Not an invoice, skipping");
                return Ok(ItemDisposition::NotRelevant);
            }
            ExtractionResult::Relevant(invoice) => invoice,
        };

        // Stage 2: validate
        validate_invoice(&mut invoice)?;

        // Stage 3: resolve party
        let party = self
            .parties
            .resolve(&invoice)
            .await
            .map_err(ItemError::PartyResolution)?;

        // Stage 4: tax treatment
        let shift_vat = should_shift_vat(&party, &self.home_country);
        if shift_vat {
            info!(
                item_id = %item.id,
                country = party.country_code(),
                "VAT shifted (EU B2B transaction)"
            );
        }
        let details = apply_tax_treatment(&invoice.items, &self.tax_rates, shift_vat)?;

        // Stage 5: book
        let document = PurchaseInvoice {
            contact_id: party.id.clone(),
            reference: invoice.invoice_number.clone(),
            date: invoice.invoice_date.clone(),
            due_date: invoice.due_date.clone(),
            details,
        };
        let booked = self
            .bookkeeper
            .create_document(&document)
            .await
            .map_err(ItemError::Booking)?;

        info!(
            item_id = %item.id,
            document_id = %booked.id,
            company = %invoice.company_name,
            total = %invoice.total_amount,
            "Booked purchase invoice"
        );
        Ok(ItemDisposition::Booked(booked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use reqwest::StatusCode;
    use rust_decimal_macros::dec;

    use crate::error::{BookkeepingError, LlmError, ValidationError};
    use crate::pipeline::tax::TaxRate;
    use crate::pipeline::types::{
        Attachment, BookedDocument, ContactInfo, InvoicePayload, LineItem, NewParty, Party,
        TaxRateFilter,
    };

    // ── Mocks ───────────────────────────────────────────────────────

    struct FixedExtractor(Result<ExtractionResult, String>);

    #[async_trait]
    impl Extractor for FixedExtractor {
        async fn classify(
            &self,
            _body: &str,
            _attachments: &[Attachment],
        ) -> Result<ExtractionResult, LlmError> {
            self.0.clone().map_err(|reason| LlmError::RequestFailed {
                provider: "mock".into(),
                reason,
            })
        }
    }

    #[derive(Default)]
    struct MockBookkeeper {
        existing: Vec<Party>,
        reject_booking: bool,
        searches: AtomicUsize,
        created_parties: Mutex<Vec<NewParty>>,
        documents: Mutex<Vec<PurchaseInvoice>>,
    }

    #[async_trait]
    impl Bookkeeper for MockBookkeeper {
        async fn search_parties(&self, _query: &str) -> Result<Vec<Party>, BookkeepingError> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            Ok(self.existing.clone())
        }

        async fn create_party(&self, party: &NewParty) -> Result<Party, BookkeepingError> {
            self.created_parties.lock().unwrap().push(party.clone());
            Ok(Party {
                id: "new-party".into(),
                company_name: Some(party.company_name.clone()),
                country: Some(party.country.clone()),
                tax_number: Some(party.tax_number.clone()),
                ..Default::default()
            })
        }

        async fn create_document(
            &self,
            invoice: &PurchaseInvoice,
        ) -> Result<BookedDocument, BookkeepingError> {
            if self.reject_booking {
                return Err(BookkeepingError::Http {
                    status: StatusCode::UNPROCESSABLE_ENTITY,
                    body: r#"{"error":"reference already taken"}"#.into(),
                });
            }
            self.documents.lock().unwrap().push(invoice.clone());
            Ok(BookedDocument { id: "doc-1".into() })
        }

        async fn list_tax_rates(
            &self,
            _filter: &TaxRateFilter,
        ) -> Result<Vec<TaxRate>, BookkeepingError> {
            Ok(vec![])
        }
    }

    fn rates() -> Arc<TaxRateTable> {
        let rate = |id: &str, p| TaxRate {
            id: id.into(),
            name: String::new(),
            percentage: p,
            tax_rate_type: "purchase_invoice".into(),
            active: true,
        };
        Arc::new(TaxRateTable::new([
            rate("A", dec!(0)),
            rate("B", dec!(9)),
            rate("C", dec!(21)),
        ]))
    }

    fn invoice(country: &str) -> InvoicePayload {
        InvoicePayload {
            company_name: "Acme GmbH".into(),
            invoice_number: "RE-2026-7".into(),
            invoice_date: "2026-02-01".into(),
            due_date: "2026-03-01".into(),
            items: vec![
                LineItem {
                    description: "Licence".into(),
                    amount: dec!(100),
                    tax_rate: dec!(21),
                },
                LineItem {
                    description: "Support".into(),
                    amount: dec!(20),
                    tax_rate: dec!(20),
                },
            ],
            total_amount: dec!(120),
            tax_amount: dec!(25),
            contact_info: ContactInfo {
                country: country.into(),
                ..Default::default()
            },
            vat_number: "DE123456789".into(),
            ..Default::default()
        }
    }

    fn item() -> CandidateItem {
        CandidateItem {
            id: "msg-1".into(),
            sender: "billing@acme.de".into(),
            subject: "Rechnung".into(),
            body: "Invoice attached".into(),
            attachments: vec![],
            received_at: Utc::now(),
        }
    }

    fn pipeline(
        extraction: Result<ExtractionResult, String>,
        bookkeeper: Arc<MockBookkeeper>,
    ) -> InvoicePipeline {
        InvoicePipeline::new(
            Arc::new(FixedExtractor(extraction)),
            bookkeeper,
            rates(),
            "NL",
        )
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn not_relevant_is_neutral_and_touches_nothing() {
        let books = Arc::new(MockBookkeeper::default());
        let result = pipeline(Ok(ExtractionResult::NotRelevant), books.clone())
            .handle(&item())
            .await
            .unwrap();

        assert_eq!(result, ItemDisposition::NotRelevant);
        assert_eq!(books.searches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn classification_failure_is_item_error() {
        let books = Arc::new(MockBookkeeper::default());
        let err = pipeline(Err("connection reset".into()), books)
            .handle(&item())
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "classify");
    }

    #[tokio::test]
    async fn validation_failure_stops_before_bookkeeping() {
        let mut bad = invoice("DE");
        bad.total_amount = dec!(121);
        let books = Arc::new(MockBookkeeper::default());

        let err = pipeline(Ok(ExtractionResult::Relevant(bad)), books.clone())
            .handle(&item())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ItemError::Validation(ValidationError::TotalMismatch { .. })
        ));
        assert_eq!(books.searches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn new_domestic_party_is_created_and_rates_resolved() {
        let books = Arc::new(MockBookkeeper::default());
        let result = pipeline(
            Ok(ExtractionResult::Relevant(invoice("nl"))),
            books.clone(),
        )
        .handle(&item())
        .await
        .unwrap();

        assert_eq!(
            result,
            ItemDisposition::Booked(BookedDocument { id: "doc-1".into() })
        );

        let created = books.created_parties.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].country, "NL");

        let docs = books.documents.lock().unwrap();
        let doc = &docs[0];
        assert_eq!(doc.contact_id, "new-party");
        assert_eq!(doc.reference, "RE-2026-7");
        let ids: Vec<_> = doc.details.iter().map(|d| d.tax_rate_id.as_str()).collect();
        assert_eq!(ids, ["C", "C"]);
    }

    #[tokio::test]
    async fn foreign_eu_party_with_tax_number_is_vat_shifted() {
        let books = Arc::new(MockBookkeeper {
            existing: vec![Party {
                id: "existing-de".into(),
                company_name: Some("Acme GmbH".into()),
                country: Some("DE".into()),
                tax_number: Some("DE123456789".into()),
                ..Default::default()
            }],
            ..Default::default()
        });

        pipeline(
            Ok(ExtractionResult::Relevant(invoice("DE"))),
            books.clone(),
        )
        .handle(&item())
        .await
        .unwrap();

        assert!(books.created_parties.lock().unwrap().is_empty());
        let docs = books.documents.lock().unwrap();
        assert_eq!(docs[0].contact_id, "existing-de");
        assert!(docs[0].details.iter().all(|d| d.tax_rate_id == "A"));
    }

    #[tokio::test]
    async fn booking_rejection_carries_status_and_body() {
        let books = Arc::new(MockBookkeeper {
            reject_booking: true,
            ..Default::default()
        });
        let err = pipeline(Ok(ExtractionResult::Relevant(invoice("NL"))), books)
            .handle(&item())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), "book");
        let msg = err.to_string();
        assert!(msg.contains("422"));
        assert!(msg.contains("reference already taken"));
    }
}
