//! Shared types and external contracts for the booking pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BookkeepingError, FetchError, LlmError};
use crate::pipeline::tax::TaxRate;

// ── Candidate item ──────────────────────────────────────────────────

/// A binary attachment carried by a candidate item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// File name from the MIME headers, if any.
    pub name: Option<String>,
    /// MIME type, e.g. "application/pdf".
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl Attachment {
    /// True if the bytes carry a PDF signature.
    pub fn is_pdf(&self) -> bool {
        self.data.len() > 4 && self.data.starts_with(b"%PDF")
    }
}

/// One unit of work fetched from the mail source.
///
/// Immutable once fetched; owned by the batch that fetched it.
#[derive(Debug, Clone)]
pub struct CandidateItem {
    /// Mail-source message id.
    pub id: String,
    /// Sender address (or display string when no address is present).
    pub sender: String,
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    pub attachments: Vec<Attachment>,
    /// When the mail source received the message.
    pub received_at: DateTime<Utc>,
}

// ── Extraction result ───────────────────────────────────────────────

/// Output of the classification stage.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionResult {
    /// Not an invoice. The item is handled with a neutral outcome.
    NotRelevant,
    /// An invoice with its extracted fields.
    Relevant(InvoicePayload),
}

/// Fields extracted from an invoice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvoicePayload {
    pub company_name: String,
    pub invoice_number: String,
    pub invoice_date: String,
    pub due_date: String,
    pub items: Vec<LineItem>,
    pub total_amount: Decimal,
    pub tax_amount: Decimal,
    pub contact_info: ContactInfo,
    /// Dutch Chamber of Commerce number (8 digits).
    pub kvk_number: String,
    /// VAT identifier, e.g. "NL123456789B01".
    pub vat_number: String,
}

/// One invoice line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineItem {
    pub description: String,
    pub amount: Decimal,
    /// Percentage, e.g. 21 for 21%.
    pub tax_rate: Decimal,
}

/// Contact and address block of the issuing party.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactInfo {
    pub name: String,
    pub email: String,
    pub street: String,
    pub city: String,
    pub zipcode: String,
    /// ISO 3166-1 alpha-2 code.
    pub country: String,
}

// ── Bookkeeping records ─────────────────────────────────────────────

/// A counterparty record as returned by the bookkeeping backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub id: String,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub tax_number: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub zipcode: Option<String>,
}

impl Party {
    pub fn country_code(&self) -> &str {
        self.country.as_deref().unwrap_or("")
    }

    /// True if the party carries a non-blank tax number.
    pub fn has_tax_number(&self) -> bool {
        self.tax_number
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty())
    }
}

/// Payload for creating a party.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NewParty {
    pub company_name: String,
    pub email: String,
    pub customer_id: String,
    pub tax_number: String,
    pub address: String,
    pub city: String,
    pub country: String,
    pub zipcode: String,
}

impl NewParty {
    /// Build a creation payload from an extracted invoice.
    pub fn from_invoice(invoice: &InvoicePayload) -> Self {
        let contact = &invoice.contact_info;
        Self {
            company_name: invoice.company_name.clone(),
            email: contact.email.clone(),
            customer_id: invoice.kvk_number.clone(),
            tax_number: invoice.vat_number.clone(),
            address: contact.street.clone(),
            city: contact.city.clone(),
            country: contact.country.clone(),
            zipcode: contact.zipcode.clone(),
        }
    }
}

/// A purchase invoice ready to be booked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PurchaseInvoice {
    pub contact_id: String,
    pub reference: String,
    pub date: String,
    pub due_date: String,
    #[serde(rename = "details_attributes")]
    pub details: Vec<DocumentLine>,
}

/// A tax-resolved invoice line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentLine {
    pub description: String,
    pub price: Decimal,
    pub tax_rate_id: String,
}

/// Confirmation that a document was booked.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BookedDocument {
    pub id: String,
}

/// Filter for listing tax rates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxRateFilter {
    pub tax_rate_type: String,
    pub active: bool,
}

impl Default for TaxRateFilter {
    fn default() -> Self {
        Self {
            tax_rate_type: "purchase_invoice".to_string(),
            active: true,
        }
    }
}

impl TaxRateFilter {
    /// Render as a backend filter expression, e.g. `tax_rate_type:purchase_invoice,active:true`.
    pub fn to_filter_expr(&self) -> String {
        format!(
            "tax_rate_type:{},active:{}",
            self.tax_rate_type, self.active
        )
    }
}

// ── External contracts ──────────────────────────────────────────────

/// Mail source: retrieves candidate items newer than a time bound.
#[async_trait]
pub trait ItemFetcher: Send + Sync {
    /// Source name for logging (e.g. "gmail").
    fn name(&self) -> &str;

    /// Fetch items received strictly after `after`, oldest first.
    async fn fetch_since(&self, after: DateTime<Utc>) -> Result<Vec<CandidateItem>, FetchError>;
}

/// Extraction model: decides relevance and extracts invoice fields.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Model identifier, for logging.
    fn model_name(&self) -> &str {
        "unknown"
    }

    async fn classify(
        &self,
        body: &str,
        attachments: &[Attachment],
    ) -> Result<ExtractionResult, LlmError>;
}

/// Bookkeeping backend.
#[async_trait]
pub trait Bookkeeper: Send + Sync {
    /// Search parties by free-text query (company name).
    async fn search_parties(&self, query: &str) -> Result<Vec<Party>, BookkeepingError>;

    async fn create_party(&self, party: &NewParty) -> Result<Party, BookkeepingError>;

    /// Book a purchase invoice. Any non-2xx answer is an error.
    async fn create_document(
        &self,
        invoice: &PurchaseInvoice,
    ) -> Result<BookedDocument, BookkeepingError>;

    async fn list_tax_rates(&self, filter: &TaxRateFilter)
    -> Result<Vec<TaxRate>, BookkeepingError>;
}
