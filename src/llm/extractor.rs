//! Invoice extraction over a rig completion model.
//!
//! The request asks for structured output matching a named JSON schema;
//! the reply is parsed leniently since models still wrap JSON in prose.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rig::OneOrMany;
use rig::client::CompletionClient;
use rig::completion::{CompletionError, CompletionModel};
use rig::message::{AssistantContent, DocumentMediaType, Message, UserContent};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::LlmConfig;
use crate::error::LlmError;
use crate::pipeline::types::{
    Attachment, ContactInfo, ExtractionResult, Extractor, InvoicePayload, LineItem,
};

const PROVIDER: &str = "openai";

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";

const SYSTEM_PROMPT: &str = "\
You are an invoice processing assistant. First determine if the content contains an invoice. \
If it does, extract the relevant information. Pay special attention to KVK (Chamber of Commerce) \
and BTW (VAT) numbers, which are often found in the header or footer of Dutch invoices. BTW \
numbers typically start with NL and KVK numbers are 8 digits.

Only include the additional fields if is_invoice is true.
Consider invoice indicators like: payment terms, invoice numbers, line items, tax amounts.
Parse the full address into separate components.
Use ISO 3166-1 alpha-2 codes for the country field.
Amounts are numbers without currency symbols; tax_rate is a percentage such as 21.
Dates are YYYY-MM-DD.";

/// Build an extractor on OpenAI's chat-completions API.
pub fn create_openai_extractor(config: &LlmConfig) -> Result<Arc<dyn Extractor>, LlmError> {
    use rig::providers::openai;

    let client: openai::Client = openai::Client::builder()
        .api_key(config.api_key.expose_secret())
        .base_url(&config.base_url)
        .build()
        .map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: format!("Failed to create OpenAI client: {e}"),
        })?;

    let model = client.completions_api().completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigExtractor::new(model, &config.model)))
}

/// Classifies and extracts invoices with any rig `CompletionModel`.
pub struct RigExtractor<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigExtractor<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

#[async_trait]
impl<M> Extractor for RigExtractor<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn classify(
        &self,
        body: &str,
        attachments: &[Attachment],
    ) -> Result<ExtractionResult, LlmError> {
        let response = self
            .model
            .completion_request(user_message(body, attachments)?)
            .preamble(SYSTEM_PROMPT.to_string())
            .additional_params(response_format())
            .send()
            .await
            .map_err(map_completion_error)?;

        let content: String = response
            .choice
            .into_iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text),
                _ => None,
            })
            .collect();
        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: PROVIDER.into(),
                reason: "completion has no text content".into(),
            });
        }

        debug!(model = %self.model_name, len = content.len(), "Extraction response received");
        parse_extraction(&content)
    }
}

/// rig folds HTTP failures into message text, so auth and rate limiting are
/// recognised by the provider's error codes.
fn map_completion_error(err: CompletionError) -> LlmError {
    let provider = PROVIDER.to_string();
    if matches!(
        err,
        CompletionError::JsonError(_) | CompletionError::ResponseError(_)
    ) {
        return LlmError::InvalidResponse {
            provider,
            reason: err.to_string(),
        };
    }

    let reason = err.to_string();
    let lower = reason.to_ascii_lowercase();
    if lower.contains("invalid_api_key") || lower.contains("incorrect api key") {
        LlmError::AuthFailed { provider }
    } else if lower.contains("rate_limit") || lower.contains("rate limit") {
        LlmError::RateLimited {
            provider,
            retry_after: None,
        }
    } else {
        LlmError::RequestFailed { provider, reason }
    }
}

// ── Request construction ────────────────────────────────────────────

fn response_format() -> Value {
    json!({
        "response_format": {
            "type": "json_schema",
            "json_schema": { "name": "invoice_schema", "schema": invoice_schema() },
        }
    })
}

/// Body text with non-PDF attachments inlined, then each PDF as a document.
fn user_message(body: &str, attachments: &[Attachment]) -> Result<Message, LlmError> {
    let mut parts = vec![UserContent::text(prompt_text(body, attachments))];
    parts.extend(
        pdf_documents(attachments)
            .into_iter()
            .map(|data| UserContent::document(data, Some(DocumentMediaType::PDF))),
    );
    let content = OneOrMany::many(parts).map_err(|e| LlmError::RequestFailed {
        provider: PROVIDER.into(),
        reason: e.to_string(),
    })?;
    Ok(Message::User { content })
}

fn prompt_text(body: &str, attachments: &[Attachment]) -> String {
    let mut text = format!("Email content:\n{body}\n\n");
    for (i, attachment) in attachments.iter().enumerate() {
        let n = i + 1;
        if attachment.is_pdf() {
            let name = attachment.name.as_deref().unwrap_or("unnamed");
            text.push_str(&format!("Attachment {n} is a PDF document ({name}), sent separately.\n\n"));
        } else if let Ok(inline) = std::str::from_utf8(&attachment.data) {
            text.push_str(&format!("Attachment {n} content:\n{inline}\n\n"));
        } else {
            text.push_str(&format!(
                "Attachment {n} content (base64):\n{}\n\n",
                STANDARD.encode(&attachment.data)
            ));
        }
    }
    text
}

/// Base64 payloads of the PDF attachments, in order.
fn pdf_documents(attachments: &[Attachment]) -> Vec<String> {
    attachments
        .iter()
        .filter(|a| a.is_pdf())
        .map(|a| STANDARD.encode(&a.data))
        .collect()
}

fn invoice_schema() -> Value {
    let string = json!({ "type": "string" });
    let number = json!({ "type": "number" });
    json!({
        "type": "object",
        "properties": {
            "is_invoice": { "type": "boolean" },
            "company_name": string,
            "invoice_number": string,
            "invoice_date": string,
            "due_date": string,
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "description": string,
                        "amount": number,
                        "tax_rate": number,
                    },
                    "required": ["description", "amount", "tax_rate"],
                },
            },
            "total_amount": number,
            "tax_amount": number,
            "contact_info": {
                "type": "object",
                "properties": {
                    "name": string,
                    "email": string,
                    "street": string,
                    "city": string,
                    "zipcode": string,
                    "country": string,
                },
            },
            "kvk_number": string,
            "vat_number": string,
        },
        "required": ["is_invoice"],
    })
}

// ── Response parsing ────────────────────────────────────────────────

/// Model output. Fields beyond `is_invoice` may be absent or null.
#[derive(Debug, Deserialize)]
struct WireInvoice {
    is_invoice: bool,
    company_name: Option<String>,
    invoice_number: Option<String>,
    invoice_date: Option<String>,
    due_date: Option<String>,
    items: Option<Vec<WireLineItem>>,
    total_amount: Option<Decimal>,
    tax_amount: Option<Decimal>,
    contact_info: Option<WireContact>,
    kvk_number: Option<String>,
    vat_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireLineItem {
    description: Option<String>,
    amount: Option<Decimal>,
    tax_rate: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct WireContact {
    name: Option<String>,
    email: Option<String>,
    street: Option<String>,
    city: Option<String>,
    zipcode: Option<String>,
    country: Option<String>,
}

impl From<WireInvoice> for InvoicePayload {
    fn from(w: WireInvoice) -> Self {
        let contact = w.contact_info.map(|c| ContactInfo {
            name: c.name.unwrap_or_default(),
            email: c.email.unwrap_or_default(),
            street: c.street.unwrap_or_default(),
            city: c.city.unwrap_or_default(),
            zipcode: c.zipcode.unwrap_or_default(),
            country: c.country.unwrap_or_default(),
        });
        Self {
            company_name: w.company_name.unwrap_or_default(),
            invoice_number: w.invoice_number.unwrap_or_default(),
            invoice_date: w.invoice_date.unwrap_or_default(),
            due_date: w.due_date.unwrap_or_default(),
            items: w
                .items
                .unwrap_or_default()
                .into_iter()
                .map(|i| LineItem {
                    description: i.description.unwrap_or_default(),
                    amount: i.amount.unwrap_or_default(),
                    tax_rate: i.tax_rate.unwrap_or_default(),
                })
                .collect(),
            total_amount: w.total_amount.unwrap_or_default(),
            tax_amount: w.tax_amount.unwrap_or_default(),
            contact_info: contact.unwrap_or_default(),
            kvk_number: w.kvk_number.unwrap_or_default(),
            vat_number: w.vat_number.unwrap_or_default(),
        }
    }
}

fn parse_extraction(content: &str) -> Result<ExtractionResult, LlmError> {
    let json = extract_json_object(content);
    let wire: WireInvoice =
        serde_json::from_str(&json).map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: format!("extraction is not valid invoice JSON: {e}"),
        })?;

    if !wire.is_invoice {
        return Ok(ExtractionResult::NotRelevant);
    }
    Ok(ExtractionResult::Relevant(wire.into()))
}

/// Extract a JSON object from text that may be wrapped in markdown fences
/// or surrounded by prose.
pub(crate) fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
