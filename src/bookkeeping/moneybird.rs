//! Moneybird REST client (API v2).

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::BookkeepingError;
use crate::pipeline::tax::{TaxRate, TaxRateTable};
use crate::pipeline::types::{
    BookedDocument, Bookkeeper, NewParty, Party, PurchaseInvoice, TaxRateFilter,
};

pub const DEFAULT_MONEYBIRD_BASE_URL: &str = "https://moneybird.com/api/v2";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct ContactEnvelope<'a> {
    contact: &'a NewParty,
}

#[derive(Serialize)]
struct PurchaseInvoiceEnvelope<'a> {
    purchase_invoice: &'a PurchaseInvoice,
}

pub struct MoneybirdClient {
    http: reqwest::Client,
    /// `<base>/<administration id>`, no trailing slash.
    admin_url: String,
    token: SecretString,
}

impl MoneybirdClient {
    pub fn new(
        base_url: &str,
        administration_id: &str,
        token: SecretString,
    ) -> Result<Self, BookkeepingError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            admin_url: format!("{}/{administration_id}", base_url.trim_end_matches('/')),
            token,
        })
    }

    /// Load the purchase-invoice tax rates into the table the pipeline reads from.
    pub async fn load_tax_rates(&self) -> Result<TaxRateTable, BookkeepingError> {
        let rates = self.list_tax_rates(&TaxRateFilter::default()).await?;
        let table = TaxRateTable::new(rates);
        info!(count = table.len(), "Tax rates loaded");
        Ok(table)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.admin_url)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, BookkeepingError> {
        let resp = self
            .http
            .get(self.url(path))
            .bearer_auth(self.token.expose_secret())
            .query(query)
            .send()
            .await?;
        decode(resp).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BookkeepingError> {
        let resp = self
            .http
            .post(self.url(path))
            .bearer_auth(self.token.expose_secret())
            .json(body)
            .send()
            .await?;
        decode(resp).await
    }
}

/// Any non-2xx answer becomes an error carrying the status and body.
async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, BookkeepingError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(BookkeepingError::Http { status, body });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| BookkeepingError::Decode(e.to_string()))
}

#[async_trait]
impl Bookkeeper for MoneybirdClient {
    async fn search_parties(&self, query: &str) -> Result<Vec<Party>, BookkeepingError> {
        let parties: Vec<Party> = self.get("contacts.json", &[("query", query)]).await?;
        debug!(query, found = parties.len(), "Contact search");
        Ok(parties)
    }

    async fn create_party(&self, party: &NewParty) -> Result<Party, BookkeepingError> {
        let created: Party = self
            .post("contacts.json", &ContactEnvelope { contact: party })
            .await?;
        info!(contact_id = %created.id, company = %party.company_name, "Contact created");
        Ok(created)
    }

    async fn create_document(
        &self,
        invoice: &PurchaseInvoice,
    ) -> Result<BookedDocument, BookkeepingError> {
        self.post(
            "documents/purchase_invoices.json",
            &PurchaseInvoiceEnvelope {
                purchase_invoice: invoice,
            },
        )
        .await
    }

    async fn list_tax_rates(
        &self,
        filter: &TaxRateFilter,
    ) -> Result<Vec<TaxRate>, BookkeepingError> {
        self.get("tax_rates.json", &[("filter", filter.to_filter_expr().as_str())])
            .await
    }
}
