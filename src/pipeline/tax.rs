//! Tax-rate resolution and reverse-charge (VAT shift) treatment.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ItemError;
use crate::pipeline::types::{DocumentLine, LineItem, Party};

/// EU member states (ISO 3166-1 alpha-2).
const EU_COUNTRIES: [&str; 27] = [
    "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU", "IE", "IT", "LV",
    "LT", "LU", "MT", "NL", "PL", "PT", "RO", "SK", "SI", "ES", "SE",
];

pub fn is_eu_country(code: &str) -> bool {
    EU_COUNTRIES.contains(&code)
}

/// A tax rate as configured in the bookkeeping backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxRate {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Percentage, sent by the backend as a string ("21.0").
    #[serde(with = "rust_decimal::serde::str")]
    pub percentage: Decimal,
    #[serde(default)]
    pub tax_rate_type: String,
    #[serde(default)]
    pub active: bool,
}

/// Read-only rate table, loaded once at startup and shared across workers.
#[derive(Debug, Clone, Default)]
pub struct TaxRateTable {
    /// Sorted by percentage ascending.
    rates: Vec<(Decimal, String)>,
}

impl TaxRateTable {
    pub fn new(rates: impl IntoIterator<Item = TaxRate>) -> Self {
        let mut rates: Vec<(Decimal, String)> = rates
            .into_iter()
            .map(|r| (r.percentage.normalize(), r.id))
            .collect();
        rates.sort_by(|a, b| a.0.cmp(&b.0));
        // Keep the first id per percentage.
        rates.dedup_by(|b, a| a.0 == b.0);
        Self { rates }
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Resolve a rate id: exact match, else the closest percentage by absolute
    /// difference. Ties go to the smaller percentage.
    pub fn resolve(&self, percentage: Decimal) -> Option<&str> {
        // Sorted ascending, so `min_by_key` keeps the smaller percentage on ties.
        self.rates
            .iter()
            .min_by_key(|(rate, _)| (*rate - percentage).abs())
            .map(|(_, id)| id.as_str())
    }

    /// The rate used for reverse-charged lines: whatever resolves for 0%.
    pub fn reverse_charge_id(&self) -> Option<&str> {
        self.resolve(Decimal::ZERO)
    }
}

/// True if invoices from `party` are reverse-charged: EU party, foreign to
/// the operating country, with a tax number on record.
pub fn should_shift_vat(party: &Party, home_country: &str) -> bool {
    let country = party.country_code();
    is_eu_country(country) && !country.eq_ignore_ascii_case(home_country) && party.has_tax_number()
}

/// Map line items to tax-resolved document lines.
pub fn apply_tax_treatment(
    items: &[LineItem],
    table: &TaxRateTable,
    shift_vat: bool,
) -> Result<Vec<DocumentLine>, ItemError> {
    let shifted = if shift_vat {
        Some(table.reverse_charge_id().ok_or_else(|| {
            ItemError::TaxTreatment("no reverse-charge (0%) tax rate configured".into())
        })?)
    } else {
        None
    };

    items
        .iter()
        .map(|item| {
            let tax_rate_id = match shifted {
                Some(id) => id,
                None => table.resolve(item.tax_rate).ok_or_else(|| {
                    ItemError::TaxTreatment(format!(
                        "no tax rate available for {}%",
                        item.tax_rate
                    ))
                })?,
            };
            Ok(DocumentLine {
                description: item.description.clone(),
                price: item.amount,
                tax_rate_id: tax_rate_id.to_string(),
            })
        })
        .collect()
}
