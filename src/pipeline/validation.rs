//! Structural validation of extracted invoices.
//!
//! Pure checks, no I/O. The only mutation is upper-casing the country code,
//! so validating an already-validated payload is a no-op.

use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;

use crate::error::ValidationError;
use crate::pipeline::types::InvoicePayload;

static KVK_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8}$").expect("static KVK regex"));

/// Validate an extracted invoice, normalizing the country code in place.
///
/// Money is compared exactly: the line-item amounts must sum to the declared
/// total with zero tolerance.
pub fn validate_invoice(invoice: &mut InvoicePayload) -> Result<(), ValidationError> {
    if invoice.company_name.trim().is_empty() {
        return Err(ValidationError::MissingPartyName);
    }

    if invoice.invoice_number.trim().is_empty() {
        return Err(ValidationError::MissingDocumentNumber);
    }

    if invoice.total_amount <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveTotal(
            invoice.total_amount.to_string(),
        ));
    }

    if invoice.items.is_empty() {
        return Err(ValidationError::NoLineItems);
    }

    if !invoice.kvk_number.is_empty() && !KVK_PATTERN.is_match(&invoice.kvk_number) {
        return Err(ValidationError::InvalidRegistryId(
            invoice.kvk_number.clone(),
        ));
    }

    let country = &mut invoice.contact_info.country;
    if !country.is_empty() {
        if country.chars().count() != 2 {
            return Err(ValidationError::InvalidCountryCode(country.clone()));
        }
        *country = country.to_uppercase();
    }

    let mut sum = Decimal::ZERO;
    for (i, item) in invoice.items.iter().enumerate() {
        if item.amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveItemAmount(
                item.amount.to_string(),
            ));
        }
        if item.tax_rate < Decimal::ZERO {
            return Err(ValidationError::NegativeTaxRate(item.tax_rate.to_string()));
        }
        sum = sum
            .checked_add(item.amount)
            .ok_or(ValidationError::AmountOverflow(i + 1))?;
    }

    if sum != invoice.total_amount {
        return Err(ValidationError::TotalMismatch {
            total: invoice.total_amount.to_string(),
            sum: sum.to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{ContactInfo, LineItem};
    use rust_decimal_macros::dec;

    fn item(amount: Decimal, tax_rate: Decimal) -> LineItem {
        LineItem {
            description: "Consulting".into(),
            amount,
            tax_rate,
        }
    }

    fn valid_invoice() -> InvoicePayload {
        InvoicePayload {
            company_name: "Acme BV".into(),
            invoice_number: "2026-0042".into(),
            invoice_date: "2026-03-01".into(),
            due_date: "2026-03-31".into(),
            items: vec![item(dec!(100.00), dec!(21)), item(dec!(25.50), dec!(9))],
            total_amount: dec!(125.50),
            tax_amount: dec!(23.30),
            contact_info: ContactInfo {
                country: "nl".into(),
                ..Default::default()
            },
            kvk_number: "12345678".into(),
            vat_number: "NL001234567B01".into(),
        }
    }

    #[test]
    fn oversized_amounts_are_rejected_not_panicking() {
        let huge = Decimal::MAX - dec!(1);
        let mut invoice = valid_invoice();
        invoice.items = vec![item(huge, dec!(21)), item(huge, dec!(21))];
        invoice.total_amount = Decimal::MAX;

        assert!(matches!(
            validate_invoice(&mut invoice),
            Err(ValidationError::AmountOverflow(2))
        ));
    }

    #[test]
    fn valid_invoice_passes_and_normalizes_country() {
        let mut invoice = valid_invoice();
        validate_invoice(&mut invoice).unwrap();
        assert_eq!(invoice.contact_info.country, "NL");
    }

    #[test]
    fn validation_is_idempotent() {
        let mut once = valid_invoice();
        validate_invoice(&mut once).unwrap();
        let mut twice = once.clone();
        validate_invoice(&mut twice).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_company_name_fails() {
        let mut invoice = valid_invoice();
        invoice.company_name = "  ".into();
        assert_eq!(
            validate_invoice(&mut invoice),
            Err(ValidationError::MissingPartyName)
        );
    }

    #[test]
    fn missing_invoice_number_fails() {
        let mut invoice = valid_invoice();
        invoice.invoice_number.clear();
        assert_eq!(
            validate_invoice(&mut invoice),
            Err(ValidationError::MissingDocumentNumber)
        );
    }

    #[test]
    fn zero_total_fails() {
        let mut invoice = valid_invoice();
        invoice.total_amount = Decimal::ZERO;
        assert!(matches!(
            validate_invoice(&mut invoice),
            Err(ValidationError::NonPositiveTotal(_))
        ));
    }

    #[test]
    fn no_items_fails() {
        let mut invoice = valid_invoice();
        invoice.items.clear();
        assert_eq!(
            validate_invoice(&mut invoice),
            Err(ValidationError::NoLineItems)
        );
    }

    #[test]
    fn kvk_must_be_eight_digits() {
        for bad in ["1234567", "123456789", "1234567a", " 12345678"] {
            let mut invoice = valid_invoice();
            invoice.kvk_number = bad.into();
            assert!(
                matches!(
                    validate_invoice(&mut invoice),
                    Err(ValidationError::InvalidRegistryId(_))
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn empty_kvk_is_allowed() {
        let mut invoice = valid_invoice();
        invoice.kvk_number.clear();
        assert!(validate_invoice(&mut invoice).is_ok());
    }

    #[test]
    fn country_must_be_two_characters() {
        let mut invoice = valid_invoice();
        invoice.contact_info.country = "NLD".into();
        assert_eq!(
            validate_invoice(&mut invoice),
            Err(ValidationError::InvalidCountryCode("NLD".into()))
        );
    }

    #[test]
    fn empty_country_is_allowed() {
        let mut invoice = valid_invoice();
        invoice.contact_info.country.clear();
        assert!(validate_invoice(&mut invoice).is_ok());
        assert!(invoice.contact_info.country.is_empty());
    }

    #[test]
    fn non_positive_item_amount_fails() {
        let mut invoice = valid_invoice();
        invoice.items = vec![item(dec!(130.00), dec!(21)), item(dec!(-4.50), dec!(21))];
        assert!(matches!(
            validate_invoice(&mut invoice),
            Err(ValidationError::NonPositiveItemAmount(_))
        ));
    }

    #[test]
    fn negative_tax_rate_fails() {
        let mut invoice = valid_invoice();
        invoice.items[1].tax_rate = dec!(-1);
        assert!(matches!(
            validate_invoice(&mut invoice),
            Err(ValidationError::NegativeTaxRate(_))
        ));
    }

    #[test]
    fn zero_tax_rate_is_allowed() {
        let mut invoice = valid_invoice();
        invoice.items[0].tax_rate = Decimal::ZERO;
        assert!(validate_invoice(&mut invoice).is_ok());
    }

    #[test]
    fn exact_sum_passes_and_any_perturbation_fails() {
        for delta in [dec!(0.01), dec!(-0.01), dec!(0.0001), dec!(10)] {
            for index in 0..2 {
                let mut invoice = valid_invoice();
                assert!(validate_invoice(&mut invoice.clone()).is_ok());

                invoice.items[index].amount += delta;
                assert!(
                    matches!(
                        validate_invoice(&mut invoice),
                        Err(ValidationError::TotalMismatch { .. })
                    ),
                    "delta {delta} on item {index} should fail"
                );
            }
        }
    }

    #[test]
    fn trailing_zero_scale_does_not_matter() {
        let mut invoice = valid_invoice();
        invoice.total_amount = dec!(125.5000);
        assert!(validate_invoice(&mut invoice).is_ok());
    }

    #[test]
    fn mismatch_reason_mentions_both_amounts() {
        let mut invoice = valid_invoice();
        invoice.total_amount = dec!(200);
        let err = validate_invoice(&mut invoice).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("200"));
        assert!(msg.contains("125.50"));
    }
}
