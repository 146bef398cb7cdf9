use crate::models::InvoiceRequest;

/// Tolerance for comparing the declared total against the line sum. Amounts
/// are XOF (no minor units), so anything under half a franc is rounding.
const TOTAL_TOLERANCE: f64 = 0.5;

/// Pre-submit checks mirroring the DGI business rules that would otherwise
/// come back as a 400/422 rejection.
pub fn validate(invoice: &InvoiceRequest) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();

    if !is_valid_ifu(&invoice.issuer_ifu) {
        errs.push("issuerIFU must be exactly 13 digits".to_string());
    }

    if let Some(buyer_ifu) = &invoice.buyer_ifu {
        if !is_valid_ifu(buyer_ifu) {
            errs.push("buyerIFU must be exactly 13 digits".to_string());
        }
    }

    if invoice.items.is_empty() {
        errs.push("invoice must contain at least one line item".to_string());
    }

    for (idx, line) in invoice.items.iter().enumerate() {
        if line.label.trim().is_empty() {
            errs.push(format!("item {}: label is mandatory", idx + 1));
        }
        if line.qty <= 0.0 {
            errs.push(format!("item {}: quantity must be positive", idx + 1));
        }
        if line.unit_price < 0.0 {
            errs.push(format!("item {}: unit price cannot be negative", idx + 1));
        }
    }

    if invoice.total < 0.0 {
        errs.push("total cannot be negative".to_string());
    } else if !invoice.items.is_empty()
        && (invoice.total - invoice.line_total()).abs() > TOTAL_TOLERANCE
    {
        errs.push(format!(
            "total {} does not match line sum {}",
            invoice.total,
            invoice.line_total()
        ));
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}

fn is_valid_ifu(ifu: &str) -> bool {
    ifu.len() == 13 && ifu.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvoiceLine, InvoiceRequest};

    fn valid() -> InvoiceRequest {
        InvoiceRequest {
            issuer_ifu: "3201910273645".to_string(),
            buyer_ifu: Some("0202012345678".to_string()),
            buyer_name: None,
            items: vec![
                InvoiceLine {
                    label: "Huile 5L".to_string(),
                    qty: 1.0,
                    unit_price: 6_000.0,
                },
                InvoiceLine {
                    label: "Savon".to_string(),
                    qty: 3.0,
                    unit_price: 500.0,
                },
            ],
            total: 7_500.0,
            metadata: None,
        }
    }

    #[test]
    fn accepts_well_formed_invoice() {
        assert!(validate(&valid()).is_ok());
    }

    #[test]
    fn rejects_bad_ifu() {
        let mut inv = valid();
        inv.issuer_ifu = "12345".to_string();
        let errs = validate(&inv).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("issuerIFU")));
    }

    #[test]
    fn rejects_empty_items_and_total_mismatch() {
        let mut inv = valid();
        inv.items.clear();
        assert!(validate(&inv).is_err());

        let mut inv = valid();
        inv.total = 9_999.0;
        let errs = validate(&inv).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("does not match")));
    }

    #[test]
    fn rejects_non_positive_quantity() {
        let mut inv = valid();
        inv.items[0].qty = 0.0;
        assert!(validate(&inv).is_err());
    }
}
