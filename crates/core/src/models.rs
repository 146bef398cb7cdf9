use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One line of an invoice as submitted to the DGI certification API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLine {
    pub label: String,
    pub qty: f64,
    pub unit_price: f64,
}

/// Invoice payload in DGI wire format. The offline queue treats this as an
/// opaque value; only the issuer IFU is inspected (duplicate suppression).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceRequest {
    #[serde(rename = "issuerIFU")]
    pub issuer_ifu: String,
    #[serde(rename = "buyerIFU", skip_serializing_if = "Option::is_none")]
    pub buyer_ifu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer_name: Option<String>,
    pub items: Vec<InvoiceLine>,
    pub total: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl InvoiceRequest {
    pub fn line_total(&self) -> f64 {
        self.items.iter().map(|l| l.qty * l.unit_price).sum()
    }
}

/// SHA-256 hex digest of the payload's JSON form, recorded in audit events
/// so a queued invoice can be matched against what was eventually certified.
pub fn payload_digest(invoice: &InvoiceRequest) -> String {
    let json = serde_json::to_vec(invoice).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&json);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InvoiceRequest {
        InvoiceRequest {
            issuer_ifu: "3201910273645".to_string(),
            buyer_ifu: None,
            buyer_name: Some("Comptoir du Marché".to_string()),
            items: vec![InvoiceLine {
                label: "Sac de riz 25kg".to_string(),
                qty: 2.0,
                unit_price: 14_500.0,
            }],
            total: 29_000.0,
            metadata: None,
        }
    }

    #[test]
    fn wire_format_uses_dgi_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("issuerIFU").is_some());
        assert!(json.get("buyerName").is_some());
        assert_eq!(json["items"][0]["unitPrice"], 14_500.0);
        // absent options are omitted entirely, not serialized as null
        assert!(json.get("buyerIFU").is_none());
    }

    #[test]
    fn digest_is_stable_and_input_sensitive() {
        let a = payload_digest(&sample());
        assert_eq!(a, payload_digest(&sample()));
        assert_eq!(a.len(), 64);

        let mut other = sample();
        other.total = 30_000.0;
        assert_ne!(a, payload_digest(&other));
    }
}
