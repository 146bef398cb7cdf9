use super::{CertificationClient, CertificationResult, CertifyError};
use async_trait::async_trait;
use emecef_core::InvoiceRequest;
use rand::{distributions::Alphanumeric, Rng};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Development stand-in for the DGI API: every invoice certifies.
#[derive(Clone, Default)]
pub struct MockClient;

impl MockClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {})
    }
}

#[async_trait]
impl CertificationClient for MockClient {
    async fn submit(
        &self,
        invoice: &InvoiceRequest,
    ) -> Result<CertificationResult, CertifyError> {
        let code: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        // simulate network latency
        sleep(Duration::from_millis(200)).await;
        Ok(CertificationResult::Certified {
            qr_data: format!("F;{};{}", code, invoice.total),
            mecef_code: code,
            dgi_invoice_id: None,
        })
    }

    async fn refresh_credentials(&self) -> Result<(), CertifyError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_always_certifies() {
        let client = MockClient::new();
        let invoice = InvoiceRequest {
            issuer_ifu: "3201910273645".to_string(),
            buyer_ifu: None,
            buyer_name: None,
            items: vec![],
            total: 1_000.0,
            metadata: None,
        };
        match client.submit(&invoice).await {
            Ok(CertificationResult::Certified { mecef_code, .. }) => {
                assert_eq!(mecef_code.len(), 16);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
