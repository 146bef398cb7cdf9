use async_trait::async_trait;
use emecef_core::InvoiceRequest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of one certification submission that reached the service.
///
/// `Queued` means the DGI accepted the invoice but is still processing it;
/// from the terminal's perspective that is equivalent to success, since the
/// server owns any further state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CertificationResult {
    Certified {
        mecef_code: String,
        qr_data: String,
        dgi_invoice_id: Option<String>,
    },
    Queued,
    Rejected {
        reasons: Vec<String>,
    },
}

/// Classified submission failures. The retry policy keys off this taxonomy,
/// so every transport or HTTP outcome must land in exactly one bucket.
#[derive(Debug, Clone, Error)]
pub enum CertifyError {
    /// No response reached the server (DNS, connect, timeout). Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// 5xx-class response. The service is up but unwell. Retryable.
    #[error("certification service error ({status}): {message}")]
    ServerTransient { status: u16, message: String },

    /// 4xx business-rule response other than auth. The invoice will never
    /// be accepted as-is; not retryable.
    #[error("invoice refused ({status}): {message}")]
    ClientInvalid { status: u16, message: String },

    /// 401: credentials no longer valid. Retryable once after a refresh.
    #[error("authorization expired")]
    AuthExpired,
}

#[async_trait]
pub trait CertificationClient: Send + Sync {
    /// Submit one invoice for certification.
    async fn submit(
        &self,
        invoice: &InvoiceRequest,
    ) -> Result<CertificationResult, CertifyError>;

    /// Obtain fresh credentials after an [`CertifyError::AuthExpired`].
    async fn refresh_credentials(&self) -> Result<(), CertifyError>;
}

pub mod dgi;
pub mod mock;
