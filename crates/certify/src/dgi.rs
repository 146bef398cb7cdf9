use super::{CertificationClient, CertificationResult, CertifyError};
use async_trait::async_trait;
use emecef_core::InvoiceRequest;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Certification response as returned by the e-MECeF REST API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertifyResponse {
    status: String,
    mecef_code: Option<String>,
    qr_data: Option<String>,
    dgi_invoice_id: Option<String>,
    reasons: Option<Vec<String>>,
    #[allow(dead_code)]
    warnings: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    token: String,
    #[allow(dead_code)]
    expires_in: Option<u64>,
}

#[derive(Clone)]
pub enum DgiAuth {
    /// Long-lived API key issued to the terminal.
    ApiKey { key: String },
    /// Short-lived bearer token obtained through the refresh endpoint.
    RefreshToken { refresh_token: String },
}

/// HTTP client for the DGI e-MECeF certification API.
///
/// Certification requests are bounded by the configured timeout; the queue
/// relies on that bound instead of imposing its own pass-level deadline.
#[derive(Clone)]
pub struct DgiClient {
    pub base_url: String,
    pub terminal_id: String,
    auth: DgiAuth,
    http_client: reqwest::Client,
    access_token: Arc<RwLock<Option<String>>>,
}

impl DgiClient {
    pub fn new(
        base_url: String,
        terminal_id: String,
        auth: DgiAuth,
        timeout: Duration,
    ) -> Arc<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .expect("Failed to create HTTP client");

        Arc::new(Self {
            base_url,
            terminal_id,
            auth,
            http_client,
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    async fn get_auth_header(&self) -> Result<String, CertifyError> {
        match &self.auth {
            DgiAuth::ApiKey { key } => Ok(format!("Bearer {}", key)),
            DgiAuth::RefreshToken { .. } => {
                {
                    let token_read = self.access_token.read().await;
                    if let Some(t) = token_read.as_ref() {
                        return Ok(format!("Bearer {}", t));
                    }
                }
                self.fetch_access_token().await?;
                let token_read = self.access_token.read().await;
                match token_read.as_ref() {
                    Some(t) => Ok(format!("Bearer {}", t)),
                    None => Err(CertifyError::AuthExpired),
                }
            }
        }
    }

    async fn fetch_access_token(&self) -> Result<(), CertifyError> {
        let refresh_token = match &self.auth {
            DgiAuth::RefreshToken { refresh_token } => refresh_token,
            DgiAuth::ApiKey { .. } => return Ok(()),
        };

        let url = format!("{}/auth/refresh", self.base_url);
        let resp = self
            .http_client
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status = %status, "token refresh refused");
            return Err(match status.as_u16() {
                500..=599 => CertifyError::ServerTransient {
                    status: status.as_u16(),
                    message: body,
                },
                _ => CertifyError::AuthExpired,
            });
        }

        let token_resp: RefreshResponse = resp
            .json()
            .await
            .map_err(|e| CertifyError::Network(format!("invalid token response: {e}")))?;

        let mut token_write = self.access_token.write().await;
        *token_write = Some(token_resp.token);
        Ok(())
    }

    /// Point-in-time reachability probe against the service health endpoint.
    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .http_client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl CertificationClient for DgiClient {
    async fn submit(
        &self,
        invoice: &InvoiceRequest,
    ) -> Result<CertificationResult, CertifyError> {
        let auth_header = self.get_auth_header().await?;
        let url = format!("{}/api/invoices", self.base_url);
        let request_ref = uuid::Uuid::new_v4().to_string();

        let resp = self
            .http_client
            .post(&url)
            .header("Authorization", auth_header)
            .header("X-Terminal-ID", &self.terminal_id)
            .header("X-Request-Ref", &request_ref)
            .json(invoice)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(error_for_status(status.as_u16(), body));
        }

        let parsed: CertifyResponse = resp.json().await.map_err(|e| {
            CertifyError::ServerTransient {
                status: status.as_u16(),
                message: format!("invalid response body: {e}"),
            }
        })?;

        let result = response_to_result(parsed)?;
        if let CertificationResult::Certified { mecef_code, .. } = &result {
            tracing::info!(%request_ref, %mecef_code, "invoice certified");
        }
        Ok(result)
    }

    async fn refresh_credentials(&self) -> Result<(), CertifyError> {
        {
            let mut token_write = self.access_token.write().await;
            *token_write = None;
        }
        self.fetch_access_token().await
    }
}

fn transport_error(err: reqwest::Error) -> CertifyError {
    if err.is_timeout() {
        CertifyError::Network(format!("request timed out: {err}"))
    } else {
        CertifyError::Network(err.to_string())
    }
}

fn error_for_status(status: u16, body: String) -> CertifyError {
    match status {
        401 => CertifyError::AuthExpired,
        400..=499 => CertifyError::ClientInvalid {
            status,
            message: body,
        },
        _ => CertifyError::ServerTransient {
            status,
            message: body,
        },
    }
}

fn response_to_result(resp: CertifyResponse) -> Result<CertificationResult, CertifyError> {
    match resp.status.as_str() {
        "CERTIFIED" => Ok(CertificationResult::Certified {
            mecef_code: resp.mecef_code.unwrap_or_default(),
            qr_data: resp.qr_data.unwrap_or_default(),
            dgi_invoice_id: resp.dgi_invoice_id,
        }),
        "PENDING" => Ok(CertificationResult::Queued),
        "REJECTED" => Ok(CertificationResult::Rejected {
            reasons: resp.reasons.unwrap_or_default(),
        }),
        other => Err(CertifyError::ServerTransient {
            status: 200,
            message: format!("unknown certification status: {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_taxonomy() {
        assert!(matches!(
            error_for_status(401, String::new()),
            CertifyError::AuthExpired
        ));
        assert!(matches!(
            error_for_status(422, String::new()),
            CertifyError::ClientInvalid { status: 422, .. }
        ));
        assert!(matches!(
            error_for_status(400, String::new()),
            CertifyError::ClientInvalid { status: 400, .. }
        ));
        assert!(matches!(
            error_for_status(503, String::new()),
            CertifyError::ServerTransient { status: 503, .. }
        ));
        assert!(matches!(
            error_for_status(500, String::new()),
            CertifyError::ServerTransient { status: 500, .. }
        ));
    }

    #[test]
    fn response_mapping_covers_all_statuses() {
        let certified = CertifyResponse {
            status: "CERTIFIED".to_string(),
            mecef_code: Some("NRZ9-F7K2".to_string()),
            qr_data: Some("F;NRZ9-F7K2;29000".to_string()),
            dgi_invoice_id: Some("dgi-001".to_string()),
            reasons: None,
            warnings: None,
        };
        assert!(matches!(
            response_to_result(certified),
            Ok(CertificationResult::Certified { .. })
        ));

        let pending = CertifyResponse {
            status: "PENDING".to_string(),
            mecef_code: None,
            qr_data: None,
            dgi_invoice_id: None,
            reasons: None,
            warnings: None,
        };
        assert!(matches!(
            response_to_result(pending),
            Ok(CertificationResult::Queued)
        ));

        let rejected = CertifyResponse {
            status: "REJECTED".to_string(),
            mecef_code: None,
            qr_data: None,
            dgi_invoice_id: None,
            reasons: Some(vec!["IFU inconnu".to_string()]),
            warnings: None,
        };
        match response_to_result(rejected) {
            Ok(CertificationResult::Rejected { reasons }) => {
                assert_eq!(reasons, vec!["IFU inconnu".to_string()]);
            }
            other => panic!("unexpected mapping: {other:?}"),
        }

        let unknown = CertifyResponse {
            status: "ON_FIRE".to_string(),
            mecef_code: None,
            qr_data: None,
            dgi_invoice_id: None,
            reasons: None,
            warnings: None,
        };
        assert!(response_to_result(unknown).is_err());
    }
}
