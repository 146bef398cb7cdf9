use crate::audit::{AuditEvent, AuditSink};
use crate::net::NetworkMonitor;
use crate::retry::{ErrorClass, RetryDecision, RetryPolicy};
use crate::store::{PendingInvoice, QueueStore, StoreError};
use certify::{CertificationClient, CertificationResult};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Reason recorded for records whose retry budget is already spent.
pub const TOO_MANY_ATTEMPTS: &str = "too many failed attempts";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("queue storage failed during sync: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub id: String,
    pub error: String,
}

/// Outcome of one sync pass. Ephemeral; only the cumulative stats persist.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    pub total: usize,
    pub errors: Vec<SyncFailure>,
}

enum Outcome {
    Synced,
    Failed(String),
}

/// Drains the pending queue against the certification service, one record
/// at a time.
///
/// Records are processed sequentially on purpose: each submission mutates
/// the queue, and concurrent read-modify-write cycles on it would lose
/// updates. Offline-POS queue sizes make the throughput cost irrelevant.
pub struct SyncEngine {
    store: Arc<QueueStore>,
    client: Arc<dyn CertificationClient>,
    network: Arc<dyn NetworkMonitor>,
    audit: Arc<dyn AuditSink>,
    policy: RetryPolicy,
}

impl SyncEngine {
    pub fn new(
        store: Arc<QueueStore>,
        client: Arc<dyn CertificationClient>,
        network: Arc<dyn NetworkMonitor>,
        audit: Arc<dyn AuditSink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            client,
            network,
            audit,
            policy,
        }
    }

    /// One full pass over the queue.
    ///
    /// Running while offline is a correctly skipped pass, not an error.
    /// Per-record failures fold into that record's state; a storage failure
    /// aborts the remainder of the pass, leaving unattempted records for
    /// the next one.
    pub async fn sync_pending(&self) -> Result<SyncReport, SyncError> {
        let started = Instant::now();

        if !self.network.is_connected() {
            tracing::debug!("offline, skipping sync pass");
            return Ok(SyncReport::default());
        }

        let pending = self.store.list();
        let mut report = SyncReport {
            total: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        tracing::info!(count = pending.len(), "starting sync pass");
        let mut auth_refreshed = false;

        for record in &pending {
            // A disconnect mid-pass truncates: remaining records stay
            // untouched and are picked up by a later pass.
            if !self.network.is_connected() {
                tracing::warn!("connectivity lost mid-pass, deferring remaining records");
                break;
            }

            if record.is_abandoned(self.policy.ceiling()) {
                report.failed += 1;
                report.errors.push(SyncFailure {
                    id: record.id.clone(),
                    error: TOO_MANY_ATTEMPTS.to_string(),
                });
                continue;
            }

            match self.attempt_record(record, &mut auth_refreshed).await? {
                Outcome::Synced => report.synced += 1,
                Outcome::Failed(error) => {
                    report.failed += 1;
                    report.errors.push(SyncFailure {
                        id: record.id.clone(),
                        error,
                    });
                }
            }
        }

        let duration = started.elapsed();
        self.store
            .record_sync_outcome(report.synced, report.failed, duration)?;
        self.audit.record(
            AuditEvent::success("sync_completed", "sync_engine").with_metadata(json!({
                "synced": report.synced,
                "failed": report.failed,
                "total": report.total,
                "duration_ms": duration.as_millis() as u64,
            })),
        );
        tracing::info!(
            synced = report.synced,
            failed = report.failed,
            "sync pass completed"
        );
        Ok(report)
    }

    async fn attempt_record(
        &self,
        record: &PendingInvoice,
        auth_refreshed: &mut bool,
    ) -> Result<Outcome, StoreError> {
        loop {
            let (class, message) = match self.client.submit(&record.invoice).await {
                Ok(CertificationResult::Certified { mecef_code, .. }) => {
                    self.store.remove(&record.id)?;
                    self.audit.record(
                        AuditEvent::success("invoice_certified", "sync_engine").with_metadata(
                            json!({
                                "invoice_id": record.id,
                                "mecef_code": mecef_code,
                                "payload_hash": record.payload_hash,
                            }),
                        ),
                    );
                    tracing::info!(id = %record.id, %mecef_code, "pending invoice certified");
                    return Ok(Outcome::Synced);
                }
                Ok(CertificationResult::Queued) => {
                    // The server accepted and owns further state; locally
                    // this is indistinguishable from success.
                    self.store.remove(&record.id)?;
                    self.audit.record(
                        AuditEvent::success("invoice_queued_by_server", "sync_engine")
                            .with_metadata(json!({ "invoice_id": record.id })),
                    );
                    tracing::info!(id = %record.id, "invoice accepted into server queue");
                    return Ok(Outcome::Synced);
                }
                Ok(CertificationResult::Rejected { reasons }) => {
                    let message = if reasons.is_empty() {
                        "rejected by certification authority".to_string()
                    } else {
                        format!(
                            "rejected by certification authority: {}",
                            reasons.join("; ")
                        )
                    };
                    (ErrorClass::Rejected, message)
                }
                Err(err) => {
                    let mut class = ErrorClass::classify(&err);
                    // One credential refresh per pass; repeats are terminal.
                    if class == ErrorClass::AuthExpired && *auth_refreshed {
                        class = ErrorClass::ClientInvalid;
                    }
                    (class, err.to_string())
                }
            };

            match self.policy.decide(record.attempts, class) {
                RetryDecision::RetryImmediate => {
                    *auth_refreshed = true;
                    match self.client.refresh_credentials().await {
                        Ok(()) => {
                            tracing::debug!(id = %record.id, "credentials refreshed, retrying submission");
                            continue;
                        }
                        Err(e) => {
                            let message = format!("credential refresh failed: {e}");
                            self.abandon(record, &message)?;
                            return Ok(Outcome::Failed(message));
                        }
                    }
                }
                RetryDecision::RetryAfter(delay) => {
                    self.store.update_attempt(&record.id, Some(&message))?;
                    tracing::debug!(
                        id = %record.id,
                        delay_ms = delay.as_millis() as u64,
                        attempts = record.attempts + 1,
                        "transient failure, deferred to a later pass"
                    );
                    return Ok(Outcome::Failed(message));
                }
                RetryDecision::Abandon => {
                    self.abandon(record, &message)?;
                    return Ok(Outcome::Failed(message));
                }
            }
        }
    }

    fn abandon(&self, record: &PendingInvoice, reason: &str) -> Result<(), StoreError> {
        self.store.mark_abandoned(&record.id, reason)?;
        self.audit.record(
            AuditEvent::failure("invoice_abandoned", "sync_engine").with_metadata(json!({
                "invoice_id": record.id,
                "reason": reason,
            })),
        );
        tracing::warn!(id = %record.id, %reason, "invoice abandoned, manual action required");
        Ok(())
    }
}
