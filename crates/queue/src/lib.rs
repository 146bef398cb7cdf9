//! Offline resilience core for the e-MECeF POS terminal.
//!
//! Invoices that cannot be certified right away land in a durable queue;
//! the sync engine drains it whenever connectivity allows, under an
//! exponential-backoff retry policy, driven by an interval-and-reconnect
//! scheduler. The host constructs one [`SyncService`] at startup and passes
//! it to whoever needs the operator surface.

pub mod audit;
pub mod engine;
pub mod net;
pub mod retry;
pub mod scheduler;
pub mod store;

pub use audit::{AuditEvent, AuditSink, JsonlAuditSink, NullAuditSink};
pub use engine::{SyncError, SyncFailure, SyncReport, TOO_MANY_ATTEMPTS};
pub use net::{NetworkError, NetworkMonitor, NetworkState};
pub use retry::{ErrorClass, RetryDecision, RetryPolicy};
pub use scheduler::SchedulerError;
pub use store::{PendingInvoice, StoreError, SyncStats};

use certify::CertificationClient;
use emecef_core::InvoiceRequest;
use engine::SyncEngine;
use scheduler::SyncScheduler;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use store::QueueStore;

/// Tunables for the offline subsystem. The defaults reproduce the
/// terminal's historical behavior; deployments may override them.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub retry_ceiling: u32,
    pub base_retry_delay: Duration,
    pub sync_interval: Duration,
    pub duplicate_window: Duration,
    pub max_pending: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            retry_ceiling: 3,
            base_retry_delay: Duration::from_secs(1),
            sync_interval: Duration::from_secs(300),
            duplicate_window: Duration::from_secs(60),
            max_pending: 100,
        }
    }
}

/// Operator surface over the offline queue, sync engine and scheduler.
///
/// One long-lived instance per process, constructed explicitly and started
/// with [`SyncService::start_autosync`]; there is no global state.
pub struct SyncService {
    store: Arc<QueueStore>,
    scheduler: Arc<SyncScheduler>,
    options: SyncOptions,
}

impl SyncService {
    pub fn open(
        path: impl AsRef<Path>,
        client: Arc<dyn CertificationClient>,
        network: Arc<dyn NetworkMonitor>,
        audit: Arc<dyn AuditSink>,
        options: SyncOptions,
    ) -> Result<Self, StoreError> {
        let store = Arc::new(QueueStore::open(
            path,
            audit.clone(),
            options.duplicate_window,
            options.max_pending,
        )?);
        let policy = RetryPolicy::new(options.base_retry_delay, options.retry_ceiling);
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            client,
            network.clone(),
            audit.clone(),
            policy,
        ));
        let scheduler = SyncScheduler::new(engine, network, audit, options.sync_interval);
        Ok(Self {
            store,
            scheduler,
            options,
        })
    }

    pub fn start_autosync(&self) -> Result<(), SchedulerError> {
        self.scheduler.start()
    }

    pub async fn stop_autosync(&self) {
        self.scheduler.stop().await
    }

    /// Queue an invoice for later certification. An `Err` means the invoice
    /// is NOT safely stored and must not be reported as queued.
    pub fn enqueue(&self, invoice: InvoiceRequest) -> Result<String, StoreError> {
        self.store.enqueue(invoice)
    }

    pub fn list(&self) -> Vec<PendingInvoice> {
        self.store.list()
    }

    /// Run a sync pass now. `None` means a pass was already in flight and
    /// this trigger coalesced into it.
    pub async fn manual_sync(&self) -> Result<Option<SyncReport>, SyncError> {
        self.scheduler.trigger_now().await
    }

    /// Give abandoned records a fresh retry budget, then sync.
    pub async fn retry_abandoned(&self) -> Result<Option<SyncReport>, SyncError> {
        let reset = self.store.reset_abandoned(self.options.retry_ceiling)?;
        if reset > 0 {
            tracing::info!(reset, "abandoned records reset for retry");
        }
        self.scheduler.trigger_now().await
    }

    pub fn stats(&self) -> SyncStats {
        self.store.stats()
    }

    pub fn reset_stats(&self) -> Result<(), StoreError> {
        self.store.reset_stats()
    }

    /// Operator-only wipe of the pending queue. Never called by automatic
    /// flows; cumulative stats are untouched.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.store.clear()
    }

    pub fn pending_count(&self) -> usize {
        self.list().len()
    }

    /// Records needing manual action, as opposed to ones that will retry
    /// automatically.
    pub fn abandoned_count(&self) -> usize {
        self.list()
            .iter()
            .filter(|r| r.is_abandoned(self.options.retry_ceiling))
            .count()
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certify::mock::MockClient;
    use emecef_core::InvoiceLine;

    fn invoice(issuer: &str) -> InvoiceRequest {
        InvoiceRequest {
            issuer_ifu: issuer.to_string(),
            buyer_ifu: None,
            buyer_name: None,
            items: vec![InvoiceLine {
                label: "Tomates (kg)".to_string(),
                qty: 2.5,
                unit_price: 600.0,
            }],
            total: 1_500.0,
            metadata: None,
        }
    }

    fn service(dir: &tempfile::TempDir) -> SyncService {
        SyncService::open(
            dir.path().join("queue"),
            MockClient::new(),
            NetworkState::new(true),
            Arc::new(NullAuditSink),
            SyncOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn enqueue_sync_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);

        svc.enqueue(invoice("1111111111111")).unwrap();
        assert_eq!(svc.pending_count(), 1);

        let report = svc.manual_sync().await.unwrap().unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.total, 1);
        assert_eq!(svc.pending_count(), 0);
        assert_eq!(svc.stats().total_synced, 1);
    }

    #[tokio::test]
    async fn retry_abandoned_revives_and_certifies() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);

        let id = svc.enqueue(invoice("1111111111111")).unwrap();
        svc.store.mark_abandoned(&id, "rejected earlier").unwrap();
        assert_eq!(svc.abandoned_count(), 1);

        let report = svc.retry_abandoned().await.unwrap().unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(svc.pending_count(), 0);
        assert_eq!(svc.abandoned_count(), 0);
    }

    #[tokio::test]
    async fn clear_all_empties_queue_but_keeps_stats() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir);

        svc.enqueue(invoice("1111111111111")).unwrap();
        let _ = svc.manual_sync().await.unwrap();
        svc.enqueue(invoice("2222222222222")).unwrap();

        svc.clear_all().unwrap();
        assert_eq!(svc.pending_count(), 0);
        assert_eq!(svc.stats().total_synced, 1);
    }
}
