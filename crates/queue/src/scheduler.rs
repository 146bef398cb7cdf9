use crate::audit::{AuditEvent, AuditSink};
use crate::engine::{SyncEngine, SyncReport, SyncError};
use crate::net::{NetworkError, NetworkMonitor};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("autosync already started")]
    AlreadyStarted,

    /// Without the subscription there is no reconnect trigger; silent
    /// absence of autosync would be a silent data-loss risk, so this is
    /// fatal at startup.
    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// `Idle` / `Running` pass gate. Every trigger path goes through it, so at
/// most one sync pass executes at a time and overlapping triggers coalesce
/// into no-ops.
struct PassGate(AtomicBool);

impl PassGate {
    fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    fn try_begin(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn end(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives the sync engine on a fixed interval and on network reconnects.
///
/// Constructed inactive; `start` spawns the loop, `stop` cancels the timer
/// and the subscription while letting an in-flight pass complete. Manual
/// triggers work whether or not autosync is running.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    network: Arc<dyn NetworkMonitor>,
    audit: Arc<dyn AuditSink>,
    interval: Duration,
    gate: PassGate,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(
        engine: Arc<SyncEngine>,
        network: Arc<dyn NetworkMonitor>,
        audit: Arc<dyn AuditSink>,
        interval: Duration,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            engine,
            network,
            audit,
            interval,
            gate: PassGate::new(),
            shutdown,
            task: Mutex::new(None),
        })
    }

    /// Run a pass now and hand the report to the caller. Returns `None`
    /// when a pass is already in flight: the trigger coalesces and the
    /// in-flight pass's result is not joined.
    pub async fn trigger_now(&self) -> Result<Option<SyncReport>, SyncError> {
        if !self.gate.try_begin() {
            tracing::debug!("sync pass already running, manual trigger coalesced");
            return Ok(None);
        }
        let result = self.engine.sync_pending().await;
        self.gate.end();
        result.map(Some)
    }

    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let mut task_slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task_slot.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let net_rx = self.network.subscribe()?;
        self.shutdown.send_replace(false);

        let sched = Arc::clone(self);
        *task_slot = Some(tokio::spawn(async move {
            sched.run_loop(net_rx).await;
        }));

        self.audit.record(
            AuditEvent::success("auto_sync_started", "sync_scheduler")
                .with_metadata(json!({ "interval_ms": self.interval.as_millis() as u64 })),
        );
        tracing::info!(interval = ?self.interval, "autosync started");
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, mut net_rx: watch::Receiver<bool>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    self.run_pass("interval").await;
                }
                changed = net_rx.changed() => {
                    match changed {
                        Err(_) => {
                            tracing::warn!("network state source closed, autosync loop exiting");
                            break;
                        }
                        Ok(()) => {
                            if *net_rx.borrow_and_update() {
                                self.run_pass("reconnect").await;
                            }
                        }
                    }
                }
            }
        }
        tracing::debug!("autosync loop exited");
    }

    async fn run_pass(&self, trigger: &str) {
        if !self.gate.try_begin() {
            tracing::debug!(trigger, "sync pass already running, trigger coalesced");
            return;
        }
        match self.engine.sync_pending().await {
            Ok(report) => {
                if report.total > 0 {
                    tracing::info!(
                        trigger,
                        synced = report.synced,
                        failed = report.failed,
                        "scheduled sync pass finished"
                    );
                }
            }
            Err(e) => {
                tracing::error!(trigger, error = %e, "scheduled sync pass failed");
                self.audit.record(
                    AuditEvent::failure("sync_error", "sync_scheduler")
                        .with_metadata(json!({ "trigger": trigger, "error": e.to_string() })),
                );
            }
        }
        self.gate.end();
    }

    /// Stop autosync. The in-flight pass, if any, completes; no new pass
    /// starts afterwards.
    pub async fn stop(&self) {
        let handle = {
            let mut task_slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
            task_slot.take()
        };
        let Some(handle) = handle else {
            return;
        };
        self.shutdown.send_replace(true);
        let _ = handle.await;
        self.audit
            .record(AuditEvent::success("auto_sync_stopped", "sync_scheduler"));
        tracing::info!("autosync stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NullAuditSink;
    use crate::net::NetworkState;
    use crate::retry::RetryPolicy;
    use crate::store::QueueStore;
    use async_trait::async_trait;
    use certify::{CertificationClient, CertificationResult, CertifyError};
    use emecef_core::{InvoiceLine, InvoiceRequest};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    /// Certifies every submission after a configurable delay, counting calls.
    struct SlowClient {
        delay: Duration,
        submits: AtomicUsize,
    }

    #[async_trait]
    impl CertificationClient for SlowClient {
        async fn submit(
            &self,
            invoice: &InvoiceRequest,
        ) -> Result<CertificationResult, CertifyError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            sleep(self.delay).await;
            Ok(CertificationResult::Certified {
                mecef_code: "AAAA-0000".to_string(),
                qr_data: format!("F;AAAA-0000;{}", invoice.total),
                dgi_invoice_id: None,
            })
        }

        async fn refresh_credentials(&self) -> Result<(), CertifyError> {
            Ok(())
        }
    }

    fn invoice(issuer: &str) -> InvoiceRequest {
        InvoiceRequest {
            issuer_ifu: issuer.to_string(),
            buyer_ifu: None,
            buyer_name: None,
            items: vec![InvoiceLine {
                label: "Cahier 200p".to_string(),
                qty: 1.0,
                unit_price: 800.0,
            }],
            total: 800.0,
            metadata: None,
        }
    }

    fn scheduler_with(
        dir: &tempfile::TempDir,
        client: Arc<SlowClient>,
        interval: Duration,
    ) -> (Arc<QueueStore>, Arc<NetworkState>, Arc<SyncScheduler>) {
        let store = Arc::new(
            QueueStore::open(
                dir.path().join("queue"),
                Arc::new(NullAuditSink),
                Duration::from_secs(60),
                100,
            )
            .unwrap(),
        );
        let network = NetworkState::new(true);
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            client,
            network.clone(),
            Arc::new(NullAuditSink),
            RetryPolicy::default(),
        ));
        let scheduler = SyncScheduler::new(
            engine,
            network.clone(),
            Arc::new(NullAuditSink),
            interval,
        );
        (store, network, scheduler)
    }

    #[tokio::test]
    async fn concurrent_triggers_run_a_single_pass() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(SlowClient {
            delay: Duration::from_millis(100),
            submits: AtomicUsize::new(0),
        });
        let (store, _network, scheduler) = scheduler_with(&dir, client.clone(), Duration::from_secs(600));

        store.enqueue(invoice("1111111111111")).unwrap();
        store.enqueue(invoice("2222222222222")).unwrap();

        let background = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.trigger_now().await })
        };
        // let the first pass claim the gate
        sleep(Duration::from_millis(20)).await;

        let second = scheduler.trigger_now().await.unwrap();
        assert!(second.is_none(), "second trigger must coalesce");

        let first = background.await.unwrap().unwrap().unwrap();
        assert_eq!(first.synced, 2);
        // each pending record submitted exactly once across both triggers
        assert_eq!(client.submits.load(Ordering::SeqCst), 2);
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn reconnect_starts_a_pass_and_stop_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(SlowClient {
            delay: Duration::from_millis(5),
            submits: AtomicUsize::new(0),
        });
        let (store, network, scheduler) = scheduler_with(&dir, client.clone(), Duration::from_secs(600));

        network.set_connected(false);
        store.enqueue(invoice("1111111111111")).unwrap();

        scheduler.start().unwrap();
        assert!(matches!(
            scheduler.start(),
            Err(SchedulerError::AlreadyStarted)
        ));

        // initial tick runs while offline: a skip, nothing submitted
        sleep(Duration::from_millis(50)).await;
        assert_eq!(client.submits.load(Ordering::SeqCst), 0);

        network.set_connected(true);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(client.submits.load(Ordering::SeqCst), 1);
        assert!(store.list().is_empty());

        scheduler.stop().await;
        // no further passes after stop
        store.enqueue(invoice("2222222222222")).unwrap();
        network.set_connected(false);
        network.set_connected(true);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(client.submits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manual_trigger_works_without_autosync_started() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(SlowClient {
            delay: Duration::from_millis(1),
            submits: AtomicUsize::new(0),
        });
        let (store, _network, scheduler) = scheduler_with(&dir, client.clone(), Duration::from_secs(600));

        store.enqueue(invoice("1111111111111")).unwrap();
        let report = scheduler.trigger_now().await.unwrap().unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.total, 1);
    }
}
