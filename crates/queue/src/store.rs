use crate::audit::{AuditEvent, AuditSink};
use chrono::{DateTime, Utc};
use emecef_core::{payload_digest, InvoiceRequest};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sled::Db;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

const PENDING_TREE: &str = "pending";
const META_TREE: &str = "meta";
const STATS_KEY: &[u8] = b"sync_stats";
const LAST_SYNC_KEY: &[u8] = b"last_sync";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),

    #[error("record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("offline queue is full ({0} records)")]
    QueueFull(usize),
}

/// An invoice awaiting certification. Lives in the queue until certified
/// (removed) or cleared by the operator; abandoned records stay visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInvoice {
    pub id: String,
    pub invoice: InvoiceRequest,
    pub payload_hash: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub abandoned: bool,
}

impl PendingInvoice {
    /// Excluded from automatic passes: terminally rejected by the authority,
    /// or out of retry budget. Only a manual reset makes it eligible again.
    pub fn is_abandoned(&self, retry_ceiling: u32) -> bool {
        self.abandoned || self.attempts >= retry_ceiling
    }
}

/// Cumulative sync counters. Persisted across restarts, only reset by
/// explicit operator action; `last_sync_time` lives under its own key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub total_synced: u64,
    pub total_failed: u64,
    pub average_sync_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// Crash-safe store for the pending-invoice queue.
///
/// Mutations serialize through one internal lock: duplicate suppression and
/// the attempt bookkeeping are read-modify-write cycles, and interleaving
/// them would lose updates.
pub struct QueueStore {
    db: Db,
    audit: Arc<dyn AuditSink>,
    duplicate_window: Duration,
    max_pending: usize,
    write_lock: Mutex<()>,
}

impl QueueStore {
    pub fn open(
        path: impl AsRef<Path>,
        audit: Arc<dyn AuditSink>,
        duplicate_window: Duration,
        max_pending: usize,
    ) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            audit,
            duplicate_window,
            max_pending,
            write_lock: Mutex::new(()),
        })
    }

    fn pending_tree(&self) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(PENDING_TREE)?)
    }

    fn meta_tree(&self) -> Result<sled::Tree, StoreError> {
        Ok(self.db.open_tree(META_TREE)?)
    }

    /// Store the invoice for later certification and return its queue id.
    ///
    /// Two enqueues for the same issuer IFU within the duplicate window
    /// collapse into one record; the second call returns the first's id.
    /// A `StoreError` means the invoice is NOT safely queued and the caller
    /// must not present it as saved.
    pub fn enqueue(&self, invoice: InvoiceRequest) -> Result<String, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let now = Utc::now();
        let records = self.read_all()?;

        let window = chrono::Duration::from_std(self.duplicate_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        if let Some(existing) = records.iter().find(|r| {
            r.invoice.issuer_ifu == invoice.issuer_ifu
                && now.signed_duration_since(r.enqueued_at).abs() < window
        }) {
            tracing::debug!(id = %existing.id, "duplicate enqueue suppressed");
            return Ok(existing.id.clone());
        }

        if records.len() >= self.max_pending {
            return Err(StoreError::QueueFull(records.len()));
        }

        let record = PendingInvoice {
            id: generate_record_id(),
            payload_hash: payload_digest(&invoice),
            invoice,
            enqueued_at: now,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            abandoned: false,
        };

        let tree = self.pending_tree()?;
        tree.insert(record.id.as_bytes(), serde_json::to_vec(&record)?)?;
        self.db.flush()?;

        self.audit.record(
            AuditEvent::success("invoice_enqueued", "offline_queue").with_metadata(json!({
                "invoice_id": record.id,
                "issuer_ifu": record.invoice.issuer_ifu,
                "payload_hash": record.payload_hash,
            })),
        );
        tracing::info!(id = %record.id, "invoice enqueued for later certification");
        Ok(record.id)
    }

    /// All current records in enqueue order. Read failures degrade to an
    /// empty queue with a warning: an empty queue is a safe state, and
    /// nothing already synced is lost by reporting it.
    pub fn list(&self) -> Vec<PendingInvoice> {
        match self.read_all() {
            Ok(mut records) => {
                records.sort_by_key(|r| r.enqueued_at);
                records
            }
            Err(e) => {
                tracing::warn!(error = %e, "pending queue read failed, treating as empty");
                Vec::new()
            }
        }
    }

    fn read_all(&self) -> Result<Vec<PendingInvoice>, StoreError> {
        let tree = self.pending_tree()?;
        let mut out = Vec::new();
        for item in tree.iter() {
            let (key, value) = item?;
            match serde_json::from_slice::<PendingInvoice>(&value) {
                Ok(record) => out.push(record),
                Err(e) => {
                    let id = String::from_utf8_lossy(&key).into_owned();
                    tracing::warn!(%id, error = %e, "skipping corrupt pending record");
                }
            }
        }
        Ok(out)
    }

    /// Idempotent: removing an absent id is a no-op.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let tree = self.pending_tree()?;
        tree.remove(id.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Record one real network attempt: increments the counter, stamps the
    /// time, sets or clears the failure description.
    pub fn update_attempt(&self, id: &str, error: Option<&str>) -> Result<(), StoreError> {
        self.mutate_record(id, |rec| {
            rec.attempts += 1;
            rec.last_attempt_at = Some(Utc::now());
            rec.last_error = error.map(str::to_string);
        })
    }

    /// Attempt bookkeeping plus the terminal flag: the record stays listed
    /// but no automatic pass will resubmit it.
    pub fn mark_abandoned(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        self.mutate_record(id, |rec| {
            rec.attempts += 1;
            rec.last_attempt_at = Some(Utc::now());
            rec.last_error = Some(reason.to_string());
            rec.abandoned = true;
        })
    }

    fn mutate_record<F>(&self, id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut PendingInvoice),
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let tree = self.pending_tree()?;
        // Absent id is a no-op: the record may have been removed by a
        // successful certification in the meantime.
        let Some(existing) = tree.get(id.as_bytes())? else {
            return Ok(());
        };
        let mut record: PendingInvoice = serde_json::from_slice(&existing)?;
        f(&mut record);
        tree.insert(id.as_bytes(), serde_json::to_vec(&record)?)?;
        self.db.flush()?;
        Ok(())
    }

    /// Operator reset: abandoned records become eligible again with a fresh
    /// attempt budget.
    pub fn reset_abandoned(&self, retry_ceiling: u32) -> Result<usize, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let tree = self.pending_tree()?;
        let mut reset = 0usize;
        for item in tree.iter() {
            let (key, value) = item?;
            let Ok(mut record) = serde_json::from_slice::<PendingInvoice>(&value) else {
                continue;
            };
            if !record.is_abandoned(retry_ceiling) {
                continue;
            }
            record.attempts = 0;
            record.abandoned = false;
            record.last_error = None;
            tree.insert(key, serde_json::to_vec(&record)?)?;
            reset += 1;
        }
        if reset > 0 {
            self.db.flush()?;
        }
        Ok(reset)
    }

    /// Deletes every pending record. Operator-only; stats are untouched.
    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let tree = self.pending_tree()?;
        let count = tree.len();
        tree.clear()?;
        self.db.flush()?;
        self.audit.record(
            AuditEvent::success("queue_cleared", "offline_queue")
                .with_metadata(json!({ "removed": count })),
        );
        tracing::info!(removed = count, "pending queue cleared");
        Ok(())
    }

    /// Cumulative stats, degraded to defaults if unreadable.
    pub fn stats(&self) -> SyncStats {
        let mut stats = self
            .read_meta::<SyncStats>(STATS_KEY)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "sync stats unreadable, using defaults");
                None
            })
            .unwrap_or_default();
        stats.last_sync_time = self
            .read_meta::<DateTime<Utc>>(LAST_SYNC_KEY)
            .unwrap_or(None);
        stats
    }

    fn read_meta<T: serde::de::DeserializeOwned>(
        &self,
        key: &[u8],
    ) -> Result<Option<T>, StoreError> {
        let tree = self.meta_tree()?;
        match tree.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Fold one finished pass into the cumulative counters. The duration
    /// average is weighted by cumulative record count, matching the stats
    /// the terminal has always reported.
    pub fn record_sync_outcome(
        &self,
        synced: usize,
        failed: usize,
        duration: Duration,
    ) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut stats = self
            .read_meta::<SyncStats>(STATS_KEY)?
            .unwrap_or_default();
        stats.total_synced += synced as u64;
        stats.total_failed += failed as u64;
        let total_records = stats.total_synced + stats.total_failed;
        if total_records > 0 {
            stats.average_sync_ms = (stats.average_sync_ms * (total_records - 1) as f64
                + duration.as_millis() as f64)
                / total_records as f64;
        }
        stats.last_sync_time = None;

        let tree = self.meta_tree()?;
        tree.insert(STATS_KEY, serde_json::to_vec(&stats)?)?;
        tree.insert(LAST_SYNC_KEY, serde_json::to_vec(&Utc::now())?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn reset_stats(&self) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let tree = self.meta_tree()?;
        tree.remove(STATS_KEY)?;
        tree.remove(LAST_SYNC_KEY)?;
        self.db.flush()?;
        Ok(())
    }
}

fn generate_record_id() -> String {
    use rand::{distributions::Alphanumeric, Rng};
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}
