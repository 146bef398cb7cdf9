use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// One audit trail entry. The sink contract is fire-and-forget: the core
/// never depends on a recording having succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub action: String,
    pub resource: String,
    pub result: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl AuditEvent {
    pub fn success(action: &str, resource: &str) -> Self {
        Self::new(action, resource, "success")
    }

    pub fn failure(action: &str, resource: &str) -> Self {
        Self::new(action, resource, "failure")
    }

    fn new(action: &str, resource: &str, result: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            action: action.to_string(),
            resource: resource.to_string(),
            result: result.to_string(),
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Appends one JSON object per line to a local audit log.
pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event).map_err(std::io::Error::other)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", json)
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.append(&event) {
            tracing::warn!(error = %e, action = %event.action, "audit event dropped");
        } else {
            tracing::debug!(action = %event.action, resource = %event.resource, "audit event written");
        }
    }
}

/// Sink for hosts that opt out of audit logging.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_sink_writes_one_parseable_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::new(&path);

        sink.record(
            AuditEvent::success("invoice_enqueued", "offline_queue")
                .with_metadata(serde_json::json!({ "invoice_id": "abc123" })),
        );
        sink.record(AuditEvent::failure("sync_error", "sync_scheduler"));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.action, "invoice_enqueued");
        assert_eq!(first.result, "success");
        assert_eq!(first.metadata["invoice_id"], "abc123");

        let second: AuditEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.result, "failure");
    }
}
