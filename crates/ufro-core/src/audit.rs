//! Audit side channel.
//!
//! The decision path only ever calls [`AuditHandle::publish`], which enqueues without waiting.
//! A background writer drains the queue into an [`AuditSink`]. A full queue, a closed writer or
//! a failing sink costs a log line and nothing else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::decision::{Decision, Identity};
use crate::error::AuditError;
use crate::outcome::CallOutcome;

const AUDIT_DEFAULT_PATH: &str = "./data/audit";
const ACCESS_TREE: &str = "access_logs";
const SERVICE_TREE: &str = "service_logs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Verifier,
    Retrieval,
}

/// One backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCallRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub service_type: ServiceType,
    pub service_name: String,
    pub endpoint: String,
    pub latency_ms: f64,
    pub status_code: Option<u16>,
    pub result: Option<Value>,
    pub timed_out: bool,
    pub error: Option<String>,
}

impl ServiceCallRecord {
    pub fn from_outcome(request_id: &str, service_type: ServiceType, outcome: &CallOutcome) -> Self {
        Self {
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
            service_type,
            service_name: outcome.service_name.clone(),
            endpoint: outcome.endpoint.clone(),
            latency_ms: outcome.latency_ms,
            status_code: outcome.status_code,
            result: outcome.payload.clone(),
            timed_out: outcome.timed_out,
            error: outcome.error.clone(),
        }
    }
}

/// One top-level identify request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub route: String,
    pub decision: Decision,
    pub identity: Option<Identity>,
    pub verifiers_consulted: usize,
    pub timeouts_count: usize,
    pub elapsed_ms: f64,
    pub status_code: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    ServiceCall(ServiceCallRecord),
    Access(AccessRecord),
}

impl AuditRecord {
    pub fn request_id(&self) -> &str {
        match self {
            AuditRecord::ServiceCall(r) => &r.request_id,
            AuditRecord::Access(r) => &r.request_id,
        }
    }
}

/// Where audit records end up. Runs on the writer task, never on the decision path.
pub trait AuditSink: Send + Sync + 'static {
    fn write(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Publishing end of the side channel. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct AuditHandle {
    tx: Option<mpsc::Sender<AuditRecord>>,
}

impl AuditHandle {
    /// A handle that drops every record.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start a writer task draining into `sink`. The task ends once every handle is dropped.
    /// Must be called from within a Tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = tokio::spawn(run_writer(sink, rx));
        (Self { tx: Some(tx) }, writer)
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Enqueue without waiting. Reports why a record could not be queued.
    pub fn try_publish(&self, record: AuditRecord) -> Result<(), AuditError> {
        let Some(tx) = self.tx.as_ref() else {
            return Ok(());
        };
        tx.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AuditError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => AuditError::Closed,
        })
    }

    /// Fire-and-forget publish. Failures are logged and discarded.
    pub fn publish(&self, record: AuditRecord) {
        let request_id = record.request_id().to_string();
        if let Err(e) = self.try_publish(record) {
            tracing::warn!(
                target: "ufro::audit",
                request_id = %request_id,
                error = %e,
                "audit record dropped"
            );
        }
    }
}

/// Sink writes may block (sled), so each one runs on the blocking pool. Records are written
/// one at a time, in queue order.
async fn run_writer(sink: Arc<dyn AuditSink>, mut rx: mpsc::Receiver<AuditRecord>) {
    while let Some(record) = rx.recv().await {
        let sink = Arc::clone(&sink);
        let written = tokio::task::spawn_blocking(move || {
            let result = sink.write(&record);
            (record, result)
        })
        .await;
        match written {
            Ok((_, Ok(()))) => {}
            Ok((record, Err(e))) => {
                tracing::warn!(
                    target: "ufro::audit",
                    request_id = %record.request_id(),
                    error = %e,
                    "audit write failed"
                );
            }
            Err(e) => {
                tracing::warn!(target: "ufro::audit", error = %e, "audit write task failed");
            }
        }
    }
    tracing::debug!(target: "ufro::audit", "audit writer stopped");
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let json = serde_json::to_string(record)?;
        tracing::info!(target: "ufro::audit", request_id = %record.request_id(), record = %json);
        Ok(())
    }
}

/// Sled-backed audit store with `access_logs` and `service_logs` trees.
/// Keys are monotonic ids, so key order is write order.
pub struct SledAuditSink {
    db: sled::Db,
    access: sled::Tree,
    service: sled::Tree,
}

impl SledAuditSink {
    /// Open the store at `path`, or at `./data/audit` when none is given.
    pub fn open(path: Option<impl AsRef<Path>>) -> Result<Self, AuditError> {
        let p = path
            .map(|x| x.as_ref().to_path_buf())
            .unwrap_or_else(|| Path::new(AUDIT_DEFAULT_PATH).to_path_buf());
        let db = sled::open(p)?;
        let access = db.open_tree(ACCESS_TREE)?;
        let service = db.open_tree(SERVICE_TREE)?;
        Ok(Self {
            db,
            access,
            service,
        })
    }

    /// Most recent access records, newest first.
    pub fn recent_access(&self, limit: usize) -> Result<Vec<AccessRecord>, AuditError> {
        Self::recent(&self.access, limit)
    }

    /// Most recent service-call records, newest first.
    pub fn recent_service_calls(&self, limit: usize) -> Result<Vec<ServiceCallRecord>, AuditError> {
        Self::recent(&self.service, limit)
    }

    fn recent<T: serde::de::DeserializeOwned>(
        tree: &sled::Tree,
        limit: usize,
    ) -> Result<Vec<T>, AuditError> {
        let mut out = Vec::new();
        for entry in tree.iter().rev().take(limit) {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// True when the underlying store answers.
    pub fn is_healthy(&self) -> bool {
        self.db.size_on_disk().is_ok()
    }

    pub fn flush(&self) -> Result<(), AuditError> {
        self.db.flush()?;
        Ok(())
    }
}

impl AuditSink for SledAuditSink {
    fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let key = self.db.generate_id()?.to_be_bytes();
        match record {
            AuditRecord::Access(r) => {
                self.access.insert(key, serde_json::to_vec(r)?)?;
            }
            AuditRecord::ServiceCall(r) => {
                self.service.insert(key, serde_json::to_vec(r)?)?;
            }
        }
        Ok(())
    }
}
