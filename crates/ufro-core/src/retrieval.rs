//! Single-shot question bridge to the document-retrieval backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditHandle, AuditRecord, ServiceCallRecord, ServiceType};
use crate::citations::{normalize, Citation};
use crate::error::AskError;
use crate::fanout::new_request_id;
use crate::outcome::{post_json, CallOutcome, CONNECT_TIMEOUT};
use crate::registry::RegistrySource;

/// Returned verbatim when the registry lists no retrieval backend.
pub const NOT_CONFIGURED_TEXT: &str = "No retrieval backend configured";

#[derive(Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// `None` when the backend failed or did not return a text field.
    pub text: Option<String>,
    pub citations: Vec<Citation>,
}

impl Answer {
    pub fn not_configured() -> Self {
        Self {
            text: Some(NOT_CONFIGURED_TEXT.to_string()),
            citations: Vec::new(),
        }
    }
}

pub struct RetrievalBridge {
    registry: Arc<dyn RegistrySource>,
    client: reqwest::Client,
    audit: AuditHandle,
}

impl RetrievalBridge {
    pub fn new(registry: Arc<dyn RegistrySource>, audit: AuditHandle) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(registry, client, audit))
    }

    pub fn with_client(
        registry: Arc<dyn RegistrySource>,
        client: reqwest::Client,
        audit: AuditHandle,
    ) -> Self {
        Self {
            registry,
            client,
            audit,
        }
    }

    /// Ask the first configured retrieval backend. Backend failures give `text: None`.
    pub async fn ask(
        &self,
        question: &str,
        total_timeout: Duration,
        request_id: Option<String>,
    ) -> Result<Answer, AskError> {
        if question.trim().is_empty() {
            return Err(AskError::MissingQuestion);
        }
        if total_timeout.is_zero() {
            return Err(AskError::InvalidTimeout);
        }

        let registry = self.registry.snapshot();
        let Some(backend) = registry.primary_retrieval() else {
            tracing::info!(target: "ufro::retrieval", "no retrieval backend configured");
            return Ok(Answer::not_configured());
        };
        let request_id = request_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_request_id);

        let body = QueryRequest { query: question };
        let mut outcome =
            post_json(&self.client, &backend.name, &backend.endpoint, &body, total_timeout).await;
        normalize_payload(&mut outcome);

        tracing::info!(
            target: "ufro::retrieval",
            request_id = %request_id,
            service = %backend.name,
            status = outcome.status_code.unwrap_or_default(),
            timed_out = outcome.timed_out,
            latency_ms = outcome.latency_ms,
            "retrieval call settled"
        );

        self.audit.publish(AuditRecord::ServiceCall(ServiceCallRecord::from_outcome(
            &request_id,
            ServiceType::Retrieval,
            &outcome,
        )));

        Ok(answer_from(&outcome))
    }
}

/// Replace a raw `citations` field with its normalized form, so the audit trail sees what the
/// caller sees.
fn normalize_payload(outcome: &mut CallOutcome) {
    if let Some(Value::Object(obj)) = outcome.payload.as_mut() {
        if let Some(normalized) = obj.get("citations").map(normalize) {
            obj.insert(
                "citations".to_string(),
                serde_json::to_value(normalized).unwrap_or(Value::Array(Vec::new())),
            );
        }
    }
}

fn answer_from(outcome: &CallOutcome) -> Answer {
    let Some(obj) = outcome.payload.as_ref().and_then(Value::as_object) else {
        return Answer {
            text: None,
            citations: Vec::new(),
        };
    };
    Answer {
        text: obj.get("text").and_then(Value::as_str).map(str::to_string),
        citations: obj.get("citations").map(normalize).unwrap_or_default(),
    }
}
