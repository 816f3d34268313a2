//! Verifier call adapter: one image, one backend, one settled outcome.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::audit::{AuditHandle, AuditRecord, ServiceCallRecord, ServiceType};
use crate::outcome::{post_json, VerificationOutcome, CONNECT_TIMEOUT};
use crate::registry::VerifierDescriptor;

#[derive(Serialize)]
struct VerifyRequest<'a> {
    image_b64: &'a str,
}

/// Seam between the fan-out and whatever actually talks to a backend.
///
/// Implementations must settle every call into an outcome; they do not return errors.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(
        &self,
        descriptor: &VerifierDescriptor,
        image_b64: &str,
        total_timeout: Duration,
        request_id: Option<&str>,
    ) -> VerificationOutcome;
}

/// HTTP verifier. Holds one connection pool for the life of the process.
#[derive(Debug, Clone)]
pub struct HttpVerifier {
    client: reqwest::Client,
    audit: AuditHandle,
}

impl HttpVerifier {
    /// Build the shared client with the fixed connect bound.
    pub fn new(audit: AuditHandle) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, audit))
    }

    pub fn with_client(client: reqwest::Client, audit: AuditHandle) -> Self {
        Self { client, audit }
    }

    /// `POST {"image_b64": ...}` to `endpoint`, bounded by `total_timeout`.
    ///
    /// Always returns an outcome. When `request_id` is set, one `verifier` audit record is
    /// published after the outcome is settled.
    pub async fn call(
        &self,
        service_name: &str,
        endpoint: &str,
        image_b64: &str,
        total_timeout: Duration,
        request_id: Option<&str>,
    ) -> VerificationOutcome {
        let body = VerifyRequest { image_b64 };
        let outcome = post_json(&self.client, service_name, endpoint, &body, total_timeout).await;

        if outcome.is_success() {
            tracing::info!(
                target: "ufro::verifier",
                request_id = request_id.unwrap_or("-"),
                service = %service_name,
                status = outcome.status_code.unwrap_or_default(),
                latency_ms = outcome.latency_ms,
                parsed = outcome.payload.is_some(),
                "verifier responded"
            );
        } else {
            tracing::warn!(
                target: "ufro::verifier",
                request_id = request_id.unwrap_or("-"),
                service = %service_name,
                timed_out = outcome.timed_out,
                error = outcome.error.as_deref().unwrap_or(""),
                latency_ms = outcome.latency_ms,
                "verifier call failed"
            );
        }

        if let Some(id) = request_id {
            self.audit.publish(AuditRecord::ServiceCall(ServiceCallRecord::from_outcome(
                id,
                ServiceType::Verifier,
                &outcome,
            )));
        }
        outcome
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn verify(
        &self,
        descriptor: &VerifierDescriptor,
        image_b64: &str,
        total_timeout: Duration,
        request_id: Option<&str>,
    ) -> VerificationOutcome {
        self.call(
            &descriptor.name,
            &descriptor.endpoint,
            image_b64,
            total_timeout,
            request_id,
        )
        .await
    }
}
