//! Fan-out orchestrator: call every active verifier at once, wait for all, decide.
//!
//! Each verifier call runs as its own task. Results are collected by dispatch position, so
//! the outcome list is in registry order no matter which backend answered first. A task that
//! panics is turned into an error outcome for the descriptor at that position.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;

use crate::audit::{AccessRecord, AuditHandle, AuditRecord};
use crate::decision::{Candidate, CandidatePolicy, Decision, DecisionEngine, Identity};
use crate::error::IdentifyError;
use crate::outcome::{CallOutcome, VerificationOutcome};
use crate::registry::{Registry, RegistrySource, VerifierDescriptor};
use crate::verifier::Verifier;

/// Route recorded on access audit records.
pub const IDENTIFY_ROUTE: &str = "/identify";

/// Total per-call bound when the caller does not pick one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// What the caller gets back from [`FanOutOrchestrator::identify`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyResult {
    pub decision: Decision,
    pub identity: Option<Identity>,
    /// Ranked, best first.
    pub candidates: Vec<Candidate>,
    pub timing_ms: f64,
    pub request_id: String,
}

/// 32 lowercase hex characters.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn validate(image_b64: &str, total_timeout: Duration, delta: f64) -> Result<(), IdentifyError> {
    if image_b64.trim().is_empty() {
        return Err(IdentifyError::MissingImage);
    }
    if !delta.is_finite() || delta < 0.0 {
        return Err(IdentifyError::InvalidDelta(delta));
    }
    if total_timeout.is_zero() {
        return Err(IdentifyError::InvalidTimeout);
    }
    Ok(())
}

fn fault_message(err: JoinError) -> String {
    if err.is_panic() {
        let panic = err.into_panic();
        if let Some(s) = panic.downcast_ref::<&str>() {
            return (*s).to_string();
        }
        if let Some(s) = panic.downcast_ref::<String>() {
            return s.clone();
        }
        return "verifier task panicked".to_string();
    }
    err.to_string()
}

pub struct FanOutOrchestrator {
    registry: Arc<dyn RegistrySource>,
    verifier: Arc<dyn Verifier>,
    engine: DecisionEngine,
    audit: AuditHandle,
}

impl FanOutOrchestrator {
    pub fn new(
        registry: Arc<dyn RegistrySource>,
        verifier: Arc<dyn Verifier>,
        audit: AuditHandle,
    ) -> Self {
        Self {
            registry,
            verifier,
            engine: DecisionEngine::default(),
            audit,
        }
    }

    pub fn with_policy(mut self, policy: CandidatePolicy) -> Self {
        self.engine = DecisionEngine::new(policy);
        self
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.snapshot()
    }

    /// Call every dispatchable verifier in `registry` concurrently and wait for all of them.
    ///
    /// Returns one outcome per dispatched call, in registry order; empty when nothing is
    /// dispatchable.
    pub async fn dispatch(
        &self,
        registry: &Registry,
        image_b64: &str,
        total_timeout: Duration,
        request_id: &str,
    ) -> Vec<VerificationOutcome> {
        let selected: Vec<VerifierDescriptor> =
            registry.active_verifiers().into_iter().cloned().collect();
        if selected.is_empty() {
            tracing::info!(
                target: "ufro::fanout",
                request_id = %request_id,
                "no active verifiers configured"
            );
            return Vec::new();
        }

        let image: Arc<str> = Arc::from(image_b64);
        let tasks = selected.iter().map(|descriptor| {
            let verifier = Arc::clone(&self.verifier);
            let descriptor = descriptor.clone();
            let image = Arc::clone(&image);
            let request_id = request_id.to_string();
            tokio::spawn(async move {
                verifier
                    .verify(&descriptor, &image, total_timeout, Some(&request_id))
                    .await
            })
        });
        let settled = join_all(tasks).await;

        settled
            .into_iter()
            .zip(selected.iter())
            .map(|(result, descriptor)| match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = fault_message(e);
                    tracing::error!(
                        target: "ufro::fanout",
                        request_id = %request_id,
                        service = %descriptor.name,
                        error = %message,
                        "verifier task faulted"
                    );
                    CallOutcome::fault(&descriptor.name, &descriptor.endpoint, message)
                }
            })
            .collect()
    }

    /// Identify the person in `image_b64`.
    ///
    /// Only invalid input is an error. Backend failures of any kind end up as outcomes and,
    /// at worst, an `unknown` decision.
    pub async fn identify(
        &self,
        image_b64: &str,
        total_timeout: Duration,
        delta: f64,
        request_id: Option<String>,
    ) -> Result<IdentifyResult, IdentifyError> {
        validate(image_b64, total_timeout, delta)?;
        let request_id = request_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_request_id);
        let started = Instant::now();

        let registry = self.registry.snapshot();
        let outcomes = self
            .dispatch(&registry, image_b64, total_timeout, &request_id)
            .await;
        let verdict = self.engine.decide(&outcomes, &registry, delta);

        let timing_ms = started.elapsed().as_secs_f64() * 1000.0;
        let timeouts_count = outcomes.iter().filter(|o| o.timed_out).count();

        tracing::info!(
            target: "ufro::fanout",
            request_id = %request_id,
            decision = %verdict.decision,
            consulted = outcomes.len(),
            candidates = verdict.candidates.len(),
            timeouts = timeouts_count,
            timing_ms,
            "identify complete"
        );

        self.audit.publish(AuditRecord::Access(AccessRecord {
            request_id: request_id.clone(),
            timestamp: chrono::Utc::now(),
            route: IDENTIFY_ROUTE.to_string(),
            decision: verdict.decision,
            identity: verdict.identity,
            verifiers_consulted: outcomes.len(),
            timeouts_count,
            elapsed_ms: timing_ms,
            status_code: 200,
        }));

        Ok(IdentifyResult {
            decision: verdict.decision,
            identity: verdict.identity,
            candidates: verdict.candidates,
            timing_ms,
            request_id,
        })
    }
}
