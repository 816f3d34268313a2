//! UFRO identity broker core library.
//!
//! Fans an image out to every active verifier backend, ranks what comes back and decides
//! `identified`, `ambiguous` or `unknown` from a configured threshold (τ) and a per-request
//! ambiguity margin (δ). Also hosts the small retrieval bridge and its citation normalizer.

pub mod audit;
pub mod citations;
pub mod config;
pub mod decision;
pub mod error;
pub mod fanout;
pub mod outcome;
pub mod registry;
pub mod retrieval;
pub mod verifier;

pub use audit::{
    AccessRecord, AuditHandle, AuditRecord, AuditSink, ServiceCallRecord, ServiceType,
    SledAuditSink, TracingAuditSink,
};
pub use citations::{normalize, Citation};
pub use config::{AuditBackend, GatewayConfig};
pub use decision::{
    build_candidates, decide_ranked, rank, Candidate, CandidatePolicy, Decision, DecisionEngine,
    Identity, Verdict, DEFAULT_DELTA,
};
pub use error::{AskError, AuditError, IdentifyError, RegistryError};
pub use fanout::{new_request_id, FanOutOrchestrator, IdentifyResult, DEFAULT_TIMEOUT, IDENTIFY_ROUTE};
pub use outcome::{CallOutcome, VerificationOutcome, CONNECT_TIMEOUT};
pub use registry::{
    FileRegistry, Registry, RegistrySource, RetrievalDescriptor, StaticRegistry,
    VerifierDescriptor, DEFAULT_THRESHOLD,
};
pub use retrieval::{Answer, RetrievalBridge, NOT_CONFIGURED_TEXT};
pub use verifier::{HttpVerifier, Verifier};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
