//! End-to-end fan-out over real HTTP.
//!
//! Each test stands up throwaway axum backends on ephemeral ports and points a registry at
//! them, so timeouts, refused connections and junk bodies go through the real client.

use axum::{http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use ufro_core::{
    AuditHandle, Decision, FanOutOrchestrator, FileRegistry, HttpVerifier, Identity, Registry,
    RegistrySource, SledAuditSink, StaticRegistry, VerifierDescriptor, DEFAULT_DELTA,
};

const IMAGE: &str = "aW1hZ2UtYnl0ZXM=";

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}/verify", addr)
}

/// Backend that checks the request shape and answers with `body`.
async fn verifier_answering(body: Value) -> String {
    serve(Router::new().route(
        "/verify",
        post(move |Json(req): Json<Value>| {
            let body = body.clone();
            async move {
                if req.get("image_b64").and_then(Value::as_str) != Some(IMAGE) {
                    return (StatusCode::BAD_REQUEST, Json(json!({"error": "no image"})));
                }
                (StatusCode::OK, Json(body))
            }
        }),
    ))
    .await
}

async fn slow_verifier(delay: Duration) -> String {
    serve(Router::new().route(
        "/verify",
        post(move || async move {
            tokio::time::sleep(delay).await;
            Json(json!({"is_me": true, "score": 0.99}))
        }),
    ))
    .await
}

async fn junk_verifier() -> String {
    serve(Router::new().route("/verify", post(|| async { "<html>gateway</html>" }))).await
}

/// An address nobody listens on.
async fn refused_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/verify", addr)
}

fn score(is_me: bool, score: f64) -> Value {
    json!({"is_me": is_me, "score": score, "threshold": 0.5, "timing_ms": 41.5})
}

fn orchestrator(verifiers: Vec<VerifierDescriptor>, audit: AuditHandle) -> FanOutOrchestrator {
    let verifier = HttpVerifier::new(audit.clone()).unwrap();
    FanOutOrchestrator::new(
        Arc::new(StaticRegistry::new(Registry::new(verifiers, vec![]))),
        Arc::new(verifier),
        audit,
    )
}

#[tokio::test]
async fn adapter_success_parses_payload() {
    let endpoint = verifier_answering(score(true, 0.97)).await;
    let verifier = HttpVerifier::new(AuditHandle::disabled()).unwrap();
    let o = verifier
        .call("A", &endpoint, IMAGE, Duration::from_secs(5), None)
        .await;
    assert_eq!(o.status_code, Some(200));
    assert_eq!(o.payload, Some(score(true, 0.97)));
    assert!(!o.timed_out);
    assert!(o.error.is_none());
    assert!(o.latency_ms > 0.0);
}

#[tokio::test]
async fn adapter_timeout_is_flagged() {
    let endpoint = slow_verifier(Duration::from_secs(3)).await;
    let verifier = HttpVerifier::new(AuditHandle::disabled()).unwrap();
    let started = Instant::now();
    let o = verifier
        .call("slow", &endpoint, IMAGE, Duration::from_millis(250), None)
        .await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(o.timed_out);
    assert_eq!(o.error.as_deref(), Some("timeout"));
    assert!(o.payload.is_none());
    assert!(o.status_code.is_none());
    assert!(o.latency_ms >= 200.0);
}

#[tokio::test]
async fn adapter_connection_refused_is_connection_error() {
    let endpoint = refused_endpoint().await;
    let verifier = HttpVerifier::new(AuditHandle::disabled()).unwrap();
    let o = verifier
        .call("down", &endpoint, IMAGE, Duration::from_secs(2), None)
        .await;
    assert!(!o.timed_out);
    let err = o.error.unwrap();
    assert!(err.starts_with("connection_error: "), "{}", err);
}

#[tokio::test]
async fn adapter_junk_body_is_soft_failure() {
    let endpoint = junk_verifier().await;
    let verifier = HttpVerifier::new(AuditHandle::disabled()).unwrap();
    let o = verifier
        .call("junk", &endpoint, IMAGE, Duration::from_secs(2), None)
        .await;
    assert_eq!(o.status_code, Some(200));
    assert!(o.payload.is_none());
    assert!(o.error.is_none());
    assert!(!o.timed_out);
}

#[tokio::test]
async fn two_close_scores_are_ambiguous() {
    let a = verifier_answering(score(true, 0.97)).await;
    let b = verifier_answering(score(true, 0.95)).await;
    let o = orchestrator(
        vec![
            VerifierDescriptor::new("A", a).with_threshold(0.9),
            VerifierDescriptor::new("B", b),
        ],
        AuditHandle::disabled(),
    );
    let r = o.identify(IMAGE, Duration::from_secs(5), DEFAULT_DELTA, None).await.unwrap();
    assert_eq!(r.decision, Decision::Ambiguous);
    assert!(r.identity.is_none());
    assert_eq!(r.candidates[0].service, "A");
    assert_eq!(r.candidates.len(), 2);
}

#[tokio::test]
async fn single_confident_backend_identifies() {
    let a = verifier_answering(score(true, 0.97)).await;
    let o = orchestrator(
        vec![VerifierDescriptor::new("A", a).with_threshold(0.9)],
        AuditHandle::disabled(),
    );
    let r = o.identify(IMAGE, Duration::from_secs(5), DEFAULT_DELTA, None).await.unwrap();
    assert_eq!(r.decision, Decision::Identified);
    assert_eq!(
        r.identity,
        Some(Identity {
            score: 0.97,
            threshold: 0.9,
            is_me: true
        })
    );
    assert_eq!(r.candidates[0].timing_ms, 41.5);
}

#[tokio::test]
async fn confident_negative_is_unknown() {
    let a = verifier_answering(score(false, 0.95)).await;
    let o = orchestrator(
        vec![VerifierDescriptor::new("A", a).with_threshold(0.9)],
        AuditHandle::disabled(),
    );
    let r = o.identify(IMAGE, Duration::from_secs(5), DEFAULT_DELTA, None).await.unwrap();
    assert_eq!(r.decision, Decision::Unknown);
    assert_eq!(r.candidates.len(), 1);
}

#[tokio::test]
async fn every_backend_failing_still_settles() {
    let slow_1 = slow_verifier(Duration::from_secs(3)).await;
    let slow_2 = slow_verifier(Duration::from_secs(3)).await;
    let down_1 = refused_endpoint().await;
    let junk = junk_verifier().await;
    let o = orchestrator(
        vec![
            VerifierDescriptor::new("slow-1", slow_1),
            VerifierDescriptor::new("down-1", down_1),
            VerifierDescriptor::new("slow-2", slow_2),
            VerifierDescriptor::new("junk", junk),
        ],
        AuditHandle::disabled(),
    );

    let registry = o.registry();
    let started = Instant::now();
    let outcomes = o
        .dispatch(&registry, IMAGE, Duration::from_millis(300), "req")
        .await;
    // Two 300ms timeouts side by side, not back to back.
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_eq!(outcomes.len(), 4);
    assert_eq!(outcomes.iter().filter(|x| x.timed_out).count(), 2);
    assert!(outcomes[1].error.as_deref().unwrap().starts_with("connection_error: "));

    let r = o.identify(IMAGE, Duration::from_millis(300), DEFAULT_DELTA, None).await.unwrap();
    assert_eq!(r.decision, Decision::Unknown);
    assert!(r.candidates.is_empty());
}

#[tokio::test]
async fn failing_backend_does_not_mask_a_good_one() {
    let good = verifier_answering(score(true, 0.96)).await;
    let down = refused_endpoint().await;
    let o = orchestrator(
        vec![
            VerifierDescriptor::new("down", down),
            VerifierDescriptor::new("good", good),
        ],
        AuditHandle::disabled(),
    );
    let r = o.identify(IMAGE, Duration::from_secs(5), DEFAULT_DELTA, None).await.unwrap();
    assert_eq!(r.decision, Decision::Identified);
    assert_eq!(r.candidates.len(), 1);
}

#[tokio::test]
async fn inactive_backends_are_not_called() {
    let active = verifier_answering(score(true, 0.91)).await;
    let inactive = verifier_answering(score(true, 0.99)).await;
    let o = orchestrator(
        vec![
            VerifierDescriptor::new("inactive", inactive).inactive(),
            VerifierDescriptor::new("active", active),
        ],
        AuditHandle::disabled(),
    );
    let r = o.identify(IMAGE, Duration::from_secs(5), DEFAULT_DELTA, None).await.unwrap();
    assert_eq!(r.candidates.len(), 1);
    assert_eq!(r.candidates[0].service, "active");
}

#[tokio::test]
async fn audit_trail_lands_in_sled() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(SledAuditSink::open(Some(dir.path())).unwrap());
    let (audit, writer) = AuditHandle::spawn(sink.clone(), 64);

    let a = verifier_answering(score(true, 0.97)).await;
    let down = refused_endpoint().await;
    let o = orchestrator(
        vec![VerifierDescriptor::new("A", a), VerifierDescriptor::new("down", down)],
        audit,
    );
    let r = o
        .identify(IMAGE, Duration::from_secs(5), DEFAULT_DELTA, Some("trace-1".into()))
        .await
        .unwrap();
    drop(o);
    writer.await.unwrap();

    let calls = sink.recent_service_calls(10).unwrap();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.request_id == "trace-1"));
    assert!(calls.iter().any(|c| c.error.is_some()));

    let access = sink.recent_access(10).unwrap();
    assert_eq!(access.len(), 1);
    assert_eq!(access[0].decision, r.decision);
    assert_eq!(access[0].verifiers_consulted, 2);
    assert_eq!(access[0].timeouts_count, 0);
}

#[tokio::test]
async fn registry_edits_apply_without_restart() {
    let a = verifier_answering(score(true, 0.97)).await;
    let b = verifier_answering(score(true, 0.96)).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.toml");
    std::fs::write(
        &path,
        format!("[[verifiers]]\nname = \"A\"\nendpoint = \"{}\"\n", a),
    )
    .unwrap();

    let registry: Arc<dyn RegistrySource> = Arc::new(FileRegistry::new(&path, Duration::ZERO));
    let o = FanOutOrchestrator::new(
        registry,
        Arc::new(HttpVerifier::new(AuditHandle::disabled()).unwrap()),
        AuditHandle::disabled(),
    );
    let first = o.identify(IMAGE, Duration::from_secs(5), DEFAULT_DELTA, None).await.unwrap();
    assert_eq!(first.decision, Decision::Identified);

    std::fs::write(
        &path,
        format!(
            "[[verifiers]]\nname = \"A\"\nendpoint = \"{}\"\n\n[[verifiers]]\nname = \"B\"\nendpoint = \"{}\"\n",
            a, b
        ),
    )
    .unwrap();
    let second = o.identify(IMAGE, Duration::from_secs(5), DEFAULT_DELTA, None).await.unwrap();
    assert_eq!(second.decision, Decision::Ambiguous);
    assert_eq!(second.candidates.len(), 2);
}

#[tokio::test]
async fn blank_endpoint_settles_as_error_outcome() {
    let good = verifier_answering(score(true, 0.96)).await;
    let o = orchestrator(
        vec![
            VerifierDescriptor::new("blank", "  "),
            VerifierDescriptor::new("good", good),
        ],
        AuditHandle::disabled(),
    );
    let registry = o.registry();
    let outcomes = o
        .dispatch(&registry, IMAGE, Duration::from_secs(5), "req")
        .await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].service_name, "blank");
    assert!(outcomes[0].error.is_some());
    assert!(!outcomes[0].timed_out);
    assert!(outcomes[1].is_success());
}
