//! UFRO Gateway: thin HTTP surface over the identity broker.
//! Identify fan-out, retrieval questions, health and the recent audit trail.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ufro_core::{
    AccessRecord, AuditBackend, AuditError, AuditHandle, FanOutOrchestrator, FileRegistry,
    GatewayConfig, HttpVerifier, RegistrySource, RetrievalBridge, ServiceCallRecord,
    SledAuditSink, TracingAuditSink, CONNECT_TIMEOUT,
};

const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_RECENT: usize = 500;

struct AppState {
    registry: Arc<dyn RegistrySource>,
    orchestrator: FanOutOrchestrator,
    bridge: RetrievalBridge,
    audit_backend: AuditBackend,
    audit_store: Option<Arc<SledAuditSink>>,
    default_timeout: Duration,
    default_delta: f64,
}

#[derive(Deserialize)]
struct IdentifyRequest {
    #[serde(default)]
    image_b64: String,
    #[serde(default)]
    timeout_s: Option<f64>,
    #[serde(default)]
    delta: Option<f64>,
}

#[derive(Deserialize)]
struct AskRequest {
    #[serde(default)]
    question: String,
    #[serde(default)]
    timeout_s: Option<f64>,
}

#[derive(Deserialize)]
struct RecentQuery {
    #[serde(default = "default_recent_limit")]
    limit: usize,
}

fn default_recent_limit() -> usize {
    50
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = GatewayConfig::load()?;
    let (state, audit_writer) = build_state(&cfg)?;
    let state = Arc::new(state);
    let store = state.audit_store.clone();

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr()).await?;
    tracing::info!(
        target: "ufro::gateway",
        addr = %cfg.bind_addr(),
        registry = %cfg.registry_path,
        audit = ?cfg.audit_backend,
        version = ufro_core::version(),
        "gateway listening"
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router and its state are gone, so every audit sender is closed.
    drain_audit(audit_writer, store).await;
    Ok(())
}

/// Wait for the writer to empty the audit queue, then flush the store.
async fn drain_audit(writer: Option<JoinHandle<()>>, store: Option<Arc<SledAuditSink>>) {
    if let Some(writer) = writer {
        if let Err(e) = writer.await {
            tracing::warn!(target: "ufro::gateway", error = %e, "audit writer ended abnormally");
        }
    }
    let Some(store) = store else {
        return;
    };
    match tokio::task::spawn_blocking(move || store.flush()).await {
        Ok(Ok(())) => tracing::info!(target: "ufro::gateway", "audit store flushed"),
        Ok(Err(e)) => {
            tracing::warn!(target: "ufro::gateway", error = %e, "audit flush on shutdown failed")
        }
        Err(e) => {
            tracing::warn!(target: "ufro::gateway", error = %e, "audit flush task failed")
        }
    }
}

/// Wires the shared state. Also returns the audit writer task, if one was started.
fn build_state(
    cfg: &GatewayConfig,
) -> Result<(AppState, Option<JoinHandle<()>>), Box<dyn std::error::Error>> {
    let registry: Arc<dyn RegistrySource> =
        Arc::new(FileRegistry::new(&cfg.registry_path, cfg.registry_ttl()));

    // The writer stops once the last handle is dropped.
    let (audit, audit_writer, audit_store) = match cfg.audit_backend {
        AuditBackend::Sled => {
            let store = Arc::new(SledAuditSink::open(Some(&cfg.audit_path))?);
            let (handle, writer) = AuditHandle::spawn(store.clone(), cfg.audit_queue_capacity);
            (handle, Some(writer), Some(store))
        }
        AuditBackend::Tracing => {
            let (handle, writer) =
                AuditHandle::spawn(Arc::new(TracingAuditSink), cfg.audit_queue_capacity);
            (handle, Some(writer), None)
        }
        AuditBackend::None => (AuditHandle::disabled(), None, None),
    };

    // One pool shared by verifier and retrieval calls.
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?;

    let verifier = HttpVerifier::with_client(client.clone(), audit.clone());
    let orchestrator =
        FanOutOrchestrator::new(Arc::clone(&registry), Arc::new(verifier), audit.clone())
            .with_policy(cfg.candidate_policy);
    let bridge = RetrievalBridge::with_client(Arc::clone(&registry), client, audit);

    let state = AppState {
        registry,
        orchestrator,
        bridge,
        audit_backend: cfg.audit_backend,
        audit_store,
        default_timeout: cfg.default_timeout(),
        default_delta: cfg.default_delta,
    };
    Ok((state, audit_writer))
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/identify", post(identify_handler))
        .route("/ask", post(ask_handler))
        .route("/audit/recent", get(recent_audit_handler))
        .with_state(state)
        .layer(axum::middleware::from_fn(log_traffic))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(target: "ufro::gateway", error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    tracing::info!(target: "ufro::gateway", "shutting down");
}

async fn log_traffic(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    tracing::info!(
        target: "ufro::gateway",
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
        "request served"
    );
    response
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let registry = state.registry.snapshot();
    let audit_healthy = state
        .audit_store
        .as_ref()
        .map(|s| s.is_healthy())
        .unwrap_or(true);
    let status = if audit_healthy { "ok" } else { "degraded" };

    Json(serde_json::json!({
        "status": status,
        "version": ufro_core::version(),
        "verifiers": {
            "configured": registry.verifiers.len(),
            "active": registry.active_verifiers().len(),
        },
        "retrieval": registry.retrieval.len(),
        "audit": {
            "backend": state.audit_backend,
            "healthy": audit_healthy,
        },
    }))
}

/// POST /identify: fan out to every active verifier and decide.
async fn identify_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IdentifyRequest>,
) -> Result<Response, (StatusCode, String)> {
    let timeout = timeout_or(body.timeout_s, state.default_timeout)?;
    let delta = body.delta.unwrap_or(state.default_delta);

    let result = state
        .orchestrator
        .identify(&body.image_b64, timeout, delta, request_id_from(&headers))
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let request_id = result.request_id.clone();
    Ok(with_request_id(Json(result).into_response(), &request_id))
}

/// POST /ask: one question to the first retrieval backend.
async fn ask_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AskRequest>,
) -> Result<Json<ufro_core::Answer>, (StatusCode, String)> {
    let timeout = timeout_or(body.timeout_s, state.default_timeout)?;
    let answer = state
        .bridge
        .ask(&body.question, timeout, request_id_from(&headers))
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(answer))
}

/// GET /audit/recent: newest access and service-call records from the sled store.
async fn recent_audit_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let Some(store) = state.audit_store.as_ref() else {
        return Err((
            StatusCode::NOT_FOUND,
            "audit store not enabled".to_string(),
        ));
    };
    let limit = query.limit.min(MAX_RECENT);

    let store = Arc::clone(store);
    let read = tokio::task::spawn_blocking(
        move || -> Result<(Vec<AccessRecord>, Vec<ServiceCallRecord>), AuditError> {
            Ok((store.recent_access(limit)?, store.recent_service_calls(limit)?))
        },
    )
    .await;
    let (access, service_calls) = match read {
        Ok(Ok(rows)) => rows,
        Ok(Err(e)) => return Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        Err(e) => return Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    };

    Ok(Json(serde_json::json!({
        "access": access,
        "service_calls": service_calls,
    })))
}

fn timeout_or(secs: Option<f64>, default: Duration) -> Result<Duration, (StatusCode, String)> {
    match secs {
        None => Ok(default),
        Some(s) => Duration::try_from_secs_f64(s)
            .map_err(|_| (StatusCode::BAD_REQUEST, format!("invalid timeout_s: {}", s))),
    }
}

fn request_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
