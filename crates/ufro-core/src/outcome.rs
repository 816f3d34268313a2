//! The normalized record every backend call settles into, and the shared HTTP call path.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Connect-phase bound for every backend call. The total bound is per call.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one backend call.
///
/// Exactly one of `payload`, `timed_out` or `error` carries the signal. A call that
/// completed with an unparseable body has none of them set and is simply not a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub service_name: String,
    pub endpoint: String,
    pub latency_ms: f64,
    pub status_code: Option<u16>,
    /// Backend JSON body, when it parsed.
    #[serde(rename = "result")]
    pub payload: Option<Value>,
    pub timed_out: bool,
    pub error: Option<String>,
}

/// Outcome of a verifier call.
pub type VerificationOutcome = CallOutcome;

impl CallOutcome {
    pub fn new(service_name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            endpoint: endpoint.into(),
            latency_ms: 0.0,
            status_code: None,
            payload: None,
            timed_out: false,
            error: None,
        }
    }

    /// Synthetic outcome for a call that faulted instead of settling.
    pub fn fault(
        service_name: impl Into<String>,
        endpoint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(service_name, endpoint)
        }
    }

    pub fn is_success(&self) -> bool {
        !self.timed_out && self.error.is_none()
    }

    fn apply_failure(&mut self, err: &reqwest::Error) {
        self.payload = None;
        self.status_code = None;
        if err.is_timeout() {
            self.timed_out = true;
            self.error = Some("timeout".to_string());
        } else if err.is_connect() {
            self.error = Some(format!("connection_error: {}", error_chain(err)));
        } else {
            self.error = Some(error_chain(err));
        }
    }
}

/// `Display` of an error and all of its sources, `": "`-joined.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(s) = source {
        let text = s.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = s.source();
    }
    out
}

/// POST `body` as JSON and settle into a [`CallOutcome`]. Never fails.
pub(crate) async fn post_json<B>(
    client: &reqwest::Client,
    service_name: &str,
    endpoint: &str,
    body: &B,
    total_timeout: Duration,
) -> CallOutcome
where
    B: Serialize + ?Sized,
{
    let mut outcome = CallOutcome::new(service_name, endpoint);
    let started = Instant::now();

    let result = async {
        let response = client
            .post(endpoint)
            .timeout(total_timeout)
            .json(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        Ok::<_, reqwest::Error>((status, bytes))
    }
    .await;

    outcome.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    match result {
        Ok((status, bytes)) => {
            outcome.status_code = Some(status);
            outcome.payload = serde_json::from_slice(&bytes).ok();
        }
        Err(e) => outcome.apply_failure(&e),
    }
    outcome
}
