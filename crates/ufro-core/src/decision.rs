//! Candidate aggregation and the τ/δ decision rule.
//!
//! Outcomes become [`Candidate`]s when their payload is a JSON object carrying a `score`.
//! Candidates are ranked by score (stable, so dispatch order breaks ties) and the top one is
//! judged against τ from the registry, never against the threshold the backend reported.
//!
//! | top.is_me | top.score vs τ | runner-up within δ | decision   |
//! |-----------|----------------|--------------------|------------|
//! | true      | ≥ τ            | no / no runner-up  | identified |
//! | true      | ≥ τ            | yes                | ambiguous  |
//! | false     | ≥ τ            | any                | unknown    |
//! | any       | < τ            | any                | unknown    |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::outcome::CallOutcome;
use crate::registry::Registry;

/// Default ambiguity margin.
pub const DEFAULT_DELTA: f64 = 0.05;

const FALLBACK_REPORTED_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Identified,
    Ambiguous,
    #[default]
    Unknown,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Identified => "identified",
            Decision::Ambiguous => "ambiguous",
            Decision::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Populated only for [`Decision::Identified`]. `threshold` is the registry τ.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub score: f64,
    pub threshold: f64,
    pub is_me: bool,
}

/// A scoring record derived from one backend response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub service: String,
    pub is_me: bool,
    pub score: f64,
    /// What the backend claimed its threshold was. Informational only.
    #[serde(rename = "threshold")]
    pub reported_threshold: f64,
    pub timing_ms: f64,
}

/// What to do with a payload that has a `score` but malformed companion fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidatePolicy {
    /// Keep the candidate with all fields reset to defaults
    /// (`is_me=false, score=0, threshold=0.5, timing_ms=0`).
    #[default]
    Lenient,
    /// Drop the candidate unless `is_me` is a bool and the numeric fields are numbers.
    Strict,
}

impl std::str::FromStr for CandidatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lenient" => Ok(Self::Lenient),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown candidate policy: {}", other)),
        }
    }
}

impl Candidate {
    fn defaults(service: &str) -> Self {
        Self {
            service: service.to_string(),
            is_me: false,
            score: 0.0,
            reported_threshold: FALLBACK_REPORTED_THRESHOLD,
            timing_ms: 0.0,
        }
    }

    /// Build a candidate from an outcome, or `None` when the payload is unusable.
    pub fn from_outcome(outcome: &CallOutcome, policy: CandidatePolicy) -> Option<Self> {
        let obj = outcome.payload.as_ref()?.as_object()?;
        if !obj.contains_key("score") {
            return None;
        }
        match policy {
            CandidatePolicy::Lenient => Some(
                Self::coerce(&outcome.service_name, obj)
                    .unwrap_or_else(|| Self::defaults(&outcome.service_name)),
            ),
            CandidatePolicy::Strict => Self::strict(&outcome.service_name, obj),
        }
    }

    fn coerce(service: &str, obj: &Map<String, Value>) -> Option<Self> {
        let is_me = obj.get("is_me").map(truthy).unwrap_or(false);
        let score = obj.get("score").and_then(coerce_f64)?;
        let reported_threshold = match obj.get("threshold") {
            None => FALLBACK_REPORTED_THRESHOLD,
            Some(v) => coerce_f64(v)?,
        };
        let timing_ms = match obj.get("timing_ms") {
            None => 0.0,
            Some(v) => coerce_f64(v)?,
        };
        Some(Self {
            service: service.to_string(),
            is_me,
            score,
            reported_threshold,
            timing_ms,
        })
    }

    fn strict(service: &str, obj: &Map<String, Value>) -> Option<Self> {
        let number = |key: &str| obj.get(key)?.as_f64().filter(|n| n.is_finite());
        Some(Self {
            service: service.to_string(),
            is_me: obj.get("is_me")?.as_bool()?,
            score: number("score")?,
            reported_threshold: number("threshold")?,
            timing_ms: number("timing_ms")?,
        })
    }
}

/// Numbers, numeric strings and booleans coerce; everything else (and non-finite values) does not.
fn coerce_f64(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Loose truthiness: false, null, 0, "" and empty containers are false.
fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Candidates in dispatch order. Outcomes without a usable payload are skipped.
pub fn build_candidates(outcomes: &[CallOutcome], policy: CandidatePolicy) -> Vec<Candidate> {
    outcomes
        .iter()
        .filter_map(|o| Candidate::from_outcome(o, policy))
        .collect()
}

/// Score descending. `sort_by` is stable, so equal scores keep dispatch order.
/// Scores are finite here, and `-0.0` ties with `0.0`.
pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}

/// Apply the τ/δ rule to already ranked candidates.
pub fn decide_ranked(
    ranked: &[Candidate],
    registry: &Registry,
    delta: f64,
) -> (Decision, Option<Identity>) {
    let Some(top) = ranked.first() else {
        return (Decision::Unknown, None);
    };
    let tau = registry.threshold_for(&top.service);

    if top.is_me && top.score >= tau {
        match ranked.get(1) {
            Some(second) if top.score - second.score <= delta => (Decision::Ambiguous, None),
            _ => (
                Decision::Identified,
                Some(Identity {
                    score: top.score,
                    threshold: tau,
                    is_me: true,
                }),
            ),
        }
    } else {
        // Either below τ, or the backend explicitly denied the match despite a high score.
        (Decision::Unknown, None)
    }
}

/// Decision plus the ranked candidates it was made from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    pub identity: Option<Identity>,
    pub candidates: Vec<Candidate>,
}

/// Filters, ranks and decides.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionEngine {
    policy: CandidatePolicy,
}

impl DecisionEngine {
    pub fn new(policy: CandidatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> CandidatePolicy {
        self.policy
    }

    pub fn decide(&self, outcomes: &[CallOutcome], registry: &Registry, delta: f64) -> Verdict {
        let mut candidates = build_candidates(outcomes, self.policy);
        rank(&mut candidates);
        let (decision, identity) = decide_ranked(&candidates, registry, delta);

        tracing::debug!(
            target: "ufro::decision",
            outcomes = outcomes.len(),
            candidates = candidates.len(),
            top = candidates.first().map(|c| c.service.as_str()).unwrap_or("-"),
            decision = %decision,
            "decision made"
        );

        Verdict {
            decision,
            identity,
            candidates,
        }
    }
}
