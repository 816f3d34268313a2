//! Backend registry: which verifiers and retrieval services exist, and their thresholds.
//!
//! The broker only ever reads a [`Registry`] snapshot. Where the snapshot comes from is a
//! [`RegistrySource`]: a fixed value for tests and embedding, or a TOML file that is re-read
//! once its cached copy is older than a configured TTL so edits apply without a restart.
//!
//! ```toml
//! [[verifiers]]
//! name = "face-a"
//! endpoint = "http://10.0.0.5:8080/verify"
//! threshold = 0.92
//!
//! [[retrieval]]
//! name = "normativa"
//! endpoint = "http://10.0.0.9:5813/query"
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::error::RegistryError;

/// Threshold applied when a verifier has no usable configured threshold.
pub const DEFAULT_THRESHOLD: f64 = 0.9;

fn default_true() -> bool {
    true
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

/// One verification backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierDescriptor {
    #[serde(default)]
    pub name: String,
    /// `endpoint_verify` is accepted for registries written against the older key.
    #[serde(default, alias = "endpoint_verify")]
    pub endpoint: String,
    #[serde(default = "default_true", deserialize_with = "lenient_active")]
    pub active: bool,
    /// Authoritative τ for candidates produced by this backend.
    #[serde(default = "default_threshold", deserialize_with = "lenient_threshold")]
    pub threshold: f64,
}

impl VerifierDescriptor {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            active: true,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Eligible for dispatch: active with a non-empty endpoint. A malformed endpoint is still
    /// dispatched and settles as an error outcome.
    pub fn is_dispatchable(&self) -> bool {
        self.active && !self.endpoint.is_empty()
    }
}

/// One document-retrieval backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub endpoint: String,
}

impl RetrievalDescriptor {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// Truthiness: older registries wrote `active = 1` or `active = "yes"`.
fn lenient_active<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match toml::Value::deserialize(deserializer)? {
        toml::Value::Boolean(b) => b,
        toml::Value::Integer(i) => i != 0,
        toml::Value::Float(f) => f != 0.0,
        toml::Value::String(s) => !s.is_empty(),
        toml::Value::Array(a) => !a.is_empty(),
        toml::Value::Table(t) => !t.is_empty(),
        toml::Value::Datetime(_) => true,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawThreshold {
    Number(f64),
    Text(String),
    Other(serde::de::IgnoredAny),
}

/// Numbers pass through, numeric strings are parsed, anything else is the default τ.
fn lenient_threshold<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = match RawThreshold::deserialize(deserializer)? {
        RawThreshold::Number(n) => n,
        RawThreshold::Text(s) => s.trim().parse::<f64>().unwrap_or(DEFAULT_THRESHOLD),
        RawThreshold::Other(_) => DEFAULT_THRESHOLD,
    };
    Ok(if value.is_finite() { value } else { DEFAULT_THRESHOLD })
}

/// Immutable registry snapshot. Order of `verifiers` is dispatch order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub verifiers: Vec<VerifierDescriptor>,
    #[serde(default)]
    pub retrieval: Vec<RetrievalDescriptor>,
}

impl Registry {
    pub fn new(verifiers: Vec<VerifierDescriptor>, retrieval: Vec<RetrievalDescriptor>) -> Self {
        Self {
            verifiers,
            retrieval,
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Verifiers that will be called, in registry order.
    pub fn active_verifiers(&self) -> Vec<&VerifierDescriptor> {
        self.verifiers.iter().filter(|v| v.is_dispatchable()).collect()
    }

    /// τ for a service: the first entry carrying that name (active or not), else 0.9.
    pub fn threshold_for(&self, service: &str) -> f64 {
        self.verifiers
            .iter()
            .find(|v| v.name == service)
            .map(|v| v.threshold)
            .unwrap_or(DEFAULT_THRESHOLD)
    }

    /// The retrieval bridge always talks to the first configured backend.
    pub fn primary_retrieval(&self) -> Option<&RetrievalDescriptor> {
        self.retrieval.first()
    }

    pub fn is_empty(&self) -> bool {
        self.verifiers.is_empty() && self.retrieval.is_empty()
    }
}

/// Hands out the registry snapshot for one request.
pub trait RegistrySource: Send + Sync {
    fn snapshot(&self) -> Arc<Registry>;
}

/// A registry that never changes.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    registry: Arc<Registry>,
}

impl StaticRegistry {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

impl RegistrySource for StaticRegistry {
    fn snapshot(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }
}

struct CachedRegistry {
    registry: Arc<Registry>,
    loaded_at: Instant,
}

/// TOML file registry with a short-lived cache.
///
/// A missing file is an empty registry. A file that fails to parse keeps serving the last
/// good snapshot (or an empty one) until the next reload attempt.
pub struct FileRegistry {
    path: PathBuf,
    ttl: Duration,
    cache: RwLock<Option<CachedRegistry>>,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            cache: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the file. `Ok(None)` when it does not exist.
    pub fn load(path: &Path) -> Result<Option<Registry>, RegistryError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Registry::from_toml_str(&content)
            .map(Some)
            .map_err(|source| RegistryError::Parse {
                path: path.display().to_string(),
                source,
            })
    }

    fn fresh(&self) -> Option<Arc<Registry>> {
        let guard = self.cache.read().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .filter(|c| c.loaded_at.elapsed() < self.ttl)
            .map(|c| Arc::clone(&c.registry))
    }

    fn reload(&self) -> Arc<Registry> {
        let mut guard = self.cache.write().unwrap_or_else(|e| e.into_inner());
        // Another request may have refreshed while we waited for the lock.
        if let Some(c) = guard.as_ref().filter(|c| c.loaded_at.elapsed() < self.ttl) {
            return Arc::clone(&c.registry);
        }

        let registry = match Self::load(&self.path) {
            Ok(Some(registry)) => {
                tracing::debug!(
                    target: "ufro::registry",
                    path = %self.path.display(),
                    verifiers = registry.verifiers.len(),
                    retrieval = registry.retrieval.len(),
                    "registry loaded"
                );
                Arc::new(registry)
            }
            Ok(None) => {
                tracing::debug!(
                    target: "ufro::registry",
                    path = %self.path.display(),
                    "registry file absent; no backends configured"
                );
                Arc::new(Registry::default())
            }
            Err(e) => {
                tracing::warn!(target: "ufro::registry", error = %e, "registry reload failed");
                guard
                    .as_ref()
                    .map(|c| Arc::clone(&c.registry))
                    .unwrap_or_default()
            }
        };

        *guard = Some(CachedRegistry {
            registry: Arc::clone(&registry),
            loaded_at: Instant::now(),
        });
        registry
    }
}

impl RegistrySource for FileRegistry {
    fn snapshot(&self) -> Arc<Registry> {
        self.fresh().unwrap_or_else(|| self.reload())
    }
}
