//! Gateway configuration.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | host | 127.0.0.1 | Bind address. |
//! | port | 8000 | HTTP port. |
//! | registry_path | conf/registry.toml | Backend registry file (missing = no backends). |
//! | registry_ttl_ms | 2000 | How long a registry snapshot is reused before re-reading the file. |
//! | audit_backend | sled | `sled`, `tracing` or `none`. |
//! | audit_path | ./data/audit | Sled directory when `audit_backend = "sled"`. |
//! | audit_queue_capacity | 1024 | Records buffered before new ones are dropped. |
//! | default_timeout_s | 15 | Per-call total timeout when a request does not set one. |
//! | default_delta | 0.05 | Ambiguity margin when a request does not set one. |
//! | candidate_policy | lenient | `lenient` or `strict` handling of malformed verifier fields. |
//!
//! Precedence: `UFRO__*` environment > file at `UFRO_CONFIG` (default `config/gateway.toml`)
//! > defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::decision::CandidatePolicy;

const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditBackend {
    Sled,
    Tracing,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub registry_path: String,
    pub registry_ttl_ms: u64,
    pub audit_backend: AuditBackend,
    pub audit_path: String,
    pub audit_queue_capacity: usize,
    pub default_timeout_s: u64,
    pub default_delta: f64,
    #[serde(default)]
    pub candidate_policy: CandidatePolicy,
}

impl GatewayConfig {
    /// Load using `UFRO_CONFIG` (or `config/gateway.toml`) plus environment overrides.
    pub fn load() -> Result<Self, config::ConfigError> {
        let path = std::env::var("UFRO_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from an explicit file path. A missing file just means defaults.
    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .set_default("host", "127.0.0.1")?
            .set_default("port", 8000_i64)?
            .set_default("registry_path", "conf/registry.toml")?
            .set_default("registry_ttl_ms", 2000_i64)?
            .set_default("audit_backend", "sled")?
            .set_default("audit_path", "./data/audit")?
            .set_default("audit_queue_capacity", 1024_i64)?
            .set_default("default_timeout_s", 15_i64)?
            .set_default("default_delta", 0.05_f64)?
            .set_default("candidate_policy", "lenient")?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path).format(config::FileFormat::Toml))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("UFRO").separator("__"))
            .build()?;

        built.try_deserialize()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn registry_ttl(&self) -> Duration {
        Duration::from_millis(self.registry_ttl_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_s)
    }
}
