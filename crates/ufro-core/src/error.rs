//! Error types for the broker.
//!
//! Backend failures are never errors here: they live in [`crate::CallOutcome`].
//! These enums cover caller input, registry loading and the audit side channel.

/// Caller-input problems rejected before any backend is contacted.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum IdentifyError {
    #[error("image_b64 is required")]
    MissingImage,
    #[error("delta must be a finite, non-negative number (got {0})")]
    InvalidDelta(f64),
    #[error("timeout must be greater than zero")]
    InvalidTimeout,
}

/// Question validation for the retrieval bridge.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AskError {
    #[error("question is required")]
    MissingQuestion,
    #[error("timeout must be greater than zero")]
    InvalidTimeout,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("registry parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit store: {0}")]
    Store(#[from] sled::Error),
    #[error("audit encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("audit channel full")]
    QueueFull,
    #[error("audit channel closed")]
    Closed,
}
