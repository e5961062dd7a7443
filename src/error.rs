//! Error types for the Machine API operator
//!
//! Reconcilers only ever see these kinds; store backends translate their
//! transport errors on the way out so nothing above the store layer has to
//! look at HTTP status codes.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The object the call was keyed on does not exist
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Optimistic concurrency collision (stale resourceVersion, expected generation mismatch)
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store rejected the mutation
    #[error("invalid: {0}")]
    Invalid(String),

    /// Network failure, timeout or throttling
    #[error("transient error: {0}")]
    Transient(String),

    /// Bad input, bad manifest, missing referenced configuration
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Unrecoverable: lost leadership, failed startup
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Per-item failures collected during a multi-item reconcile
    #[error("{} errors occurred: [{}]", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Translate a kube client error into one of the operator's error kinds.
    pub fn from_kube(kind: &str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => Error::not_found(kind, name),
                409 => Error::Conflict(format!("{kind} {name}: {}", resp.message)),
                400 | 422 => Error::Invalid(format!("{kind} {name}: {}", resp.message)),
                408 | 429 | 500..=599 => {
                    Error::Transient(format!("{kind} {name}: {}", resp.message))
                }
                _ => Error::KubeError(kube::Error::Api(resp)),
            },
            kube::Error::HyperError(e) => Error::Transient(e.to_string()),
            kube::Error::Service(e) => Error::Transient(e.to_string()),
            other => Error::KubeError(other),
        }
    }

    /// Collapse a list of per-item errors: none -> Ok, one -> that error, many -> Aggregate.
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Whether the engine should retry with backoff.
    ///
    /// Invalid and configuration errors are still requeued by the engine (the
    /// input may be fixed by a user) but they surface as Degraded status first.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Conflict(_) | Error::Transient(_) | Error::KubeError(_) => true,
            Error::Aggregate(errors) => errors.iter().any(Error::is_retriable),
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// Short label used for the reconcile error counter.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Invalid(_) => "invalid",
            Error::Transient(_) => "transient",
            Error::ConfigError(_) => "config",
            Error::Fatal(_) => "fatal",
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) | Error::YamlError(_) => "serialization",
            Error::IoError(_) => "io",
            Error::Aggregate(_) => "aggregate",
        }
    }
}
