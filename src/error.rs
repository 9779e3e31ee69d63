//! Error types for the review pipeline

use thiserror::Error;

/// Result type for review pipeline operations
pub type ReviewResult<T> = Result<T, ReviewError>;

/// Error classification used by the phase error boundary.
///
/// Orthogonal to transport: the same kind can originate from an LLM call,
/// a search connector, or the checkpoint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Inputs malformed; never retried
    Validation,
    /// LLM / database / PDF transport failure
    External,
    /// Persisted state is corrupt; fatal even for optional phases
    Data,
    /// Cooperative cancellation
    Cancelled,
    /// Anything else; treated as external
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::External => "external",
            ErrorKind::Data => "data",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Errors surfaced by the review pipeline
#[derive(Error, Debug)]
pub enum ReviewError {
    /// Invalid configuration file or values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Phase inputs missing from accumulated state
    #[error("Phase '{phase}' dependencies not met: missing {missing:?}")]
    DependencyUnmet { phase: String, missing: Vec<String> },

    /// A PRISMA counter setter would break a flow invariant
    #[error("PRISMA invariant violated: {0}")]
    PrismaInvariant(String),

    /// Transient external failure (network, rate limit, 5xx)
    #[error("Transient external error: {0}")]
    ExternalTransient(String),

    /// Permanent external failure (4xx, schema mismatch, bad credentials)
    #[error("Permanent external error: {0}")]
    ExternalPermanent(String),

    /// Checkpoint or payload failed to deserialize
    #[error("Corrupt state: {0}")]
    DataCorrupt(String),

    /// Circuit breaker rejected the call without invoking the operation
    #[error("Circuit breaker open for '{0}'")]
    CircuitOpen(String),

    /// Operation exceeded its per-call timeout
    #[error("Operation timed out")]
    Timeout,

    /// Run context was cancelled
    #[error("Run cancelled")]
    Cancelled,

    /// A reliability gate rejected the run in strict mode
    #[error("Reliability gate '{gate}' failed: {details}")]
    GateFailed { gate: String, details: String },

    /// Checkpoint store I/O failure
    #[error("State persistence error: {0}")]
    StatePersistence(String),

    /// Central run registry failure
    #[error("Run registry error: {0}")]
    Registry(String),

    /// Handler input validation failure
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal invariant failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReviewError {
    /// Classify this error for the phase error boundary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReviewError::Config(_)
            | ReviewError::DependencyUnmet { .. }
            | ReviewError::PrismaInvariant(_)
            | ReviewError::GateFailed { .. }
            | ReviewError::Validation(_) => ErrorKind::Validation,
            ReviewError::ExternalTransient(_)
            | ReviewError::ExternalPermanent(_)
            | ReviewError::CircuitOpen(_)
            | ReviewError::Timeout => ErrorKind::External,
            ReviewError::DataCorrupt(_)
            | ReviewError::StatePersistence(_)
            | ReviewError::Registry(_) => ErrorKind::Data,
            ReviewError::Cancelled => ErrorKind::Cancelled,
            ReviewError::Internal(_) => ErrorKind::Unknown,
        }
    }

    /// Whether a retry policy may attempt this error again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReviewError::ExternalTransient(_) | ReviewError::Timeout
        )
    }
}

impl From<std::io::Error> for ReviewError {
    fn from(err: std::io::Error) -> Self {
        ReviewError::StatePersistence(err.to_string())
    }
}

impl From<serde_json::Error> for ReviewError {
    fn from(err: serde_json::Error) -> Self {
        ReviewError::DataCorrupt(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ReviewError {
    fn from(err: serde_yaml::Error) -> Self {
        ReviewError::Config(format!("YAML error: {}", err))
    }
}

impl From<rusqlite::Error> for ReviewError {
    fn from(err: rusqlite::Error) -> Self {
        ReviewError::Registry(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_external() {
        let err = ReviewError::ExternalTransient("429".to_string());
        assert_eq!(err.kind(), ErrorKind::External);
        assert!(err.is_transient());
    }

    #[test]
    fn permanent_external_is_not_transient() {
        let err = ReviewError::ExternalPermanent("401 invalid key".to_string());
        assert_eq!(err.kind(), ErrorKind::External);
        assert!(!err.is_transient());
    }

    #[test]
    fn corrupt_state_is_data_kind() {
        let err = ReviewError::DataCorrupt("truncated checkpoint".to_string());
        assert_eq!(err.kind(), ErrorKind::Data);
    }
}
