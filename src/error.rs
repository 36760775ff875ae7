//! Error types for the Bench operator

use thiserror::Error;

/// Main error type for Bench operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error: user-supplied spec or operator settings are invalid.
    /// Non-retryable; reconciliation surfaces these as a failure condition
    /// instead of looping tightly.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Database provider error (provisioning, readiness, credentials)
    #[error("database provider error: {0}")]
    Provider(String),

    /// Requested capability exists as a variant but has no implementation
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A circuit breaker is open; the wrapped call was never attempted
    #[error("circuit breaker is open for {0}")]
    CircuitOpen(String),

    /// A half-open circuit breaker has exhausted its probe budget
    #[error("circuit breaker half-open request limit reached for {0}")]
    TooManyRequests(String),

    /// Optimistic-concurrency conflict on a status write; retry via requeue
    #[error("conflict updating {0}, retry required")]
    Conflict(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a not-implemented error with the given message
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a conflict error naming the contended object
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// True for errors that will not resolve by retrying with the same spec.
    ///
    /// Reconcilers map these to a `Failed` phase instead of requeueing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::NotImplemented(_) | Self::Serialization(_)
        )
    }

    /// True when a circuit breaker short-circuited the call without invoking
    /// the wrapped provider.
    pub fn is_circuit_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen(_) | Self::TooManyRequests(_))
    }
}
