//! Error types for the TrainJob operator
//!
//! Errors are structured with fields to aid debugging in production, and
//! carry a retryability classification the work queue uses to decide
//! between rate-limited re-enqueue and dropping the key.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for trainops operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A work-queue key that cannot be split into namespace and name
    #[error("invalid job key {key:?}: expected namespace/name")]
    InvalidKey {
        /// The offending key
        key: String,
    },

    /// A job object that cannot be reconciled as stored
    #[error("invalid job {job}: {message}")]
    InvalidJob {
        /// Namespaced name of the job
        job: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "dispatcher", "reconciler")
        context: String,
    },
}

impl Error {
    /// Create an invalid-key error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey { key: key.into() }
    }

    /// Create an invalid-job error
    pub fn invalid_job(job: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidJob {
            job: job.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Retryable errors re-enqueue the job key with rate-limit backoff.
    /// Invalid keys/objects and serialization failures are dropped — no
    /// amount of retrying fixes a malformed object. API conflicts retry:
    /// the re-run reads a fresh snapshot from the cache.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => true,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) => false,
                _ => true,
            },
            Error::InvalidKey { .. } => false,
            Error::InvalidJob { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

/// Whether a kube error is a 404 for the requested object
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether a kube error is an optimistic-concurrency conflict
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Whether a kube error is a server-side timeout.
///
/// A timed-out create may still have gone through; callers treat it as
/// success and let the watch observation (or expectation expiry) settle it.
pub fn is_timeout(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 504)
}
