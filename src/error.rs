//! Error types for the Corral control plane

use thiserror::Error;

use crate::pki::PkiError;

/// Main error type for Corral operations
///
/// The variants mirror the protocol-level failure taxonomy: a handler error
/// maps 1:1 onto the status code returned to the device, and the reconciler
/// surfaces everything that is not `NotFound` as a requeue-with-error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Referenced object is absent from the store
    #[error("not found: {0}")]
    NotFound(String),

    /// The presented credential does not authorize the requested device id
    #[error("identity does not match requested device")]
    Forbidden,

    /// Malformed directive or message content
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Optimistic-concurrency patch rejection
    #[error("conflict: {0}")]
    Conflict(String),

    /// PKI error
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Store, CA or credential-provider failure with no defined recovery
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error for the named object
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an invalid-input error with the given message
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True when the error means the referenced object is absent,
    /// either at the taxonomy level or as a raw API 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// True when the error is an optimistic-concurrency rejection
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Kube(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }
}
