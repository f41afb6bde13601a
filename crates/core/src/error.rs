//! Unified error taxonomy for trustplane modules
//!
//! Every boundary in the core returns typed errors from this set. Transient
//! errors are retried at their origin and never surface to the management
//! API; conflicts and read misses are returned directly.

use thiserror::Error;

/// Result type alias using trustplane's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Enumerable reasons a certificate fails validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationReason {
    /// Certificate not-after is in the past
    ExpiredCert,
    /// Certificate not-before is in the future
    NotYetValid,
    /// Certificate was not signed by the trustplane root
    UnknownIssuer,
    /// Certificate is in the revocation set
    Revoked,
    /// Certificate subject does not match the stored device record
    SubjectMismatch,
    /// Certificate could not be parsed at all
    Malformed,
}

impl std::fmt::Display for AttestationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ExpiredCert => "expired_cert",
            Self::NotYetValid => "not_yet_valid",
            Self::UnknownIssuer => "unknown_issuer",
            Self::Revoked => "revoked",
            Self::SubjectMismatch => "subject_mismatch",
            Self::Malformed => "malformed",
        };
        write!(f, "{}", s)
    }
}

/// Unified error type for all trustplane modules
#[derive(Error, Debug)]
pub enum Error {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {reason}")]
    Conflict { reason: String },

    #[error("MAC address already registered: {0}")]
    DuplicateMac(String),

    #[error("Device id already registered: {0}")]
    DuplicateDeviceId(String),

    #[error("Attestation failed: {reason}")]
    AttestationFailed { reason: AttestationReason },

    #[error("Switch unavailable")]
    SwitchUnavailable,

    #[error("Switch rejected rule: {reason}")]
    SwitchRuleRejected { reason: String },

    #[error("Storage error: {cause}")]
    Storage { cause: String },

    #[error("Configuration error for {key}: {reason}")]
    Config { key: String, reason: String },

    #[error("Transient error: {cause}")]
    Transient { cause: String },

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a read miss
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Shorthand for a state-violation conflict
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    /// Shorthand for an underlying storage failure
    pub fn storage(cause: impl std::fmt::Display) -> Self {
        Self::Storage {
            cause: cause.to_string(),
        }
    }

    /// Whether this error should be retried at its origin
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}
