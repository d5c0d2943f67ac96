//! Reconciliation error taxonomy.
//!
//! Every failure the reconciler sees is reduced to an [`ErrorKind`]. Retry
//! versus terminal handling is decided from the kind alone.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_cloud::ProviderError;

/// Classification of a reconciliation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The resource no longer exists. Terminal; the resource leaves the fleet.
    NotFound,
    /// Network failure, timeout or throttling. Retried with backoff.
    Transient,
    /// Credentials lack the required permission. Terminal.
    PermissionDenied,
    /// Malformed request or undecodable response. Terminal.
    Invalid,
}

impl ErrorKind {
    /// Whether a failure of this kind may succeed on a later attempt.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Stable name used in logs and outcome records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Transient => "transient",
            Self::PermissionDenied => "permission_denied",
            Self::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a provider error.
#[must_use]
pub fn classify(err: &ProviderError) -> ErrorKind {
    match err {
        ProviderError::NotFound(_) => ErrorKind::NotFound,
        ProviderError::Auth(_) => ErrorKind::PermissionDenied,
        ProviderError::Http(_)
        | ProviderError::Timeout(_)
        | ProviderError::Throttled { .. }
        | ProviderError::Unavailable(_) => ErrorKind::Transient,
        ProviderError::Api { status, .. } if *status >= 500 => ErrorKind::Transient,
        ProviderError::Api { .. }
        | ProviderError::InvalidRequest { .. }
        | ProviderError::Config(_)
        | ProviderError::Serialization(_) => ErrorKind::Invalid,
    }
}

/// Errors raised while inspecting or remediating a resource.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The provider call failed.
    #[error("{source}")]
    Provider {
        kind: ErrorKind,
        #[source]
        source: ProviderError,
    },

    /// The provider call did not finish within its deadline.
    #[error("{operation} timed out after {}s", .timeout.as_secs_f64())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The corrective action was applied but the resource is still not compliant.
    #[error("still non-compliant after remediation: {detail}")]
    Unverified { detail: String },
}

impl ReconcileError {
    /// Classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Provider { kind, .. } => *kind,
            Self::Timeout { .. } | Self::Unverified { .. } => ErrorKind::Transient,
        }
    }

    /// Minimum delay the provider asked for before the next call.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Provider { source, .. } => source.retry_after(),
            _ => None,
        }
    }
}

impl From<ProviderError> for ReconcileError {
    fn from(source: ProviderError) -> Self {
        Self::Provider {
            kind: classify(&source),
            source,
        }
    }
}
