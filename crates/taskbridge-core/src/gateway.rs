//! Shared gateway error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the external gateways.
///
/// Dispatch handlers use this taxonomy to choose between retry and
/// dead-letter: [`GatewayError::is_transient`] failures return to the outbox
/// with backoff, everything else is permanent.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// Credentials rejected or insufficient.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The referenced remote object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote store rejected the write due to a state conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Rate limit still in force after the in-call retry.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Advertised wait until the limit resets.
        retry_after: Duration,
    },

    /// Timeout, connection failure, or server-side error.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The request itself was malformed or semantically invalid.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Whether a retry with backoff can plausibly succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }

    /// Whether the failure indicates broken credentials.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}
