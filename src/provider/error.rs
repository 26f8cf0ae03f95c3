//! Error types for marketplace access.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by a [`super::CloudProvider`].
///
/// None of these are raised into a strategy: creation and destroy report
/// them as values, everything else degrades to an empty or sentinel result.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when the marketplace refuses to rent an offer.
    #[error("offer {offer_id} rejected: {message}")]
    Rejected {
        /// Offer that was refused.
        offer_id: String,
        /// Message returned by the marketplace.
        message: String,
    },
    /// Raised when rate limiting persisted through every retry.
    #[error("{operation} still rate limited after {attempts} attempts")]
    RateLimited {
        /// Operation being retried.
        operation: String,
        /// Attempts made before giving up.
        attempts: u32,
    },
    /// Raised for any other API failure.
    #[error("{operation} failed: {source}")]
    Api {
        /// Operation that failed.
        operation: String,
        /// Underlying API error.
        #[source]
        source: ApiError,
    },
    /// Raised when a call exceeded its wall-clock bound.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Bound that was exceeded, in seconds.
        seconds: u64,
    },
    /// Raised when the binding does not support an operation or value.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Raw failure reported by a marketplace API binding.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{}", self.describe())]
pub struct ApiError {
    /// HTTP status, absent for transport failures.
    pub status: Option<u16>,
    /// Body or transport message.
    pub message: String,
    /// Server supplied `Retry-After` hint.
    pub retry_after: Option<Duration>,
}

impl ApiError {
    /// Builds an error for an HTTP response.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Builds an error for a transport failure (connection reset, DNS, ...).
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attaches a `Retry-After` hint.
    #[must_use]
    pub const fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// HTTP 429.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self.status, Some(429))
    }

    /// HTTP 404.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.status, Some(404))
    }

    /// Rate limiting, server errors and transport failures.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(code) => code == 429 || code >= 500,
        }
    }

    fn describe(&self) -> String {
        self.status.map_or_else(
            || format!("transport error: {}", self.message),
            |code| format!("HTTP {code}: {}", self.message),
        )
    }
}
