//! Error types for the shop core.
//!
//! All fallible operations return [`Result<T>`], an alias over [`ShopError`].
//!
//! # Error Categories
//!
//! - **Authentication** ([`ShopError::Authentication`]): credentials or token
//!   rejected after the single permitted re-authentication
//! - **Transport** ([`ShopError::RetryableTransport`], [`ShopError::RetriesExhausted`],
//!   [`ShopError::Timeout`]): network failures and 5xx responses
//! - **Fatal remote** ([`ShopError::Client`], [`ShopError::Decoding`]): the remote
//!   service rejected the request or answered with something unreadable
//! - **Absence** ([`ShopError::NotFound`]): a valid "does not exist" outcome
//! - **Local** ([`ShopError::Storage`], [`ShopError::Config`], [`ShopError::InvalidInput`],
//!   [`ShopError::InsufficientBalance`], [`ShopError::ProviderUnavailable`])
//!
//! A purchase that was already finalized is not an error: completion reports it
//! as [`CompletionOutcome::AlreadyProcessed`](crate::payment::CompletionOutcome).
//!
//! # Examples
//!
//! ```
//! use vpn_shop_core::error::{Result, ShopError};
//!
//! fn parse_months(raw: &str) -> Result<u32> {
//!     raw.parse().map_err(|_| ShopError::InvalidInput(format!("months must be a number: {raw}")))
//! }
//!
//! assert!(parse_months("3").is_ok());
//! assert!(parse_months("three").is_err());
//! ```

use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type alias for shop operations.
pub type Result<T> = std::result::Result<T, ShopError>;

/// Errors that can occur in the reconciliation and provisioning core.
///
/// Remote-call variants carry the name of the service (`"panel"`, `"tax"`,
/// `"crypto"`, ...) so log lines and error chains identify the peer without
/// extra context.
///
/// # Error Recovery
///
/// - [`RetryableTransport`](Self::RetryableTransport) and
///   [`RetriesExhausted`](Self::RetriesExhausted): safe to retry later; the
///   reconciliation loop does so on its next tick
/// - [`Client`](Self::Client) and [`Decoding`](Self::Decoding): never retried,
///   the request or the peer must be fixed
/// - [`Authentication`](Self::Authentication): check configured credentials
#[must_use = "errors should be handled, propagated, or explicitly panicked"]
#[derive(Debug, Clone, Error)]
pub enum ShopError {
    /// Credentials or bearer token rejected.
    ///
    /// Raised when the authentication endpoint refuses the configured
    /// credentials, or when a request is still rejected with 401/403 after the
    /// token has been refreshed once within the same operation.
    ///
    /// # Recovery
    ///
    /// Verify the credentials referenced by the configuration. Retrying with
    /// the same credentials will not help.
    #[error("{service} rejected credentials: {message}")]
    Authentication {
        /// Remote service name.
        service: &'static str,
        /// Diagnostic detail (status and body when available).
        message: String,
    },

    /// Network failure or 5xx response.
    ///
    /// The client core retries these internally; callers only see this variant
    /// when a single attempt was configured.
    #[error(
        "{service} transient failure{}: {message}",
        .status.map(|s| format!(" (status {s})")).unwrap_or_default()
    )]
    RetryableTransport {
        /// Remote service name.
        service: &'static str,
        /// HTTP status when the peer answered.
        status: Option<u16>,
        /// Diagnostic detail.
        message: String,
    },

    /// Retry budget spent on transient failures.
    #[error("{service} {operation} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        /// Remote service name.
        service: &'static str,
        /// Logical operation name.
        operation: &'static str,
        /// Number of attempts made.
        attempts: u32,
        /// Message of the last transient failure.
        last_error: String,
    },

    /// Remote rejected the request with a non-auth 4xx status.
    ///
    /// Never retried: the same request would be rejected again.
    #[error("{service} rejected request with status {status}: {body}")]
    Client {
        /// Remote service name.
        service: &'static str,
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },

    /// Response could not be decoded.
    ///
    /// The raw body is preserved for diagnostics.
    #[error("failed to decode {service} response: {message}; body={body}")]
    Decoding {
        /// Remote service name.
        service: &'static str,
        /// Decoder error message.
        message: String,
        /// Raw response body.
        body: String,
    },

    /// Requested entity does not exist.
    ///
    /// A valid absence outcome, distinct from [`Client`](Self::Client).
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Purchase store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller supplied an invalid value.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Customer balance does not cover the price.
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Price of the requested plan.
        required: Decimal,
        /// Balance at the time of the check.
        available: Decimal,
    },

    /// No client is configured for the requested payment provider.
    #[error("payment provider '{0}' is not available")]
    ProviderUnavailable(String),
}

impl ShopError {
    /// Returns `true` when repeating the whole operation later may succeed.
    ///
    /// # Examples
    ///
    /// ```
    /// use vpn_shop_core::ShopError;
    ///
    /// let err = ShopError::Client { service: "panel", status: 400, body: String::new() };
    /// assert!(!err.is_retryable());
    ///
    /// let err = ShopError::RetryableTransport {
    ///     service: "panel",
    ///     status: Some(502),
    ///     message: String::new(),
    /// };
    /// assert!(err.is_retryable());
    /// ```
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RetryableTransport { .. }
                | Self::RetriesExhausted { .. }
                | Self::Timeout(_)
                | Self::Storage(_)
        )
    }
}

impl From<sqlx::Error> for ShopError {
    fn from(error: sqlx::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<toml::de::Error> for ShopError {
    fn from(error: toml::de::Error) -> Self {
        Self::Config(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_display() {
        let error =
            ShopError::Client { service: "panel", status: 422, body: "bad username".to_owned() };
        assert_eq!(error.to_string(), "panel rejected request with status 422: bad username");
    }

    #[test]
    fn test_transient_error_display_with_status() {
        let error = ShopError::RetryableTransport {
            service: "tax",
            status: Some(503),
            message: "unavailable".to_owned(),
        };
        assert_eq!(error.to_string(), "tax transient failure (status 503): unavailable");
    }

    #[test]
    fn test_transient_error_display_without_status() {
        let error = ShopError::RetryableTransport {
            service: "tax",
            status: None,
            message: "connection reset".to_owned(),
        };
        assert_eq!(error.to_string(), "tax transient failure: connection reset");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ShopError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ShopError::NotFound("user".to_owned()).is_retryable());
        assert!(
            !ShopError::Authentication { service: "tax", message: String::new() }.is_retryable()
        );
        assert!(
            !ShopError::Decoding { service: "panel", message: String::new(), body: String::new() }
                .is_retryable()
        );
    }

    #[test]
    fn test_insufficient_balance_display() {
        let error = ShopError::InsufficientBalance {
            required: Decimal::new(300, 0),
            available: Decimal::new(120, 0),
        };
        assert_eq!(error.to_string(), "insufficient balance: required 300, available 120");
    }
}
