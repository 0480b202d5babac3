//! HTTP client configuration.
//!
//! One `[http]` table is shared by every outbound client (panel, tax,
//! payment providers). It covers connection pooling, per-request timeouts,
//! the retry budget and the overall per-operation deadline.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::{
    error::{Result, ShopError},
    reliability::RetryPolicy,
};

/// HTTP client configuration from TOML.
///
/// # Examples
///
/// ```toml
/// [http]
/// timeout_secs = 15
/// max_attempts = 3
/// initial_backoff_ms = 500
/// max_backoff_ms = 5000
/// operation_timeout_secs = 60
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    /// Maximum idle connections per host.
    pub pool_max_idle_per_host: usize,

    /// Single request timeout in seconds.
    pub timeout_secs: u64,

    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Attempts per operation, the first one included.
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,

    /// Cap for a single backoff delay, in milliseconds.
    pub max_backoff_ms: u64,

    /// Deadline for a whole operation (all attempts, backoff and re-auth).
    pub operation_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 10,
            timeout_secs: 15,
            connect_timeout_secs: 5,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 5_000,
            operation_timeout_secs: 60,
        }
    }
}

impl HttpConfig {
    /// Validates configuration values are within acceptable bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Config`] if:
    /// - `timeout_secs` is outside 1-300
    /// - `connect_timeout_secs` is outside 1-60
    /// - `max_attempts` is outside 1-10
    /// - `max_backoff_ms` is below `initial_backoff_ms`
    /// - `operation_timeout_secs` is zero
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 || self.timeout_secs > 300 {
            return Err(ShopError::Config("http.timeout_secs must be between 1 and 300".to_owned()));
        }
        if self.connect_timeout_secs == 0 || self.connect_timeout_secs > 60 {
            return Err(ShopError::Config(
                "http.connect_timeout_secs must be between 1 and 60".to_owned(),
            ));
        }
        if self.max_attempts == 0 || self.max_attempts > 10 {
            return Err(ShopError::Config("http.max_attempts must be between 1 and 10".to_owned()));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ShopError::Config(
                "http.max_backoff_ms must not be below http.initial_backoff_ms".to_owned(),
            ));
        }
        if self.operation_timeout_secs == 0 {
            return Err(ShopError::Config(
                "http.operation_timeout_secs must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// Returns the request timeout as Duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns the connect timeout as Duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Returns the per-operation deadline as Duration.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Builds the backoff policy described by this table.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.max_attempts).with_delays(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    /// Builds a pooled reqwest client honoring the configured timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Config`] if the TLS backend cannot be initialized.
    pub fn build_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .timeout(self.timeout())
            .connect_timeout(self.connect_timeout())
            .build()
            .map_err(|e| ShopError::Config(format!("failed to build HTTP client: {e}")))
    }
}

/// Parses and checks a service base URL.
///
/// Plain `http` is accepted because the panel usually sits on a private
/// network next to the worker.
///
/// # Errors
///
/// Returns [`ShopError::Config`] when the URL does not parse, uses a scheme
/// other than http/https, or has no host.
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| ShopError::Config(format!("invalid URL '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ShopError::Config(format!("unsupported URL scheme in '{raw}'")));
    }
    if url.host_str().is_none() {
        return Err(ShopError::Config(format!("URL '{raw}' has no host")));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HttpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.retry_policy().initial_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: HttpConfig = toml::from_str("max_attempts = 5").unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.timeout_secs, 15);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let config = HttpConfig { max_attempts: 0, ..HttpConfig::default() };
        assert!(matches!(config.validate(), Err(ShopError::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let config =
            HttpConfig { initial_backoff_ms: 1_000, max_backoff_ms: 10, ..HttpConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_base_url() {
        assert!(parse_base_url("https://panel.example.com").is_ok());
        assert!(parse_base_url("http://10.0.0.5:3000").is_ok());
        assert!(parse_base_url("ftp://panel.example.com").is_err());
        assert!(parse_base_url("not a url").is_err());
    }
}
