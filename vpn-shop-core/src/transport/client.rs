//! Resilient client core shared by every outbound integration.
//!
//! [`ResilientClient::execute`] runs one logical operation:
//!
//! 1. obtain a token (single-flight, see [`TokenCache`])
//! 2. send the request built by the caller's closure
//! 3. classify the outcome with [`StatusClass`]
//!
//! Auth failures invalidate the token that was used and re-authenticate at
//! most once. Transient failures back off per [`RetryPolicy`]. Everything
//! else returns immediately. The whole operation, backoff sleeps included,
//! is bounded by the configured operation timeout.

use std::{sync::Arc, time::Duration};

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use super::{Authenticator, HttpConfig, TokenCache};
use crate::{
    error::{Result, ShopError},
    reliability::{RetryPolicy, StatusClass},
};

/// Raw response of a successful call.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP status (always 2xx).
    pub status: StatusCode,
    /// Response body as text.
    pub body: String,
}

/// Outcome of a single attempt.
#[derive(Debug)]
enum Attempt {
    Done(RawResponse),
    Auth { used: Arc<str>, status: StatusCode, body: String },
    Retryable(ShopError),
    Fatal(ShopError),
}

struct Inner {
    service: &'static str,
    base_url: String,
    http: Client,
    auth: Arc<dyn Authenticator>,
    tokens: TokenCache,
    policy: RetryPolicy,
    operation_timeout: Duration,
}

/// Credentialed HTTP client with retry, backoff and single-flight auth.
///
/// Cloning is cheap and clones share the token.
///
/// # Examples
///
/// ```rust,no_run
/// use vpn_shop_core::transport::{HttpConfig, ResilientClient, StaticToken};
///
/// # async fn example() -> vpn_shop_core::Result<()> {
/// let client = ResilientClient::new(
///     "panel",
///     "https://panel.example.com",
///     StaticToken::bearer("token"),
///     &HttpConfig::default(),
/// )?;
///
/// let url = client.endpoint("/api/inbounds");
/// let body: serde_json::Value =
///     client.execute_json("list_inbounds", |http, _| http.get(&url)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ResilientClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("service", &self.inner.service)
            .field("base_url", &self.inner.base_url)
            .field("auth", &self.inner.auth)
            .field("policy", &self.inner.policy)
            .field("operation_timeout", &self.inner.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl ResilientClient {
    /// Creates a client for `service` rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Config`] if the base URL is invalid or the HTTP
    /// client cannot be built.
    pub fn new(
        service: &'static str,
        base_url: &str,
        auth: impl Authenticator + 'static,
        config: &HttpConfig,
    ) -> Result<Self> {
        Self::with_http(service, base_url, Arc::new(auth), config.build_client()?, config)
    }

    /// Creates a client reusing an existing connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Config`] if the base URL is invalid.
    pub fn with_http(
        service: &'static str,
        base_url: &str,
        auth: Arc<dyn Authenticator>,
        http: Client,
        config: &HttpConfig,
    ) -> Result<Self> {
        let base_url = super::parse_base_url(base_url)?;
        Ok(Self {
            inner: Arc::new(Inner {
                service,
                base_url: base_url.as_str().trim_end_matches('/').to_owned(),
                http,
                auth,
                tokens: TokenCache::new(),
                policy: config.retry_policy(),
                operation_timeout: config.operation_timeout(),
            }),
        })
    }

    /// Service name used in errors and log fields.
    #[must_use]
    pub fn service(&self) -> &'static str {
        self.inner.service
    }

    /// Joins `path` onto the base URL.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.inner.base_url)
    }

    /// Joins `path` and then percent-encoded `segments` onto the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::InvalidInput`] if the base URL cannot carry a path.
    pub fn endpoint_with(&self, path: &str, segments: &[&str]) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.endpoint(path))
            .map_err(|e| ShopError::InvalidInput(format!("{} endpoint: {e}", self.inner.service)))?;
        url.path_segments_mut()
            .map_err(|()| {
                let service = self.inner.service;
                ShopError::InvalidInput(format!("{service} base URL cannot carry a path"))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Returns the currently cached token, if any.
    #[must_use]
    pub fn cached_token(&self) -> Option<Arc<str>> {
        self.inner.tokens.current()
    }

    /// Authenticates now instead of on first use.
    ///
    /// # Errors
    ///
    /// Returns the authentication error.
    pub async fn authenticate(&self) -> Result<()> {
        self.token().await.map(drop)
    }

    async fn token(&self) -> Result<Arc<str>> {
        let inner = &self.inner;
        inner.tokens.get_or_refresh(|| inner.auth.authenticate(&inner.http)).await
    }

    /// Executes one logical operation and returns the raw 2xx response.
    ///
    /// `build` receives the pooled client and the current token; it is called
    /// again for every attempt, so anything that must stay stable across
    /// retries (idempotence keys) has to be created outside of it.
    ///
    /// # Errors
    ///
    /// - [`ShopError::NotFound`] on 404
    /// - [`ShopError::Client`] on any other non-auth 4xx
    /// - [`ShopError::Authentication`] when re-authentication did not help
    /// - [`ShopError::RetriesExhausted`] when every attempt failed transiently
    /// - [`ShopError::Timeout`] when the operation deadline passed
    #[instrument(skip(self, build), fields(service = self.inner.service))]
    pub async fn execute<F>(&self, operation: &'static str, build: F) -> Result<RawResponse>
    where
        F: Fn(&Client, &str) -> RequestBuilder + Send + Sync,
    {
        let deadline = self.inner.operation_timeout;
        match tokio::time::timeout(deadline, self.run(operation, &build)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    service = self.inner.service,
                    operation,
                    kind = "timeout",
                    "operation deadline exceeded"
                );
                Err(ShopError::Timeout(deadline))
            }
        }
    }

    /// Executes an operation and decodes the JSON body into `T`.
    ///
    /// # Errors
    ///
    /// Everything [`execute`](Self::execute) returns, plus
    /// [`ShopError::Decoding`] when the body does not match `T`.
    pub async fn execute_json<T, F>(&self, operation: &'static str, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&Client, &str) -> RequestBuilder + Send + Sync,
    {
        let response = self.execute(operation, build).await?;
        self.decode(&response.body)
    }

    /// Like [`execute_json`](Self::execute_json), mapping 404 to `None`.
    ///
    /// # Errors
    ///
    /// Everything [`execute_json`](Self::execute_json) returns except
    /// [`ShopError::NotFound`].
    pub async fn execute_optional_json<T, F>(
        &self,
        operation: &'static str,
        build: F,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        F: Fn(&Client, &str) -> RequestBuilder + Send + Sync,
    {
        match self.execute_json(operation, build).await {
            Ok(value) => Ok(Some(value)),
            Err(ShopError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Decodes a JSON body, keeping the raw text on failure.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Decoding`] with the raw body.
    pub fn decode<T: DeserializeOwned>(&self, body: &str) -> Result<T> {
        serde_json::from_str(body).map_err(|e| ShopError::Decoding {
            service: self.inner.service,
            message: e.to_string(),
            body: body.to_owned(),
        })
    }

    async fn run<F>(&self, operation: &'static str, build: &F) -> Result<RawResponse>
    where
        F: Fn(&Client, &str) -> RequestBuilder + Send + Sync,
    {
        let service = self.inner.service;
        let max_attempts = self.inner.policy.attempts();
        let mut attempt = 0u32;
        let mut reauthenticated = false;

        loop {
            attempt += 1;
            match self.attempt(operation, build).await {
                Attempt::Done(response) => {
                    if attempt > 1 {
                        debug!(service, operation, attempt, "operation succeeded after retry");
                    }
                    return Ok(response);
                }
                Attempt::Fatal(error) => return Err(error),
                Attempt::Auth { used, status, body } => {
                    self.inner.tokens.invalidate(&used);
                    if reauthenticated {
                        warn!(
                            service,
                            operation,
                            kind = "auth",
                            attempt,
                            %status,
                            "rejected after re-authentication"
                        );
                        return Err(ShopError::Authentication {
                            service,
                            message: format!("status {status} after re-authentication: {body}"),
                        });
                    }
                    reauthenticated = true;
                    // The replay after a refresh does not consume the transient budget.
                    attempt -= 1;
                    warn!(
                        service,
                        operation,
                        kind = "auth",
                        attempt,
                        %status,
                        "token rejected, re-authenticating"
                    );
                }
                Attempt::Retryable(error) => {
                    if attempt >= max_attempts {
                        warn!(
                            service,
                            operation,
                            kind = "retryable",
                            attempt,
                            error = %error,
                            "retry budget exhausted"
                        );
                        return Err(ShopError::RetriesExhausted {
                            service,
                            operation,
                            attempts: attempt,
                            last_error: error.to_string(),
                        });
                    }
                    let delay = self.inner.policy.delay_for_attempt(attempt - 1);
                    #[allow(
                        clippy::cast_possible_truncation,
                        reason = "backoff delays are capped far below u64::MAX ms"
                    )]
                    let delay_ms = delay.as_millis() as u64;
                    warn!(
                        service,
                        operation,
                        kind = "retryable",
                        attempt,
                        delay_ms,
                        error = %error,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt<F>(&self, operation: &'static str, build: &F) -> Attempt
    where
        F: Fn(&Client, &str) -> RequestBuilder + Send + Sync,
    {
        let inner = &self.inner;
        let token = match self.token().await {
            Ok(token) => token,
            Err(error @ ShopError::Authentication { .. }) => return Attempt::Fatal(error),
            Err(error) if error.is_retryable() => return Attempt::Retryable(error),
            Err(error) => return Attempt::Fatal(error),
        };

        let request = inner.auth.apply(build(&inner.http, &token), &token);
        debug!(service = inner.service, operation, "sending request");

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => return self.transport_failure(&error),
        };
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(error) => return self.transport_failure(&error),
        };

        match StatusClass::of(status) {
            StatusClass::Success => Attempt::Done(RawResponse { status, body }),
            StatusClass::Auth => Attempt::Auth { used: token, status, body },
            StatusClass::NotFound => {
                Attempt::Fatal(ShopError::NotFound(format!("{} {operation}", inner.service)))
            }
            StatusClass::Retryable => Attempt::Retryable(ShopError::RetryableTransport {
                service: inner.service,
                status: Some(status.as_u16()),
                message: body,
            }),
            StatusClass::Client => Attempt::Fatal(ShopError::Client {
                service: inner.service,
                status: status.as_u16(),
                body,
            }),
        }
    }

    fn transport_failure(&self, error: &reqwest::Error) -> Attempt {
        match transport_error(self.inner.service, error) {
            retryable @ ShopError::RetryableTransport { .. } => Attempt::Retryable(retryable),
            fatal => Attempt::Fatal(fatal),
        }
    }
}

/// Maps a reqwest failure outside the retry loop (e.g. an auth endpoint).
pub(crate) fn transport_error(service: &'static str, error: &reqwest::Error) -> ShopError {
    if error.is_builder() {
        ShopError::InvalidInput(format!("{service} request: {error}"))
    } else {
        ShopError::RetryableTransport {
            service,
            status: error.status().map(|s| s.as_u16()),
            message: error.to_string(),
        }
    }
}
