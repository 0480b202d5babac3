//! Credential acquisition and placement.
//!
//! An [`Authenticator`] knows how to obtain a token and how to attach it to
//! an outgoing request. Services with long-lived credentials use
//! [`StaticToken`]; the tax service logs in with a password and implements
//! the trait itself.

use std::fmt;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};

use crate::error::Result;

/// Obtains tokens and applies them to requests.
#[async_trait]
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Obtains a fresh token.
    ///
    /// Called single-flight by the client core whenever no valid token is
    /// cached.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Authentication`](crate::ShopError::Authentication)
    /// when the credentials are refused, or a transport error when the
    /// authentication endpoint is unreachable.
    async fn authenticate(&self, http: &Client) -> Result<String>;

    /// Attaches `token` to a request. Defaults to a bearer header.
    fn apply(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request.bearer_auth(token)
    }
}

/// Where a static credential goes on the wire.
#[derive(Clone, PartialEq, Eq)]
pub enum TokenPlacement {
    /// `Authorization: Bearer <token>`.
    Bearer,
    /// Custom header, e.g. `Crypto-Pay-API-Token`.
    Header(&'static str),
    /// HTTP basic auth with the token as password.
    Basic {
        /// Basic auth user (shop id for the card gateway).
        username: String,
    },
    /// Token is embedded in the URL path by the request builder.
    Path,
}

impl fmt::Debug for TokenPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer => f.write_str("Bearer"),
            Self::Header(name) => f.debug_tuple("Header").field(name).finish(),
            Self::Basic { username } => {
                f.debug_struct("Basic").field("username", username).finish()
            }
            Self::Path => f.write_str("Path"),
        }
    }
}

/// Long-lived credential issued out of band.
///
/// Re-authentication returns the same value, so a second 401/403 within one
/// operation is reported as fatal.
#[derive(Clone)]
pub struct StaticToken {
    token: String,
    placement: TokenPlacement,
}

impl StaticToken {
    /// Creates a credential with the given placement.
    #[must_use]
    pub fn new(token: impl Into<String>, placement: TokenPlacement) -> Self {
        Self { token: token.into(), placement }
    }

    /// Bearer credential.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::new(token, TokenPlacement::Bearer)
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticToken")
            .field("token", &"[REDACTED]")
            .field("placement", &self.placement)
            .finish()
    }
}

#[async_trait]
impl Authenticator for StaticToken {
    async fn authenticate(&self, _http: &Client) -> Result<String> {
        Ok(self.token.clone())
    }

    fn apply(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        match &self.placement {
            TokenPlacement::Bearer => request.bearer_auth(token),
            TokenPlacement::Header(name) => request.header(*name, token),
            TokenPlacement::Basic { username } => request.basic_auth(username, Some(token)),
            TokenPlacement::Path => request,
        }
    }
}
