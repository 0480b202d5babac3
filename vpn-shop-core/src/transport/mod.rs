//! Outbound HTTP plumbing.
//!
//! Every remote integration (VPN panel, tax service, payment providers) is a
//! thin typed wrapper over a [`ResilientClient`]:
//!
//! - [`Authenticator`] obtains a token and attaches it to requests
//! - [`TokenCache`] keeps one token per client and refreshes it single-flight
//! - [`ResilientClient`] classifies responses, retries transient failures
//!   with backoff and re-authenticates at most once per operation
//!
//! # Examples
//!
//! ```rust,no_run
//! use vpn_shop_core::transport::{HttpConfig, ResilientClient, StaticToken, TokenPlacement};
//!
//! # fn example() -> vpn_shop_core::Result<()> {
//! let crypto = ResilientClient::new(
//!     "crypto",
//!     "https://pay.crypt.bot",
//!     StaticToken::new("app-token", TokenPlacement::Header("Crypto-Pay-API-Token")),
//!     &HttpConfig::default(),
//! )?;
//! assert_eq!(crypto.endpoint("/api/getMe"), "https://pay.crypt.bot/api/getMe");
//! # Ok(())
//! # }
//! ```

mod auth;
mod client;
mod config;
mod token;

pub use auth::{Authenticator, StaticToken, TokenPlacement};
pub(crate) use client::transport_error;
pub use client::{RawResponse, ResilientClient};
pub use config::{HttpConfig, parse_base_url};
pub use token::TokenCache;
