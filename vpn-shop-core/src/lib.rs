//! VPN shop core: payment reconciliation and account provisioning.
//!
//! A customer pays for a VPN subscription through one of several payment
//! providers. This crate turns confirmed payments into provisioned panel
//! accounts, exactly once per purchase, and reports the income to the tax
//! service.
//!
//! # Architecture
//!
//! ```text
//!   crypto / card            ┌──────────────┐   claim / commit   ┌──────────────┐
//!   invoice status  ───────► │  reconcile   │ ─────────────────► │   purchase   │
//!                            │  (per-provider loops)             │   ledger     │
//!   stars callback  ───────► │  payment     │ ◄───────────────── │ (Postgres)   │
//!                            └──────┬───────┘                    └──────────────┘
//!                                   │ provision          report income
//!                            ┌──────▼───────┐            ┌──────────────┐
//!                            │    panel     │            │     tax      │
//!                            └──────────────┘            └──────────────┘
//! ```
//!
//! Every remote peer is reached through [`transport::ResilientClient`], which
//! owns the peer's token, re-authenticates once on 401/403 and retries 5xx
//! and network failures with capped exponential backoff.
//!
//! # Module Organization
//!
//! - [`transport`]: resilient HTTP client core and authenticators
//! - [`reliability`]: retry policy and status classification
//! - [`panel`]: VPN panel client and subscription arithmetic
//! - [`tax`]: income reporting
//! - [`payment`]: provider clients and purchase orchestration
//! - [`purchase`]: purchase ledger (Postgres and in-memory)
//! - [`reconcile`]: periodic invoice reconciliation
//! - [`audit`]: structured audit events for payment state changes
//! - [`config`]: TOML configuration
//! - [`error`]: error types
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use vpn_shop_core::{
//!     config::{ShopConfig, resolve_env},
//!     panel::PanelClient,
//!     payment::{CryptoPayClient, PaymentService},
//!     purchase::{InMemoryStore, Provider},
//!     reconcile::Reconciler,
//! };
//!
//! # async fn example() -> vpn_shop_core::Result<()> {
//! let config = ShopConfig::from_file("shop.toml")?;
//! let panel =
//!     PanelClient::new(&config.panel.url, &resolve_env(&config.panel.token_env)?, &config.http)?;
//! let crypto = CryptoPayClient::new(
//!     "https://pay.crypt.bot",
//!     &resolve_env("CRYPTO_PAY_TOKEN")?,
//!     &config.http,
//! )?;
//!
//! let service = PaymentService::new(
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(panel),
//!     config.plans.clone(),
//!     config.completion_settings(),
//! )
//! .with_provider(Arc::new(crypto));
//!
//! let report = Reconciler::new(service).run_once(Provider::Crypto).await?;
//! println!("completed {} purchases", report.completed);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![allow(
    clippy::multiple_crate_versions,
    reason = "transitive dependencies from sqlx and reqwest"
)]

pub mod audit;
pub mod config;
pub mod error;
pub mod panel;
pub mod payment;
pub mod purchase;
pub mod reconcile;
pub mod reliability;
pub mod tax;
pub mod transport;

pub use error::{Result, ShopError};
pub use payment::{CompletionOutcome, PaymentService};
