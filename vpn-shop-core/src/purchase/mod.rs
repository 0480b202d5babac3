//! Durable purchase ledger.
//!
//! Every status transition is a conditional write: it only applies when the
//! row is still in the expected state (and, for claimed rows, still carries
//! the caller's claim id). Losing a race therefore shows up as `false` or
//! `None`, never as a second transition.
//!
//! [`PgStore`] is the production implementation; [`InMemoryStore`] has the
//! same semantics behind a mutex and backs tests and local runs.

mod memory;
pub mod models;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use memory::InMemoryStore;
pub use models::{
    Claim, Customer, DebitClaim, NewPurchase, Provider, Purchase, PurchaseStatus, Settlement,
};
pub use postgres::PgStore;

use crate::error::Result;

/// Purchase and customer persistence with compare-and-swap transitions.
#[async_trait]
pub trait PurchaseStore: Send + Sync {
    /// Inserts a `Pending` purchase.
    async fn create_purchase(&self, new: NewPurchase) -> Result<Purchase>;

    /// Records the provider-side id of a purchase's invoice.
    async fn attach_correlation(&self, purchase_id: i64, correlation_id: &str) -> Result<()>;

    /// Fetches a purchase by id.
    async fn purchase(&self, purchase_id: i64) -> Result<Option<Purchase>>;

    /// Purchases of `provider` that have an invoice and are `Pending`, or
    /// `Processing` with a lease older than `stale_before`.
    async fn reclaimable_by_provider(
        &self,
        provider: Provider,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Purchase>>;

    /// Moves a claimable purchase to `Processing` under a fresh claim id.
    ///
    /// Returns `None` when the purchase is missing, terminal, or held by a
    /// live claim.
    async fn claim(&self, purchase_id: i64, stale_before: DateTime<Utc>) -> Result<Option<Claim>>;

    /// Returns a claimed purchase to `Pending`.
    async fn release(&self, claim: &Claim) -> Result<bool>;

    /// Completes a claimed purchase and applies `settlement` atomically.
    ///
    /// Returns `false` if the claim was lost meanwhile; nothing is written.
    async fn complete(&self, claim: &Claim, settlement: Settlement) -> Result<bool>;

    /// Marks a `Pending` purchase `Failed`.
    async fn fail(&self, purchase_id: i64) -> Result<bool>;

    /// Debits the purchase amount from the buyer's balance and claims the
    /// purchase atomically. Insufficient funds mark the purchase `Failed`.
    async fn claim_with_debit(
        &self,
        purchase_id: i64,
        stale_before: DateTime<Utc>,
    ) -> Result<DebitClaim>;

    /// Refunds the debited amount and marks the claimed purchase `Failed`.
    async fn refund_and_fail(&self, claim: &Claim) -> Result<bool>;

    /// Fetches a customer by id.
    async fn customer(&self, customer_id: i64) -> Result<Option<Customer>>;

    /// Fetches a customer by chat identity.
    async fn customer_by_identity(&self, identity: &str) -> Result<Option<Customer>>;

    /// Returns the customer with `identity`, creating it with a zero balance.
    async fn ensure_customer(&self, identity: &str, language: &str) -> Result<Customer>;
}
