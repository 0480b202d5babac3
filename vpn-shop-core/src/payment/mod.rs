//! Payment providers and purchase completion.
//!
//! Each provider client implements [`PaymentProvider`]: create an invoice
//! carrying [`InvoiceMetadata`], and report invoice states back. The
//! [`PaymentService`] ties providers, the purchase ledger and the panel
//! together and is the surface the bot layer calls.
//!
//! # Providers
//!
//! | Provider | Confirmation | Status query |
//! |----------|--------------|--------------|
//! | [`CryptoPayClient`] | polling | batch |
//! | [`CardGatewayClient`] | polling | one call per payment |
//! | [`StarsClient`] | bot callback | none |

mod card;
mod crypto;
mod metadata;
mod plans;
mod service;
mod stars;

use std::fmt;

use async_trait::async_trait;
pub use card::CardGatewayClient;
pub use crypto::CryptoPayClient;
pub use metadata::InvoiceMetadata;
pub use plans::{Plan, PlanCatalog};
use rust_decimal::Decimal;
pub use service::{CompletionSettings, PaymentService};
pub use stars::{STARS_CURRENCY, StarsClient};

pub use crate::purchase::Provider;
use crate::error::{Result, ShopError};

/// Outcome of completing a purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// This call provisioned (or credited) and committed the purchase.
    Completed,
    /// The purchase was already terminal or held by another completer.
    AlreadyProcessed,
}

/// What a provider needs to issue an invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceRequest {
    /// Ledger id, echoed in the metadata.
    pub purchase_id: i64,
    /// Price.
    pub amount: Decimal,
    /// Currency code.
    pub currency: String,
    /// Short title shown by the provider.
    pub title: String,
    /// Longer description.
    pub description: String,
    /// Payload to embed.
    pub metadata: InvoiceMetadata,
}

/// Invoice issued by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    /// Provider-side id, stored as the purchase's correlation id.
    pub correlation_id: String,
    /// Where the customer pays.
    pub payment_url: String,
}

/// Coarse invoice state shared by all providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceState {
    /// Not paid yet.
    Pending,
    /// Paid; the purchase can be completed.
    Paid,
    /// Cancelled or expired; the purchase will never be paid.
    Cancelled,
}

/// State of one invoice as reported by its provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceStatus {
    /// Provider-side id.
    pub correlation_id: String,
    /// Current state.
    pub state: InvoiceState,
    /// Raw payload echoed back by the provider, if any.
    pub payload: Option<String>,
}

/// A payment provider integration.
#[async_trait]
pub trait PaymentProvider: Send + Sync + fmt::Debug {
    /// Which provider this is.
    fn kind(&self) -> Provider;

    /// Whether [`invoice_statuses`](Self::invoice_statuses) answers for many
    /// invoices in one request.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Issues an invoice.
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice>;

    /// Looks up one invoice.
    async fn invoice_status(&self, correlation_id: &str) -> Result<InvoiceStatus>;

    /// Looks up several invoices. The default makes one call per id and
    /// stops at the first failure; batch-capable providers override it.
    async fn invoice_statuses(&self, correlation_ids: &[String]) -> Result<Vec<InvoiceStatus>> {
        let mut statuses = Vec::with_capacity(correlation_ids.len());
        for id in correlation_ids {
            statuses.push(self.invoice_status(id).await?);
        }
        Ok(statuses)
    }
}

/// Formats an amount with exactly two decimals.
pub(crate) fn money(amount: Decimal) -> String {
    format!("{:.2}", amount.round_dp(2))
}

/// Error for providers whose statuses cannot be polled.
pub(crate) fn not_pollable(provider: Provider) -> ShopError {
    ShopError::ProviderUnavailable(format!("{provider} invoices cannot be polled"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_formatting() {
        assert_eq!(money(Decimal::new(199, 0)), "199.00");
        assert_eq!(money(Decimal::new(1_995, 3)), "2.00");
        assert_eq!(money(Decimal::new(1_504, 2)), "15.04");
    }
}
