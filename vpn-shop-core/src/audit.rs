//! Audit trail for purchase state changes.
//!
//! Every money-relevant transition emits one structured event on the
//! `audit` tracing target, so it can be routed to its own sink. Customer
//! identities are masked before they reach the event.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::purchase::{Provider, Purchase};

/// Kinds of audited purchase events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Invoice created at a payment provider.
    InvoiceCreated,
    /// Invoice creation failed; purchase marked failed.
    InvoiceFailed,
    /// Purchase completed and provisioned (or balance credited).
    PurchaseCompleted,
    /// Provisioning failed; claim released back to pending.
    PurchaseReleased,
    /// Provider reported the invoice cancelled or expired.
    PurchaseCancelled,
    /// Balance debited for a purchase.
    BalanceDebited,
    /// Balance refunded after a failed balance purchase.
    BalanceRefunded,
    /// Income reported to the tax service.
    IncomeReported,
}

/// Contextual details of an audit event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditDetails {
    /// Payment provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    /// Amount involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    /// Months bought; 0 for top-ups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub months: Option<u32>,
    /// Provider-side invoice id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One audit record.
///
/// # Examples
///
/// ```
/// use vpn_shop_core::audit::{AuditEvent, AuditEventType, audit_log};
///
/// let event = AuditEvent::new(AuditEventType::IncomeReported, 42)
///     .with_customer("123456789")
///     .with_error("tax service unavailable");
/// assert_eq!(event.customer.as_deref(), Some("*****6789"));
/// audit_log(&event);
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub event_type: AuditEventType,
    /// Purchase concerned.
    pub purchase_id: i64,
    /// Masked customer identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
    /// Event details.
    pub details: AuditDetails,
}

impl AuditEvent {
    /// Creates an event for `purchase_id`.
    #[must_use]
    pub fn new(event_type: AuditEventType, purchase_id: i64) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            purchase_id,
            customer: None,
            details: AuditDetails::default(),
        }
    }

    /// Creates an event prefilled from a purchase row.
    #[must_use]
    pub fn for_purchase(event_type: AuditEventType, purchase: &Purchase) -> Self {
        let mut event = Self::new(event_type, purchase.id);
        event.details = AuditDetails {
            provider: Some(purchase.provider),
            amount: Some(purchase.amount),
            months: Some(purchase.months),
            correlation_id: purchase.correlation_id.clone(),
            error: None,
        };
        event
    }

    /// Adds the customer identity, masked.
    #[must_use]
    pub fn with_customer(mut self, identity: &str) -> Self {
        self.customer = Some(mask_identity(identity));
        self
    }

    /// Adds a failure description.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.details.error = Some(error.into());
        self
    }

    /// Adds the provider-side id.
    #[must_use]
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for builder methods"
    )]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.details.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Logs an audit event with target "audit".
pub fn audit_log(event: &AuditEvent) {
    tracing::info!(
        target: "audit",
        timestamp = %event.timestamp,
        event_type = ?event.event_type,
        purchase_id = event.purchase_id,
        customer = event.customer.as_deref().unwrap_or("-"),
        details = ?event.details,
        "AUDIT"
    );
}

/// Masks all but the last four characters of an identity.
///
/// # Examples
///
/// ```
/// use vpn_shop_core::audit::mask_identity;
///
/// assert_eq!(mask_identity("123456789"), "*****6789");
/// assert_eq!(mask_identity("abc"), "abc");
/// ```
#[must_use]
pub fn mask_identity(identity: &str) -> String {
    let len = identity.chars().count();
    if len <= 4 {
        return identity.to_owned();
    }
    identity
        .chars()
        .enumerate()
        .map(|(i, c)| if i < len - 4 { '*' } else { c })
        .collect()
}
