//! Purchase ledger types.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ShopError;

/// Where the money for a purchase comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Crypto invoice provider, confirmed by batch polling.
    Crypto,
    /// Card gateway, confirmed by per-payment polling.
    Card,
    /// In-app stars, confirmed by the bot callback only.
    Stars,
    /// Customer's prepaid balance, settled synchronously.
    Balance,
}

impl Provider {
    /// Every provider, in a stable order.
    pub const ALL: [Self; 4] = [Self::Crypto, Self::Card, Self::Stars, Self::Balance];

    /// Storage and log representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Crypto => "crypto",
            Self::Card => "card",
            Self::Stars => "stars",
            Self::Balance => "balance",
        }
    }

    /// Whether confirmations are discovered by polling the provider.
    #[must_use]
    pub const fn is_pollable(self) -> bool {
        matches!(self, Self::Crypto | Self::Card)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ShopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ShopError::InvalidInput(format!("unknown provider '{s}'")))
    }
}

/// Lifecycle of a purchase.
///
/// `Pending → Processing → Completed`, `Processing → Pending` on a failed
/// provisioning attempt, `Pending → Failed` when the invoice dies. Terminal
/// states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    /// Awaiting payment confirmation.
    Pending,
    /// Claimed by exactly one completer; not visible outside the core.
    Processing,
    /// Paid and provisioned.
    Completed,
    /// Invoice cancelled or expired, or balance debit refunded.
    Failed,
}

impl PurchaseStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `true` for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PurchaseStatus {
    type Err = ShopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ShopError::Storage(format!("unknown purchase status '{other}'"))),
        }
    }
}

/// One row of the purchase ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Purchase {
    /// Ledger id, also embedded in invoice metadata.
    pub id: i64,
    /// Buyer.
    pub customer_id: i64,
    /// Payment provider.
    pub provider: Provider,
    /// Provider-side invoice or payment id, set once the invoice exists.
    pub correlation_id: Option<String>,
    /// Price charged.
    pub amount: Decimal,
    /// Currency code (`RUB`, `USD`, `XTR`, ...).
    pub currency: String,
    /// Subscription months; 0 means a balance top-up.
    pub months: u32,
    /// Lifecycle state.
    pub status: PurchaseStatus,
    /// Owner of the current claim.
    pub claim_id: Option<Uuid>,
    /// Start of the current claim's lease.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time.
    pub paid_at: Option<DateTime<Utc>>,
}

impl Purchase {
    /// A top-up credits the balance instead of provisioning.
    #[must_use]
    pub const fn is_top_up(&self) -> bool {
        self.months == 0
    }

    /// Whether a completer may claim this purchase.
    ///
    /// `Processing` rows are claimable again once their lease started
    /// before `stale_before`.
    #[must_use]
    pub fn is_claimable(&self, stale_before: DateTime<Utc>) -> bool {
        match self.status {
            PurchaseStatus::Pending => true,
            PurchaseStatus::Processing => self.claimed_at.is_none_or(|at| at < stale_before),
            PurchaseStatus::Completed | PurchaseStatus::Failed => false,
        }
    }
}

/// Input for a new ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPurchase {
    /// Buyer.
    pub customer_id: i64,
    /// Payment provider.
    pub provider: Provider,
    /// Price charged.
    pub amount: Decimal,
    /// Currency code.
    pub currency: String,
    /// Subscription months; 0 means a balance top-up.
    pub months: u32,
}

/// Local projection of a customer.
///
/// Subscription link and expiry are a read-through cache of the panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Customer {
    /// Ledger id.
    pub id: i64,
    /// Chat identity, also the panel username.
    pub identity: String,
    /// Prepaid balance.
    pub balance: Decimal,
    /// Preferred language code.
    pub language: String,
    /// Subscription link from the panel.
    pub subscription_link: Option<String>,
    /// Subscription expiry from the panel.
    pub expire_at: Option<DateTime<Utc>>,
}

/// Proof of ownership of a `Processing` purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    /// Claimed purchase.
    pub purchase_id: i64,
    /// Unique id written with the claim.
    pub claim_id: Uuid,
}

/// Customer-side effect committed together with completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Top-up: add the purchase amount to the balance.
    CreditBalance,
    /// Plan: store what the panel reported. Absent fields keep the cached
    /// customer values.
    Subscription {
        /// Subscription link.
        link: Option<String>,
        /// New expiry.
        expire_at: Option<DateTime<Utc>>,
    },
}

/// Result of an atomic debit-and-claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitClaim {
    /// Balance debited, purchase claimed.
    Claimed(Claim),
    /// Balance too low; the purchase was marked `Failed`.
    Insufficient {
        /// Balance at the time of the check.
        available: Decimal,
    },
    /// Purchase was not claimable.
    NotClaimable,
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn purchase(status: PurchaseStatus, claimed_at: Option<DateTime<Utc>>) -> Purchase {
        Purchase {
            id: 1,
            customer_id: 1,
            provider: Provider::Crypto,
            correlation_id: None,
            amount: Decimal::ONE,
            currency: "USD".to_owned(),
            months: 1,
            status,
            claim_id: None,
            claimed_at,
            created_at: Utc::now(),
            paid_at: None,
        }
    }

    #[test]
    fn test_provider_round_trip_names() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert!("paypal".parse::<Provider>().is_err());
    }

    #[test]
    fn test_only_polled_providers_are_pollable() {
        assert!(Provider::Crypto.is_pollable());
        assert!(Provider::Card.is_pollable());
        assert!(!Provider::Stars.is_pollable());
        assert!(!Provider::Balance.is_pollable());
    }

    #[test]
    fn test_claimability() {
        let now = Utc::now();
        let stale_before = now - TimeDelta::minutes(5);

        assert!(purchase(PurchaseStatus::Pending, None).is_claimable(stale_before));
        assert!(
            !purchase(PurchaseStatus::Processing, Some(now)).is_claimable(stale_before),
            "fresh lease"
        );
        assert!(
            purchase(PurchaseStatus::Processing, Some(now - TimeDelta::minutes(10)))
                .is_claimable(stale_before),
            "stale lease"
        );
        assert!(!purchase(PurchaseStatus::Completed, None).is_claimable(stale_before));
        assert!(!purchase(PurchaseStatus::Failed, None).is_claimable(stale_before));
    }
}
