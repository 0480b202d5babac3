//! In-memory ledger with the same transition rules as [`PgStore`](super::PgStore).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{
    Claim, Customer, DebitClaim, NewPurchase, Provider, Purchase, PurchaseStatus,
    PurchaseStore, Settlement,
};
use crate::error::{Result, ShopError};

#[derive(Debug, Default)]
struct Ledger {
    purchases: BTreeMap<i64, Purchase>,
    customers: BTreeMap<i64, Customer>,
    next_purchase_id: i64,
    next_customer_id: i64,
}

impl Ledger {
    fn claimed_mut(&mut self, claim: &Claim) -> Option<&mut Purchase> {
        self.purchases.get_mut(&claim.purchase_id).filter(|p| {
            p.status == PurchaseStatus::Processing && p.claim_id == Some(claim.claim_id)
        })
    }

    fn customer_mut(&mut self, customer_id: i64) -> Result<&mut Customer> {
        self.customers
            .get_mut(&customer_id)
            .ok_or_else(|| ShopError::Storage(format!("customer {customer_id} missing")))
    }
}

/// Mutex-guarded ledger.
///
/// # Examples
///
/// ```
/// use rust_decimal::Decimal;
/// use vpn_shop_core::purchase::{InMemoryStore, NewPurchase, Provider, PurchaseStore};
///
/// # async fn example() -> vpn_shop_core::Result<()> {
/// let store = InMemoryStore::new();
/// let customer = store.ensure_customer("user42", "en").await?;
/// let purchase = store
///     .create_purchase(NewPurchase {
///         customer_id: customer.id,
///         provider: Provider::Crypto,
///         amount: Decimal::new(5, 0),
///         currency: "USD".to_owned(),
///         months: 1,
///     })
///     .await?;
/// assert_eq!(purchase.id, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    ledger: Mutex<Ledger>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a customer's balance.
    pub fn set_balance(&self, customer_id: i64, balance: Decimal) -> Result<()> {
        self.ledger.lock().customer_mut(customer_id)?.balance = balance;
        Ok(())
    }

    /// Inserts a purchase row as-is, keeping its id.
    pub fn insert_purchase(&self, purchase: Purchase) {
        let mut ledger = self.ledger.lock();
        ledger.next_purchase_id = ledger.next_purchase_id.max(purchase.id);
        ledger.purchases.insert(purchase.id, purchase);
    }
}

#[async_trait]
impl PurchaseStore for InMemoryStore {
    async fn create_purchase(&self, new: NewPurchase) -> Result<Purchase> {
        let mut ledger = self.ledger.lock();
        if !ledger.customers.contains_key(&new.customer_id) {
            return Err(ShopError::Storage(format!("customer {} missing", new.customer_id)));
        }
        ledger.next_purchase_id += 1;
        let purchase = Purchase {
            id: ledger.next_purchase_id,
            customer_id: new.customer_id,
            provider: new.provider,
            correlation_id: None,
            amount: new.amount,
            currency: new.currency,
            months: new.months,
            status: PurchaseStatus::Pending,
            claim_id: None,
            claimed_at: None,
            created_at: Utc::now(),
            paid_at: None,
        };
        ledger.purchases.insert(purchase.id, purchase.clone());
        Ok(purchase)
    }

    async fn attach_correlation(&self, purchase_id: i64, correlation_id: &str) -> Result<()> {
        let mut ledger = self.ledger.lock();
        let purchase = ledger
            .purchases
            .get_mut(&purchase_id)
            .ok_or_else(|| ShopError::NotFound(format!("purchase {purchase_id}")))?;
        purchase.correlation_id = Some(correlation_id.to_owned());
        Ok(())
    }

    async fn purchase(&self, purchase_id: i64) -> Result<Option<Purchase>> {
        Ok(self.ledger.lock().purchases.get(&purchase_id).cloned())
    }

    async fn reclaimable_by_provider(
        &self,
        provider: Provider,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Purchase>> {
        Ok(self
            .ledger
            .lock()
            .purchases
            .values()
            .filter(|p| {
                p.provider == provider
                    && p.correlation_id.is_some()
                    && p.is_claimable(stale_before)
            })
            .cloned()
            .collect())
    }

    async fn claim(&self, purchase_id: i64, stale_before: DateTime<Utc>) -> Result<Option<Claim>> {
        let mut ledger = self.ledger.lock();
        let Some(purchase) =
            ledger.purchases.get_mut(&purchase_id).filter(|p| p.is_claimable(stale_before))
        else {
            return Ok(None);
        };
        let claim = Claim { purchase_id, claim_id: Uuid::new_v4() };
        purchase.status = PurchaseStatus::Processing;
        purchase.claim_id = Some(claim.claim_id);
        purchase.claimed_at = Some(Utc::now());
        Ok(Some(claim))
    }

    async fn release(&self, claim: &Claim) -> Result<bool> {
        let mut ledger = self.ledger.lock();
        let Some(purchase) = ledger.claimed_mut(claim) else {
            return Ok(false);
        };
        purchase.status = PurchaseStatus::Pending;
        purchase.claim_id = None;
        purchase.claimed_at = None;
        Ok(true)
    }

    async fn complete(&self, claim: &Claim, settlement: Settlement) -> Result<bool> {
        let mut ledger = self.ledger.lock();
        let Some(purchase) = ledger.claimed_mut(claim) else {
            return Ok(false);
        };
        let (customer_id, amount) = (purchase.customer_id, purchase.amount);
        // Resolve the customer before mutating anything so a failure leaves
        // the row untouched.
        ledger.customer_mut(customer_id)?;

        let Some(purchase) = ledger.claimed_mut(claim) else {
            return Ok(false);
        };
        purchase.status = PurchaseStatus::Completed;
        purchase.claim_id = None;
        purchase.claimed_at = None;
        purchase.paid_at = Some(Utc::now());

        let customer = ledger.customer_mut(customer_id)?;
        match settlement {
            Settlement::CreditBalance => customer.balance += amount,
            Settlement::Subscription { link, expire_at } => {
                if link.is_some() {
                    customer.subscription_link = link;
                }
                if expire_at.is_some() {
                    customer.expire_at = expire_at;
                }
            }
        }
        Ok(true)
    }

    async fn fail(&self, purchase_id: i64) -> Result<bool> {
        let mut ledger = self.ledger.lock();
        match ledger.purchases.get_mut(&purchase_id) {
            Some(purchase) if purchase.status == PurchaseStatus::Pending => {
                purchase.status = PurchaseStatus::Failed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_with_debit(
        &self,
        purchase_id: i64,
        stale_before: DateTime<Utc>,
    ) -> Result<DebitClaim> {
        let mut ledger = self.ledger.lock();
        let Some((customer_id, amount)) = ledger
            .purchases
            .get(&purchase_id)
            .filter(|p| p.is_claimable(stale_before))
            .map(|p| (p.customer_id, p.amount))
        else {
            return Ok(DebitClaim::NotClaimable);
        };

        let customer = ledger.customer_mut(customer_id)?;
        if customer.balance < amount {
            let available = customer.balance;
            if let Some(purchase) = ledger.purchases.get_mut(&purchase_id) {
                purchase.status = PurchaseStatus::Failed;
                purchase.claim_id = None;
                purchase.claimed_at = None;
            }
            return Ok(DebitClaim::Insufficient { available });
        }
        customer.balance -= amount;

        let claim = Claim { purchase_id, claim_id: Uuid::new_v4() };
        if let Some(purchase) = ledger.purchases.get_mut(&purchase_id) {
            purchase.status = PurchaseStatus::Processing;
            purchase.claim_id = Some(claim.claim_id);
            purchase.claimed_at = Some(Utc::now());
        }
        Ok(DebitClaim::Claimed(claim))
    }

    async fn refund_and_fail(&self, claim: &Claim) -> Result<bool> {
        let mut ledger = self.ledger.lock();
        let Some(purchase) = ledger.claimed_mut(claim) else {
            return Ok(false);
        };
        let (customer_id, amount) = (purchase.customer_id, purchase.amount);
        ledger.customer_mut(customer_id)?.balance += amount;
        if let Some(purchase) = ledger.claimed_mut(claim) {
            purchase.status = PurchaseStatus::Failed;
            purchase.claim_id = None;
            purchase.claimed_at = None;
        }
        Ok(true)
    }

    async fn customer(&self, customer_id: i64) -> Result<Option<Customer>> {
        Ok(self.ledger.lock().customers.get(&customer_id).cloned())
    }

    async fn customer_by_identity(&self, identity: &str) -> Result<Option<Customer>> {
        Ok(self.ledger.lock().customers.values().find(|c| c.identity == identity).cloned())
    }

    async fn ensure_customer(&self, identity: &str, language: &str) -> Result<Customer> {
        let mut ledger = self.ledger.lock();
        if let Some(existing) = ledger.customers.values().find(|c| c.identity == identity) {
            return Ok(existing.clone());
        }
        ledger.next_customer_id += 1;
        let customer = Customer {
            id: ledger.next_customer_id,
            identity: identity.to_owned(),
            balance: Decimal::ZERO,
            language: language.to_owned(),
            subscription_link: None,
            expire_at: None,
        };
        ledger.customers.insert(customer.id, customer.clone());
        Ok(customer)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    async fn store_with_purchase(months: u32, amount: Decimal) -> (InMemoryStore, Purchase) {
        let store = InMemoryStore::new();
        let customer = store.ensure_customer("user42", "en").await.unwrap();
        let purchase = store
            .create_purchase(NewPurchase {
                customer_id: customer.id,
                provider: Provider::Crypto,
                amount,
                currency: "RUB".to_owned(),
                months,
            })
            .await
            .unwrap();
        (store, purchase)
    }

    fn lease_cutoff() -> DateTime<Utc> {
        Utc::now() - TimeDelta::minutes(5)
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (store, purchase) = store_with_purchase(1, Decimal::ONE).await;

        let first = store.claim(purchase.id, lease_cutoff()).await.unwrap();
        let second = store.claim(purchase.id, lease_cutoff()).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_stale_claim_can_be_taken_over() {
        let (store, purchase) = store_with_purchase(1, Decimal::ONE).await;
        let stale = store.claim(purchase.id, lease_cutoff()).await.unwrap().unwrap();

        // Every lease counts as stale with a cutoff in the future.
        let future_cutoff = Utc::now() + TimeDelta::minutes(1);
        let fresh = store.claim(purchase.id, future_cutoff).await.unwrap().unwrap();
        assert_ne!(stale.claim_id, fresh.claim_id);

        assert!(!store.complete(&stale, Settlement::CreditBalance).await.unwrap());
        assert!(store.complete(&fresh, Settlement::CreditBalance).await.unwrap());
    }

    #[tokio::test]
    async fn test_top_up_credits_balance_once() {
        let (store, purchase) = store_with_purchase(0, Decimal::new(150, 0)).await;
        let claim = store.claim(purchase.id, lease_cutoff()).await.unwrap().unwrap();

        assert!(store.complete(&claim, Settlement::CreditBalance).await.unwrap());
        assert!(!store.complete(&claim, Settlement::CreditBalance).await.unwrap());

        let customer = store.customer(purchase.customer_id).await.unwrap().unwrap();
        assert_eq!(customer.balance, Decimal::new(150, 0));
        let purchase = store.purchase(purchase.id).await.unwrap().unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Completed);
        assert!(purchase.paid_at.is_some());
    }

    async fn settle_subscription(
        store: &InMemoryStore,
        customer_id: i64,
        link: Option<&str>,
        expire_at: Option<DateTime<Utc>>,
    ) {
        let purchase = store
            .create_purchase(NewPurchase {
                customer_id,
                provider: Provider::Crypto,
                amount: Decimal::ONE,
                currency: "RUB".to_owned(),
                months: 1,
            })
            .await
            .unwrap();
        let claim = store.claim(purchase.id, lease_cutoff()).await.unwrap().unwrap();
        let settlement = Settlement::Subscription { link: link.map(str::to_owned), expire_at };
        assert!(store.complete(&claim, settlement).await.unwrap());
    }

    #[tokio::test]
    async fn test_subscription_without_expiry_keeps_cached_projection() {
        let store = InMemoryStore::new();
        let customer = store.ensure_customer("user42", "en").await.unwrap();
        let expire_at = Utc::now() + TimeDelta::days(30);

        let link = "https://sub.example.com/user42";
        settle_subscription(&store, customer.id, Some(link), Some(expire_at)).await;
        settle_subscription(&store, customer.id, None, None).await;

        let customer = store.customer(customer.id).await.unwrap().unwrap();
        assert_eq!(customer.subscription_link.as_deref(), Some(link));
        assert_eq!(customer.expire_at, Some(expire_at));
    }

    #[tokio::test]
    async fn test_release_returns_to_pending() {
        let (store, purchase) = store_with_purchase(1, Decimal::ONE).await;
        let claim = store.claim(purchase.id, lease_cutoff()).await.unwrap().unwrap();

        assert!(store.release(&claim).await.unwrap());
        let purchase = store.purchase(purchase.id).await.unwrap().unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Pending);
        assert!(purchase.claim_id.is_none());
    }

    #[tokio::test]
    async fn test_fail_only_from_pending() {
        let (store, purchase) = store_with_purchase(1, Decimal::ONE).await;
        let claim = store.claim(purchase.id, lease_cutoff()).await.unwrap().unwrap();

        assert!(!store.fail(purchase.id).await.unwrap(), "claimed rows are not failed");
        store.release(&claim).await.unwrap();
        assert!(store.fail(purchase.id).await.unwrap());
        assert!(!store.fail(purchase.id).await.unwrap(), "terminal rows stay terminal");
        assert!(store.claim(purchase.id, lease_cutoff()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_debit_claim_and_refund() {
        let (store, purchase) = store_with_purchase(1, Decimal::new(100, 0)).await;
        store.set_balance(purchase.customer_id, Decimal::new(250, 0)).unwrap();

        let DebitClaim::Claimed(claim) =
            store.claim_with_debit(purchase.id, lease_cutoff()).await.unwrap()
        else {
            panic!("expected a claim");
        };
        let customer = store.customer(purchase.customer_id).await.unwrap().unwrap();
        assert_eq!(customer.balance, Decimal::new(150, 0));

        assert!(store.refund_and_fail(&claim).await.unwrap());
        let customer = store.customer(purchase.customer_id).await.unwrap().unwrap();
        assert_eq!(customer.balance, Decimal::new(250, 0));
        let purchase = store.purchase(purchase.id).await.unwrap().unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Failed);
    }

    #[tokio::test]
    async fn test_debit_with_insufficient_balance_fails_purchase() {
        let (store, purchase) = store_with_purchase(1, Decimal::new(100, 0)).await;
        store.set_balance(purchase.customer_id, Decimal::new(40, 0)).unwrap();

        let outcome = store.claim_with_debit(purchase.id, lease_cutoff()).await.unwrap();
        assert_eq!(outcome, DebitClaim::Insufficient { available: Decimal::new(40, 0) });

        let purchase = store.purchase(purchase.id).await.unwrap().unwrap();
        assert_eq!(purchase.status, PurchaseStatus::Failed);
        let customer = store.customer(purchase.customer_id).await.unwrap().unwrap();
        assert_eq!(customer.balance, Decimal::new(40, 0));
    }

    #[tokio::test]
    async fn test_reclaimable_requires_correlation() {
        let (store, purchase) = store_with_purchase(1, Decimal::ONE).await;
        let cutoff = lease_cutoff();
        assert!(store.reclaimable_by_provider(Provider::Crypto, cutoff).await.unwrap().is_empty());

        store.attach_correlation(purchase.id, "INV1").await.unwrap();
        let pending = store.reclaimable_by_provider(Provider::Crypto, cutoff).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(store.reclaimable_by_provider(Provider::Card, cutoff).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_customer_is_idempotent() {
        let store = InMemoryStore::new();
        let first = store.ensure_customer("user1", "ru").await.unwrap();
        let second = store.ensure_customer("user1", "en").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.language, "ru");
    }
}
