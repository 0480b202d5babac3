//! Purchase orchestration.
//!
//! Completion follows claim → provision → commit:
//!
//! 1. the purchase is claimed (`Pending`/stale `Processing` → `Processing`),
//!    so at most one completer provisions it
//! 2. the panel account is created or extended
//! 3. completion and the customer projection are committed atomically
//!
//! A provisioning failure releases the claim and leaves the purchase
//! `Pending` for the next reconciliation run.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument, warn};

use super::{
    CompletionOutcome, InvoiceMetadata, InvoiceRequest, PaymentProvider, PlanCatalog,
    STARS_CURRENCY,
};
use crate::{
    audit::{AuditEvent, AuditEventType, audit_log},
    error::{Result, ShopError},
    panel::{AccountProvisioner, Region, RemoteAccount},
    purchase::{
        Claim, Customer, DebitClaim, NewPurchase, Provider, Purchase, PurchaseStore, Settlement,
    },
    tax::IncomeReporter,
};

/// Knobs of purchase completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSettings {
    /// Monthly traffic limit applied on every provisioning.
    pub traffic_limit_bytes: i64,
    /// How long a claim stays exclusive before it may be taken over.
    pub claim_lease: Duration,
    /// Fiat currency of crypto, card and balance purchases.
    pub currency: String,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            traffic_limit_bytes: 0,
            claim_lease: Duration::from_secs(300),
            currency: "RUB".to_owned(),
        }
    }
}

/// Operations exposed to the bot layer and the reconciliation loops.
#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn PurchaseStore>,
    provisioner: Arc<dyn AccountProvisioner>,
    providers: HashMap<Provider, Arc<dyn PaymentProvider>>,
    income: Option<Arc<dyn IncomeReporter>>,
    plans: PlanCatalog,
    settings: CompletionSettings,
}

impl std::fmt::Debug for PaymentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut providers: Vec<_> = self.providers.keys().collect();
        providers.sort();
        f.debug_struct("PaymentService")
            .field("providers", &providers)
            .field("income_reporting", &self.income.is_some())
            .field("plans", &self.plans)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PaymentService {
    /// Creates a service without payment providers or income reporting.
    #[must_use]
    pub fn new(
        store: Arc<dyn PurchaseStore>,
        provisioner: Arc<dyn AccountProvisioner>,
        plans: PlanCatalog,
        settings: CompletionSettings,
    ) -> Self {
        Self {
            store,
            provisioner,
            providers: HashMap::new(),
            income: None,
            plans,
            settings,
        }
    }

    /// Registers a payment provider, replacing one of the same kind.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    /// Reports income of externally paid purchases.
    #[must_use]
    pub fn with_income_reporter(mut self, reporter: Arc<dyn IncomeReporter>) -> Self {
        self.income = Some(reporter);
        self
    }

    /// Registered provider of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::ProviderUnavailable`] when none is registered.
    pub fn provider(&self, kind: Provider) -> Result<Arc<dyn PaymentProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| ShopError::ProviderUnavailable(kind.to_string()))
    }

    /// The purchase ledger.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PurchaseStore> {
        &self.store
    }

    /// The plan catalog.
    #[must_use]
    pub fn plans(&self) -> &PlanCatalog {
        &self.plans
    }

    /// Claims taken before this instant are stale.
    pub(crate) fn stale_before(&self) -> DateTime<Utc> {
        let lease = TimeDelta::from_std(self.settings.claim_lease).unwrap_or(TimeDelta::MAX);
        Utc::now().checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn currency_for(&self, provider: Provider) -> String {
        match provider {
            Provider::Stars => STARS_CURRENCY.to_owned(),
            Provider::Crypto | Provider::Card | Provider::Balance => self.settings.currency.clone(),
        }
    }

    /// Creates a `Pending` purchase and an invoice for it.
    ///
    /// `months = 0` is a balance top-up of `amount`. Returns the payment URL
    /// and the purchase id.
    ///
    /// # Errors
    ///
    /// - [`ShopError::InvalidInput`] for a non-positive amount or a balance provider
    /// - [`ShopError::ProviderUnavailable`] when the provider is not configured
    /// - the provider's error; the purchase is then marked `Failed`
    #[instrument(skip(self, customer), fields(customer_id = customer.id))]
    pub async fn create_purchase(
        &self,
        amount: Decimal,
        months: u32,
        customer: &Customer,
        provider: Provider,
    ) -> Result<(String, i64)> {
        if amount <= Decimal::ZERO {
            return Err(ShopError::InvalidInput(format!("amount must be positive: {amount}")));
        }
        if provider == Provider::Balance {
            return Err(ShopError::InvalidInput(
                "balance purchases go through purchase_from_balance".to_owned(),
            ));
        }
        let client = self.provider(provider)?;

        let purchase = self
            .store
            .create_purchase(NewPurchase {
                customer_id: customer.id,
                provider,
                amount,
                currency: self.currency_for(provider),
                months,
            })
            .await?;

        let (title, description) = describe(months);
        let request = InvoiceRequest {
            purchase_id: purchase.id,
            amount,
            currency: purchase.currency.clone(),
            title,
            description,
            metadata: InvoiceMetadata::new(purchase.id),
        };
        let invoice = match client.create_invoice(&request).await {
            Ok(invoice) => invoice,
            Err(e) => {
                if let Err(mark) = self.store.fail(purchase.id).await {
                    error!(
                        purchase_id = purchase.id,
                        error = %mark,
                        "failed to mark purchase failed"
                    );
                }
                audit_log(
                    &AuditEvent::for_purchase(AuditEventType::InvoiceFailed, &purchase)
                        .with_customer(&customer.identity)
                        .with_error(e.to_string()),
                );
                return Err(e);
            }
        };
        self.store.attach_correlation(purchase.id, &invoice.correlation_id).await?;

        audit_log(
            &AuditEvent::for_purchase(AuditEventType::InvoiceCreated, &purchase)
                .with_customer(&customer.identity)
                .with_correlation_id(&invoice.correlation_id),
        );
        info!(
            purchase_id = purchase.id,
            %provider,
            correlation_id = %invoice.correlation_id,
            "invoice created"
        );
        Ok((invoice.payment_url, purchase.id))
    }

    /// Completes a paid purchase exactly once.
    ///
    /// Purchases that are terminal or held by a live claim are reported as
    /// [`CompletionOutcome::AlreadyProcessed`] without side effects.
    ///
    /// # Errors
    ///
    /// - [`ShopError::NotFound`] when the purchase or its customer is missing
    /// - [`ShopError::InvalidInput`] for a balance purchase; only
    ///   [`purchase_from_balance`](Self::purchase_from_balance) settles those,
    ///   since it debits the balance in the same step as the claim
    /// - the provisioning error; the purchase is back to `Pending`
    #[instrument(skip(self))]
    pub async fn process_purchase_by_id(&self, purchase_id: i64) -> Result<CompletionOutcome> {
        match self.store.purchase(purchase_id).await? {
            None => return Err(ShopError::NotFound(format!("purchase {purchase_id}"))),
            Some(purchase) if purchase.provider == Provider::Balance => {
                warn!(
                    purchase_id,
                    status = %purchase.status,
                    "refusing to complete undebited balance purchase"
                );
                return Err(ShopError::InvalidInput(format!(
                    "balance purchase {purchase_id} is settled by purchase_from_balance"
                )));
            }
            Some(_) => {}
        }

        let Some(claim) = self.store.claim(purchase_id, self.stale_before()).await? else {
            return match self.store.purchase(purchase_id).await? {
                Some(purchase) => {
                    debug!(purchase_id, status = %purchase.status, "purchase not claimable");
                    Ok(CompletionOutcome::AlreadyProcessed)
                }
                None => Err(ShopError::NotFound(format!("purchase {purchase_id}"))),
            };
        };

        let (purchase, customer) = match self.load_claimed(&claim).await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.release(&claim).await;
                return Err(e);
            }
        };

        let settlement = if purchase.is_top_up() {
            Settlement::CreditBalance
        } else {
            match self
                .provisioner
                .create_or_update_account(
                    &customer.identity,
                    purchase.months,
                    self.settings.traffic_limit_bytes,
                )
                .await
            {
                Ok(account) => subscription(&account),
                Err(e) => {
                    warn!(purchase_id, error = %e, "provisioning failed, releasing claim");
                    self.release(&claim).await;
                    audit_log(
                        &AuditEvent::for_purchase(AuditEventType::PurchaseReleased, &purchase)
                            .with_customer(&customer.identity)
                            .with_error(e.to_string()),
                    );
                    return Err(e);
                }
            }
        };

        if !self.store.complete(&claim, settlement).await? {
            error!(purchase_id, "claim lost before commit; purchase was taken over");
            return Ok(CompletionOutcome::AlreadyProcessed);
        }

        audit_log(
            &AuditEvent::for_purchase(AuditEventType::PurchaseCompleted, &purchase)
                .with_customer(&customer.identity),
        );
        info!(
            purchase_id,
            provider = %purchase.provider,
            months = purchase.months,
            "purchase completed"
        );

        self.report_income(&purchase).await;
        Ok(CompletionOutcome::Completed)
    }

    /// Buys a plan with the customer's balance.
    ///
    /// # Errors
    ///
    /// - [`ShopError::InvalidInput`] when no plan of that length exists
    /// - [`ShopError::InsufficientBalance`]; the purchase is marked `Failed`
    /// - the provisioning error; the balance is refunded and the purchase
    ///   marked `Failed`
    #[instrument(skip(self, customer), fields(customer_id = customer.id))]
    pub async fn purchase_from_balance(
        &self,
        customer: &Customer,
        months: u32,
    ) -> Result<RemoteAccount> {
        let price = self.plans.price(months, Provider::Balance)?;
        let purchase = self
            .store
            .create_purchase(NewPurchase {
                customer_id: customer.id,
                provider: Provider::Balance,
                amount: price,
                currency: self.currency_for(Provider::Balance),
                months,
            })
            .await?;

        let claim = match self.store.claim_with_debit(purchase.id, self.stale_before()).await? {
            DebitClaim::Claimed(claim) => claim,
            DebitClaim::Insufficient { available } => {
                info!(purchase_id = purchase.id, %price, %available, "insufficient balance");
                return Err(ShopError::InsufficientBalance { required: price, available });
            }
            DebitClaim::NotClaimable => {
                return Err(ShopError::Storage(format!(
                    "fresh balance purchase {} is not claimable",
                    purchase.id
                )));
            }
        };
        audit_log(
            &AuditEvent::for_purchase(AuditEventType::BalanceDebited, &purchase)
                .with_customer(&customer.identity),
        );

        let account = match self
            .provisioner
            .create_or_update_account(&customer.identity, months, self.settings.traffic_limit_bytes)
            .await
        {
            Ok(account) => account,
            Err(e) => {
                warn!(purchase_id = purchase.id, error = %e, "provisioning failed, refunding");
                match self.store.refund_and_fail(&claim).await {
                    Ok(_) => audit_log(
                        &AuditEvent::for_purchase(AuditEventType::BalanceRefunded, &purchase)
                            .with_customer(&customer.identity)
                            .with_error(e.to_string()),
                    ),
                    Err(refund) => {
                        error!(purchase_id = purchase.id, error = %refund, "refund failed");
                    }
                }
                return Err(e);
            }
        };

        if self.store.complete(&claim, subscription(&account)).await? {
            audit_log(
                &AuditEvent::for_purchase(AuditEventType::PurchaseCompleted, &purchase)
                    .with_customer(&customer.identity),
            );
            info!(purchase_id = purchase.id, months, "balance purchase completed");
        } else {
            error!(purchase_id = purchase.id, "claim lost before commit");
        }
        Ok(account)
    }

    /// Handles the bot's successful-payment callback for stars invoices.
    ///
    /// # Errors
    ///
    /// - [`ShopError::InvalidInput`] for a payload that is not ours or a
    ///   purchase that is not a stars purchase
    /// - everything [`process_purchase_by_id`](Self::process_purchase_by_id) returns
    #[instrument(skip(self))]
    pub async fn handle_successful_payment(&self, payload: &str) -> Result<CompletionOutcome> {
        let metadata = InvoiceMetadata::decode(payload)?;
        let purchase = self
            .store
            .purchase(metadata.purchase_id)
            .await?
            .ok_or_else(|| ShopError::NotFound(format!("purchase {}", metadata.purchase_id)))?;
        if purchase.provider != Provider::Stars {
            return Err(ShopError::InvalidInput(format!(
                "purchase {} is a {} purchase, not stars",
                purchase.id, purchase.provider
            )));
        }
        self.process_purchase_by_id(purchase.id).await
    }

    /// The customer's panel account, if one exists.
    ///
    /// # Errors
    ///
    /// Returns the panel failure.
    pub async fn get_user(&self, identity: &str) -> Result<Option<RemoteAccount>> {
        self.provisioner.find_account(identity).await
    }

    /// Bytes used by the customer's panel account between `from` and `to`.
    ///
    /// # Errors
    ///
    /// - [`ShopError::NotFound`] when the customer has no panel account
    /// - the panel failure
    pub async fn get_user_daily_usage(
        &self,
        identity: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        let account = self
            .provisioner
            .find_account(identity)
            .await?
            .ok_or_else(|| ShopError::NotFound(format!("panel account {identity}")))?;
        self.provisioner.usage_between(account.uuid, from, to).await
    }

    /// Countries with usable nodes.
    ///
    /// # Errors
    ///
    /// Returns the panel failure.
    pub async fn available_regions(&self) -> Result<Vec<Region>> {
        self.provisioner.available_regions().await
    }

    async fn load_claimed(&self, claim: &Claim) -> Result<(Purchase, Customer)> {
        let purchase = self
            .store
            .purchase(claim.purchase_id)
            .await?
            .ok_or_else(|| ShopError::NotFound(format!("purchase {}", claim.purchase_id)))?;
        let customer = self
            .store
            .customer(purchase.customer_id)
            .await?
            .ok_or_else(|| ShopError::NotFound(format!("customer {}", purchase.customer_id)))?;
        Ok((purchase, customer))
    }

    async fn release(&self, claim: &Claim) {
        match self.store.release(claim).await {
            Ok(true) => {}
            Ok(false) => warn!(purchase_id = claim.purchase_id, "claim already gone on release"),
            Err(e) => {
                // The lease expires on its own; the next run reclaims it.
                error!(purchase_id = claim.purchase_id, error = %e, "failed to release claim");
            }
        }
    }

    async fn report_income(&self, purchase: &Purchase) {
        let Some(reporter) = &self.income else {
            return;
        };
        if !matches!(purchase.provider, Provider::Crypto | Provider::Card) {
            return;
        }
        let (_, description) = describe(purchase.months);
        match reporter.report_income(purchase.amount, &description).await {
            Ok(receipt) => {
                audit_log(
                    &AuditEvent::for_purchase(AuditEventType::IncomeReported, purchase)
                        .with_correlation_id(receipt),
                );
            }
            Err(e) => {
                error!(purchase_id = purchase.id, error = %e, "income reporting failed");
            }
        }
    }
}

fn subscription(account: &RemoteAccount) -> Settlement {
    Settlement::Subscription {
        link: account.subscription_url.clone(),
        expire_at: account.expire_at,
    }
}

/// Invoice title and description for a purchase of `months`.
fn describe(months: u32) -> (String, String) {
    match months {
        0 => ("Balance top-up".to_owned(), "Balance top-up".to_owned()),
        1 => ("VPN subscription".to_owned(), "VPN subscription, 1 month".to_owned()),
        n => ("VPN subscription".to_owned(), format!("VPN subscription, {n} months")),
    }
}
