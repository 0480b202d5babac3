//! PostgreSQL ledger.
//!
//! Transitions are single conditional `UPDATE`s; the ones that also touch
//! the customer row run inside a transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use super::{
    Claim, Customer, DebitClaim, NewPurchase, Provider, Purchase, PurchaseStatus,
    PurchaseStore, Settlement,
};
use crate::error::{Result, ShopError};

const PURCHASE_COLUMNS: &str = "id, customer_id, provider, correlation_id, amount, currency, \
                                months, status, claim_id, claimed_at, created_at, paid_at";

const CUSTOMER_COLUMNS: &str =
    "id, identity, balance, language, subscription_link, expire_at";

/// Claimable predicate over `purchase`; `$N` is the stale-lease cutoff.
fn claimable(cutoff_param: u8) -> String {
    format!(
        "(status = 'pending' OR (status = 'processing' AND \
         (claimed_at IS NULL OR claimed_at < ${cutoff_param})))"
    )
}

/// Claims a purchase. `claimed_at` is bound from the application clock, the
/// same clock the `stale_before` cutoff is computed on.
fn claim_update() -> String {
    format!(
        "UPDATE purchase SET status = 'processing', claim_id = $2, claimed_at = $3 \
         WHERE id = $1 AND {}",
        claimable(4)
    )
}

const CLAIM_DEBITED: &str =
    "UPDATE purchase SET status = 'processing', claim_id = $2, claimed_at = $3 WHERE id = $1";

/// Migrations shipped with the crate.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Ledger backed by a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wraps an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Storage`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    /// Applies the bundled migrations.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Storage`] if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| ShopError::Storage(format!("migration failed: {e}")))
    }

    async fn fail_within(tx: &mut Transaction<'_, Postgres>, purchase_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE purchase SET status = 'failed', claim_id = NULL, claimed_at = NULL \
             WHERE id = $1",
        )
        .bind(purchase_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn purchase_from_row(row: &PgRow) -> Result<Purchase> {
    let provider: String = row.try_get("provider")?;
    let status: String = row.try_get("status")?;
    let months: i32 = row.try_get("months")?;
    Ok(Purchase {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        provider: provider.parse::<Provider>().map_err(|e| ShopError::Storage(e.to_string()))?,
        correlation_id: row.try_get("correlation_id")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        months: u32::try_from(months)
            .map_err(|_| ShopError::Storage(format!("negative months: {months}")))?,
        status: status.parse::<PurchaseStatus>()?,
        claim_id: row.try_get("claim_id")?,
        claimed_at: row.try_get("claimed_at")?,
        created_at: row.try_get("created_at")?,
        paid_at: row.try_get("paid_at")?,
    })
}

fn customer_from_row(row: &PgRow) -> Result<Customer> {
    Ok(Customer {
        id: row.try_get("id")?,
        identity: row.try_get("identity")?,
        balance: row.try_get("balance")?,
        language: row.try_get("language")?,
        subscription_link: row.try_get("subscription_link")?,
        expire_at: row.try_get("expire_at")?,
    })
}

#[async_trait]
impl PurchaseStore for PgStore {
    async fn create_purchase(&self, new: NewPurchase) -> Result<Purchase> {
        let months = i32::try_from(new.months)
            .map_err(|_| ShopError::InvalidInput(format!("months out of range: {}", new.months)))?;
        let row = sqlx::query(&format!(
            "INSERT INTO purchase (customer_id, provider, amount, currency, months) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {PURCHASE_COLUMNS}"
        ))
        .bind(new.customer_id)
        .bind(new.provider.as_str())
        .bind(new.amount)
        .bind(&new.currency)
        .bind(months)
        .fetch_one(&self.pool)
        .await?;
        purchase_from_row(&row)
    }

    async fn attach_correlation(&self, purchase_id: i64, correlation_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE purchase SET correlation_id = $2 WHERE id = $1")
            .bind(purchase_id)
            .bind(correlation_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ShopError::NotFound(format!("purchase {purchase_id}")));
        }
        Ok(())
    }

    async fn purchase(&self, purchase_id: i64) -> Result<Option<Purchase>> {
        let row = sqlx::query(&format!("SELECT {PURCHASE_COLUMNS} FROM purchase WHERE id = $1"))
            .bind(purchase_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(purchase_from_row).transpose()
    }

    async fn reclaimable_by_provider(
        &self,
        provider: Provider,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Purchase>> {
        let rows = sqlx::query(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchase \
             WHERE provider = $1 AND correlation_id IS NOT NULL AND {} \
             ORDER BY id",
            claimable(2)
        ))
        .bind(provider.as_str())
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(purchase_from_row).collect()
    }

    async fn claim(&self, purchase_id: i64, stale_before: DateTime<Utc>) -> Result<Option<Claim>> {
        let claim_id = Uuid::new_v4();
        let result = sqlx::query(&claim_update())
            .bind(purchase_id)
            .bind(claim_id)
            .bind(Utc::now())
            .bind(stale_before)
            .execute(&self.pool)
            .await?;
        Ok((result.rows_affected() == 1).then_some(Claim { purchase_id, claim_id }))
    }

    async fn release(&self, claim: &Claim) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE purchase SET status = 'pending', claim_id = NULL, claimed_at = NULL \
             WHERE id = $1 AND status = 'processing' AND claim_id = $2",
        )
        .bind(claim.purchase_id)
        .bind(claim.claim_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, claim: &Claim, settlement: Settlement) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE purchase SET status = 'completed', claim_id = NULL, claimed_at = NULL, \
             paid_at = now() \
             WHERE id = $1 AND status = 'processing' AND claim_id = $2 \
             RETURNING customer_id, amount",
        )
        .bind(claim.purchase_id)
        .bind(claim.claim_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };
        let customer_id: i64 = row.try_get("customer_id")?;
        let amount: Decimal = row.try_get("amount")?;

        match settlement {
            Settlement::CreditBalance => {
                sqlx::query("UPDATE customer SET balance = balance + $2 WHERE id = $1")
                    .bind(customer_id)
                    .bind(amount)
                    .execute(&mut *tx)
                    .await?;
            }
            Settlement::Subscription { link, expire_at } => {
                sqlx::query(
                    "UPDATE customer SET subscription_link = COALESCE($2, subscription_link), \
                     expire_at = COALESCE($3, expire_at) WHERE id = $1",
                )
                .bind(customer_id)
                .bind(link)
                .bind(expire_at)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn fail(&self, purchase_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE purchase SET status = 'failed' WHERE id = $1 AND status = 'pending'",
        )
        .bind(purchase_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_with_debit(
        &self,
        purchase_id: i64,
        stale_before: DateTime<Utc>,
    ) -> Result<DebitClaim> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT customer_id, amount FROM purchase WHERE id = $1 AND {} FOR UPDATE",
            claimable(2)
        ))
        .bind(purchase_id)
        .bind(stale_before)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(DebitClaim::NotClaimable);
        };
        let customer_id: i64 = row.try_get("customer_id")?;
        let amount: Decimal = row.try_get("amount")?;

        let debited = sqlx::query(
            "UPDATE customer SET balance = balance - $2 WHERE id = $1 AND balance >= $2",
        )
        .bind(customer_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if debited.rows_affected() == 0 {
            let available: Decimal = sqlx::query("SELECT balance FROM customer WHERE id = $1")
                .bind(customer_id)
                .fetch_one(&mut *tx)
                .await?
                .try_get("balance")?;
            Self::fail_within(&mut tx, purchase_id).await?;
            tx.commit().await?;
            return Ok(DebitClaim::Insufficient { available });
        }

        let claim = Claim { purchase_id, claim_id: Uuid::new_v4() };
        sqlx::query(CLAIM_DEBITED)
            .bind(purchase_id)
            .bind(claim.claim_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(DebitClaim::Claimed(claim))
    }

    async fn refund_and_fail(&self, claim: &Claim) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE purchase SET status = 'failed', claim_id = NULL, claimed_at = NULL \
             WHERE id = $1 AND status = 'processing' AND claim_id = $2 \
             RETURNING customer_id, amount",
        )
        .bind(claim.purchase_id)
        .bind(claim.claim_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };
        let customer_id: i64 = row.try_get("customer_id")?;
        let amount: Decimal = row.try_get("amount")?;
        sqlx::query("UPDATE customer SET balance = balance + $2 WHERE id = $1")
            .bind(customer_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn customer(&self, customer_id: i64) -> Result<Option<Customer>> {
        let row = sqlx::query(&format!("SELECT {CUSTOMER_COLUMNS} FROM customer WHERE id = $1"))
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(customer_from_row).transpose()
    }

    async fn customer_by_identity(&self, identity: &str) -> Result<Option<Customer>> {
        let row =
            sqlx::query(&format!("SELECT {CUSTOMER_COLUMNS} FROM customer WHERE identity = $1"))
                .bind(identity)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(customer_from_row).transpose()
    }

    async fn ensure_customer(&self, identity: &str, language: &str) -> Result<Customer> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query(&format!(
            "INSERT INTO customer (identity, language) VALUES ($1, $2) \
             ON CONFLICT (identity) DO UPDATE SET identity = EXCLUDED.identity \
             RETURNING {CUSTOMER_COLUMNS}"
        ))
        .bind(identity)
        .bind(language)
        .fetch_one(&self.pool)
        .await?;
        customer_from_row(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claimable_predicate_binds_given_parameter() {
        let predicate = claimable(3);
        assert!(predicate.contains("claimed_at < $3"));
        assert!(predicate.contains("status = 'pending'"));
    }

    #[test]
    fn test_claims_take_timestamp_from_application_clock() {
        let claim = claim_update();
        assert!(claim.contains("claimed_at = $3"));
        assert!(claim.contains("claimed_at < $4"));
        assert!(!claim.contains("now()"));
        assert!(CLAIM_DEBITED.contains("claimed_at = $3"));
        assert!(!CLAIM_DEBITED.contains("now()"));
    }
}
