//! Income reporting to the tax service.
//!
//! The tax service issues short-lived bearer tokens in exchange for a
//! username and password. [`TaxClient`] logs in either eagerly
//! ([`TaxClient::connect`]) or on first use ([`TaxClient::new`]); the
//! client core refreshes the token single-flight after a 401/403.

mod models;

use std::fmt;

use async_trait::async_trait;
use chrono::Local;
use reqwest::Client;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{info, instrument};

pub use models::IncomeReceipt;
use models::{DeviceInfo, IncomeClient, IncomeRequest, IncomeService, LoginRequest, LoginResponse};

use crate::{
    error::{Result, ShopError},
    reliability::StatusClass,
    transport::{Authenticator, HttpConfig, ResilientClient, transport_error},
};

/// Records income for completed purchases.
#[async_trait]
pub trait IncomeReporter: Send + Sync {
    /// Records `amount` with a human-readable `description`.
    ///
    /// Returns the receipt id.
    ///
    /// # Errors
    ///
    /// Returns the remote failure.
    async fn report_income(&self, amount: Decimal, description: &str) -> Result<String>;
}

/// Username/password login against `POST /auth/lkfl`.
struct PasswordLogin {
    login_url: String,
    username: String,
    password: String,
}

impl fmt::Debug for PasswordLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordLogin")
            .field("login_url", &self.login_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl Authenticator for PasswordLogin {
    #[instrument(skip(self, http), fields(service = TaxClient::SERVICE))]
    async fn authenticate(&self, http: &Client) -> Result<String> {
        let body = LoginRequest {
            username: &self.username,
            password: &self.password,
            device_info: DeviceInfo::default(),
        };
        let response = http
            .post(&self.login_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(TaxClient::SERVICE, &e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| transport_error(TaxClient::SERVICE, &e))?;

        match StatusClass::of(status) {
            StatusClass::Success => {
                let login: LoginResponse =
                    serde_json::from_str(&text).map_err(|e| ShopError::Decoding {
                        service: TaxClient::SERVICE,
                        message: e.to_string(),
                        body: text.clone(),
                    })?;
                info!("tax service login succeeded");
                Ok(login.token)
            }
            StatusClass::Retryable => Err(ShopError::RetryableTransport {
                service: TaxClient::SERVICE,
                status: Some(status.as_u16()),
                message: text,
            }),
            _ => Err(ShopError::Authentication {
                service: TaxClient::SERVICE,
                message: format!("login failed with status {status}: {text}"),
            }),
        }
    }
}

/// Client for the self-employed income API.
#[derive(Debug, Clone)]
pub struct TaxClient {
    client: ResilientClient,
}

impl TaxClient {
    /// Service name in logs and errors.
    pub const SERVICE: &'static str = "tax";

    /// Creates a client that logs in on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Config`] if the base URL is invalid.
    pub fn new(base_url: &str, username: &str, password: &str, http: &HttpConfig) -> Result<Self> {
        let base = crate::transport::parse_base_url(base_url)?;
        let login = PasswordLogin {
            login_url: format!("{}/auth/lkfl", base.as_str().trim_end_matches('/')),
            username: username.to_owned(),
            password: password.to_owned(),
        };
        let client = ResilientClient::new(Self::SERVICE, base_url, login, http)?;
        Ok(Self { client })
    }

    /// Creates a client and logs in immediately.
    ///
    /// # Errors
    ///
    /// Returns the login failure, so misconfigured credentials surface at
    /// startup.
    pub async fn connect(
        base_url: &str,
        username: &str,
        password: &str,
        http: &HttpConfig,
    ) -> Result<Self> {
        let client = Self::new(base_url, username, password, http)?;
        client.client.authenticate().await?;
        Ok(client)
    }

    /// Returns `true` once a token is cached.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.client.cached_token().is_some()
    }

    /// Records an income of `amount` for a single service line.
    ///
    /// # Errors
    ///
    /// - [`ShopError::InvalidInput`] when `amount` is not positive
    /// - any error of the client core
    #[instrument(skip(self), fields(service = Self::SERVICE))]
    pub async fn create_income(&self, amount: Decimal, description: &str) -> Result<IncomeReceipt> {
        if amount <= Decimal::ZERO {
            return Err(ShopError::InvalidInput(format!(
                "income amount must be positive: {amount}"
            )));
        }
        let amount = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        let url = self.client.endpoint("/income");
        let receipt: IncomeReceipt = self
            .client
            .execute_json("create_income", |http, _| {
                // Timestamps are taken per attempt, as the service expects the send time.
                let now = Local::now().format("%Y-%m-%dT%H:%M:%S%:z").to_string();
                let body = IncomeRequest {
                    operation_time: now.clone(),
                    request_time: now,
                    services: vec![IncomeService {
                        name: description.to_owned(),
                        amount,
                        quantity: 1,
                    }],
                    total_amount: format!("{amount:.2}"),
                    client: IncomeClient { income_type: "FROM_INDIVIDUAL" },
                    payment_type: "CASH",
                    ignore_max_total_income_restriction: false,
                };
                http.post(&url).header("Accept", "application/json, text/plain, */*").json(&body)
            })
            .await?;
        info!(receipt = %receipt.approved_receipt_uuid, %amount, "income recorded");
        Ok(receipt)
    }
}

#[async_trait]
impl IncomeReporter for TaxClient {
    async fn report_income(&self, amount: Decimal, description: &str) -> Result<String> {
        self.create_income(amount, description).await.map(|r| r.approved_receipt_uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_debug_redacts_password() {
        let login = PasswordLogin {
            login_url: "https://tax.example.com/auth/lkfl".to_owned(),
            username: "inn".to_owned(),
            password: "hunter2".to_owned(),
        };
        assert!(!format!("{login:?}").contains("hunter2"));
    }

    #[test]
    fn test_new_is_lazy() {
        let client =
            TaxClient::new("https://tax.example.com/api/v1", "inn", "pw", &HttpConfig::default())
                .unwrap();
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amount() {
        let client =
            TaxClient::new("https://tax.example.com/api/v1", "inn", "pw", &HttpConfig::default())
                .unwrap();
        let result = client.create_income(Decimal::ZERO, "VPN, 1 month").await;
        assert!(matches!(result, Err(ShopError::InvalidInput(_))));
    }

    #[test]
    fn test_income_body_shape() {
        let body = IncomeRequest {
            operation_time: "2025-01-01T10:00:00+03:00".to_owned(),
            request_time: "2025-01-01T10:00:00+03:00".to_owned(),
            services: vec![IncomeService {
                name: "VPN".to_owned(),
                amount: Decimal::new(29900, 2),
                quantity: 1,
            }],
            total_amount: format!("{:.2}", Decimal::new(299, 0)),
            client: IncomeClient { income_type: "FROM_INDIVIDUAL" },
            payment_type: "CASH",
            ignore_max_total_income_restriction: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["totalAmount"], "299.00");
        assert_eq!(json["services"][0]["amount"], 299.0);
        assert_eq!(json["client"]["incomeType"], "FROM_INDIVIDUAL");
        assert_eq!(json["ignoreMaxTotalIncomeRestriction"], false);
    }
}
