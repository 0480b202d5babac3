//! Card payment gateway (`YooKassa`-style API).
//!
//! Payments are created with an `Idempotence-Key` generated once per
//! invoice, so a retried create never produces a second payment.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{Invoice, InvoiceRequest, InvoiceState, InvoiceStatus, PaymentProvider, money};
use crate::{
    error::{Result, ShopError},
    purchase::Provider,
    transport::{HttpConfig, ResilientClient, StaticToken, TokenPlacement},
};

/// Metadata key holding the encoded invoice metadata.
const PAYLOAD_KEY: &str = "shop_payload";

#[derive(Debug, Serialize)]
struct Amount {
    value: String,
    currency: String,
}

#[derive(Debug, Serialize)]
struct Confirmation<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    return_url: &'a str,
}

#[derive(Debug, Serialize)]
struct CreatePayment<'a> {
    amount: Amount,
    capture: bool,
    confirmation: Confirmation<'a>,
    description: &'a str,
    metadata: HashMap<&'static str, String>,
}

#[derive(Debug, Deserialize)]
struct PaymentConfirmation {
    #[serde(default)]
    confirmation_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Payment {
    id: String,
    status: String,
    #[serde(default)]
    confirmation: Option<PaymentConfirmation>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl Payment {
    fn state(&self) -> InvoiceState {
        match self.status.as_str() {
            "succeeded" => InvoiceState::Paid,
            "canceled" => InvoiceState::Cancelled,
            _ => InvoiceState::Pending,
        }
    }
}

/// Card gateway client authenticating with shop id and secret key.
#[derive(Debug, Clone)]
pub struct CardGatewayClient {
    client: ResilientClient,
    return_url: String,
}

impl CardGatewayClient {
    /// Service name in logs and errors.
    pub const SERVICE: &'static str = "card";

    /// Creates a client.
    ///
    /// `return_url` is where the gateway sends the customer after paying.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Config`] if a URL is invalid.
    pub fn new(
        base_url: &str,
        shop_id: &str,
        secret_key: &str,
        return_url: &str,
        http: &HttpConfig,
    ) -> Result<Self> {
        crate::transport::parse_base_url(return_url)?;
        let auth = StaticToken::new(
            secret_key,
            TokenPlacement::Basic { username: shop_id.to_owned() },
        );
        Ok(Self {
            client: ResilientClient::new(Self::SERVICE, base_url, auth, http)?,
            return_url: return_url.to_owned(),
        })
    }
}

#[async_trait]
impl PaymentProvider for CardGatewayClient {
    fn kind(&self) -> Provider {
        Provider::Card
    }

    #[instrument(skip(self, request), fields(purchase_id = request.purchase_id))]
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice> {
        // One key for every attempt of this create.
        let idempotence_key = Uuid::new_v4().to_string();
        let body = CreatePayment {
            amount: Amount { value: money(request.amount), currency: request.currency.clone() },
            capture: true,
            confirmation: Confirmation { kind: "redirect", return_url: &self.return_url },
            description: &request.description,
            metadata: HashMap::from([(PAYLOAD_KEY, request.metadata.encode())]),
        };
        let url = self.client.endpoint("/v3/payments");
        let payment: Payment = self
            .client
            .execute_json("create_payment", |http, _| {
                http.post(&url).header("Idempotence-Key", &idempotence_key).json(&body)
            })
            .await?;
        debug!(payment_id = %payment.id, "card payment created");

        let payment_url = payment
            .confirmation
            .and_then(|c| c.confirmation_url)
            .ok_or_else(|| ShopError::Decoding {
                service: Self::SERVICE,
                message: "payment has no confirmation URL".to_owned(),
                body: String::new(),
            })?;
        Ok(Invoice { correlation_id: payment.id, payment_url })
    }

    async fn invoice_status(&self, correlation_id: &str) -> Result<InvoiceStatus> {
        let url = self.client.endpoint_with("/v3/payments", &[correlation_id])?;
        let mut payment: Payment =
            self.client.execute_json("get_payment", |http, _| http.get(url.clone())).await?;
        Ok(InvoiceStatus {
            state: payment.state(),
            payload: payment.metadata.remove(PAYLOAD_KEY),
            correlation_id: payment.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let payment = |status: &str| Payment {
            id: "p".to_owned(),
            status: status.to_owned(),
            confirmation: None,
            metadata: HashMap::new(),
        };
        assert_eq!(payment("succeeded").state(), InvoiceState::Paid);
        assert_eq!(payment("canceled").state(), InvoiceState::Cancelled);
        assert_eq!(payment("pending").state(), InvoiceState::Pending);
        assert_eq!(payment("waiting_for_capture").state(), InvoiceState::Pending);
    }

    #[test]
    fn test_rejects_bad_return_url() {
        let result = CardGatewayClient::new(
            "https://api.yookassa.ru",
            "shop",
            "secret",
            "not a url",
            &HttpConfig::default(),
        );
        assert!(matches!(result, Err(ShopError::Config(_))));
    }
}
