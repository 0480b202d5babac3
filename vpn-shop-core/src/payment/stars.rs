//! In-app stars invoices via the bot API.
//!
//! Stars payments are confirmed by the bot's successful-payment callback
//! (see [`handle_successful_payment`]), so this provider is never polled.
//!
//! [`handle_successful_payment`]: super::PaymentService::handle_successful_payment

use async_trait::async_trait;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::{Invoice, InvoiceRequest, InvoiceStatus, PaymentProvider, not_pollable};
use crate::{
    error::{Result, ShopError},
    purchase::Provider,
    transport::{HttpConfig, ResilientClient, StaticToken, TokenPlacement},
};

/// Stars currency code.
pub const STARS_CURRENCY: &str = "XTR";

#[derive(Debug, Serialize)]
struct LabeledPrice<'a> {
    label: &'a str,
    amount: i64,
}

#[derive(Debug, Serialize)]
struct CreateInvoiceLink<'a> {
    title: &'a str,
    description: &'a str,
    payload: String,
    currency: &'static str,
    prices: [LabeledPrice<'a>; 1],
}

#[derive(Debug, Deserialize)]
struct BotResponse {
    ok: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Bot API client issuing stars invoice links.
#[derive(Debug, Clone)]
pub struct StarsClient {
    client: ResilientClient,
}

impl StarsClient {
    /// Service name in logs and errors.
    pub const SERVICE: &'static str = "stars";

    /// Creates a client; the bot token travels in the URL path.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Config`] if the base URL is invalid.
    pub fn new(base_url: &str, bot_token: &str, http: &HttpConfig) -> Result<Self> {
        let auth = StaticToken::new(bot_token, TokenPlacement::Path);
        Ok(Self { client: ResilientClient::new(Self::SERVICE, base_url, auth, http)? })
    }

    /// Correlation id recorded for a stars purchase.
    #[must_use]
    pub fn correlation_id(purchase_id: i64) -> String {
        format!("stars:{purchase_id}")
    }
}

#[async_trait]
impl PaymentProvider for StarsClient {
    fn kind(&self) -> Provider {
        Provider::Stars
    }

    #[instrument(skip(self, request), fields(purchase_id = request.purchase_id))]
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice> {
        let stars = request
            .amount
            .trunc()
            .to_i64()
            .filter(|s| *s > 0 && request.amount.fract() == Decimal::ZERO)
            .ok_or_else(|| {
                ShopError::InvalidInput(format!(
                    "stars price must be a positive whole number: {}",
                    request.amount
                ))
            })?;
        let body = CreateInvoiceLink {
            title: &request.title,
            description: &request.description,
            payload: request.metadata.encode(),
            currency: STARS_CURRENCY,
            prices: [LabeledPrice { label: &request.title, amount: stars }],
        };
        let response: BotResponse = self
            .client
            .execute_json("create_invoice_link", |http, token| {
                let url = self.client.endpoint(&format!("/bot{token}/createInvoiceLink"));
                http.post(url).json(&body)
            })
            .await?;
        match response {
            BotResponse { ok: true, result: Some(link), .. } => Ok(Invoice {
                correlation_id: Self::correlation_id(request.purchase_id),
                payment_url: link,
            }),
            BotResponse { description, .. } => Err(ShopError::Client {
                service: Self::SERVICE,
                status: 200,
                body: description.unwrap_or_default(),
            }),
        }
    }

    async fn invoice_status(&self, _correlation_id: &str) -> Result<InvoiceStatus> {
        Err(not_pollable(Provider::Stars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::InvoiceMetadata;

    fn request(amount: Decimal) -> InvoiceRequest {
        InvoiceRequest {
            purchase_id: 3,
            amount,
            currency: STARS_CURRENCY.to_owned(),
            title: "VPN".to_owned(),
            description: "1 month".to_owned(),
            metadata: InvoiceMetadata::new(3),
        }
    }

    #[tokio::test]
    async fn test_fractional_stars_are_rejected() {
        let client =
            StarsClient::new("https://api.telegram.org", "t", &HttpConfig::default()).unwrap();
        let result = client.create_invoice(&request(Decimal::new(15, 1))).await;
        assert!(matches!(result, Err(ShopError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_not_pollable() {
        let client =
            StarsClient::new("https://api.telegram.org", "t", &HttpConfig::default()).unwrap();
        assert!(matches!(
            client.invoice_status("stars:1").await,
            Err(ShopError::ProviderUnavailable(_))
        ));
    }
}
