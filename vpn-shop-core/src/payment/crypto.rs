//! Crypto invoice provider (Crypto Pay API).

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::instrument;

use super::{Invoice, InvoiceRequest, InvoiceState, InvoiceStatus, PaymentProvider, money};
use crate::{
    error::{Result, ShopError},
    purchase::Provider,
    transport::{HttpConfig, ResilientClient, StaticToken, TokenPlacement},
};

/// Header carrying the application token.
const TOKEN_HEADER: &str = "Crypto-Pay-API-Token";

/// `getInvoices` page size; the API answers with at most 100 items by default
/// and 1000 at most.
const MAX_INVOICES_PER_REQUEST: usize = 100;

/// `{"ok": bool, "result": ..., "error": ...}` envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct CreateInvoice<'a> {
    currency_type: &'static str,
    fiat: &'a str,
    amount: String,
    description: &'a str,
    payload: String,
}

#[derive(Debug, Deserialize)]
struct CryptoInvoice {
    invoice_id: i64,
    status: String,
    #[serde(default)]
    bot_invoice_url: Option<String>,
    #[serde(default)]
    pay_url: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceList {
    #[serde(default)]
    items: Vec<CryptoInvoice>,
}

impl CryptoInvoice {
    fn state(&self) -> InvoiceState {
        match self.status.as_str() {
            "paid" => InvoiceState::Paid,
            "expired" => InvoiceState::Cancelled,
            _ => InvoiceState::Pending,
        }
    }

    fn into_status(self) -> InvoiceStatus {
        InvoiceStatus {
            correlation_id: self.invoice_id.to_string(),
            state: self.state(),
            payload: self.payload,
        }
    }
}

/// Crypto Pay client. Invoices are priced in fiat and settled in crypto.
#[derive(Debug, Clone)]
pub struct CryptoPayClient {
    client: ResilientClient,
}

impl CryptoPayClient {
    /// Service name in logs and errors.
    pub const SERVICE: &'static str = "crypto";

    /// Creates a client authenticating with an application token.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Config`] if the base URL is invalid.
    pub fn new(base_url: &str, token: &str, http: &HttpConfig) -> Result<Self> {
        let auth = StaticToken::new(token, TokenPlacement::Header(TOKEN_HEADER));
        Ok(Self { client: ResilientClient::new(Self::SERVICE, base_url, auth, http)? })
    }

    fn unwrap_envelope<T: DeserializeOwned>(&self, body: &str) -> Result<T> {
        let envelope: Envelope<T> = self.client.decode(body)?;
        match envelope {
            Envelope { ok: true, result: Some(result), .. } => Ok(result),
            Envelope { error, .. } => Err(ShopError::Client {
                service: Self::SERVICE,
                status: 200,
                body: error.map_or_else(|| body.to_owned(), |e| e.to_string()),
            }),
        }
    }
}

#[async_trait]
impl PaymentProvider for CryptoPayClient {
    fn kind(&self) -> Provider {
        Provider::Crypto
    }

    fn supports_batch(&self) -> bool {
        true
    }

    #[instrument(skip(self, request), fields(purchase_id = request.purchase_id))]
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice> {
        let body = CreateInvoice {
            currency_type: "fiat",
            fiat: &request.currency,
            amount: money(request.amount),
            description: &request.description,
            payload: request.metadata.encode(),
        };
        let url = self.client.endpoint("/api/createInvoice");
        let response =
            self.client.execute("create_invoice", |http, _| http.post(&url).json(&body)).await?;
        let invoice: CryptoInvoice = self.unwrap_envelope(&response.body)?;
        let payment_url = invoice
            .bot_invoice_url
            .or(invoice.pay_url)
            .ok_or_else(|| ShopError::Decoding {
                service: Self::SERVICE,
                message: "invoice has no payment URL".to_owned(),
                body: response.body.clone(),
            })?;
        Ok(Invoice { correlation_id: invoice.invoice_id.to_string(), payment_url })
    }

    async fn invoice_status(&self, correlation_id: &str) -> Result<InvoiceStatus> {
        self.invoice_statuses(&[correlation_id.to_owned()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ShopError::NotFound(format!("crypto invoice {correlation_id}")))
    }

    #[instrument(skip(self, correlation_ids), fields(count = correlation_ids.len()))]
    async fn invoice_statuses(&self, correlation_ids: &[String]) -> Result<Vec<InvoiceStatus>> {
        let url = self.client.endpoint("/api/getInvoices");
        let count = MAX_INVOICES_PER_REQUEST.to_string();
        let mut statuses = Vec::with_capacity(correlation_ids.len());
        for page in correlation_ids.chunks(MAX_INVOICES_PER_REQUEST) {
            let ids = page.join(",");
            let response = self
                .client
                .execute("get_invoices", |http, _| {
                    let query = [("invoice_ids", ids.as_str()), ("count", count.as_str())];
                    http.get(&url).query(&query)
                })
                .await?;
            let list: InvoiceList = self.unwrap_envelope(&response.body)?;
            statuses.extend(list.items.into_iter().map(CryptoInvoice::into_status));
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> CryptoPayClient {
        CryptoPayClient::new("https://pay.crypt.bot", "token", &HttpConfig::default()).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        let invoice = |status: &str| CryptoInvoice {
            invoice_id: 1,
            status: status.to_owned(),
            bot_invoice_url: None,
            pay_url: None,
            payload: None,
        };
        assert_eq!(invoice("paid").state(), InvoiceState::Paid);
        assert_eq!(invoice("expired").state(), InvoiceState::Cancelled);
        assert_eq!(invoice("active").state(), InvoiceState::Pending);
    }

    #[test]
    fn test_envelope_error_is_client_error() {
        let body = r#"{"ok":false,"error":{"code":400,"name":"AMOUNT_TOO_SMALL"}}"#;
        let result: Result<InvoiceList> = client().unwrap_envelope(body);
        match result {
            Err(ShopError::Client { body, .. }) => assert!(body.contains("AMOUNT_TOO_SMALL")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_envelope_result() {
        let body = r#"{"ok":true,"result":{"items":[
            {"invoice_id":5,"status":"paid","payload":"{\"purchase_id\":1}"}
        ]}}"#;
        let list: InvoiceList = client().unwrap_envelope(body).unwrap();
        let status = list.items.into_iter().next().unwrap().into_status();
        assert_eq!(status.correlation_id, "5");
        assert_eq!(status.state, InvoiceState::Paid);
        assert_eq!(status.payload.as_deref(), Some(r#"{"purchase_id":1}"#));
    }
}
