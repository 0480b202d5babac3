//! Wire types of the tax income API.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Body of `POST /auth/lkfl`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub device_info: DeviceInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeviceInfo {
    pub source_device_id: &'static str,
    pub source_type: &'static str,
    pub app_version: &'static str,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self { source_device_id: "*", source_type: "WEB", app_version: "1.0.0" }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LoginResponse {
    pub token: String,
}

/// Body of `POST /income`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IncomeRequest {
    pub operation_time: String,
    pub request_time: String,
    pub services: Vec<IncomeService>,
    /// Two decimal places, as a string.
    pub total_amount: String,
    pub client: IncomeClient,
    pub payment_type: &'static str,
    pub ignore_max_total_income_restriction: bool,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct IncomeService {
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IncomeClient {
    pub income_type: &'static str,
}

/// Receipt returned for a recorded income.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeReceipt {
    /// Receipt id issued by the tax service.
    pub approved_receipt_uuid: String,
}
