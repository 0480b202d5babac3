//! Wire types of the VPN panel API.
//!
//! Only the fields this crate reads or writes are modelled; unknown fields
//! are ignored on input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every panel response wraps its payload as `{"response": ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    /// Payload.
    pub response: T,
}

/// Account status as reported by the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    /// Account can connect.
    Active,
    /// Disabled by an operator.
    Disabled,
    /// Traffic limit reached.
    Limited,
    /// Subscription ran out.
    Expired,
}

/// Traffic reset strategy. Plans always reset monthly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrafficLimitStrategy {
    /// Never reset.
    NoReset,
    /// Reset daily.
    Day,
    /// Reset weekly.
    Week,
    /// Reset monthly.
    Month,
}

/// Inbound reference attached to an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRef {
    /// Inbound id.
    pub uuid: Uuid,
    /// Inbound tag.
    #[serde(default)]
    pub tag: String,
}

/// Account owned by the panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAccount {
    /// Panel-side account id.
    pub uuid: Uuid,
    /// Username; equals the customer identity.
    pub username: String,
    /// Current status.
    pub status: AccountStatus,
    /// Subscription expiry; `None` when never set.
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
    /// Traffic limit per reset period, 0 = unlimited.
    #[serde(default)]
    pub traffic_limit_bytes: i64,
    /// Subscription link handed to the customer.
    #[serde(default)]
    pub subscription_url: Option<String>,
    /// Total traffic ever used.
    #[serde(default)]
    pub lifetime_used_traffic_bytes: i64,
    /// Inbounds the account may use.
    #[serde(default)]
    pub active_user_inbounds: Vec<InboundRef>,
}

/// Inbound listed by `GET /api/inbounds`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    /// Inbound id.
    pub uuid: Uuid,
    /// Inbound tag.
    #[serde(default)]
    pub tag: String,
}

/// Node listed by `GET /api/nodes/get-all`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Node id.
    pub uuid: Uuid,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// ISO 3166-1 alpha-2 country code.
    #[serde(default)]
    pub country_code: String,
    /// Disabled by an operator.
    #[serde(default)]
    pub is_disabled: bool,
    /// Node reported online.
    #[serde(default)]
    pub is_node_online: bool,
}

/// Body of `POST /api/users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCreate {
    /// Username; equals the customer identity.
    pub username: String,
    /// Always [`AccountStatus::Active`].
    pub status: AccountStatus,
    /// Always [`TrafficLimitStrategy::Month`].
    pub traffic_limit_strategy: TrafficLimitStrategy,
    /// Traffic limit per month.
    pub traffic_limit_bytes: i64,
    /// Expiry of the new subscription.
    pub expire_at: DateTime<Utc>,
    /// Every inbound known at creation time.
    pub active_user_inbounds: Vec<Uuid>,
}

/// Body of `POST /api/users/update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountUpdate {
    /// Account to update.
    pub uuid: Uuid,
    /// Forced to [`AccountStatus::Active`].
    pub status: AccountStatus,
    /// New traffic limit.
    pub traffic_limit_bytes: i64,
    /// Extended expiry.
    pub expire_at: DateTime<Utc>,
}

/// Per-node usage entry of the usage range endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUsage {
    /// Node display name.
    #[serde(default)]
    pub node_name: String,
    /// Bytes used on that node within the range.
    #[serde(default)]
    pub total: i64,
}

/// A country where at least one usable node is located.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Region {
    /// ISO 3166-1 alpha-2 country code, upper case.
    pub country_code: String,
    /// Flag emoji derived from the country code.
    pub flag: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_decodes_with_missing_optionals() {
        let json = r#"{
            "uuid": "6f1c8a52-3b0e-4b8e-9d0a-2f5b8f1c0d11",
            "username": "user42",
            "status": "EXPIRED",
            "somethingElse": true
        }"#;
        let account: RemoteAccount = serde_json::from_str(json).unwrap();
        assert_eq!(account.status, AccountStatus::Expired);
        assert!(account.expire_at.is_none());
        assert!(account.active_user_inbounds.is_empty());
    }

    #[test]
    fn test_create_body_is_camel_case() {
        let body = AccountCreate {
            username: "user42".to_owned(),
            status: AccountStatus::Active,
            traffic_limit_strategy: TrafficLimitStrategy::Month,
            traffic_limit_bytes: 100,
            expire_at: DateTime::<Utc>::UNIX_EPOCH,
            active_user_inbounds: vec![],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], "ACTIVE");
        assert_eq!(json["trafficLimitStrategy"], "MONTH");
        assert_eq!(json["trafficLimitBytes"], 100);
        assert!(json.get("activeUserInbounds").is_some());
    }
}
