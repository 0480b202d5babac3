//! VPN panel client.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    AccountProvisioner, extend_expiry, flag_emoji,
    models::{
        AccountCreate, AccountStatus, AccountUpdate, Envelope, Inbound, Node, NodeUsage, Region,
        RemoteAccount, TrafficLimitStrategy,
    },
};
use crate::{
    error::{Result, ShopError},
    transport::{HttpConfig, ResilientClient, StaticToken},
};

/// Typed client for the panel's account API.
///
/// Authenticates with a long-lived bearer token.
///
/// # Examples
///
/// ```rust,no_run
/// use vpn_shop_core::{panel::{AccountProvisioner, PanelClient}, transport::HttpConfig};
///
/// # async fn example() -> vpn_shop_core::Result<()> {
/// let panel = PanelClient::new("https://panel.example.com", "token", &HttpConfig::default())?;
/// let account = panel.create_or_update_account("user42", 1, 100 * 1024 * 1024 * 1024).await?;
/// println!("expires at {:?}", account.expire_at);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PanelClient {
    client: ResilientClient,
}

impl PanelClient {
    /// Service name in logs and errors.
    pub const SERVICE: &'static str = "panel";

    /// Creates a panel client.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Config`] if the base URL is invalid.
    pub fn new(base_url: &str, token: &str, http: &HttpConfig) -> Result<Self> {
        let client =
            ResilientClient::new(Self::SERVICE, base_url, StaticToken::bearer(token), http)?;
        Ok(Self { client })
    }

    /// Looks an account up by username; absence is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns transport or decoding errors from the client core.
    #[instrument(skip(self))]
    pub async fn find_account(&self, username: &str) -> Result<Option<RemoteAccount>> {
        let url = self.client.endpoint_with("/api/users/username", &[username])?;
        let envelope: Option<Envelope<RemoteAccount>> = self
            .client
            .execute_optional_json("find_account", |http, _| http.get(url.clone()))
            .await?;
        Ok(envelope.map(|e| e.response))
    }

    /// Lists inbounds. Never cached: new accounts always get the current set.
    ///
    /// # Errors
    ///
    /// Returns transport or decoding errors from the client core.
    pub async fn list_inbounds(&self) -> Result<Vec<Inbound>> {
        let url = self.client.endpoint("/api/inbounds");
        let envelope: Envelope<Vec<Inbound>> =
            self.client.execute_json("list_inbounds", |http, _| http.get(&url)).await?;
        Ok(envelope.response)
    }

    /// Lists every node known to the panel.
    ///
    /// # Errors
    ///
    /// Returns transport or decoding errors from the client core.
    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        let url = self.client.endpoint("/api/nodes/get-all");
        let envelope: Envelope<Vec<Node>> =
            self.client.execute_json("list_nodes", |http, _| http.get(&url)).await?;
        Ok(envelope.response)
    }

    /// Countries with at least one enabled, online node.
    ///
    /// Deduplicated by country code and sorted.
    ///
    /// # Errors
    ///
    /// Returns transport or decoding errors from the client core.
    #[instrument(skip(self))]
    pub async fn available_regions(&self) -> Result<Vec<Region>> {
        Ok(regions_from_nodes(&self.list_nodes().await?))
    }

    async fn create_account(
        &self,
        username: &str,
        months: u32,
        traffic_limit_bytes: i64,
    ) -> Result<RemoteAccount> {
        let inbounds = self.list_inbounds().await?;
        let body = AccountCreate {
            username: username.to_owned(),
            status: AccountStatus::Active,
            traffic_limit_strategy: TrafficLimitStrategy::Month,
            traffic_limit_bytes,
            expire_at: extend_expiry(None, months, Utc::now())?,
            active_user_inbounds: inbounds.into_iter().map(|i| i.uuid).collect(),
        };
        let url = self.client.endpoint("/api/users");
        let envelope: Envelope<RemoteAccount> = self
            .client
            .execute_json("create_account", |http, _| http.post(&url).json(&body))
            .await?;
        info!(username, months, expire_at = %body.expire_at, "panel account created");
        Ok(envelope.response)
    }

    async fn update_account(
        &self,
        existing: &RemoteAccount,
        months: u32,
        traffic_limit_bytes: i64,
    ) -> Result<RemoteAccount> {
        let body = AccountUpdate {
            uuid: existing.uuid,
            status: AccountStatus::Active,
            traffic_limit_bytes,
            expire_at: extend_expiry(existing.expire_at, months, Utc::now())?,
        };
        let url = self.client.endpoint("/api/users/update");
        let envelope: Envelope<RemoteAccount> = self
            .client
            .execute_json("update_account", |http, _| http.post(&url).json(&body))
            .await?;
        info!(
            username = %existing.username,
            months,
            expire_at = %body.expire_at,
            "panel account extended"
        );
        Ok(envelope.response)
    }

    /// Sums per-node traffic of an account between `from` and `to`.
    ///
    /// # Errors
    ///
    /// Returns transport or decoding errors from the client core.
    #[instrument(skip(self))]
    pub async fn usage_between(
        &self,
        account: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        if to < from {
            return Err(ShopError::InvalidInput("usage range ends before it starts".to_owned()));
        }
        let account = account.to_string();
        let url = self.client.endpoint_with("/api/users/stats/usage", &[&account, "range"])?;
        let query = [("start", from.to_rfc3339()), ("end", to.to_rfc3339())];
        let envelope: Envelope<Vec<NodeUsage>> = self
            .client
            .execute_json("usage_between", |http, _| http.get(url.clone()).query(&query))
            .await?;
        Ok(envelope.response.iter().map(|u| u.total).sum())
    }
}

#[async_trait]
impl AccountProvisioner for PanelClient {
    #[instrument(skip(self))]
    async fn create_or_update_account(
        &self,
        identity: &str,
        months: u32,
        traffic_limit_bytes: i64,
    ) -> Result<RemoteAccount> {
        match self.find_account(identity).await? {
            Some(existing) => self.update_account(&existing, months, traffic_limit_bytes).await,
            None => self.create_account(identity, months, traffic_limit_bytes).await,
        }
    }

    async fn find_account(&self, identity: &str) -> Result<Option<RemoteAccount>> {
        Self::find_account(self, identity).await
    }

    async fn usage_between(
        &self,
        account: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        Self::usage_between(self, account, from, to).await
    }

    async fn available_regions(&self) -> Result<Vec<Region>> {
        Self::available_regions(self).await
    }
}

/// Filters usable nodes and collapses them to one region per country.
#[must_use]
pub fn regions_from_nodes(nodes: &[Node]) -> Vec<Region> {
    let mut regions = BTreeMap::new();
    for node in nodes.iter().filter(|n| !n.is_disabled && n.is_node_online) {
        let code = node.country_code.trim().to_ascii_uppercase();
        if code.is_empty() {
            continue;
        }
        regions
            .entry(code.clone())
            .or_insert_with(|| Region { flag: flag_emoji(&code), country_code: code });
    }
    regions.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(code: &str, disabled: bool, online: bool) -> Node {
        Node {
            uuid: Uuid::new_v4(),
            name: format!("node-{code}"),
            country_code: code.to_owned(),
            is_disabled: disabled,
            is_node_online: online,
        }
    }

    #[test]
    fn test_regions_keep_only_usable_nodes() {
        let nodes = vec![
            node("DE", false, true),
            node("NL", true, true),
            node("FI", false, false),
            node("de", false, true),
            node("AT", false, true),
        ];
        let regions = regions_from_nodes(&nodes);
        let codes: Vec<_> = regions.iter().map(|r| r.country_code.as_str()).collect();
        assert_eq!(codes, vec!["AT", "DE"]);
        assert_eq!(regions[1].flag, "🇩🇪");
    }

    #[test]
    fn test_regions_skip_blank_codes() {
        assert!(regions_from_nodes(&[node(" ", false, true)]).is_empty());
    }
}
