//! Account provisioning against the VPN panel.
//!
//! The payment side only depends on the [`AccountProvisioner`] trait;
//! [`PanelClient`] is the production implementation.
//!
//! # Subscription arithmetic
//!
//! A month is always 30 days. Renewals stack on the existing expiry even if
//! it lies in the past; an account that never had an expiry starts from now.
//! See [`extend_expiry`].

mod client;
pub mod models;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
pub use client::{PanelClient, regions_from_nodes};
pub use models::{AccountStatus, Inbound, Node, Region, RemoteAccount};
use uuid::Uuid;

use crate::error::{Result, ShopError};

/// Days added per purchased month.
pub const DAYS_PER_MONTH: i64 = 30;

/// Remote account management used by purchase completion.
#[async_trait]
pub trait AccountProvisioner: Send + Sync {
    /// Creates the account or extends it by `months` × 30 days.
    ///
    /// Idempotent in shape (an upsert) but not in effect: every call extends
    /// the expiry again, so callers must guard against repeats.
    ///
    /// # Errors
    ///
    /// Returns the remote failure; nothing is committed locally.
    async fn create_or_update_account(
        &self,
        identity: &str,
        months: u32,
        traffic_limit_bytes: i64,
    ) -> Result<RemoteAccount>;

    /// Looks the account up; absence is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns the remote failure.
    async fn find_account(&self, identity: &str) -> Result<Option<RemoteAccount>>;

    /// Traffic used by `account` between `from` and `to`, in bytes.
    ///
    /// # Errors
    ///
    /// Returns the remote failure.
    async fn usage_between(
        &self,
        account: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64>;

    /// Countries that currently have an enabled, online node.
    ///
    /// # Errors
    ///
    /// Returns the remote failure.
    async fn available_regions(&self) -> Result<Vec<Region>>;
}

/// New expiry after buying `months` on top of `current`.
///
/// # Errors
///
/// Returns [`ShopError::InvalidInput`] if the result is out of range.
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use vpn_shop_core::panel::extend_expiry;
///
/// let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
/// let current = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
///
/// let renewed = extend_expiry(Some(current), 2, now).unwrap();
/// assert_eq!(renewed, Utc.with_ymd_and_hms(2025, 4, 30, 0, 0, 0).unwrap());
///
/// let fresh = extend_expiry(None, 1, now).unwrap();
/// assert_eq!(fresh, Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap());
/// ```
pub fn extend_expiry(
    current: Option<DateTime<Utc>>,
    months: u32,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let base = current.unwrap_or(now);
    TimeDelta::try_days(i64::from(months) * DAYS_PER_MONTH)
        .and_then(|delta| base.checked_add_signed(delta))
        .ok_or_else(|| ShopError::InvalidInput(format!("cannot extend expiry by {months} months")))
}

/// Flag emoji for an ISO 3166-1 alpha-2 code, or a white flag otherwise.
#[must_use]
pub fn flag_emoji(country_code: &str) -> String {
    const REGIONAL_INDICATOR_A: u32 = 0x1F1E6;
    let code = country_code.trim();
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return "\u{1F3F3}".to_owned();
    }
    code.chars()
        .filter_map(|c| {
            let offset = u32::from(c.to_ascii_uppercase()) - u32::from('A');
            char::from_u32(REGIONAL_INDICATOR_A + offset)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_missing_expiry_starts_from_now() {
        assert_eq!(extend_expiry(None, 1, at(1)).unwrap(), at(1) + TimeDelta::days(30));
    }

    #[test]
    fn test_past_expiry_still_stacks() {
        let expired = at(1);
        let now = at(20);
        assert_eq!(extend_expiry(Some(expired), 1, now).unwrap(), at(1) + TimeDelta::days(30));
    }

    #[test]
    fn test_zero_months_is_identity() {
        assert_eq!(extend_expiry(Some(at(5)), 0, at(1)).unwrap(), at(5));
    }

    #[test]
    fn test_flag_emoji() {
        assert_eq!(flag_emoji("NL"), "🇳🇱");
        assert_eq!(flag_emoji("us"), "🇺🇸");
        assert_eq!(flag_emoji("XYZ"), "\u{1F3F3}");
        assert_eq!(flag_emoji("1A"), "\u{1F3F3}");
    }

    proptest! {
        #[test]
        fn prop_extension_adds_exactly_thirty_days_per_month(
            offset_days in -3650i64..3650,
            months in 0u32..=120,
        ) {
            let now = at(15);
            let current = now + TimeDelta::days(offset_days);
            let extended = extend_expiry(Some(current), months, now).unwrap();
            prop_assert_eq!(extended - current, TimeDelta::days(i64::from(months) * 30));
        }

        #[test]
        fn prop_renewals_stack(first in 1u32..=24, second in 1u32..=24) {
            let now = at(15);
            let once = extend_expiry(None, first, now).unwrap();
            let twice = extend_expiry(Some(once), second, now).unwrap();
            prop_assert_eq!(twice, extend_expiry(None, first + second, now).unwrap());
            prop_assert!(twice > once);
        }
    }
}
