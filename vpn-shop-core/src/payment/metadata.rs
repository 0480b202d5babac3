//! Structured invoice payload.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShopError};

/// Data embedded in a provider invoice at creation and read back on
/// confirmation.
///
/// Serialized as `{"purchase_id": <i64>}`. Unknown fields are rejected so a
/// payload produced by something else is never mistaken for ours.
///
/// # Examples
///
/// ```
/// use vpn_shop_core::payment::InvoiceMetadata;
///
/// let encoded = InvoiceMetadata::new(42).encode();
/// assert_eq!(encoded, r#"{"purchase_id":42}"#);
/// assert_eq!(InvoiceMetadata::decode(&encoded).unwrap().purchase_id, 42);
/// assert!(InvoiceMetadata::decode("42&user42").is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvoiceMetadata {
    /// Ledger id of the purchase the invoice pays for.
    pub purchase_id: i64,
}

impl InvoiceMetadata {
    /// Metadata for `purchase_id`.
    #[must_use]
    pub const fn new(purchase_id: i64) -> Self {
        Self { purchase_id }
    }

    /// JSON text to embed in the invoice.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(r#"{{"purchase_id":{}}}"#, self.purchase_id)
    }

    /// Parses a payload produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::InvalidInput`] when the payload is not valid
    /// metadata.
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw.trim())
            .map_err(|e| ShopError::InvalidInput(format!("invalid invoice metadata '{raw}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_foreign_payloads() {
        for raw in ["", "{}", r#"{"purchase_id":"42"}"#, r#"{"purchase_id":1,"x":2}"#, "null"] {
            assert!(InvoiceMetadata::decode(raw).is_err(), "{raw}");
        }
    }

    #[test]
    fn test_tolerates_whitespace() {
        assert_eq!(InvoiceMetadata::decode(" {\"purchase_id\": 9}\n").unwrap().purchase_id, 9);
    }
}
