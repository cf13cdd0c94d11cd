//! Trade signals carried from the leader monitor to followers.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::position::Side;

/// Whether the leader opened or closed its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    Open,
    Close,
}

/// Immutable description of a leader position change.
///
/// `id` is unique per publication and only used to correlate log lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeSignal {
    pub id: String,

    /// Leader side; `None` on close signals (`"NONE"` on the wire)
    #[serde(with = "wire_side")]
    pub side: Option<Side>,

    /// Mid price at publication time
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,

    /// Publication time, unix milliseconds
    pub timestamp: i64,

    #[serde(rename = "type")]
    pub kind: SignalKind,

    /// Leader size; zero on close signals
    #[serde(with = "rust_decimal::serde::float")]
    pub original_amount: Decimal,

    /// Leader's observed execution reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

impl TradeSignal {
    /// Signal for a freshly opened leader position.
    pub fn open(side: Side, amount: Decimal, price: Decimal, tx_hash: Option<String>) -> Self {
        Self {
            id: Self::next_id(),
            side: Some(side),
            price,
            timestamp: Utc::now().timestamp_millis(),
            kind: SignalKind::Open,
            original_amount: amount,
            tx_hash,
        }
    }

    /// Signal for a leader close.
    pub fn close(price: Decimal) -> Self {
        Self {
            id: Self::next_id(),
            side: None,
            price,
            timestamp: Utc::now().timestamp_millis(),
            kind: SignalKind::Close,
            original_amount: Decimal::ZERO,
            tx_hash: None,
        }
    }

    pub fn side_label(&self) -> &'static str {
        self.side.map(|s| s.as_str()).unwrap_or("NONE")
    }

    fn next_id() -> String {
        format!("SIG-{}", Uuid::new_v4().simple())
    }
}

mod wire_side {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::models::Side;

    pub fn serialize<S: Serializer>(side: &Option<Side>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(side.map(|side| side.as_str()).unwrap_or("NONE"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Side>, D::Error> {
        let raw = String::deserialize(d)?;
        match raw.as_str() {
            "LONG" => Ok(Some(Side::Long)),
            "SHORT" => Ok(Some(Side::Short)),
            "NONE" => Ok(None),
            other => Err(D::Error::unknown_variant(other, &["LONG", "SHORT", "NONE"])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_open_signal_wire_shape() {
        let signal = TradeSignal::open(Side::Long, dec!(0.1), dec!(64250.50), None);
        let value = serde_json::to_value(&signal).unwrap();

        assert_eq!(value["type"], json!("OPEN"));
        assert_eq!(value["side"], json!("LONG"));
        assert_eq!(value["originalAmount"], json!(0.1));
        assert_eq!(value["price"], json!(64250.5));
        assert!(value["id"].as_str().unwrap().starts_with("SIG-"));
        assert!(value.get("txHash").is_none());
    }

    #[test]
    fn test_close_signal_has_no_side() {
        let signal = TradeSignal::close(dec!(100));
        assert_eq!(signal.kind, SignalKind::Close);
        assert_eq!(signal.side, None);
        assert_eq!(signal.original_amount, Decimal::ZERO);
        assert_eq!(signal.side_label(), "NONE");

        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value["side"], json!("NONE"));
    }

    #[test]
    fn test_parse_bridge_message() {
        let raw = r#"{
            "id": "SIG-1718000000000",
            "side": "SHORT",
            "price": 64120.5,
            "timestamp": 1718000000000,
            "type": "OPEN",
            "originalAmount": 0.25
        }"#;

        let signal: TradeSignal = serde_json::from_str(raw).unwrap();
        assert_eq!(signal.side, Some(Side::Short));
        assert_eq!(signal.kind, SignalKind::Open);
        assert_eq!(signal.price, dec!(64120.5));
        assert_eq!(signal.original_amount, dec!(0.25));
        assert_eq!(signal.tx_hash, None);

        let bad = raw.replace("SHORT", "SIDEWAYS");
        assert!(serde_json::from_str::<TradeSignal>(&bad).is_err());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = TradeSignal::close(dec!(1));
        let b = TradeSignal::close(dec!(1));
        assert_ne!(a.id, b.id);
    }
}
