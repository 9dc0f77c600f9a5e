//! Identifiers used throughout GridTrade.
//!
//! Entities minted by the marketplace itself (offers, blocks, orders,
//! accounts) use UUIDv7 for time-ordered sorting. Identifiers that arrive on
//! the wire from protocol participants (transaction, message, item and trade
//! ids) are opaque strings.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUIDv7-backed identifier newtype.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

/// Declares an opaque string identifier newtype.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is empty or whitespace only.
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Marketplace-minted ids
// ---------------------------------------------------------------------------

uuid_id!(
    /// Identifier of a published offer.
    OfferId,
    "offer:"
);

uuid_id!(
    /// Identifier of a single allocatable block (one unit of energy).
    BlockId,
    "block:"
);

uuid_id!(
    /// Identifier of a buyer's order.
    OrderId,
    ""
);

uuid_id!(
    /// Identifier of a marketplace account (buyer, provider or platform).
    UserId,
    "user:"
);

// ---------------------------------------------------------------------------
// Protocol-supplied ids
// ---------------------------------------------------------------------------

string_id!(
    /// Correlates every message of one buyer journey (select → cancel).
    TransactionId
);

string_id!(
    /// Unique per protocol message; the dedup key for inbound requests.
    MessageId
);

string_id!(
    /// Catalog item identifier (the energy product an offer prices).
    ItemId
);

string_id!(
    /// Settlement key. Usually the order id, but callers may settle any trade.
    TradeId
);

impl From<OrderId> for TradeId {
    fn from(order_id: OrderId) -> Self {
        Self(order_id.0.to_string())
    }
}

impl TradeId {
    /// Interpret this trade id as an order id, if it is one.
    #[must_use]
    pub fn as_order_id(&self) -> Option<OrderId> {
        Uuid::parse_str(&self.0).ok().map(OrderId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_sort_by_creation() {
        let a = OrderId::new();
        let b = OrderId::new();
        assert!(a < b);
    }

    #[test]
    fn trade_id_round_trips_through_order_id() {
        let order_id = OrderId::new();
        let trade_id = TradeId::from(order_id);
        assert_eq!(trade_id.as_order_id(), Some(order_id));
        assert_eq!(TradeId::new("trade-1").as_order_id(), None);
    }

    #[test]
    fn blank_string_ids() {
        assert!(MessageId::new("  ").is_blank());
        assert!(!TransactionId::from("txn-1").is_blank());
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&TransactionId::new("txn-9")).unwrap();
        assert_eq!(json, "\"txn-9\"");

        let offer = OfferId::new();
        let json = serde_json::to_string(&offer).unwrap();
        assert_eq!(json, format!("\"{}\"", offer.0));
    }

    #[test]
    fn display_prefixes() {
        let offer = OfferId::new();
        assert!(offer.to_string().starts_with("offer:"));
        let order = OrderId::new();
        assert_eq!(order.to_string(), order.0.to_string());
    }
}
