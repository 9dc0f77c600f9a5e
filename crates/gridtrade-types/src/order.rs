//! Order types for the GridTrade marketplace.
//!
//! ## State Machine
//!
//! ```text
//!   ┌───────┐ blocks claimed ┌─────────┐ confirm ┌────────┐ settle ┌───────────┐
//!   │ DRAFT ├───────────────▶│ PENDING ├────────▶│ ACTIVE ├───────▶│ COMPLETED │
//!   └───┬───┘                └────┬────┘         └───┬────┘        └───────────┘
//!       │ under-claim             │ cancel/expire    │ cancel
//!       ▼                         ▼                  ▼
//!   ┌─────────────────────────────────────────────────────┐
//!   │                      CANCELLED                      │
//!   └─────────────────────────────────────────────────────┘
//! ```
//!
//! An order owns its line items; line items reference offers and, through
//! the block ledger, the blocks reserved for them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{ItemId, OfferId, OrderId, Quote, TransactionId, UserId};

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Draft,
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl OrderStatus {
    /// Can an order in this status move to `target`?
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Draft, Self::Pending | Self::Cancelled)
                | (Self::Pending, Self::Active | Self::Cancelled)
                | (Self::Active, Self::Completed | Self::Cancelled)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether the order currently holds blocks.
    #[must_use]
    pub fn holds_inventory(self) -> bool {
        matches!(self, Self::Pending | Self::Active | Self::Completed)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "DRAFT"),
            Self::Pending => write!(f, "PENDING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Payment state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Escrowed,
    Refunded,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Escrowed => write!(f, "ESCROWED"),
            Self::Refunded => write!(f, "REFUNDED"),
        }
    }
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub item_id: ItemId,
    pub offer_id: OfferId,
    pub provider_id: UserId,
    pub quantity: u64,
    pub unit_price: Decimal,
}

impl OrderItem {
    #[must_use]
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Who initiated a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelledBy {
    Buyer,
    Provider,
    /// Reservation failure or expiry.
    System,
}

impl std::fmt::Display for CancelledBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buyer => write!(f, "BUYER"),
            Self::Provider => write!(f, "PROVIDER"),
            Self::System => write!(f, "SYSTEM"),
        }
    }
}

/// How an escrowed amount is divided when an order is cancelled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltySplit {
    /// Returned to the buyer out of escrow.
    pub buyer_refund: Decimal,
    /// Paid to the provider(s) out of escrow.
    pub seller_compensation: Decimal,
    /// Retained by the platform out of escrow.
    pub platform_fee: Decimal,
    /// Charged to the provider on top of the escrow split.
    pub seller_penalty: Decimal,
}

impl PenaltySplit {
    /// Portion of the escrow this split distributes.
    #[must_use]
    pub fn escrow_distributed(&self) -> Decimal {
        self.buyer_refund + self.seller_compensation + self.platform_fee
    }
}

/// Cancellation metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub by: CancelledBy,
    pub at: DateTime<Utc>,
    pub reason: String,
    pub split: PenaltySplit,
    /// Blocks returned to AVAILABLE.
    pub released_blocks: u64,
}

/// Amounts held in escrow for a confirmed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowAmounts {
    pub principal: Decimal,
    pub fee: Decimal,
    pub total: Decimal,
}

/// Observable fulfillment state reported by `on_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FulfillmentState {
    AwaitingConfirmation,
    Scheduled,
    InDelivery,
    Delivered,
    Settled,
    Cancelled,
}

impl std::fmt::Display for FulfillmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingConfirmation => write!(f, "AWAITING_CONFIRMATION"),
            Self::Scheduled => write!(f, "SCHEDULED"),
            Self::InDelivery => write!(f, "IN_DELIVERY"),
            Self::Delivered => write!(f, "DELIVERED"),
            Self::Settled => write!(f, "SETTLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A buyer's claim against one or more offers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub transaction_id: TransactionId,
    pub buyer_id: UserId,
    /// Distinct providers across all line items.
    pub provider_ids: Vec<UserId>,
    pub items: Vec<OrderItem>,
    pub quote: Quote,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    /// Set once escrow has been deducted at confirmation.
    pub escrow: Option<EscrowAmounts>,
    /// Earliest delivery start across line items.
    pub delivery_start: DateTime<Utc>,
    /// Latest delivery end across line items.
    pub delivery_end: DateTime<Utc>,
    pub cancellation: Option<Cancellation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Total blocks across all line items.
    #[must_use]
    pub fn total_quantity(&self) -> u64 {
        self.items.iter().map(|item| item.quantity).sum()
    }

    /// Principal owed to each provider.
    #[must_use]
    pub fn provider_shares(&self) -> Vec<(UserId, Decimal)> {
        let mut shares: Vec<(UserId, Decimal)> = Vec::new();
        for item in &self.items {
            match shares.iter_mut().find(|(id, _)| *id == item.provider_id) {
                Some((_, amount)) => *amount += item.line_total(),
                None => shares.push((item.provider_id, item.line_total())),
            }
        }
        shares
    }

    /// Derive the fulfillment state at `now`.
    #[must_use]
    pub fn fulfillment(&self, now: DateTime<Utc>) -> FulfillmentState {
        match self.status {
            OrderStatus::Draft | OrderStatus::Pending => FulfillmentState::AwaitingConfirmation,
            OrderStatus::Active if now < self.delivery_start => FulfillmentState::Scheduled,
            OrderStatus::Active if now < self.delivery_end => FulfillmentState::InDelivery,
            OrderStatus::Active => FulfillmentState::Delivered,
            OrderStatus::Completed => FulfillmentState::Settled,
            OrderStatus::Cancelled => FulfillmentState::Cancelled,
        }
    }
}

impl std::fmt::Display for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Order[{}] {} {} units = {} {}",
            self.id, self.status, self.quote.total_quantity, self.quote.total_price, self.quote.currency,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_order(status: OrderStatus) -> Order {
        let now = Utc::now();
        let provider = UserId::new();
        let items = vec![
            OrderItem {
                item_id: ItemId::new("solar"),
                offer_id: OfferId::new(),
                provider_id: provider,
                quantity: 3,
                unit_price: Decimal::new(500, 2),
            },
            OrderItem {
                item_id: ItemId::new("solar"),
                offer_id: OfferId::new(),
                provider_id: provider,
                quantity: 2,
                unit_price: Decimal::new(400, 2),
            },
        ];
        let mut quote = Quote::empty("INR");
        for item in &items {
            quote.add_line(item.unit_price, item.quantity);
        }
        Order {
            id: OrderId::new(),
            transaction_id: TransactionId::new("txn"),
            buyer_id: UserId::new(),
            provider_ids: vec![provider],
            items,
            quote,
            status,
            payment_status: PaymentStatus::Pending,
            escrow: None,
            delivery_start: now + chrono::Duration::hours(2),
            delivery_end: now + chrono::Duration::hours(3),
            cancellation: None,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn valid_transitions() {
        assert!(OrderStatus::Draft.can_transition_to(OrderStatus::Pending));
        assert!(OrderStatus::Draft.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Active));
        assert!(OrderStatus::Active.can_transition_to(OrderStatus::Completed));
        assert!(OrderStatus::Active.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn invalid_transitions() {
        assert!(!OrderStatus::Draft.can_transition_to(OrderStatus::Active));
        assert!(!OrderStatus::Active.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Completed.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::Pending));
    }

    #[test]
    fn provider_shares_merge_lines() {
        let order = make_order(OrderStatus::Pending);
        let shares = order.provider_shares();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].1, Decimal::new(2300, 2));
        assert_eq!(order.total_quantity(), 5);
    }

    #[test]
    fn fulfillment_tracks_delivery_window() {
        let order = make_order(OrderStatus::Active);
        let now = Utc::now();
        assert_eq!(order.fulfillment(now), FulfillmentState::Scheduled);
        assert_eq!(
            order.fulfillment(now + chrono::Duration::minutes(150)),
            FulfillmentState::InDelivery
        );
        assert_eq!(
            order.fulfillment(now + chrono::Duration::hours(4)),
            FulfillmentState::Delivered
        );
        assert_eq!(
            make_order(OrderStatus::Pending).fulfillment(now),
            FulfillmentState::AwaitingConfirmation
        );
    }

    #[test]
    fn order_status_wire_format() {
        let json = serde_json::to_string(&OrderStatus::Cancelled).unwrap();
        assert_eq!(json, "\"CANCELLED\"");
        let back: OrderStatus = serde_json::from_str("\"ACTIVE\"").unwrap();
        assert_eq!(back, OrderStatus::Active);
    }
}
