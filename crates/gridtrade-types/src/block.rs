//! Block types: the atomic allocation unit of an offer.
//!
//! ## State Machine
//!
//! ```text
//!   ┌───────────┐  claim   ┌──────────┐  mark_sold  ┌──────┐
//!   │ AVAILABLE ├─────────▶│ RESERVED ├────────────▶│ SOLD │
//!   └───────────┘          └────┬─────┘             └──┬───┘
//!         ▲        release      │                      │
//!         └─────────────────────┴──────────────────────┘
//! ```
//!
//! The owning order id is set exactly when a block leaves AVAILABLE and
//! cleared exactly when it returns.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{BlockId, OfferId, OrderId, TransactionId, UserId};

/// Allocation state of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockStatus {
    Available,
    Reserved,
    Sold,
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "AVAILABLE"),
            Self::Reserved => write!(f, "RESERVED"),
            Self::Sold => write!(f, "SOLD"),
        }
    }
}

/// One unit of energy belonging to an offer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub offer_id: OfferId,
    pub provider_id: UserId,
    pub unit_price: Decimal,
    pub status: BlockStatus,
    pub order_id: Option<OrderId>,
    pub transaction_id: Option<TransactionId>,
    /// When the block was last reserved.
    pub reserved_at: Option<DateTime<Utc>>,
}

impl Block {
    #[must_use]
    pub fn available(offer_id: OfferId, provider_id: UserId, unit_price: Decimal) -> Self {
        Self {
            id: BlockId::new(),
            offer_id,
            provider_id,
            unit_price,
            status: BlockStatus::Available,
            order_id: None,
            transaction_id: None,
            reserved_at: None,
        }
    }

    /// AVAILABLE → RESERVED, stamping ownership. Returns `false` if the
    /// block was not available.
    pub fn reserve(
        &mut self,
        order_id: OrderId,
        transaction_id: &TransactionId,
        at: DateTime<Utc>,
    ) -> bool {
        if self.status != BlockStatus::Available {
            return false;
        }
        self.status = BlockStatus::Reserved;
        self.order_id = Some(order_id);
        self.transaction_id = Some(transaction_id.clone());
        self.reserved_at = Some(at);
        true
    }

    /// RESERVED → SOLD. Returns `false` if the block was not reserved.
    pub fn sell(&mut self) -> bool {
        if self.status != BlockStatus::Reserved {
            return false;
        }
        self.status = BlockStatus::Sold;
        true
    }

    /// Back to AVAILABLE, clearing ownership. Returns `false` if already available.
    pub fn release(&mut self) -> bool {
        if self.status == BlockStatus::Available {
            return false;
        }
        self.status = BlockStatus::Available;
        self.order_id = None;
        self.transaction_id = None;
        self.reserved_at = None;
        true
    }
}

/// Per-status block counts for one offer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub total: u64,
    pub available: u64,
    pub reserved: u64,
    pub sold: u64,
}

impl BlockStats {
    /// Blocks that have left AVAILABLE. Never exceeds `total`.
    #[must_use]
    pub fn committed(&self) -> u64 {
        self.reserved + self.sold
    }

    pub fn record(&mut self, status: BlockStatus) {
        self.total += 1;
        match status {
            BlockStatus::Available => self.available += 1,
            BlockStatus::Reserved => self.reserved += 1,
            BlockStatus::Sold => self.sold += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Block {
        Block::available(OfferId::new(), UserId::new(), Decimal::ONE)
    }

    #[test]
    fn reserve_stamps_ownership() {
        let mut b = block();
        let order = OrderId::new();
        assert!(b.reserve(order, &TransactionId::new("t"), Utc::now()));
        assert_eq!(b.status, BlockStatus::Reserved);
        assert_eq!(b.order_id, Some(order));
        assert!(!b.reserve(OrderId::new(), &TransactionId::new("t2"), Utc::now()));
        assert_eq!(b.order_id, Some(order));
    }

    #[test]
    fn sell_requires_reservation() {
        let mut b = block();
        assert!(!b.sell());
        b.reserve(OrderId::new(), &TransactionId::new("t"), Utc::now());
        assert!(b.sell());
        assert!(!b.sell());
        assert_eq!(b.status, BlockStatus::Sold);
    }

    #[test]
    fn release_clears_ownership() {
        let mut b = block();
        assert!(!b.release());
        b.reserve(OrderId::new(), &TransactionId::new("t"), Utc::now());
        assert!(b.release());
        assert_eq!(b.status, BlockStatus::Available);
        assert!(b.order_id.is_none());
        assert!(b.transaction_id.is_none());
    }

    #[test]
    fn stats_committed() {
        let mut stats = BlockStats::default();
        stats.record(BlockStatus::Available);
        stats.record(BlockStatus::Reserved);
        stats.record(BlockStatus::Sold);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.committed(), 2);
    }
}
