//! Seam through which open settlements hold back cancellation.

use gridtrade_types::{OrderId, SettlementStatus};

/// Reports where the settlement of an order's trade stands.
pub trait SettlementGate: Send + Sync + std::fmt::Debug {
    /// Status of the settlement record keyed by `order_id`, if one exists.
    fn settlement_status(&self, order_id: OrderId) -> Option<SettlementStatus>;
}

/// No settlement engine attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSettlements;

impl SettlementGate for NoSettlements {
    fn settlement_status(&self, _order_id: OrderId) -> Option<SettlementStatus> {
        None
    }
}
