//! In-memory order table with a transaction index.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use gridtrade_types::{GridError, Order, OrderId, OrderStatus, Result, TransactionId};

/// Outcome of [`OrderStore::insert_draft`].
#[derive(Debug, Clone)]
pub enum DraftOutcome {
    Created,
    /// The transaction already has a live order.
    Existing(Box<Order>),
}

#[derive(Debug, Default)]
struct Tables {
    orders: HashMap<OrderId, Order>,
    /// Latest order per transaction.
    by_transaction: HashMap<TransactionId, OrderId>,
}

/// Order records keyed by id.
///
/// Writes to a single order are serialised by the per-order lease held in
/// the lifecycle; this table only guarantees each read or write is atomic.
#[derive(Debug, Default)]
pub struct OrderStore {
    tables: RwLock<Tables>,
}

impl OrderStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a DRAFT unless the transaction already has a live order.
    ///
    /// A transaction whose previous order was cancelled may start over.
    ///
    /// # Errors
    /// [`GridError::RequestInFlight`] if another init for the same
    /// transaction is still claiming blocks.
    pub fn insert_draft(&self, order: Order) -> Result<DraftOutcome> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = tables
            .by_transaction
            .get(&order.transaction_id)
            .and_then(|id| tables.orders.get(id))
        {
            match existing.status {
                OrderStatus::Draft => {
                    return Err(GridError::RequestInFlight {
                        key: order.transaction_id.to_string(),
                    });
                }
                OrderStatus::Pending | OrderStatus::Active | OrderStatus::Completed => {
                    return Ok(DraftOutcome::Existing(Box::new(existing.clone())));
                }
                OrderStatus::Cancelled => {}
            }
        }
        tables
            .by_transaction
            .insert(order.transaction_id.clone(), order.id);
        tables.orders.insert(order.id, order);
        Ok(DraftOutcome::Created)
    }

    pub fn get(&self, order_id: OrderId) -> Result<Order> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .orders
            .get(&order_id)
            .cloned()
            .ok_or(GridError::OrderNotFound(order_id))
    }

    #[must_use]
    pub fn contains(&self, order_id: OrderId) -> bool {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .orders
            .contains_key(&order_id)
    }

    /// Replace a stored order.
    pub fn put(&self, order: Order) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .orders
            .insert(order.id, order);
    }

    /// Latest order created for a transaction.
    #[must_use]
    pub fn by_transaction(&self, transaction_id: &TransactionId) -> Option<Order> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .by_transaction
            .get(transaction_id)
            .and_then(|id| tables.orders.get(id))
            .cloned()
    }

    #[must_use]
    pub fn with_status(&self, status: OrderStatus) -> Vec<Order> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .orders
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .orders
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
