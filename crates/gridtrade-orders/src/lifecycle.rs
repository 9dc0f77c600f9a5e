//! Order state transitions.
//!
//! ## State Machine
//!
//! ```text
//!   init:     (new) ─▶ DRAFT ──all items claimed──▶ PENDING
//!                        └────any item short─────▶ CANCELLED (system, blocks released)
//!   confirm:  PENDING ─▶ ACTIVE      (blocks SOLD, escrow held)
//!   cancel:   PENDING | ACTIVE ─▶ CANCELLED (blocks released, penalty split)
//!   complete: ACTIVE ─▶ COMPLETED    (after settlement release)
//! ```
//!
//! Confirm, cancel and complete each re-read the order under the per-order
//! lease and return the current order unchanged when the transition already
//! happened, so duplicates and lost races are harmless.
//!
//! Cancellation is refused while the order's escrow is committed to a
//! settlement (`begin_settlement` up to RELEASED or REFUNDED), so the
//! settlement payout and the cancellation split never both spend it.
//!
//! Escrow bookkeeping never undoes a confirmed order: once blocks are SOLD
//! the inventory commitment stands, and a failed escrow hold is logged for
//! manual recovery.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use gridtrade_guard::{LockKey, LockManager};
use gridtrade_ledger::{AccountLedger, BlockLedger};
use gridtrade_types::{
    Cancellation, CancellationPolicy, CancelledBy, Clock, EscrowAmounts, FeeSchedule, GridError,
    InitItem, MarketplaceConfig, OfferId, Order, OrderId, OrderItem, OrderStatus, PaymentStatus,
    Quote, Result, TradeId, TransactionId, UserId,
};
use tracing::{debug, error, info, warn};

use crate::catalog::CatalogPublisher;
use crate::policy::{allocate_pro_rata, penalty_split};
use crate::settlement_gate::{NoSettlements, SettlementGate};
use crate::store::{DraftOutcome, OrderStore};
use crate::trust::TrustRegistry;

/// Reason recorded when reservation falls short.
const INSUFFICIENT_INVENTORY_REASON: &str = "insufficient inventory";
/// Reason recorded when a PENDING order outlives its TTL.
const PENDING_EXPIRED_REASON: &str = "pending order expired";

/// Owns order records and drives every order transition.
#[derive(Debug)]
pub struct OrderLifecycle {
    store: OrderStore,
    blocks: Arc<BlockLedger>,
    accounts: Arc<AccountLedger>,
    locks: LockManager,
    publisher: Arc<dyn CatalogPublisher>,
    settlements: Arc<dyn SettlementGate>,
    /// Orders handed to settlement whose record may not exist yet.
    settling: Mutex<HashSet<OrderId>>,
    trust: TrustRegistry,
    fees: FeeSchedule,
    policy: CancellationPolicy,
    pending_ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl OrderLifecycle {
    #[must_use]
    pub fn new(
        config: &MarketplaceConfig,
        blocks: Arc<BlockLedger>,
        accounts: Arc<AccountLedger>,
        locks: LockManager,
        publisher: Arc<dyn CatalogPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store: OrderStore::new(),
            blocks,
            accounts,
            locks,
            publisher,
            settlements: Arc::new(NoSettlements),
            settling: Mutex::new(HashSet::new()),
            trust: TrustRegistry::new(),
            fees: config.fees.clone(),
            policy: config.cancellation.clone(),
            pending_ttl: config.orders.pending_ttl(),
            clock,
        }
    }

    /// Consult `gate` before cancelling an order.
    #[must_use]
    pub fn with_settlement_gate(mut self, gate: Arc<dyn SettlementGate>) -> Self {
        self.settlements = gate;
        self
    }

    fn settling(&self) -> MutexGuard<'_, HashSet<OrderId>> {
        self.settling.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn trust(&self) -> &TrustRegistry {
        &self.trust
    }

    pub fn get(&self, order_id: OrderId) -> Result<Order> {
        self.store.get(order_id)
    }

    #[must_use]
    pub fn find_by_transaction(&self, transaction_id: &TransactionId) -> Option<Order> {
        self.store.by_transaction(transaction_id)
    }

    /// Re-publish live availability for `offer_ids`. Failures are logged only.
    fn publish(&self, offer_ids: impl IntoIterator<Item = OfferId>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime, skipping catalog publish");
            return;
        };
        for offer_id in offer_ids {
            let available = match self.blocks.available_count(offer_id) {
                Ok(available) => available,
                Err(err) => {
                    warn!(offer_id = %offer_id, error = %err, "Cannot read availability to publish");
                    continue;
                }
            };
            let publisher = Arc::clone(&self.publisher);
            runtime.spawn(async move {
                if let Err(err) = publisher.publish_availability(offer_id, available).await {
                    warn!(offer_id = %offer_id, available, error = %err, "Catalog publish failed");
                }
            });
        }
    }

    fn offer_ids(order: &Order) -> BTreeSet<OfferId> {
        order.items.iter().map(|item| item.offer_id).collect()
    }

    // -----------------------------------------------------------------
    // init
    // -----------------------------------------------------------------

    /// Build a DRAFT order from the requested items without claiming anything.
    fn draft(
        &self,
        transaction_id: &TransactionId,
        buyer_id: UserId,
        provider_id: Option<UserId>,
        items: &[InitItem],
    ) -> Result<Order> {
        if items.is_empty() {
            return Err(GridError::InvalidRequest {
                reason: "init requires at least one item".into(),
            });
        }
        let mut lines = Vec::with_capacity(items.len());
        let mut currency: Option<String> = None;
        let mut window: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
        for item in items {
            if item.quantity == 0 {
                return Err(GridError::InvalidRequest {
                    reason: format!("quantity for offer {} must be positive", item.offer_id),
                });
            }
            let offer = self.blocks.offer(item.offer_id)?;
            if let Some(expected) = provider_id {
                if offer.provider_id != expected {
                    return Err(GridError::InvalidRequest {
                        reason: format!("offer {} does not belong to provider {expected}", offer.id),
                    });
                }
            }
            match &currency {
                Some(c) if *c != offer.currency => {
                    return Err(GridError::InvalidRequest {
                        reason: format!("offer {} is priced in {}, not {c}", offer.id, offer.currency),
                    });
                }
                Some(_) => {}
                None => currency = Some(offer.currency.clone()),
            }
            window = Some(match window {
                Some((start, end)) => (start.min(offer.window.start), end.max(offer.window.end)),
                None => (offer.window.start, offer.window.end),
            });
            lines.push(OrderItem {
                item_id: offer.item_id.clone(),
                offer_id: offer.id,
                provider_id: offer.provider_id,
                quantity: item.quantity,
                unit_price: offer.unit_price,
            });
        }

        let mut quote = Quote::empty(currency.unwrap_or_default());
        for line in &lines {
            quote.add_line(line.unit_price, line.quantity);
        }
        let mut provider_ids: Vec<UserId> = Vec::new();
        for line in &lines {
            if !provider_ids.contains(&line.provider_id) {
                provider_ids.push(line.provider_id);
            }
        }
        let (delivery_start, delivery_end) = window.unwrap_or_default();
        let now = self.clock.now();
        Ok(Order {
            id: OrderId::new(),
            transaction_id: transaction_id.clone(),
            buyer_id,
            provider_ids,
            items: lines,
            quote,
            status: OrderStatus::Draft,
            payment_status: PaymentStatus::Pending,
            escrow: None,
            delivery_start,
            delivery_end,
            cancellation: None,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
            completed_at: None,
        })
    }

    /// Create an order and reserve blocks for every item, all or nothing.
    ///
    /// A repeated init for a transaction that already has a live order
    /// returns that order without claiming again.
    ///
    /// # Errors
    /// Validation errors for unknown offers or bad items;
    /// [`GridError::InsufficientInventory`] naming the first item that fell
    /// short, after every block claimed for the order was released.
    pub fn init(
        &self,
        transaction_id: &TransactionId,
        buyer_id: UserId,
        provider_id: Option<UserId>,
        items: &[InitItem],
    ) -> Result<Order> {
        let mut order = self.draft(transaction_id, buyer_id, provider_id, items)?;
        if let DraftOutcome::Existing(existing) = self.store.insert_draft(order.clone())? {
            debug!(
                transaction_id = %transaction_id,
                order_id = %existing.id,
                "Init replayed for existing order"
            );
            return Ok(*existing);
        }

        for item in &order.items {
            let shortfall = match self.blocks.claim(item.offer_id, item.quantity, order.id, transaction_id) {
                Ok(claimed) if claimed.len() as u64 == item.quantity => None,
                Ok(claimed) => Some(GridError::InsufficientInventory {
                    offer_id: item.offer_id,
                    requested: item.quantity,
                    available: claimed.len() as u64,
                }),
                Err(err) => Some(err),
            };
            if let Some(err) = shortfall {
                let released = self.blocks.release_by_order(order.id);
                let now = self.clock.now();
                order.status = OrderStatus::Cancelled;
                order.updated_at = now;
                order.cancellation = Some(Cancellation {
                    by: CancelledBy::System,
                    at: now,
                    reason: INSUFFICIENT_INVENTORY_REASON.to_string(),
                    split: Default::default(),
                    released_blocks: released,
                });
                let touched = Self::offer_ids(&order);
                self.store.put(order);
                warn!(transaction_id = %transaction_id, released, error = %err, "Init failed, reservation rolled back");
                self.publish(touched);
                return Err(err);
            }
        }

        order.status = OrderStatus::Pending;
        order.updated_at = self.clock.now();
        self.store.put(order.clone());
        info!(
            order_id = %order.id,
            transaction_id = %transaction_id,
            units = order.total_quantity(),
            total = %order.quote.total_price,
            "Order reserved"
        );
        self.publish(Self::offer_ids(&order));
        Ok(order)
    }

    // -----------------------------------------------------------------
    // confirm
    // -----------------------------------------------------------------

    /// PENDING → ACTIVE: sell the reserved blocks and hold escrow.
    ///
    /// Idempotent: an ACTIVE or COMPLETED order is returned unchanged.
    pub async fn confirm(&self, order_id: OrderId) -> Result<Order> {
        self.locks
            .with_lock(&LockKey::order(order_id), || async { self.confirm_locked(order_id) })
            .await
    }

    fn confirm_locked(&self, order_id: OrderId) -> Result<Order> {
        let mut order = self.store.get(order_id)?;
        match order.status {
            OrderStatus::Active | OrderStatus::Completed => {
                debug!(order_id = %order_id, status = %order.status, "Confirm replayed");
                return Ok(order);
            }
            OrderStatus::Pending => {}
            from => {
                return Err(GridError::InvalidOrderTransition {
                    order_id,
                    from,
                    to: OrderStatus::Active,
                });
            }
        }

        let now = self.clock.now();
        order.status = OrderStatus::Active;
        order.confirmed_at = Some(now);
        order.updated_at = now;
        let sold = self.blocks.mark_sold(order_id);

        let principal = order.quote.total_price;
        let fee = self.fees.fee_for(principal);
        let escrow = EscrowAmounts {
            principal,
            fee,
            total: principal + fee,
        };
        match self.accounts.hold_escrow(
            order.buyer_id,
            &order.quote.currency,
            escrow.total,
            &order_id.to_string(),
        ) {
            Ok(()) => {
                order.payment_status = PaymentStatus::Escrowed;
                order.escrow = Some(escrow);
            }
            Err(err) => {
                error!(
                    order_id = %order_id,
                    buyer = %order.buyer_id,
                    amount = %escrow.total,
                    error = %err,
                    "Escrow hold failed after confirmation; needs manual reconciliation"
                );
            }
        }

        self.store.put(order.clone());
        info!(order_id = %order_id, sold, payment = %order.payment_status, "Order confirmed");
        self.publish(Self::offer_ids(&order));
        Ok(order)
    }

    // -----------------------------------------------------------------
    // cancel
    // -----------------------------------------------------------------

    /// PENDING | ACTIVE → CANCELLED: release blocks, split escrow, adjust trust.
    ///
    /// Idempotent: an already CANCELLED order is returned unchanged.
    /// Buyer and provider cancellations are refused inside the delivery
    /// buffer; system cancellations are not.
    ///
    /// # Errors
    /// [`GridError::OrderNotCancellable`] for DRAFT or COMPLETED orders,
    /// [`GridError::TooCloseToDelivery`] inside the buffer.
    pub async fn cancel(&self, order_id: OrderId, by: CancelledBy, reason: &str) -> Result<Order> {
        self.locks
            .with_lock(&LockKey::order(order_id), || async {
                self.cancel_locked(order_id, by, reason)
            })
            .await
    }

    fn cancel_locked(&self, order_id: OrderId, by: CancelledBy, reason: &str) -> Result<Order> {
        let mut order = self.store.get(order_id)?;
        match order.status {
            OrderStatus::Cancelled => {
                debug!(order_id = %order_id, "Cancel replayed");
                return Ok(order);
            }
            OrderStatus::Pending | OrderStatus::Active => {}
            status => return Err(GridError::OrderNotCancellable { order_id, status }),
        }

        self.ensure_not_settling(&order)?;

        let now = self.clock.now();
        if by != CancelledBy::System {
            let starts_in = order.delivery_start - now;
            if starts_in < self.policy.buffer() {
                return Err(GridError::TooCloseToDelivery {
                    order_id,
                    starts_in_minutes: starts_in.num_minutes(),
                    buffer_minutes: self.policy.buffer_minutes,
                });
            }
        }

        let released = self.blocks.release_by_order(order_id);
        let escrowed = (order.payment_status == PaymentStatus::Escrowed)
            .then_some(order.escrow.as_ref())
            .flatten();
        let split = penalty_split(&self.policy, by, escrowed);
        if escrowed.is_some() {
            self.settle_split(&order, &split);
            order.payment_status = PaymentStatus::Refunded;
        }
        self.adjust_trust(&order, by);

        order.status = OrderStatus::Cancelled;
        order.updated_at = now;
        order.cancellation = Some(Cancellation {
            by,
            at: now,
            reason: reason.to_string(),
            split,
            released_blocks: released,
        });
        self.store.put(order.clone());
        info!(order_id = %order_id, by = %by, released, reason, "Order cancelled");
        self.publish(Self::offer_ids(&order));
        Ok(order)
    }

    fn ensure_not_settling(&self, order: &Order) -> Result<()> {
        let open = match self.settlements.settlement_status(order.id) {
            Some(status) => !status.is_paid_out(),
            None => self.settling().contains(&order.id),
        };
        if open {
            return Err(GridError::SettlementInProgress {
                order_id: order.id,
                trade_id: TradeId::from(order.id),
            });
        }
        Ok(())
    }

    /// Move the escrow per `split`. Ledger failures are logged, never raised.
    fn settle_split(&self, order: &Order, split: &gridtrade_types::PenaltySplit) {
        let reference = order.id.to_string();
        let currency = &order.quote.currency;
        let shares = order.provider_shares();
        let compensation = allocate_pro_rata(split.seller_compensation, &shares);
        if let Err(err) = self.accounts.split_escrow(
            order.buyer_id,
            currency,
            split.buyer_refund,
            &compensation,
            split.platform_fee,
            &reference,
        ) {
            error!(order_id = %order.id, error = %err, "Escrow split failed; needs manual reconciliation");
        }
        for penalty in allocate_pro_rata(split.seller_penalty, &shares) {
            if let Err(err) = self
                .accounts
                .debit_penalty(penalty.account, currency, penalty.amount, &reference)
            {
                warn!(
                    order_id = %order.id,
                    provider = %penalty.account,
                    amount = %penalty.amount,
                    error = %err,
                    "Provider penalty not collected"
                );
            }
        }
    }

    fn adjust_trust(&self, order: &Order, by: CancelledBy) {
        match by {
            CancelledBy::Buyer => {
                self.trust.penalize(
                    order.buyer_id,
                    order.total_quantity(),
                    self.policy.buyer.trust_penalty_per_unit,
                );
            }
            CancelledBy::Provider => {
                for provider in &order.provider_ids {
                    let units = order
                        .items
                        .iter()
                        .filter(|item| item.provider_id == *provider)
                        .map(|item| item.quantity)
                        .sum();
                    self.trust
                        .penalize(*provider, units, self.policy.provider.trust_penalty_per_unit);
                }
            }
            CancelledBy::System => {}
        }
    }

    // -----------------------------------------------------------------
    // settlement follow-ups
    // -----------------------------------------------------------------

    /// Commit an ACTIVE, escrowed order to settlement. From here until the
    /// settlement pays out the order cannot be cancelled.
    ///
    /// # Errors
    /// [`GridError::InvalidRequest`] unless the order is ACTIVE with its
    /// escrow held.
    pub async fn begin_settlement(&self, order_id: OrderId) -> Result<Order> {
        self.locks
            .with_lock(&LockKey::order(order_id), || async {
                let order = self.store.get(order_id)?;
                if order.status != OrderStatus::Active {
                    return Err(GridError::InvalidRequest {
                        reason: format!("order {order_id} is {}, settlement needs ACTIVE", order.status),
                    });
                }
                if order.payment_status != PaymentStatus::Escrowed {
                    return Err(GridError::InvalidRequest {
                        reason: format!(
                            "order {order_id} payment is {}, settlement needs ESCROWED",
                            order.payment_status
                        ),
                    });
                }
                self.settling().insert(order_id);
                Ok(order)
            })
            .await
    }

    /// Drop the settlement commitment after opening the record failed.
    pub fn abandon_settlement(&self, order_id: OrderId) {
        self.settling().remove(&order_id);
    }

    /// ACTIVE → COMPLETED once settlement released the funds. Idempotent.
    pub async fn complete(&self, order_id: OrderId) -> Result<Order> {
        self.locks
            .with_lock(&LockKey::order(order_id), || async {
                let mut order = self.store.get(order_id)?;
                match order.status {
                    OrderStatus::Completed => return Ok(order),
                    OrderStatus::Active => {}
                    from => {
                        return Err(GridError::InvalidOrderTransition {
                            order_id,
                            from,
                            to: OrderStatus::Completed,
                        });
                    }
                }
                let now = self.clock.now();
                order.status = OrderStatus::Completed;
                order.completed_at = Some(now);
                order.updated_at = now;
                self.store.put(order.clone());
                self.settling().remove(&order_id);
                self.blocks.retire_order(order_id);
                info!(order_id = %order_id, "Order completed");
                Ok(order)
            })
            .await
    }

    /// Record that settlement refunded the buyer. Idempotent.
    pub async fn mark_refunded(&self, order_id: OrderId) -> Result<Order> {
        self.locks
            .with_lock(&LockKey::order(order_id), || async {
                let mut order = self.store.get(order_id)?;
                self.settling().remove(&order_id);
                if order.payment_status != PaymentStatus::Refunded {
                    order.payment_status = PaymentStatus::Refunded;
                    order.updated_at = self.clock.now();
                    self.store.put(order.clone());
                    info!(order_id = %order_id, "Order payment refunded");
                }
                Ok(order)
            })
            .await
    }

    // -----------------------------------------------------------------
    // reconciliation
    // -----------------------------------------------------------------

    /// Cancel PENDING orders older than the pending TTL. Returns the expired ids.
    pub async fn expire_stale_pending(&self, now: DateTime<Utc>) -> Vec<OrderId> {
        let cutoff = now - self.pending_ttl;
        let mut expired = Vec::new();
        for order in self.store.with_status(OrderStatus::Pending) {
            if order.created_at > cutoff {
                continue;
            }
            match self.cancel(order.id, CancelledBy::System, PENDING_EXPIRED_REASON).await {
                Ok(cancelled) if cancelled.status == OrderStatus::Cancelled => expired.push(order.id),
                Ok(_) => {}
                Err(err) => warn!(order_id = %order.id, error = %err, "Could not expire pending order"),
            }
        }
        expired
    }

    /// Release reservations older than `cutoff` whose order is gone or no
    /// longer holds inventory. Returns the number of blocks released.
    pub fn release_orphaned_blocks(&self, cutoff: DateTime<Utc>) -> u64 {
        let mut released = 0;
        for order_id in self.blocks.reserved_orders_before(cutoff) {
            let orphaned = match self.store.get(order_id) {
                Ok(order) => !matches!(order.status, OrderStatus::Pending | OrderStatus::Active),
                Err(_) => true,
            };
            if orphaned {
                let count = self.blocks.release_by_order(order_id);
                if count > 0 {
                    warn!(order_id = %order_id, count, "Released orphaned reservation");
                }
                released += count;
            }
        }
        released
    }
}
