//! Block ledger: atomic claim / release / mark-sold over offer inventory.
//!
//! Every registered offer owns exactly `total_units` blocks, created once at
//! registration. All mutations of one offer's blocks happen under that
//! offer's mutex, which makes each claim a single indivisible
//! read-check-write: two concurrent claimants can never jointly reserve more
//! blocks than were AVAILABLE when the later one began.
//!
//! Secondary indexes (order → offers, transaction → offers) are written
//! before a claim touches any block, so a release by order or transaction
//! always finds every offer the key may own blocks in. The index locks and
//! the offer locks are never held at the same time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use gridtrade_types::{
    Block, BlockId, BlockStats, BlockStatus, Clock, GridError, Offer, OfferId, OfferStatus,
    OrderId, Result, TransactionId,
};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct OfferInventory {
    offer: Offer,
    blocks: Vec<Block>,
}

impl OfferInventory {
    fn available(&self) -> u64 {
        self.count(BlockStatus::Available)
    }

    fn count(&self, status: BlockStatus) -> u64 {
        self.blocks.iter().filter(|b| b.status == status).count() as u64
    }

    fn stats(&self) -> BlockStats {
        let mut stats = BlockStats::default();
        for block in &self.blocks {
            stats.record(block.status);
        }
        stats
    }

    fn ensure_claimable(&self, quantity: u64) -> Result<()> {
        if quantity == 0 {
            return Err(GridError::InvalidRequest {
                reason: "claim quantity must be positive".into(),
            });
        }
        if self.offer.status == OfferStatus::Withdrawn {
            return Err(GridError::OfferWithdrawn(self.offer.id));
        }
        Ok(())
    }

    fn reserve_up_to(
        &mut self,
        quantity: u64,
        order_id: OrderId,
        transaction_id: &TransactionId,
        at: DateTime<Utc>,
    ) -> Vec<BlockId> {
        let mut claimed = Vec::new();
        for block in &mut self.blocks {
            if claimed.len() as u64 == quantity {
                break;
            }
            if block.reserve(order_id, transaction_id, at) {
                claimed.push(block.id);
            }
        }
        claimed
    }
}

type Inventory = Arc<Mutex<OfferInventory>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Atomic block inventory for all offers.
#[derive(Debug)]
pub struct BlockLedger {
    offers: RwLock<HashMap<OfferId, Inventory>>,
    by_order: Mutex<HashMap<OrderId, HashSet<OfferId>>>,
    by_transaction: Mutex<HashMap<TransactionId, HashSet<OfferId>>>,
    clock: Arc<dyn Clock>,
}

impl BlockLedger {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            offers: RwLock::new(HashMap::new()),
            by_order: Mutex::new(HashMap::new()),
            by_transaction: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn inventory(&self, offer_id: OfferId) -> Result<Inventory> {
        self.offers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&offer_id)
            .cloned()
            .ok_or(GridError::OfferNotFound(offer_id))
    }

    fn offers_indexed_by<K: std::hash::Hash + Eq>(
        index: &Mutex<HashMap<K, HashSet<OfferId>>>,
        key: &K,
    ) -> Vec<OfferId> {
        lock(index)
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn inventories(&self, offer_ids: &[OfferId]) -> Vec<Inventory> {
        let offers = self.offers.read().unwrap_or_else(PoisonError::into_inner);
        offer_ids
            .iter()
            .filter_map(|id| offers.get(id).cloned())
            .collect()
    }

    fn all_inventories(&self) -> Vec<Inventory> {
        self.offers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------
    // Offers
    // -----------------------------------------------------------------

    /// Register an offer and create its fixed block set.
    ///
    /// # Errors
    /// [`GridError::DuplicateOffer`] if the id is already registered,
    /// [`GridError::InvalidRequest`] for an offer with no units.
    pub fn register_offer(&self, offer: Offer) -> Result<()> {
        if offer.total_units == 0 {
            return Err(GridError::InvalidRequest {
                reason: "offer must have at least one unit".into(),
            });
        }
        let mut offers = self.offers.write().unwrap_or_else(PoisonError::into_inner);
        if offers.contains_key(&offer.id) {
            return Err(GridError::DuplicateOffer(offer.id));
        }
        let blocks = (0..offer.total_units)
            .map(|_| Block::available(offer.id, offer.provider_id, offer.unit_price))
            .collect();
        info!(
            offer_id = %offer.id,
            provider_id = %offer.provider_id,
            units = offer.total_units,
            "Offer registered"
        );
        offers.insert(offer.id, Arc::new(Mutex::new(OfferInventory { offer, blocks })));
        Ok(())
    }

    /// Unpublish an offer. New claims are rejected; held blocks stay held.
    pub fn withdraw_offer(&self, offer_id: OfferId) -> Result<Offer> {
        let inventory = self.inventory(offer_id)?;
        let mut inv = lock(&inventory);
        if inv.offer.status != OfferStatus::Withdrawn {
            inv.offer.status = OfferStatus::Withdrawn;
            info!(offer_id = %offer_id, "Offer withdrawn");
        }
        Ok(inv.offer.clone())
    }

    pub fn offer(&self, offer_id: OfferId) -> Result<Offer> {
        let inventory = self.inventory(offer_id)?;
        let offer = lock(&inventory).offer.clone();
        Ok(offer)
    }

    /// All registered offers.
    #[must_use]
    pub fn offers(&self) -> Vec<Offer> {
        self.all_inventories()
            .iter()
            .map(|inv| lock(inv).offer.clone())
            .collect()
    }

    // -----------------------------------------------------------------
    // Claims
    // -----------------------------------------------------------------

    fn index_claim(&self, offer_id: OfferId, order_id: OrderId, transaction_id: &TransactionId) {
        lock(&self.by_order).entry(order_id).or_default().insert(offer_id);
        lock(&self.by_transaction)
            .entry(transaction_id.clone())
            .or_default()
            .insert(offer_id);
    }

    /// Reserve up to `quantity` AVAILABLE blocks of `offer_id` for an order.
    ///
    /// Returns the blocks actually reserved, which may be fewer than
    /// requested. Callers that need all of them must compare the length
    /// and release on a shortfall.
    ///
    /// # Errors
    /// Unknown or withdrawn offer, or a zero quantity.
    pub fn claim(
        &self,
        offer_id: OfferId,
        quantity: u64,
        order_id: OrderId,
        transaction_id: &TransactionId,
    ) -> Result<Vec<BlockId>> {
        let inventory = self.inventory(offer_id)?;
        lock(&inventory).ensure_claimable(quantity)?;
        self.index_claim(offer_id, order_id, transaction_id);

        let now = self.clock.now();
        let mut inv = lock(&inventory);
        inv.ensure_claimable(quantity)?;
        let claimed = inv.reserve_up_to(quantity, order_id, transaction_id, now);
        let remaining = inv.available();
        drop(inv);

        if (claimed.len() as u64) < quantity {
            warn!(
                offer_id = %offer_id,
                order_id = %order_id,
                requested = quantity,
                claimed = claimed.len(),
                "Partial block claim"
            );
        } else {
            debug!(
                offer_id = %offer_id,
                order_id = %order_id,
                claimed = claimed.len(),
                remaining,
                "Blocks reserved"
            );
        }
        Ok(claimed)
    }

    /// Reserve exactly `quantity` blocks or none at all.
    ///
    /// # Errors
    /// [`GridError::InsufficientInventory`] with the live availability when
    /// fewer than `quantity` blocks are AVAILABLE.
    pub fn claim_exact(
        &self,
        offer_id: OfferId,
        quantity: u64,
        order_id: OrderId,
        transaction_id: &TransactionId,
    ) -> Result<Vec<BlockId>> {
        let inventory = self.inventory(offer_id)?;
        lock(&inventory).ensure_claimable(quantity)?;
        self.index_claim(offer_id, order_id, transaction_id);

        let now = self.clock.now();
        let mut inv = lock(&inventory);
        inv.ensure_claimable(quantity)?;
        let available = inv.available();
        if available < quantity {
            return Err(GridError::InsufficientInventory {
                offer_id,
                requested: quantity,
                available,
            });
        }
        let claimed = inv.reserve_up_to(quantity, order_id, transaction_id, now);
        debug!(offer_id = %offer_id, order_id = %order_id, claimed = claimed.len(), "Blocks reserved");
        Ok(claimed)
    }

    // -----------------------------------------------------------------
    // Release / sale
    // -----------------------------------------------------------------

    /// Return every block owned by `transaction_id` to AVAILABLE. Idempotent.
    pub fn release(&self, transaction_id: &TransactionId) -> u64 {
        let offer_ids = Self::offers_indexed_by(&self.by_transaction, transaction_id);
        let mut released = 0;
        let mut orders = HashSet::new();
        for inventory in self.inventories(&offer_ids) {
            let mut inv = lock(&inventory);
            for block in &mut inv.blocks {
                if block.transaction_id.as_ref() != Some(transaction_id) {
                    continue;
                }
                let owner = block.order_id;
                if block.release() {
                    released += 1;
                    orders.extend(owner);
                }
            }
        }
        lock(&self.by_transaction).remove(transaction_id);
        let mut by_order = lock(&self.by_order);
        for order_id in &orders {
            by_order.remove(order_id);
        }
        drop(by_order);
        if released > 0 {
            info!(transaction_id = %transaction_id, released, "Blocks released by transaction");
        }
        released
    }

    /// Return every block owned by `order_id` to AVAILABLE. Idempotent.
    pub fn release_by_order(&self, order_id: OrderId) -> u64 {
        let offer_ids = Self::offers_indexed_by(&self.by_order, &order_id);
        let mut released = 0;
        let mut transactions = HashSet::new();
        for inventory in self.inventories(&offer_ids) {
            let mut inv = lock(&inventory);
            for block in &mut inv.blocks {
                if block.order_id != Some(order_id) {
                    continue;
                }
                let transaction = block.transaction_id.clone();
                if block.release() {
                    released += 1;
                    transactions.extend(transaction);
                }
            }
        }
        lock(&self.by_order).remove(&order_id);
        self.forget_transactions(&transactions);
        if released > 0 {
            info!(order_id = %order_id, released, "Blocks released by order");
        }
        released
    }

    /// Move every RESERVED block owned by `order_id` to SOLD. Idempotent.
    pub fn mark_sold(&self, order_id: OrderId) -> u64 {
        let offer_ids = Self::offers_indexed_by(&self.by_order, &order_id);
        let mut sold = 0;
        for inventory in self.inventories(&offer_ids) {
            let mut inv = lock(&inventory);
            for block in &mut inv.blocks {
                if block.order_id == Some(order_id) && block.sell() {
                    sold += 1;
                }
            }
        }
        if sold > 0 {
            info!(order_id = %order_id, sold, "Blocks marked sold");
        }
        sold
    }

    /// Drop the index entries of an order whose blocks stay SOLD for good.
    /// The blocks keep their owner; only the lookups by order and
    /// transaction go away.
    pub fn retire_order(&self, order_id: OrderId) {
        let transactions: HashSet<TransactionId> = self
            .blocks_for_order(order_id)
            .into_iter()
            .filter_map(|block| block.transaction_id)
            .collect();
        lock(&self.by_order).remove(&order_id);
        self.forget_transactions(&transactions);
        debug!(order_id = %order_id, "Order retired from block indexes");
    }

    fn forget_transactions(&self, transactions: &HashSet<TransactionId>) {
        if transactions.is_empty() {
            return;
        }
        let mut by_transaction = lock(&self.by_transaction);
        for transaction_id in transactions {
            by_transaction.remove(transaction_id);
        }
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    pub fn available_count(&self, offer_id: OfferId) -> Result<u64> {
        let inventory = self.inventory(offer_id)?;
        let available = lock(&inventory).available();
        Ok(available)
    }

    pub fn stats(&self, offer_id: OfferId) -> Result<BlockStats> {
        let inventory = self.inventory(offer_id)?;
        let stats = lock(&inventory).stats();
        Ok(stats)
    }

    /// Snapshot of the blocks an order currently owns. Retired orders own none.
    #[must_use]
    pub fn blocks_for_order(&self, order_id: OrderId) -> Vec<Block> {
        let offer_ids = Self::offers_indexed_by(&self.by_order, &order_id);
        self.inventories(&offer_ids)
            .iter()
            .flat_map(|inventory| {
                lock(inventory)
                    .blocks
                    .iter()
                    .filter(|b| b.order_id == Some(order_id))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Orders holding RESERVED blocks that were reserved before `cutoff`.
    #[must_use]
    pub fn reserved_orders_before(&self, cutoff: DateTime<Utc>) -> Vec<OrderId> {
        let mut orders = HashSet::new();
        for inventory in self.all_inventories() {
            let inv = lock(&inventory);
            orders.extend(inv.blocks.iter().filter_map(|b| match (b.status, b.reserved_at) {
                (BlockStatus::Reserved, Some(at)) if at < cutoff => b.order_id,
                _ => None,
            }));
        }
        orders.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridtrade_types::{ManualClock, SystemClock, UserId};

    fn ledger_with_offer(units: u64) -> (BlockLedger, OfferId) {
        let ledger = BlockLedger::new(Arc::new(SystemClock));
        let offer = Offer::dummy(UserId::new(), units, chrono::Duration::hours(2));
        let id = offer.id;
        ledger.register_offer(offer).unwrap();
        (ledger, id)
    }

    fn txn(id: &str) -> TransactionId {
        TransactionId::new(id)
    }

    #[test]
    fn register_creates_fixed_block_set() {
        let (ledger, offer_id) = ledger_with_offer(10);
        let stats = ledger.stats(offer_id).unwrap();
        assert_eq!(stats.total, 10);
        assert_eq!(stats.available, 10);
        assert_eq!(ledger.available_count(offer_id).unwrap(), 10);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let ledger = BlockLedger::new(Arc::new(SystemClock));
        let offer = Offer::dummy(UserId::new(), 3, chrono::Duration::hours(2));
        ledger.register_offer(offer.clone()).unwrap();
        let err = ledger.register_offer(offer).unwrap_err();
        assert!(matches!(err, GridError::DuplicateOffer(_)));
    }

    #[test]
    fn claim_reserves_and_stamps_owner() {
        let (ledger, offer_id) = ledger_with_offer(10);
        let order = OrderId::new();
        let claimed = ledger.claim(offer_id, 4, order, &txn("t1")).unwrap();
        assert_eq!(claimed.len(), 4);
        assert_eq!(ledger.available_count(offer_id).unwrap(), 6);
        let owned = ledger.blocks_for_order(order);
        assert_eq!(owned.len(), 4);
        assert!(owned.iter().all(|b| b.status == BlockStatus::Reserved));
    }

    #[test]
    fn partial_claim_returns_what_exists() {
        let (ledger, offer_id) = ledger_with_offer(5);
        let claimed = ledger.claim(offer_id, 8, OrderId::new(), &txn("t1")).unwrap();
        assert_eq!(claimed.len(), 5);
        let again = ledger.claim(offer_id, 1, OrderId::new(), &txn("t2")).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn claim_exact_is_all_or_nothing() {
        let (ledger, offer_id) = ledger_with_offer(5);
        ledger.claim_exact(offer_id, 3, OrderId::new(), &txn("t1")).unwrap();
        let err = ledger
            .claim_exact(offer_id, 3, OrderId::new(), &txn("t2"))
            .unwrap_err();
        assert!(matches!(
            err,
            GridError::InsufficientInventory { requested: 3, available: 2, .. }
        ));
        assert_eq!(ledger.available_count(offer_id).unwrap(), 2);
    }

    #[test]
    fn zero_quantity_rejected() {
        let (ledger, offer_id) = ledger_with_offer(5);
        let err = ledger.claim(offer_id, 0, OrderId::new(), &txn("t1")).unwrap_err();
        assert!(matches!(err, GridError::InvalidRequest { .. }));
    }

    #[test]
    fn claim_then_release_round_trips() {
        let (ledger, offer_id) = ledger_with_offer(10);
        let before = ledger.available_count(offer_id).unwrap();
        ledger.claim(offer_id, 7, OrderId::new(), &txn("t1")).unwrap();
        assert_eq!(ledger.release(&txn("t1")), 7);
        assert_eq!(ledger.available_count(offer_id).unwrap(), before);
        // Releasing again is a no-op.
        assert_eq!(ledger.release(&txn("t1")), 0);
    }

    #[test]
    fn release_by_order_only_touches_that_order() {
        let (ledger, offer_id) = ledger_with_offer(10);
        let a = OrderId::new();
        let b = OrderId::new();
        ledger.claim(offer_id, 3, a, &txn("ta")).unwrap();
        ledger.claim(offer_id, 4, b, &txn("tb")).unwrap();

        assert_eq!(ledger.release_by_order(a), 3);
        assert_eq!(ledger.available_count(offer_id).unwrap(), 6);
        assert_eq!(ledger.blocks_for_order(b).len(), 4);
        assert!(ledger.blocks_for_order(a).is_empty());
    }

    #[test]
    fn indexes_drain_after_claim_sell_retire() {
        let (ledger, offer_id) = ledger_with_offer(10);
        let order = OrderId::new();
        ledger.claim(offer_id, 4, order, &txn("t1")).unwrap();
        ledger.mark_sold(order);
        assert!(!lock(&ledger.by_order).is_empty());

        ledger.retire_order(order);
        assert!(lock(&ledger.by_order).is_empty());
        assert!(lock(&ledger.by_transaction).is_empty());
        assert_eq!(ledger.stats(offer_id).unwrap().sold, 4);
    }

    #[test]
    fn indexes_drain_on_both_release_paths() {
        let (ledger, offer_id) = ledger_with_offer(10);
        let a = OrderId::new();
        let b = OrderId::new();
        ledger.claim(offer_id, 3, a, &txn("ta")).unwrap();
        ledger.claim(offer_id, 2, b, &txn("tb")).unwrap();

        ledger.release(&txn("ta"));
        ledger.release_by_order(b);
        assert!(lock(&ledger.by_order).is_empty());
        assert!(lock(&ledger.by_transaction).is_empty());
        assert_eq!(ledger.available_count(offer_id).unwrap(), 10);
    }

    #[test]
    fn mark_sold_is_idempotent() {
        let (ledger, offer_id) = ledger_with_offer(10);
        let order = OrderId::new();
        ledger.claim(offer_id, 4, order, &txn("t1")).unwrap();
        assert_eq!(ledger.mark_sold(order), 4);
        assert_eq!(ledger.mark_sold(order), 0);
        let stats = ledger.stats(offer_id).unwrap();
        assert_eq!(stats.sold, 4);
        assert_eq!(stats.reserved, 0);
    }

    #[test]
    fn sold_blocks_return_on_release() {
        let (ledger, offer_id) = ledger_with_offer(4);
        let order = OrderId::new();
        ledger.claim(offer_id, 4, order, &txn("t1")).unwrap();
        ledger.mark_sold(order);
        assert_eq!(ledger.release_by_order(order), 4);
        assert_eq!(ledger.available_count(offer_id).unwrap(), 4);
    }

    #[test]
    fn withdrawn_offer_rejects_claims_but_releases() {
        let (ledger, offer_id) = ledger_with_offer(4);
        let order = OrderId::new();
        ledger.claim(offer_id, 2, order, &txn("t1")).unwrap();
        ledger.withdraw_offer(offer_id).unwrap();

        let err = ledger.claim(offer_id, 1, OrderId::new(), &txn("t2")).unwrap_err();
        assert!(matches!(err, GridError::OfferWithdrawn(_)));
        assert_eq!(ledger.release_by_order(order), 2);
    }

    #[test]
    fn unknown_offer() {
        let ledger = BlockLedger::new(Arc::new(SystemClock));
        let err = ledger.available_count(OfferId::new()).unwrap_err();
        assert!(matches!(err, GridError::OfferNotFound(_)));
    }

    #[test]
    fn stale_reservations_are_listed() {
        let clock = Arc::new(ManualClock::new());
        let ledger = BlockLedger::new(clock.clone());
        let offer = Offer::dummy(UserId::new(), 10, chrono::Duration::hours(2));
        let offer_id = offer.id;
        ledger.register_offer(offer).unwrap();

        let old = OrderId::new();
        ledger.claim(offer_id, 2, old, &txn("t-old")).unwrap();
        clock.advance(chrono::Duration::minutes(30));
        let fresh = OrderId::new();
        ledger.claim(offer_id, 2, fresh, &txn("t-new")).unwrap();

        let stale = ledger.reserved_orders_before(clock.now() - chrono::Duration::minutes(10));
        assert_eq!(stale, vec![old]);
    }

    #[test]
    fn concurrent_claims_never_oversell() {
        let (ledger, offer_id) = ledger_with_offer(10);
        let ledger = Arc::new(ledger);
        let results: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let ledger = Arc::clone(&ledger);
                    scope.spawn(move || {
                        ledger
                            .claim(offer_id, 3, OrderId::new(), &TransactionId::new(format!("t{i}")))
                            .unwrap()
                            .len()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results.iter().sum::<usize>(), 10);
        let stats = ledger.stats(offer_id).unwrap();
        assert!(stats.committed() <= stats.total);
        assert_eq!(stats.available, 0);
    }

    #[test]
    fn two_claims_of_six_against_ten() {
        let (ledger, offer_id) = ledger_with_offer(10);
        let ledger = Arc::new(ledger);
        let mut claimed: Vec<usize> = std::thread::scope(|scope| {
            let a = scope.spawn(|| ledger.claim(offer_id, 6, OrderId::new(), &txn("ta")).unwrap().len());
            let b = scope.spawn(|| ledger.claim(offer_id, 6, OrderId::new(), &txn("tb")).unwrap().len());
            vec![a.join().unwrap(), b.join().unwrap()]
        });
        claimed.sort_unstable();
        assert_eq!(claimed, vec![4, 6]);
    }
}
