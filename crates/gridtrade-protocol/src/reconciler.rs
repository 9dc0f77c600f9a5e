//! Periodic repair sweep.
//!
//! Each run:
//! 1. cancels PENDING orders older than the pending TTL (system cancellation),
//! 2. releases reservations whose order is gone or no longer live,
//! 3. moves overdue settlement records to ERROR_EXPIRED,
//! 4. purges lapsed idempotency records,
//! 5. reports paid-out trades whose ledger movement failed.

use std::sync::Arc;
use std::time::Duration;

use gridtrade_guard::IdempotencyGuard;
use gridtrade_orders::OrderLifecycle;
use gridtrade_settlement::SettlementEngine;
use gridtrade_types::{AckResponse, Clock, MarketplaceConfig, OrderId, TradeId};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::settlement_api::SettlementReply;

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub expired_orders: Vec<OrderId>,
    pub released_blocks: u64,
    pub expired_settlements: Vec<TradeId>,
    pub purged_records: usize,
    /// Standing until an operator repairs the ledger by hand.
    pub unmoved_payouts: Vec<TradeId>,
}

impl ReconciliationReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expired_orders.is_empty()
            && self.released_blocks == 0
            && self.expired_settlements.is_empty()
            && self.purged_records == 0
            && self.unmoved_payouts.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    orders: Arc<OrderLifecycle>,
    settlements: Arc<SettlementEngine>,
    acks: Arc<IdempotencyGuard<AckResponse>>,
    responses: Arc<IdempotencyGuard<SettlementReply>>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    orphan_grace: chrono::Duration,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        config: &MarketplaceConfig,
        orders: Arc<OrderLifecycle>,
        settlements: Arc<SettlementEngine>,
        acks: Arc<IdempotencyGuard<AckResponse>>,
        responses: Arc<IdempotencyGuard<SettlementReply>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orders,
            settlements,
            acks,
            responses,
            clock,
            interval: Duration::from_secs(config.reconciliation.interval_secs.max(1)),
            orphan_grace: config.orders.pending_ttl(),
        }
    }

    /// One sweep at the clock's current time.
    pub async fn run_once(&self) -> ReconciliationReport {
        let now = self.clock.now();
        let report = ReconciliationReport {
            expired_orders: self.orders.expire_stale_pending(now).await,
            released_blocks: self.orders.release_orphaned_blocks(now - self.orphan_grace),
            expired_settlements: self.settlements.sweep_expired(now).await,
            purged_records: self.acks.purge_expired() + self.responses.purge_expired(),
            unmoved_payouts: self.settlements.unmoved_payouts(),
        };
        if !report.unmoved_payouts.is_empty() {
            warn!(
                count = report.unmoved_payouts.len(),
                trades = ?report.unmoved_payouts,
                "Payouts without ledger movement"
            );
        }
        if report.is_empty() {
            debug!("Reconciliation found nothing to repair");
        } else {
            info!(
                expired_orders = report.expired_orders.len(),
                released_blocks = report.released_blocks,
                expired_settlements = report.expired_settlements.len(),
                purged_records = report.purged_records,
                "Reconciliation sweep"
            );
        }
        report
    }

    /// Sweep every interval until `shutdown` flips to `true` or its sender drops.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.interval.as_secs(), "Reconciler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Reconciler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridtrade_guard::LockManager;
    use gridtrade_ledger::{AccountLedger, BlockLedger};
    use gridtrade_orders::NoopPublisher;
    use gridtrade_types::{
        InitItem, ManualClock, Offer, OrderStatus, PaymentStatus, SettlementStatus, TransactionId,
        UserId, VerificationOutcome,
    };
    use rust_decimal::Decimal;

    struct Fixture {
        clock: Arc<ManualClock>,
        blocks: Arc<BlockLedger>,
        orders: Arc<OrderLifecycle>,
        settlements: Arc<SettlementEngine>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let config = MarketplaceConfig::default();
        let locks = LockManager::new(&config.locks);
        let blocks = Arc::new(BlockLedger::new(clock.clone()));
        let accounts = Arc::new(AccountLedger::new(clock.clone()));
        let settlements = Arc::new(SettlementEngine::new(
            &config,
            accounts.clone(),
            locks.clone(),
            clock.clone(),
        ));
        let orders = Arc::new(
            OrderLifecycle::new(
                &config,
                blocks.clone(),
                accounts,
                locks,
                Arc::new(NoopPublisher),
                clock.clone(),
            )
            .with_settlement_gate(settlements.clone()),
        );
        let reconciler = Reconciler::new(
            &config,
            orders.clone(),
            settlements.clone(),
            Arc::new(IdempotencyGuard::new(&config.idempotency, clock.clone())),
            Arc::new(IdempotencyGuard::new(&config.idempotency, clock.clone())),
            clock.clone(),
        );
        Fixture {
            clock,
            blocks,
            orders,
            settlements,
            reconciler,
        }
    }

    #[tokio::test]
    async fn sweep_repairs_stale_state() {
        let f = fixture();
        let offer = Offer::dummy(UserId::new(), 10, chrono::Duration::hours(5));
        f.blocks.register_offer(offer.clone()).unwrap();
        let order = f
            .orders
            .init(
                &"txn-1".into(),
                UserId::new(),
                None,
                &[InitItem {
                    offer_id: offer.id,
                    quantity: 3,
                }],
            )
            .unwrap();
        // A reservation whose order never made it into the store.
        f.blocks
            .claim(offer.id, 2, OrderId::new(), &TransactionId::new("lost"))
            .unwrap();
        let trade = TradeId::new("trade-1");
        f.settlements
            .initiate(&trade, Decimal::new(50, 0), Some(chrono::Duration::minutes(5)))
            .await
            .unwrap();

        assert!(f.reconciler.run_once().await.is_empty());

        f.clock.advance(chrono::Duration::minutes(16));
        let report = f.reconciler.run_once().await;
        assert_eq!(report.expired_orders, vec![order.id]);
        assert_eq!(report.released_blocks, 2);
        assert_eq!(report.expired_settlements, vec![trade.clone()]);

        assert_eq!(f.orders.get(order.id).unwrap().status, OrderStatus::Cancelled);
        assert_eq!(f.blocks.available_count(offer.id).unwrap(), 10);
        assert_eq!(
            f.settlements.get(&trade).unwrap().record.status,
            SettlementStatus::ErrorExpired
        );
    }

    #[tokio::test]
    async fn reports_payouts_the_ledger_refused() {
        let f = fixture();
        let offer = Offer::dummy(UserId::new(), 4, chrono::Duration::hours(5));
        f.blocks.register_offer(offer.clone()).unwrap();
        // Unfunded buyer: the order confirms but no escrow is held.
        let order = f
            .orders
            .init(
                &"txn-1".into(),
                UserId::new(),
                None,
                &[InitItem {
                    offer_id: offer.id,
                    quantity: 4,
                }],
            )
            .unwrap();
        let mut order = f.orders.confirm(order.id).await.unwrap();
        order.payment_status = PaymentStatus::Escrowed;

        let trade = TradeId::from(order.id);
        f.settlements.initiate_for_order(&order, None).await.unwrap();
        f.settlements.confirm_funded(&trade, "R1").await.unwrap();
        f.settlements
            .verify_outcome(&trade, VerificationOutcome::Success)
            .await
            .unwrap();
        let paid = f.settlements.confirm_payout(&trade, "P1", None).await.unwrap();
        assert_eq!(paid.record.status, SettlementStatus::Released);
        assert!(paid.record.payout_error.is_some());

        let report = f.reconciler.run_once().await;
        assert_eq!(report.unmoved_payouts, vec![trade]);
        assert!(!report.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let handle = f.reconciler.clone().spawn(rx);
        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
