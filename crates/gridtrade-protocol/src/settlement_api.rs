//! Caller-driven settlement calls with client idempotency keys.
//!
//! Unlike the protocol actions these answer synchronously: the caller
//! drives each step and gets the record plus its progress steps back.
//! A call carrying a client key is fingerprinted; replaying the same key on
//! the same endpoint returns the first response verbatim, success or error,
//! and reusing it for a different request is rejected.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gridtrade_guard::{Claim, IdempotencyGuard, IdempotencyKey, fingerprint};
use gridtrade_orders::OrderLifecycle;
use gridtrade_settlement::SettlementEngine;
use gridtrade_types::{
    GridError, OrderId, PayoutAction, Result, SettlementStatus, SettlementView,
    TradeId, VerificationOutcome, WireError,
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

/// How long a concurrent duplicate waits for the first call's response.
const DUPLICATE_WAIT: Duration = Duration::from_secs(5);

/// What every settlement endpoint returns.
pub type SettlementReply = std::result::Result<SettlementView, WireError>;

/// Settlement endpoints: initiate, fund, verify, pay out, reconcile.
#[derive(Debug, Clone)]
pub struct SettlementApi {
    engine: Arc<SettlementEngine>,
    orders: Arc<OrderLifecycle>,
    responses: Arc<IdempotencyGuard<SettlementReply>>,
}

impl SettlementApi {
    #[must_use]
    pub fn new(
        engine: Arc<SettlementEngine>,
        orders: Arc<OrderLifecycle>,
        responses: Arc<IdempotencyGuard<SettlementReply>>,
    ) -> Self {
        Self {
            engine,
            orders,
            responses,
        }
    }

    pub async fn initiate(
        &self,
        trade_id: &TradeId,
        principal: Decimal,
        expiry: Option<chrono::Duration>,
        client_key: Option<&str>,
    ) -> SettlementReply {
        let body = json!({
            "trade_id": trade_id,
            "principal": principal,
            "expiry_secs": expiry.map(|d| d.num_seconds()),
        });
        self.idempotent("initiate", client_key, &body, || {
            self.engine.initiate(trade_id, principal, expiry)
        })
        .await
    }

    /// Open escrow for an ACTIVE order with its escrow held; the trade id
    /// is the order id. The order refuses cancellation from here until the
    /// settlement pays out.
    pub async fn initiate_for_order(
        &self,
        order_id: OrderId,
        expiry: Option<chrono::Duration>,
        client_key: Option<&str>,
    ) -> SettlementReply {
        let body = json!({
            "order_id": order_id,
            "expiry_secs": expiry.map(|d| d.num_seconds()),
        });
        self.idempotent("initiate_for_order", client_key, &body, || async move {
            let order = self.orders.begin_settlement(order_id).await?;
            let opened = self.engine.initiate_for_order(&order, expiry).await;
            if opened.is_err() {
                self.orders.abandon_settlement(order_id);
            }
            opened
        })
        .await
    }

    pub async fn confirm_funded(
        &self,
        trade_id: &TradeId,
        receipt: &str,
        client_key: Option<&str>,
    ) -> SettlementReply {
        let body = json!({ "trade_id": trade_id, "receipt": receipt });
        self.idempotent("confirm_funded", client_key, &body, || {
            self.engine.confirm_funded(trade_id, receipt)
        })
        .await
    }

    pub async fn verify_outcome(
        &self,
        trade_id: &TradeId,
        outcome: VerificationOutcome,
        client_key: Option<&str>,
    ) -> SettlementReply {
        let body = json!({ "trade_id": trade_id, "outcome": outcome });
        self.idempotent("verify_outcome", client_key, &body, || {
            self.engine.verify_outcome(trade_id, outcome)
        })
        .await
    }

    /// Pay out, then complete the owning order (release) or mark its
    /// payment refunded (refund) when the trade id names an order.
    pub async fn confirm_payout(
        &self,
        trade_id: &TradeId,
        receipt: &str,
        action: Option<PayoutAction>,
        client_key: Option<&str>,
    ) -> SettlementReply {
        let body = json!({ "trade_id": trade_id, "receipt": receipt, "action": action });
        self.idempotent("confirm_payout", client_key, &body, || async move {
            let view = self.engine.confirm_payout(trade_id, receipt, action).await?;
            self.follow_up_order(trade_id, view.record.status).await;
            Ok(view)
        })
        .await
    }

    /// Manual recovery of an expired escrow: refund the buyer.
    pub async fn reconcile_expired(
        &self,
        trade_id: &TradeId,
        receipt: &str,
        client_key: Option<&str>,
    ) -> SettlementReply {
        let body = json!({ "trade_id": trade_id, "receipt": receipt });
        self.idempotent("reconcile_expired", client_key, &body, || async move {
            let view = self.engine.reconcile_expired(trade_id, receipt).await?;
            self.follow_up_order(trade_id, view.record.status).await;
            Ok(view)
        })
        .await
    }

    pub fn get(&self, trade_id: &TradeId) -> SettlementReply {
        self.engine.get(trade_id).map_err(|err| WireError::from(&err))
    }

    async fn follow_up_order(&self, trade_id: &TradeId, status: SettlementStatus) {
        let Some(order_id) = trade_id.as_order_id() else {
            return;
        };
        let followed = match status {
            SettlementStatus::Released => self.orders.complete(order_id).await,
            SettlementStatus::Refunded => self.orders.mark_refunded(order_id).await,
            _ => return,
        };
        match followed {
            Ok(_) | Err(GridError::OrderNotFound(_)) => {}
            Err(err) => warn!(
                trade_id = %trade_id,
                status = %status,
                error = %err,
                "Order follow-up after payout failed"
            ),
        }
    }

    async fn idempotent<B, F, Fut>(
        &self,
        endpoint: &'static str,
        client_key: Option<&str>,
        body: &B,
        op: F,
    ) -> SettlementReply
    where
        B: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SettlementView>>,
    {
        let Some(client_key) = client_key else {
            return op().await.map_err(|err| WireError::from(&err));
        };
        let key = IdempotencyKey::client(endpoint, client_key);
        let print = fingerprint(endpoint, body).map_err(|err| WireError::from(&err))?;

        match self.responses.begin_processing(&key, Some(print.as_str())) {
            Ok(Claim::Accepted) => {}
            Ok(Claim::Completed(reply)) => {
                debug!(key = %key, "Replayed settlement response");
                return reply;
            }
            Ok(Claim::InFlight) => {
                return match self.responses.wait_for_result(&key, DUPLICATE_WAIT).await {
                    Ok(Some(reply)) => reply,
                    Ok(None) => Err(WireError::from(&GridError::RequestInFlight {
                        key: key.to_string(),
                    })),
                    Err(err) => Err(WireError::from(&err)),
                };
            }
            Err(err) => return Err(WireError::from(&err)),
        }

        let reply = op().await.map_err(|err| WireError::from(&err));
        match &reply {
            // Contention may clear; let the client retry with the same key.
            Err(wire) if wire.retryable => self.responses.abandon(&key),
            _ => self.responses.store_result(&key, reply.clone()),
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridtrade_guard::LockManager;
    use gridtrade_ledger::{AccountLedger, BlockLedger, PLATFORM_ACCOUNT};
    use gridtrade_orders::NoopPublisher;
    use gridtrade_types::{
        CancelledBy, InitItem, ManualClock, MarketplaceConfig, Offer, Order, OrderStatus,
        PaymentStatus, UserId,
    };

    struct Fixture {
        api: SettlementApi,
        engine: Arc<SettlementEngine>,
        orders: Arc<OrderLifecycle>,
        blocks: Arc<BlockLedger>,
        accounts: Arc<AccountLedger>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let config = MarketplaceConfig::default();
        let locks = LockManager::new(&config.locks);
        let blocks = Arc::new(BlockLedger::new(clock.clone()));
        let accounts = Arc::new(AccountLedger::new(clock.clone()));
        let engine = Arc::new(SettlementEngine::new(
            &config,
            accounts.clone(),
            locks.clone(),
            clock.clone(),
        ));
        let orders = Arc::new(
            OrderLifecycle::new(
                &config,
                blocks.clone(),
                accounts.clone(),
                locks,
                Arc::new(NoopPublisher),
                clock.clone(),
            )
            .with_settlement_gate(engine.clone()),
        );
        let api = SettlementApi::new(
            engine.clone(),
            orders.clone(),
            Arc::new(IdempotencyGuard::new(&config.idempotency, clock)),
        );
        Fixture {
            api,
            engine,
            orders,
            blocks,
            accounts,
        }
    }

    fn hundred() -> Decimal {
        Decimal::new(100, 0)
    }

    async fn active_order(f: &Fixture, txn: &str, buyer: UserId, offer: &Offer, quantity: u64) -> Order {
        let order = f
            .orders
            .init(
                &txn.into(),
                buyer,
                None,
                &[InitItem {
                    offer_id: offer.id,
                    quantity,
                }],
            )
            .unwrap();
        f.orders.confirm(order.id).await.unwrap()
    }

    #[tokio::test]
    async fn client_key_replays_verbatim() {
        let f = fixture();
        let trade = TradeId::new("trade-1");
        let first = f.api.initiate(&trade, hundred(), None, Some("k1")).await.unwrap();
        let replay = f.api.initiate(&trade, hundred(), None, Some("k1")).await.unwrap();
        assert_eq!(first, replay);

        let reused = f
            .api
            .initiate(&trade, Decimal::new(7, 0), None, Some("k1"))
            .await
            .unwrap_err();
        assert_eq!(reused.code, "IDEMPOTENCY_KEY_REUSE");
    }

    #[tokio::test]
    async fn cached_errors_replay_too() {
        let f = fixture();
        let missing = TradeId::new("nope");
        let first = f.api.confirm_funded(&missing, "R1", Some("k1")).await.unwrap_err();
        assert_eq!(first.code, "ERROR_NO_RECORD");

        f.api.initiate(&missing, hundred(), None, None).await.unwrap();
        let replay = f.api.confirm_funded(&missing, "R1", Some("k1")).await.unwrap_err();
        assert_eq!(first, replay);

        let fresh = f.api.confirm_funded(&missing, "R1", Some("k2")).await.unwrap();
        assert_eq!(fresh.record.status, SettlementStatus::Funded);
    }

    #[tokio::test]
    async fn order_settlement_completes_order() {
        let f = fixture();
        let provider = UserId::new();
        let buyer = UserId::new();
        let offer = Offer::dummy(provider, 20, chrono::Duration::hours(2));
        f.blocks.register_offer(offer.clone()).unwrap();
        f.accounts.deposit(buyer, "INR", Decimal::new(1_000, 0), "seed").unwrap();
        let order = f
            .orders
            .init(
                &"txn-1".into(),
                buyer,
                None,
                &[InitItem {
                    offer_id: offer.id,
                    quantity: 20,
                }],
            )
            .unwrap();

        let early = f.api.initiate_for_order(order.id, None, None).await.unwrap_err();
        assert_eq!(early.code, "INVALID_REQUEST");

        f.orders.confirm(order.id).await.unwrap();
        let view = f.api.initiate_for_order(order.id, None, None).await.unwrap();
        assert_eq!(view.record.principal, hundred());
        assert_eq!(view.record.total, Decimal::new(1025, 1));

        let trade = TradeId::from(order.id);
        f.api.confirm_funded(&trade, "R1", None).await.unwrap();
        f.api
            .verify_outcome(&trade, VerificationOutcome::Success, None)
            .await
            .unwrap();
        let paid = f.api.confirm_payout(&trade, "P1", None, None).await.unwrap();

        assert_eq!(paid.record.status, SettlementStatus::Released);
        assert_eq!(f.orders.get(order.id).unwrap().status, OrderStatus::Completed);
        assert_eq!(f.accounts.balance(provider, "INR").available, hundred());
        assert_eq!(
            f.accounts.balance(PLATFORM_ACCOUNT, "INR").available,
            Decimal::new(25, 1)
        );
        assert_eq!(f.accounts.balance(buyer, "INR").escrowed, Decimal::ZERO);
        f.accounts.verify_conservation("INR").unwrap();
    }

    #[tokio::test]
    async fn refund_marks_order_payment_refunded() {
        let f = fixture();
        let buyer = UserId::new();
        let offer = Offer::dummy(UserId::new(), 4, chrono::Duration::hours(2));
        f.blocks.register_offer(offer.clone()).unwrap();
        f.accounts.deposit(buyer, "INR", Decimal::new(100, 0), "seed").unwrap();
        let order = f
            .orders
            .init(
                &"txn-2".into(),
                buyer,
                None,
                &[InitItem {
                    offer_id: offer.id,
                    quantity: 4,
                }],
            )
            .unwrap();
        f.orders.confirm(order.id).await.unwrap();
        f.api.initiate_for_order(order.id, None, None).await.unwrap();

        let trade = TradeId::from(order.id);
        f.api.confirm_funded(&trade, "R1", None).await.unwrap();
        f.api.verify_outcome(&trade, VerificationOutcome::Fail, None).await.unwrap();
        f.api
            .confirm_payout(&trade, "P1", Some(PayoutAction::Refund), None)
            .await
            .unwrap();

        let order = f.orders.get(order.id).unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Refunded);
        assert_eq!(f.accounts.balance(buyer, "INR").available, Decimal::new(100, 0));
    }

    #[tokio::test]
    async fn cancel_waits_for_payout_and_spares_other_orders() {
        let f = fixture();
        let provider = UserId::new();
        let buyer = UserId::new();
        let offer = Offer::dummy(provider, 8, chrono::Duration::hours(4));
        f.blocks.register_offer(offer.clone()).unwrap();
        f.accounts.deposit(buyer, "INR", Decimal::new(100, 0), "seed").unwrap();
        let a = active_order(&f, "txn-a", buyer, &offer, 4).await;
        let b = active_order(&f, "txn-b", buyer, &offer, 4).await;
        let per_order = Decimal::new(2_050, 2);

        let trade = TradeId::from(a.id);
        f.api.initiate_for_order(a.id, None, None).await.unwrap();
        f.api.confirm_funded(&trade, "R1", None).await.unwrap();
        f.api
            .verify_outcome(&trade, VerificationOutcome::Success, None)
            .await
            .unwrap();

        let err = f
            .orders
            .cancel(a.id, CancelledBy::Buyer, "changed plans")
            .await
            .unwrap_err();
        assert_eq!(err.wire_code(), "SETTLEMENT_IN_PROGRESS");
        assert_eq!(f.orders.get(a.id).unwrap().status, OrderStatus::Active);

        let paid = f.api.confirm_payout(&trade, "P1", None, None).await.unwrap();
        assert_eq!(paid.record.status, SettlementStatus::Released);
        assert_eq!(paid.record.payout_error, None);
        assert_eq!(f.accounts.balance(provider, "INR").available, Decimal::new(20, 0));
        assert_eq!(f.accounts.escrowed_for(buyer, "INR", &b.id.to_string()), per_order);
        assert_eq!(f.accounts.balance(buyer, "INR").escrowed, per_order);
        assert!(f.engine.unmoved_payouts().is_empty());

        // B's cancellation moves exactly B's escrow: 90 % back to the buyer.
        let cancelled = f.orders.cancel(b.id, CancelledBy::Buyer, "").await.unwrap();
        assert_eq!(cancelled.cancellation.unwrap().split.buyer_refund, Decimal::new(18_450, 3));
        assert_eq!(f.accounts.balance(buyer, "INR").escrowed, Decimal::ZERO);
        assert_eq!(
            f.accounts.balance(buyer, "INR").available,
            Decimal::new(100, 0) - per_order - per_order + Decimal::new(18_450, 3)
        );
        f.accounts.verify_conservation("INR").unwrap();
    }

    #[tokio::test]
    async fn two_active_orders_pay_out_independently() {
        let f = fixture();
        let provider = UserId::new();
        let buyer = UserId::new();
        let offer = Offer::dummy(provider, 8, chrono::Duration::hours(4));
        f.blocks.register_offer(offer.clone()).unwrap();
        f.accounts.deposit(buyer, "INR", Decimal::new(100, 0), "seed").unwrap();
        let a = active_order(&f, "txn-a", buyer, &offer, 4).await;
        let b = active_order(&f, "txn-b", buyer, &offer, 4).await;

        for (order, outcome, action) in [
            (&a, VerificationOutcome::Success, PayoutAction::Release),
            (&b, VerificationOutcome::Fail, PayoutAction::Refund),
        ] {
            let trade = TradeId::from(order.id);
            f.api.initiate_for_order(order.id, None, None).await.unwrap();
            f.api.confirm_funded(&trade, "R", None).await.unwrap();
            f.api.verify_outcome(&trade, outcome, None).await.unwrap();
            f.api.confirm_payout(&trade, "P", Some(action), None).await.unwrap();
        }

        assert_eq!(f.orders.get(a.id).unwrap().status, OrderStatus::Completed);
        let refunded = f.orders.get(b.id).unwrap();
        assert_eq!(refunded.payment_status, PaymentStatus::Refunded);
        assert_eq!(f.accounts.balance(buyer, "INR").escrowed, Decimal::ZERO);
        assert_eq!(f.accounts.balance(buyer, "INR").available, Decimal::new(7_950, 2));

        // Cancelling after the refund moves nothing more.
        let cancelled = f.orders.cancel(b.id, CancelledBy::Buyer, "").await.unwrap();
        assert_eq!(cancelled.cancellation.unwrap().split, Default::default());
        assert_eq!(f.accounts.balance(buyer, "INR").available, Decimal::new(7_950, 2));
        f.accounts.verify_conservation("INR").unwrap();
    }

    #[tokio::test]
    async fn settlement_needs_escrow_held() {
        let f = fixture();
        let buyer = UserId::new();
        let offer = Offer::dummy(UserId::new(), 4, chrono::Duration::hours(4));
        f.blocks.register_offer(offer.clone()).unwrap();
        // No deposit: confirm succeeds but the hold fails.
        let order = active_order(&f, "txn-1", buyer, &offer, 4).await;
        assert_eq!(order.payment_status, PaymentStatus::Pending);

        let err = f.api.initiate_for_order(order.id, None, None).await.unwrap_err();
        assert_eq!(err.code, "INVALID_REQUEST");
        assert!(f.engine.get(&TradeId::from(order.id)).is_err());
        f.orders.cancel(order.id, CancelledBy::Buyer, "").await.unwrap();
    }
}
