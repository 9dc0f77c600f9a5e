//! Deadline enforcement and manual recovery of expired escrows.

use chrono::{DateTime, Utc};
use gridtrade_guard::LockKey;
use gridtrade_types::{
    GridError, PayoutAction, Result, SettlementStatus, SettlementView, TradeId,
};
use tracing::{debug, info, warn};

use crate::SettlementEngine;

impl SettlementEngine {
    /// Move every record stuck past its deadline to ERROR_EXPIRED.
    ///
    /// A record is stuck when it is INITIATED, or FUNDED without an
    /// outcome. FUNDED records whose outcome is already recorded are left
    /// for payout. Returns the trades that were moved.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<TradeId> {
        let candidates: Vec<TradeId> = self
            .records()
            .into_iter()
            .filter(|r| is_stuck(r.status, r.outcome.is_some()) && r.is_expired_at(now))
            .map(|r| r.trade_id)
            .collect();

        let mut expired = Vec::with_capacity(candidates.len());
        for trade_id in candidates {
            let moved = self
                .locks
                .with_lock(&LockKey::trade(&trade_id), || async {
                    let mut record = self.load(&trade_id)?;
                    // Re-checked under the lease: funding or verification may have won.
                    if !is_stuck(record.status, record.outcome.is_some())
                        || !record.is_expired_at(now)
                    {
                        return Ok(false);
                    }
                    record.status = SettlementStatus::ErrorExpired;
                    record.errored_at = Some(now);
                    self.save(record);
                    Ok(true)
                })
                .await;
            match moved {
                Ok(true) => {
                    warn!(trade_id = %trade_id, "Settlement expired");
                    expired.push(trade_id);
                }
                Ok(false) => {}
                Err(err) => warn!(trade_id = %trade_id, error = %err, "Expiry sweep skipped trade"),
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expiry sweep finished");
        }
        expired
    }

    /// ERROR_EXPIRED → REFUNDED by an operator.
    ///
    /// The buyer's escrow (principal + fee) is returned when parties are
    /// bound. Replaying on an already reconciled record is a no-op.
    ///
    /// # Errors
    /// [`GridError::InvalidSettlementTransition`] unless the record is
    /// ERROR_EXPIRED (or already manually reconciled).
    pub async fn reconcile_expired(&self, trade_id: &TradeId, receipt: &str) -> Result<SettlementView> {
        self.locks
            .with_lock(&LockKey::trade(trade_id), || async {
                let mut record = self.load(trade_id)?;
                if record.manually_reconciled {
                    debug!(trade_id = %trade_id, "Reconciliation replayed");
                    return Ok(SettlementView::from(record));
                }
                if record.status != SettlementStatus::ErrorExpired {
                    return Err(GridError::InvalidSettlementTransition {
                        trade_id: trade_id.clone(),
                        from: record.status,
                        to: SettlementStatus::Refunded,
                    });
                }
                record.payout_error = self.move_payout(&record, PayoutAction::Refund);
                record.status = SettlementStatus::Refunded;
                record.payout_action = Some(PayoutAction::Refund);
                record.payout_receipt = Some(receipt.to_string());
                record.manually_reconciled = true;
                record.settled_at = Some(self.clock.now());
                self.save(record.clone());
                info!(trade_id = %trade_id, receipt, "Expired settlement reconciled");
                Ok(SettlementView::from(record))
            })
            .await
    }
}

fn is_stuck(status: SettlementStatus, has_outcome: bool) -> bool {
    match status {
        SettlementStatus::Initiated => true,
        SettlementStatus::Funded => !has_outcome,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gridtrade_guard::LockManager;
    use gridtrade_ledger::AccountLedger;
    use gridtrade_types::{
        Clock, ManualClock, MarketplaceConfig, VerificationOutcome,
    };
    use rust_decimal::Decimal;

    use super::*;

    fn engine() -> (Arc<ManualClock>, SettlementEngine) {
        let clock = Arc::new(ManualClock::new());
        let config = MarketplaceConfig::default();
        let engine = SettlementEngine::new(
            &config,
            Arc::new(AccountLedger::new(clock.clone())),
            LockManager::new(&config.locks),
            clock.clone(),
        );
        (clock, engine)
    }

    #[tokio::test]
    async fn sweep_expires_unfunded_and_unverified() {
        let (clock, engine) = engine();
        let ten = Some(chrono::Duration::minutes(10));
        let unfunded = TradeId::new("unfunded");
        let unverified = TradeId::new("unverified");
        let verified = TradeId::new("verified");
        for t in [&unfunded, &unverified, &verified] {
            engine.initiate(t, Decimal::new(40, 0), ten).await.unwrap();
        }
        engine.confirm_funded(&unverified, "R1").await.unwrap();
        engine.confirm_funded(&verified, "R2").await.unwrap();
        engine
            .verify_outcome(&verified, VerificationOutcome::Success)
            .await
            .unwrap();

        assert!(engine.sweep_expired(clock.now()).await.is_empty());
        clock.advance(chrono::Duration::minutes(11));
        let mut expired = engine.sweep_expired(clock.now()).await;
        expired.sort();
        assert_eq!(expired, vec![unfunded.clone(), unverified.clone()]);
        assert_eq!(
            engine.get(&verified).unwrap().record.status,
            SettlementStatus::Funded
        );
        assert!(engine.sweep_expired(clock.now()).await.is_empty());
    }

    #[tokio::test]
    async fn reconcile_refunds_expired_once() {
        let (clock, engine) = engine();
        let t = TradeId::new("trade-1");
        engine
            .initiate(&t, Decimal::new(100, 0), Some(chrono::Duration::minutes(1)))
            .await
            .unwrap();
        clock.advance(chrono::Duration::minutes(2));
        engine.sweep_expired(clock.now()).await;

        let view = engine.reconcile_expired(&t, "M1").await.unwrap();
        assert_eq!(view.record.status, SettlementStatus::Refunded);
        assert!(view.record.manually_reconciled);
        assert_eq!(view.record.payout_amount(), Some(view.record.total));

        let again = engine.reconcile_expired(&t, "M2").await.unwrap();
        assert_eq!(again.record.payout_receipt.as_deref(), Some("M1"));
    }

    #[tokio::test]
    async fn reconcile_rejects_live_records() {
        let (_, engine) = engine();
        let t = TradeId::new("trade-1");
        engine.initiate(&t, Decimal::new(100, 0), None).await.unwrap();
        let err = engine.reconcile_expired(&t, "M1").await.unwrap_err();
        assert!(matches!(err, GridError::InvalidSettlementTransition { .. }));
    }
}
