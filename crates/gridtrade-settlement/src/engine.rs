//! The settlement engine.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use gridtrade_guard::{LockKey, LockManager};
use gridtrade_ledger::AccountLedger;
use gridtrade_orders::SettlementGate;
use gridtrade_types::{
    Clock, FeeSchedule, GridError, MarketplaceConfig, Order, OrderId, OrderStatus, Payee,
    PaymentStatus, PayoutAction, Result, SettlementParties, SettlementRecord, SettlementStatus,
    SettlementView, TradeId, VerificationOutcome,
};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

/// Escrow state machine over all trades.
#[derive(Debug)]
pub struct SettlementEngine {
    pub(crate) records: RwLock<HashMap<TradeId, SettlementRecord>>,
    pub(crate) locks: LockManager,
    pub(crate) accounts: Arc<AccountLedger>,
    fees: FeeSchedule,
    currency: String,
    default_expiry: chrono::Duration,
    pub(crate) clock: Arc<dyn Clock>,
}

impl SettlementEngine {
    #[must_use]
    pub fn new(
        config: &MarketplaceConfig,
        accounts: Arc<AccountLedger>,
        locks: LockManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            locks,
            accounts,
            fees: config.fees.clone(),
            currency: config.currency.code.clone(),
            default_expiry: config.settlement.default_expiry(),
            clock,
        }
    }

    pub(crate) fn load(&self, trade_id: &TradeId) -> Result<SettlementRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(trade_id)
            .cloned()
            .ok_or_else(|| GridError::SettlementNotFound(trade_id.clone()))
    }

    pub(crate) fn save(&self, record: SettlementRecord) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.trade_id.clone(), record);
    }

    /// Current record and progress.
    pub fn get(&self, trade_id: &TradeId) -> Result<SettlementView> {
        self.load(trade_id).map(SettlementView::from)
    }

    /// All records.
    #[must_use]
    pub fn records(&self) -> Vec<SettlementRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------
    // initiate
    // -----------------------------------------------------------------

    /// Open escrow for a trade. Returns the existing record unchanged when
    /// one already exists.
    ///
    /// `fee = min(cap, principal × rate)`, `total = principal + fee`,
    /// `expires_at = now + expiry` (the configured default when `None`).
    pub async fn initiate(
        &self,
        trade_id: &TradeId,
        principal: Decimal,
        expiry: Option<chrono::Duration>,
    ) -> Result<SettlementView> {
        self.open(trade_id, principal, expiry, self.currency.clone(), None)
            .await
    }

    /// Open escrow for a confirmed order, binding the buyer and provider
    /// payees so payout moves money in the account ledger.
    ///
    /// # Errors
    /// [`GridError::InvalidRequest`] unless the order is ACTIVE with its
    /// escrow held.
    pub async fn initiate_for_order(
        &self,
        order: &Order,
        expiry: Option<chrono::Duration>,
    ) -> Result<SettlementView> {
        if order.status != OrderStatus::Active || order.payment_status != PaymentStatus::Escrowed {
            return Err(GridError::InvalidRequest {
                reason: format!(
                    "order {} is {} with payment {}; settlement needs an ACTIVE order with escrow held",
                    order.id, order.status, order.payment_status
                ),
            });
        }
        let parties = SettlementParties {
            buyer: order.buyer_id,
            payees: order
                .provider_shares()
                .into_iter()
                .map(|(account, amount)| Payee { account, amount })
                .collect(),
        };
        self.open(
            &TradeId::from(order.id),
            order.quote.total_price,
            expiry,
            order.quote.currency.clone(),
            Some(parties),
        )
        .await
    }

    async fn open(
        &self,
        trade_id: &TradeId,
        principal: Decimal,
        expiry: Option<chrono::Duration>,
        currency: String,
        parties: Option<SettlementParties>,
    ) -> Result<SettlementView> {
        if trade_id.is_blank() {
            return Err(GridError::InvalidRequest {
                reason: "trade id is empty".into(),
            });
        }
        if principal <= Decimal::ZERO {
            return Err(GridError::InvalidRequest {
                reason: format!("principal must be positive, got {principal}"),
            });
        }
        let expiry = expiry.unwrap_or(self.default_expiry);
        if expiry <= chrono::Duration::zero() {
            return Err(GridError::InvalidRequest {
                reason: "expiry must be positive".into(),
            });
        }

        self.locks
            .with_lock(&LockKey::trade(trade_id), || async {
                if let Ok(existing) = self.load(trade_id) {
                    debug!(trade_id = %trade_id, status = %existing.status, "Initiate replayed");
                    return Ok(SettlementView::from(existing));
                }
                let now = self.clock.now();
                let fee = self.fees.fee_for(principal);
                let record = SettlementRecord {
                    trade_id: trade_id.clone(),
                    principal,
                    fee,
                    total: principal + fee,
                    currency,
                    status: SettlementStatus::Initiated,
                    outcome: None,
                    payout_action: None,
                    funding_receipt: None,
                    payout_receipt: None,
                    parties,
                    manually_reconciled: false,
                    payout_error: None,
                    expires_at: now + expiry,
                    initiated_at: now,
                    funded_at: None,
                    verified_at: None,
                    settled_at: None,
                    errored_at: None,
                };
                self.save(record.clone());
                info!(
                    trade_id = %trade_id,
                    principal = %record.principal,
                    fee = %record.fee,
                    expires_at = %record.expires_at,
                    "Settlement initiated"
                );
                Ok(SettlementView::from(record))
            })
            .await
    }

    // -----------------------------------------------------------------
    // confirm_funded
    // -----------------------------------------------------------------

    /// INITIATED → FUNDED with the funding receipt. A no-op once funded or
    /// past funding.
    pub async fn confirm_funded(&self, trade_id: &TradeId, receipt: &str) -> Result<SettlementView> {
        self.locks
            .with_lock(&LockKey::trade(trade_id), || async {
                let mut record = self.load(trade_id)?;
                if record.status != SettlementStatus::Initiated {
                    debug!(trade_id = %trade_id, status = %record.status, "Funding replayed");
                    return Ok(SettlementView::from(record));
                }
                record.status = SettlementStatus::Funded;
                record.funding_receipt = Some(receipt.to_string());
                record.funded_at = Some(self.clock.now());
                self.save(record.clone());
                info!(trade_id = %trade_id, receipt, "Settlement funded");
                Ok(SettlementView::from(record))
            })
            .await
    }

    // -----------------------------------------------------------------
    // verify_outcome
    // -----------------------------------------------------------------

    /// Record the verification outcome of a FUNDED trade.
    ///
    /// The outcome is write-once: supplying the same outcome again is a
    /// no-op. Nothing moves money here.
    ///
    /// # Errors
    /// [`GridError::SettlementExpired`] once the deadline passed (the
    /// record moves to ERROR_EXPIRED and no outcome is stored),
    /// [`GridError::AlreadySettled`] after payout,
    /// [`GridError::OutcomeAlreadyRecorded`] for a conflicting outcome.
    pub async fn verify_outcome(
        &self,
        trade_id: &TradeId,
        outcome: VerificationOutcome,
    ) -> Result<SettlementView> {
        self.locks
            .with_lock(&LockKey::trade(trade_id), || async {
                let mut record = self.load(trade_id)?;
                match record.status {
                    SettlementStatus::Funded => {}
                    SettlementStatus::Released | SettlementStatus::Refunded => {
                        return Err(GridError::AlreadySettled {
                            trade_id: trade_id.clone(),
                            status: record.status,
                        });
                    }
                    SettlementStatus::ErrorExpired => {
                        return Err(GridError::SettlementExpired {
                            trade_id: trade_id.clone(),
                            expired_at: record.expires_at,
                        });
                    }
                    from => {
                        return Err(GridError::InvalidSettlementTransition {
                            trade_id: trade_id.clone(),
                            from,
                            to: outcome.payout_action().resulting_status(),
                        });
                    }
                }

                let now = self.clock.now();
                if record.is_expired_at(now) {
                    record.status = SettlementStatus::ErrorExpired;
                    record.errored_at = Some(now);
                    self.save(record.clone());
                    warn!(trade_id = %trade_id, expires_at = %record.expires_at, "Verification after deadline");
                    return Err(GridError::SettlementExpired {
                        trade_id: trade_id.clone(),
                        expired_at: record.expires_at,
                    });
                }

                match record.outcome {
                    Some(recorded) if recorded == outcome => {
                        return Ok(SettlementView::from(record));
                    }
                    Some(recorded) => {
                        return Err(GridError::OutcomeAlreadyRecorded {
                            trade_id: trade_id.clone(),
                            recorded,
                        });
                    }
                    None => {}
                }

                record.outcome = Some(outcome);
                record.verified_at = Some(now);
                self.save(record.clone());
                info!(trade_id = %trade_id, outcome = %outcome, "Settlement verified");
                Ok(SettlementView::from(record))
            })
            .await
    }

    // -----------------------------------------------------------------
    // confirm_payout
    // -----------------------------------------------------------------

    /// FUNDED → RELEASED | REFUNDED.
    ///
    /// `action` defaults to what the stored outcome implies (SUCCESS →
    /// release principal to the providers, platform keeps the fee; FAIL →
    /// refund principal + fee to the buyer). A no-op once paid out.
    ///
    /// # Errors
    /// [`GridError::OutcomeMissing`] before verification,
    /// [`GridError::PayoutActionMismatch`] if `action` contradicts the
    /// outcome, [`GridError::SettlementExpired`] after expiry.
    pub async fn confirm_payout(
        &self,
        trade_id: &TradeId,
        receipt: &str,
        action: Option<PayoutAction>,
    ) -> Result<SettlementView> {
        self.locks
            .with_lock(&LockKey::trade(trade_id), || async {
                let mut record = self.load(trade_id)?;
                match record.status {
                    SettlementStatus::Funded => {}
                    SettlementStatus::Released | SettlementStatus::Refunded => {
                        debug!(trade_id = %trade_id, status = %record.status, "Payout replayed");
                        return Ok(SettlementView::from(record));
                    }
                    SettlementStatus::ErrorExpired => {
                        return Err(GridError::SettlementExpired {
                            trade_id: trade_id.clone(),
                            expired_at: record.expires_at,
                        });
                    }
                    from => {
                        return Err(GridError::InvalidSettlementTransition {
                            trade_id: trade_id.clone(),
                            from,
                            to: action.map_or(SettlementStatus::Released, PayoutAction::resulting_status),
                        });
                    }
                }

                let outcome = record
                    .outcome
                    .ok_or_else(|| GridError::OutcomeMissing(trade_id.clone()))?;
                let derived = outcome.payout_action();
                if let Some(requested) = action {
                    if requested != derived {
                        return Err(GridError::PayoutActionMismatch {
                            trade_id: trade_id.clone(),
                            outcome,
                            action: requested,
                        });
                    }
                }

                record.payout_error = self.move_payout(&record, derived);
                record.status = derived.resulting_status();
                record.payout_action = Some(derived);
                record.payout_receipt = Some(receipt.to_string());
                record.settled_at = Some(self.clock.now());
                self.save(record.clone());
                info!(
                    trade_id = %trade_id,
                    status = %record.status,
                    amount = ?record.payout_amount(),
                    receipt,
                    "Settlement paid out"
                );
                Ok(SettlementView::from(record))
            })
            .await
    }

    /// Move escrowed money for a payout. A ledger failure is logged and
    /// returned for the record; the payout itself still stands.
    pub(crate) fn move_payout(&self, record: &SettlementRecord, action: PayoutAction) -> Option<String> {
        let parties = record.parties.as_ref()?;
        let reference = record.trade_id.to_string();
        let moved = match action {
            PayoutAction::Release => self.accounts.release_escrow_to(
                parties.buyer,
                &record.currency,
                &parties.payees,
                record.fee,
                &reference,
            ),
            PayoutAction::Refund => {
                self.accounts
                    .refund_escrow(parties.buyer, &record.currency, record.total, &reference)
            }
        };
        let err = moved.err()?;
        error!(
            trade_id = %record.trade_id,
            action = %action,
            error = %err,
            "Payout ledger movement failed; needs manual reconciliation"
        );
        Some(err.to_string())
    }

    /// Paid-out trades whose ledger movement failed.
    #[must_use]
    pub fn unmoved_payouts(&self) -> Vec<TradeId> {
        let mut unmoved: Vec<TradeId> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.payout_error.is_some())
            .map(|r| r.trade_id.clone())
            .collect();
        unmoved.sort();
        unmoved
    }
}

impl SettlementGate for SettlementEngine {
    fn settlement_status(&self, order_id: OrderId) -> Option<SettlementStatus> {
        self.load(&TradeId::from(order_id)).ok().map(|record| record.status)
    }
}
