//! Settlement (escrow) record types.
//!
//! ## State Machine
//!
//! ```text
//!   ┌───────────┐ funded ┌────────┐  outcome + payout  ┌──────────────────┐
//!   │ INITIATED ├───────▶│ FUNDED ├───────────────────▶│ RELEASED/REFUNDED│
//!   └─────┬─────┘        └───┬────┘                    └──────────────────┘
//!         │ deadline         │ deadline, no outcome            ▲
//!         ▼                  ▼                                 │ manual
//!   ┌──────────────────────────────┐                           │ reconciliation
//!   │        ERROR_EXPIRED         ├───────────────────────────┘ (refund only)
//!   └──────────────────────────────┘
//! ```
//!
//! `ERROR_NO_RECORD` and `ERROR_ALREADY_SETTLED` are reported to callers but
//! never stored over an existing record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{TradeId, UserId};

/// Status of a settlement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Initiated,
    Funded,
    Released,
    Refunded,
    ErrorExpired,
    ErrorNoRecord,
    ErrorAlreadySettled,
}

impl SettlementStatus {
    /// Can a stored record move from this status to `target`?
    ///
    /// Status only advances; the one sideways move is into ERROR_EXPIRED.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Initiated, Self::Funded | Self::ErrorExpired)
                | (Self::Funded, Self::Released | Self::Refunded | Self::ErrorExpired)
                | (Self::ErrorExpired, Self::Refunded)
        )
    }

    /// RELEASED and REFUNDED: money has moved, nothing further may happen.
    #[must_use]
    pub fn is_paid_out(self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::ErrorExpired | Self::ErrorNoRecord | Self::ErrorAlreadySettled
        )
    }
}

impl std::fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initiated => write!(f, "INITIATED"),
            Self::Funded => write!(f, "FUNDED"),
            Self::Released => write!(f, "RELEASED"),
            Self::Refunded => write!(f, "REFUNDED"),
            Self::ErrorExpired => write!(f, "ERROR_EXPIRED"),
            Self::ErrorNoRecord => write!(f, "ERROR_NO_RECORD"),
            Self::ErrorAlreadySettled => write!(f, "ERROR_ALREADY_SETTLED"),
        }
    }
}

/// Result of delivery verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationOutcome {
    Success,
    Fail,
}

impl VerificationOutcome {
    /// The payout this outcome calls for.
    #[must_use]
    pub fn payout_action(self) -> PayoutAction {
        match self {
            Self::Success => PayoutAction::Release,
            Self::Fail => PayoutAction::Refund,
        }
    }
}

impl std::fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

/// What a payout does with the escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutAction {
    /// Principal to the seller(s), fee to the platform.
    Release,
    /// Principal and fee back to the buyer.
    Refund,
}

impl PayoutAction {
    #[must_use]
    pub fn resulting_status(self) -> SettlementStatus {
        match self {
            Self::Release => SettlementStatus::Released,
            Self::Refund => SettlementStatus::Refunded,
        }
    }
}

impl std::fmt::Display for PayoutAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Release => write!(f, "RELEASE"),
            Self::Refund => write!(f, "REFUND"),
        }
    }
}

/// A provider and the principal it receives on release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payee {
    pub account: UserId,
    pub amount: Decimal,
}

/// Accounts whose balances a payout moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementParties {
    pub buyer: UserId,
    pub payees: Vec<Payee>,
}

/// One escrow record per trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub trade_id: TradeId,
    pub principal: Decimal,
    pub fee: Decimal,
    /// Always `principal + fee`.
    pub total: Decimal,
    pub currency: String,
    pub status: SettlementStatus,
    pub outcome: Option<VerificationOutcome>,
    pub payout_action: Option<PayoutAction>,
    pub funding_receipt: Option<String>,
    pub payout_receipt: Option<String>,
    pub parties: Option<SettlementParties>,
    /// Set when an expired record was refunded by hand.
    pub manually_reconciled: bool,
    /// Ledger error from the payout movement; the status moved regardless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout_error: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub initiated_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub errored_at: Option<DateTime<Utc>>,
}

impl SettlementRecord {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Amount the payout moves to its recipient: principal on release,
    /// principal + fee on refund.
    #[must_use]
    pub fn payout_amount(&self) -> Option<Decimal> {
        match self.payout_action? {
            PayoutAction::Release => Some(self.principal),
            PayoutAction::Refund => Some(self.total),
        }
    }

    /// Human-readable progress for display.
    #[must_use]
    pub fn steps(&self) -> Vec<SettlementStep> {
        let expired = self.status == SettlementStatus::ErrorExpired
            || (self.status == SettlementStatus::Refunded && self.manually_reconciled);
        let mut steps = Vec::with_capacity(4);

        steps.push(SettlementStep::done("Escrow initiated", Some(self.initiated_at)));

        steps.push(match self.funded_at {
            Some(at) => SettlementStep::done("Buyer funds escrowed", Some(at)),
            None if expired => SettlementStep::failed("Buyer funds escrowed", self.errored_at),
            None => SettlementStep::current("Buyer funds escrowed"),
        });

        steps.push(match (self.outcome, self.verified_at) {
            (Some(VerificationOutcome::Success), at) => {
                SettlementStep::done("Delivery verified", at)
            }
            (Some(VerificationOutcome::Fail), at) => {
                SettlementStep::failed("Delivery verification failed", at)
            }
            (None, _) if expired => {
                SettlementStep::failed("Verification window expired", self.errored_at)
            }
            (None, _) if self.funded_at.is_some() => SettlementStep::current("Delivery verification"),
            (None, _) => SettlementStep::pending("Delivery verification"),
        });

        let payout_label = match self.payout_action.or(self.outcome.map(VerificationOutcome::payout_action)) {
            Some(PayoutAction::Refund) => "Refund to buyer",
            _ => "Release to seller",
        };
        steps.push(match self.status {
            SettlementStatus::Released | SettlementStatus::Refunded => {
                SettlementStep::done(payout_label, self.settled_at)
            }
            SettlementStatus::ErrorExpired => {
                SettlementStep::failed("Awaiting manual reconciliation", self.errored_at)
            }
            _ if self.outcome.is_some() => SettlementStep::current(payout_label),
            _ => SettlementStep::pending(payout_label),
        });

        steps
    }
}

/// State of one progress step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    Done,
    Current,
    Pending,
    Failed,
}

/// A single line of settlement progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementStep {
    pub label: String,
    pub state: StepState,
    pub at: Option<DateTime<Utc>>,
}

impl SettlementStep {
    fn done(label: &str, at: Option<DateTime<Utc>>) -> Self {
        Self {
            label: label.to_string(),
            state: StepState::Done,
            at,
        }
    }

    fn current(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: StepState::Current,
            at: None,
        }
    }

    fn pending(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: StepState::Pending,
            at: None,
        }
    }

    fn failed(label: &str, at: Option<DateTime<Utc>>) -> Self {
        Self {
            label: label.to_string(),
            state: StepState::Failed,
            at,
        }
    }
}

/// What every settlement call returns: the record and its progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementView {
    pub record: SettlementRecord,
    pub steps: Vec<SettlementStep>,
}

impl From<SettlementRecord> for SettlementView {
    fn from(record: SettlementRecord) -> Self {
        let steps = record.steps();
        Self { record, steps }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: SettlementStatus) -> SettlementRecord {
        let now = Utc::now();
        SettlementRecord {
            trade_id: TradeId::new("trade-1"),
            principal: Decimal::new(100, 0),
            fee: Decimal::new(25, 1),
            total: Decimal::new(1025, 1),
            currency: "INR".into(),
            status,
            outcome: None,
            payout_action: None,
            funding_receipt: None,
            payout_receipt: None,
            parties: None,
            manually_reconciled: false,
            payout_error: None,
            expires_at: now + chrono::Duration::hours(1),
            initiated_at: now,
            funded_at: None,
            verified_at: None,
            settled_at: None,
            errored_at: None,
        }
    }

    #[test]
    fn transitions_only_advance() {
        use SettlementStatus::*;
        assert!(Initiated.can_transition_to(Funded));
        assert!(Funded.can_transition_to(Released));
        assert!(Funded.can_transition_to(Refunded));
        assert!(Funded.can_transition_to(ErrorExpired));
        assert!(!Funded.can_transition_to(Initiated));
        assert!(!Released.can_transition_to(Refunded));
        assert!(!Refunded.can_transition_to(Released));
        assert!(!Initiated.can_transition_to(Released));
        assert!(!Funded.can_transition_to(ErrorAlreadySettled));
    }

    #[test]
    fn outcome_maps_to_action() {
        assert_eq!(VerificationOutcome::Success.payout_action(), PayoutAction::Release);
        assert_eq!(VerificationOutcome::Fail.payout_action(), PayoutAction::Refund);
        assert_eq!(PayoutAction::Refund.resulting_status(), SettlementStatus::Refunded);
    }

    #[test]
    fn steps_for_fresh_record() {
        let steps = record(SettlementStatus::Initiated).steps();
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0].state, StepState::Done);
        assert_eq!(steps[1].state, StepState::Current);
        assert_eq!(steps[2].state, StepState::Pending);
        assert_eq!(steps[3].state, StepState::Pending);
    }

    #[test]
    fn steps_for_expired_record() {
        let mut rec = record(SettlementStatus::ErrorExpired);
        rec.funded_at = Some(Utc::now());
        rec.errored_at = Some(Utc::now());
        let steps = rec.steps();
        assert_eq!(steps[1].state, StepState::Done);
        assert_eq!(steps[2].state, StepState::Failed);
        assert_eq!(steps[3].state, StepState::Failed);
    }

    #[test]
    fn payout_amount_by_action() {
        let mut rec = record(SettlementStatus::Released);
        rec.payout_action = Some(PayoutAction::Release);
        assert_eq!(rec.payout_amount(), Some(Decimal::new(100, 0)));
        rec.payout_action = Some(PayoutAction::Refund);
        assert_eq!(rec.payout_amount(), Some(Decimal::new(1025, 1)));
    }

    #[test]
    fn status_wire_format() {
        let json = serde_json::to_string(&SettlementStatus::ErrorExpired).unwrap();
        assert_eq!(json, "\"ERROR_EXPIRED\"");
    }
}
