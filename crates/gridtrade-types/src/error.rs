//! Error types for the GridTrade marketplace.
//!
//! All errors use the `GT_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Validation errors
//! - 2xx: Inventory / contention errors
//! - 3xx: Order state errors
//! - 4xx: Settlement errors
//! - 5xx: Lease / idempotency errors
//! - 6xx: Account ledger errors
//! - 7xx: Side-effect delivery errors
//! - 9xx: General / internal errors
//!
//! Components never exchange wire strings. [`GridError::wire_code`] and
//! [`GridError::class`] are consulted only at the protocol boundary.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    OfferId, OrderId, OrderStatus, PayoutAction, SettlementStatus, TradeId, UserId,
    VerificationOutcome,
};

/// The closed error taxonomy every [`GridError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Malformed request or unknown entity. Rejected synchronously, never retried.
    Validation,
    /// Insufficient blocks or a contended lease. Retryable by the caller.
    Contention,
    /// The entity is in a state that forbids the operation. Terminal.
    StateConflict,
    /// A settlement deadline lapsed. Terminal, needs manual reconciliation.
    Expiry,
    /// A best-effort side effect failed. Logged, never the primary failure.
    SideEffect,
    /// Unrecoverable internal failure.
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "VALIDATION"),
            Self::Contention => write!(f, "CONTENTION"),
            Self::StateConflict => write!(f, "STATE_CONFLICT"),
            Self::Expiry => write!(f, "EXPIRY"),
            Self::SideEffect => write!(f, "SIDE_EFFECT"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// Central error enum for all GridTrade operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GridError {
    // =================================================================
    // Validation Errors (1xx)
    // =================================================================
    /// The request is structurally invalid.
    #[error("GT_ERR_100: Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// No offer with this id is known.
    #[error("GT_ERR_101: Offer not found: {0}")]
    OfferNotFound(OfferId),

    /// No order with this id is known.
    #[error("GT_ERR_102: Order not found: {0}")]
    OrderNotFound(OrderId),

    /// An offer with this id was already registered.
    #[error("GT_ERR_103: Offer already registered: {0}")]
    DuplicateOffer(OfferId),

    /// The offer was withdrawn and accepts no new claims.
    #[error("GT_ERR_104: Offer withdrawn: {0}")]
    OfferWithdrawn(OfferId),

    /// The requested quantity exceeds every block the offer ever had.
    #[error("GT_ERR_105: Quantity {requested} exceeds offer {offer_id} total of {total} blocks")]
    QuantityExceedsOffer {
        offer_id: OfferId,
        requested: u64,
        total: u64,
    },

    /// A client idempotency key was reused with a different request body.
    #[error("GT_ERR_106: Idempotency key {key} reused with a different request on {endpoint}")]
    IdempotencyKeyReuse { endpoint: String, key: String },

    // =================================================================
    // Inventory / Contention Errors (2xx)
    // =================================================================
    /// Fewer blocks were available than requested.
    #[error(
        "GT_ERR_200: Insufficient inventory on offer {offer_id}: requested {requested}, available {available}"
    )]
    InsufficientInventory {
        offer_id: OfferId,
        requested: u64,
        available: u64,
    },

    /// A lease could not be acquired within the bounded wait.
    #[error("GT_ERR_201: Lock contention on {key} after {waited_ms}ms")]
    LockContention { key: String, waited_ms: u64 },

    /// A duplicate of this request is still being processed.
    #[error("GT_ERR_202: Request {key} is still in flight")]
    RequestInFlight { key: String },

    // =================================================================
    // Order State Errors (3xx)
    // =================================================================
    /// The order cannot move between these states.
    #[error("GT_ERR_300: Order {order_id} cannot move from {from} to {to}")]
    InvalidOrderTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// Only PENDING and ACTIVE orders may be cancelled.
    #[error("GT_ERR_301: Order {order_id} cannot be cancelled while {status}")]
    OrderNotCancellable {
        order_id: OrderId,
        status: OrderStatus,
    },

    /// Delivery starts inside the cancellation buffer.
    #[error(
        "GT_ERR_302: Order {order_id} delivery starts in {starts_in_minutes} minutes, inside the {buffer_minutes} minute cancellation buffer"
    )]
    TooCloseToDelivery {
        order_id: OrderId,
        starts_in_minutes: i64,
        buffer_minutes: i64,
    },

    /// The order's escrow is committed to a settlement that has not paid out.
    #[error("GT_ERR_303: Order {order_id} has settlement {trade_id} in progress")]
    SettlementInProgress { order_id: OrderId, trade_id: TradeId },

    // =================================================================
    // Settlement Errors (4xx)
    // =================================================================
    /// No settlement record exists for this trade.
    #[error("GT_ERR_400: No settlement record for trade {0}")]
    SettlementNotFound(TradeId),

    /// The verification window lapsed before an outcome was supplied.
    #[error("GT_ERR_401: Settlement {trade_id} expired at {expired_at}")]
    SettlementExpired {
        trade_id: TradeId,
        expired_at: DateTime<Utc>,
    },

    /// The record already reached a terminal payout state.
    #[error("GT_ERR_402: Settlement {trade_id} already settled as {status}")]
    AlreadySettled {
        trade_id: TradeId,
        status: SettlementStatus,
    },

    /// The settlement cannot move between these states.
    #[error("GT_ERR_403: Settlement {trade_id} cannot move from {from} to {to}")]
    InvalidSettlementTransition {
        trade_id: TradeId,
        from: SettlementStatus,
        to: SettlementStatus,
    },

    /// A different verification outcome was already recorded.
    #[error("GT_ERR_404: Settlement {trade_id} already verified as {recorded}")]
    OutcomeAlreadyRecorded {
        trade_id: TradeId,
        recorded: VerificationOutcome,
    },

    /// Payout was requested before any verification outcome.
    #[error("GT_ERR_405: Settlement {0} has no verification outcome")]
    OutcomeMissing(TradeId),

    /// The requested payout action contradicts the verification outcome.
    #[error("GT_ERR_406: Settlement {trade_id} verified {outcome}, cannot {action}")]
    PayoutActionMismatch {
        trade_id: TradeId,
        outcome: VerificationOutcome,
        action: PayoutAction,
    },

    // =================================================================
    // Lease / Idempotency Errors (5xx)
    // =================================================================
    /// The lease expired and was taken over before it could be renewed.
    #[error("GT_ERR_500: Lease on {key} was lost")]
    LeaseLost { key: String },

    /// Every idempotency slot holds a live claim; nothing can be evicted.
    #[error("GT_ERR_501: Idempotency store full: {capacity} claims in flight")]
    IdempotencyStoreFull { capacity: usize },

    // =================================================================
    // Account Ledger Errors (6xx)
    // =================================================================
    /// Not enough available balance to perform the operation.
    #[error("GT_ERR_600: Insufficient balance for {account}: need {needed}, have {available}")]
    InsufficientBalance {
        account: UserId,
        needed: Decimal,
        available: Decimal,
    },

    /// Not enough escrowed balance to release or refund.
    #[error("GT_ERR_601: Insufficient escrow for {account}: need {needed}, held {held}")]
    InsufficientEscrow {
        account: UserId,
        needed: Decimal,
        held: Decimal,
    },

    /// Money was created or destroyed by a movement.
    #[error("GT_ERR_602: Supply invariant violation: {reason}")]
    SupplyInvariantViolation { reason: String },

    // =================================================================
    // Side-effect Delivery Errors (7xx)
    // =================================================================
    /// The external catalog could not be reached.
    #[error("GT_ERR_700: Catalog unavailable: {reason}")]
    CatalogUnavailable { reason: String },

    /// A callback could not be delivered.
    #[error("GT_ERR_701: Callback delivery to {uri} failed: {reason}")]
    CallbackDelivery { uri: String, reason: String },

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("GT_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Serialization / deserialization error.
    #[error("GT_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config file, missing fields, etc.).
    #[error("GT_ERR_902: Configuration error: {0}")]
    Configuration(String),
}

impl GridError {
    /// The taxonomy class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidRequest { .. }
            | Self::OfferNotFound(_)
            | Self::OrderNotFound(_)
            | Self::DuplicateOffer(_)
            | Self::OfferWithdrawn(_)
            | Self::QuantityExceedsOffer { .. }
            | Self::IdempotencyKeyReuse { .. }
            | Self::SettlementNotFound(_) => ErrorClass::Validation,
            Self::InsufficientInventory { .. }
            | Self::LockContention { .. }
            | Self::RequestInFlight { .. }
            | Self::IdempotencyStoreFull { .. }
            | Self::InsufficientBalance { .. } => ErrorClass::Contention,
            Self::InvalidOrderTransition { .. }
            | Self::OrderNotCancellable { .. }
            | Self::TooCloseToDelivery { .. }
            | Self::SettlementInProgress { .. }
            | Self::AlreadySettled { .. }
            | Self::InvalidSettlementTransition { .. }
            | Self::OutcomeAlreadyRecorded { .. }
            | Self::OutcomeMissing(_)
            | Self::PayoutActionMismatch { .. }
            | Self::LeaseLost { .. } => ErrorClass::StateConflict,
            Self::SettlementExpired { .. } => ErrorClass::Expiry,
            Self::CatalogUnavailable { .. } | Self::CallbackDelivery { .. } => {
                ErrorClass::SideEffect
            }
            Self::InsufficientEscrow { .. }
            | Self::SupplyInvariantViolation { .. }
            | Self::Internal(_)
            | Self::Serialization(_)
            | Self::Configuration(_) => ErrorClass::Internal,
        }
    }

    /// Stable code carried in protocol `error.code` fields.
    #[must_use]
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::OfferNotFound(_) => "OFFER_NOT_FOUND",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::DuplicateOffer(_) => "DUPLICATE_OFFER",
            Self::OfferWithdrawn(_) => "OFFER_WITHDRAWN",
            Self::QuantityExceedsOffer { .. } => "QUANTITY_EXCEEDS_OFFER",
            Self::IdempotencyKeyReuse { .. } => "IDEMPOTENCY_KEY_REUSE",
            Self::InsufficientInventory { .. } => "INSUFFICIENT_INVENTORY",
            Self::LockContention { .. } => "LOCK_CONTENTION",
            Self::RequestInFlight { .. } => "REQUEST_IN_FLIGHT",
            Self::InvalidOrderTransition { .. } => "INVALID_ORDER_TRANSITION",
            Self::OrderNotCancellable { .. } => "ORDER_NOT_CANCELLABLE",
            Self::TooCloseToDelivery { .. } => "TOO_CLOSE_TO_DELIVERY",
            Self::SettlementInProgress { .. } => "SETTLEMENT_IN_PROGRESS",
            Self::SettlementNotFound(_) => "ERROR_NO_RECORD",
            Self::SettlementExpired { .. } => "ERROR_EXPIRED",
            Self::AlreadySettled { .. } => "ERROR_ALREADY_SETTLED",
            Self::InvalidSettlementTransition { .. } => "INVALID_SETTLEMENT_TRANSITION",
            Self::OutcomeAlreadyRecorded { .. } => "OUTCOME_ALREADY_RECORDED",
            Self::OutcomeMissing(_) => "OUTCOME_MISSING",
            Self::PayoutActionMismatch { .. } => "PAYOUT_ACTION_MISMATCH",
            Self::LeaseLost { .. } => "LEASE_LOST",
            Self::IdempotencyStoreFull { .. } => "IDEMPOTENCY_STORE_FULL",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::InsufficientEscrow { .. } => "INSUFFICIENT_ESCROW",
            Self::SupplyInvariantViolation { .. } => "SUPPLY_INVARIANT_VIOLATION",
            Self::CatalogUnavailable { .. } => "CATALOG_UNAVAILABLE",
            Self::CallbackDelivery { .. } => "CALLBACK_DELIVERY_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    /// Whether the caller may retry (possibly with a smaller quantity).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Contention
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, GridError>;

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_contains_prefix() {
        let err = GridError::OrderNotFound(OrderId::new());
        let msg = format!("{err}");
        assert!(msg.starts_with("GT_ERR_102"), "Got: {msg}");
    }

    #[test]
    fn insufficient_inventory_reports_shortfall() {
        let err = GridError::InsufficientInventory {
            offer_id: OfferId::new(),
            requested: 6,
            available: 4,
        };
        let msg = format!("{err}");
        assert!(msg.contains("GT_ERR_200"));
        assert!(msg.contains("requested 6"));
        assert!(msg.contains("available 4"));
        assert_eq!(err.wire_code(), "INSUFFICIENT_INVENTORY");
        assert!(err.is_retryable());
    }

    #[test]
    fn settlement_errors_use_status_wire_codes() {
        let trade = TradeId::new("trade-1");
        assert_eq!(
            GridError::SettlementNotFound(trade.clone()).wire_code(),
            "ERROR_NO_RECORD"
        );
        let expired = GridError::SettlementExpired {
            trade_id: trade.clone(),
            expired_at: Utc::now(),
        };
        assert_eq!(expired.wire_code(), "ERROR_EXPIRED");
        assert_eq!(expired.class(), ErrorClass::Expiry);
        let settled = GridError::AlreadySettled {
            trade_id: trade,
            status: SettlementStatus::Released,
        };
        assert_eq!(settled.wire_code(), "ERROR_ALREADY_SETTLED");
        assert!(!settled.is_retryable());
    }

    #[test]
    fn too_close_to_delivery_is_terminal() {
        let err = GridError::TooCloseToDelivery {
            order_id: OrderId::new(),
            starts_in_minutes: 10,
            buffer_minutes: 30,
        };
        assert_eq!(err.class(), ErrorClass::StateConflict);
        assert!(!err.is_retryable());
    }

    #[test]
    fn all_errors_have_gt_err_prefix() {
        let errors: Vec<GridError> = vec![
            GridError::LockContention {
                key: "order:1".into(),
                waited_ms: 10,
            },
            GridError::LeaseLost {
                key: "trade:1".into(),
            },
            GridError::CatalogUnavailable {
                reason: "timeout".into(),
            },
            GridError::IdempotencyStoreFull { capacity: 2 },
            GridError::SettlementInProgress {
                order_id: OrderId::new(),
                trade_id: TradeId::new("trade-1"),
            },
            GridError::Internal("test".into()),
            GridError::Configuration("bad".into()),
        ];
        for err in errors {
            let msg = format!("{err}");
            assert!(msg.starts_with("GT_ERR_"), "Error missing GT_ERR_ prefix: {msg}");
        }
    }

    #[test]
    fn side_effect_class() {
        let err = GridError::CallbackDelivery {
            uri: "http://bap".into(),
            reason: "503".into(),
        };
        assert_eq!(err.class(), ErrorClass::SideEffect);
    }
}
