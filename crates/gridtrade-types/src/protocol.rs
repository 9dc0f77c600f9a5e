//! Wire messages for the ack-then-callback protocol.
//!
//! Every mutating action arrives as a [`Request`], is answered synchronously
//! with an [`AckResponse`], and its real outcome is later delivered to the
//! caller's callback address as a [`Callback`] whose action is the matching
//! `on_*` variant. All three share the same [`Context`] so the caller can
//! correlate them by transaction id and message id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    CancelledBy, ErrorClass, FulfillmentState, GridError, MessageId, Offer, OfferId, Order,
    OrderId, OrderStatus, PaymentStatus, Quote, SettlementStatus, TransactionId, UserId,
};

/// Protocol action names, requests and their callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Select,
    Init,
    Confirm,
    Status,
    Cancel,
    OnSelect,
    OnInit,
    OnConfirm,
    OnStatus,
    OnCancel,
}

impl Action {
    /// The `on_*` action answering this request action.
    #[must_use]
    pub fn callback(self) -> Option<Self> {
        match self {
            Self::Select => Some(Self::OnSelect),
            Self::Init => Some(Self::OnInit),
            Self::Confirm => Some(Self::OnConfirm),
            Self::Status => Some(Self::OnStatus),
            Self::Cancel => Some(Self::OnCancel),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_callback(self) -> bool {
        self.callback().is_none()
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Init => "init",
            Self::Confirm => "confirm",
            Self::Status => "status",
            Self::Cancel => "cancel",
            Self::OnSelect => "on_select",
            Self::OnInit => "on_init",
            Self::OnConfirm => "on_confirm",
            Self::OnStatus => "on_status",
            Self::OnCancel => "on_cancel",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation header shared by requests, acks and callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub transaction_id: TransactionId,
    pub message_id: MessageId,
    pub action: Action,
    /// Where the `on_*` callback is delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_uri: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Context {
    #[must_use]
    pub fn new(
        transaction_id: impl Into<TransactionId>,
        message_id: impl Into<MessageId>,
        action: Action,
        callback_uri: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            message_id: message_id.into(),
            action,
            callback_uri: Some(callback_uri.into()),
            timestamp,
        }
    }

    /// The context of the callback answering this request.
    #[must_use]
    pub fn for_callback(&self, action: Action, at: DateTime<Utc>) -> Self {
        Self {
            transaction_id: self.transaction_id.clone(),
            message_id: self.message_id.clone(),
            action,
            callback_uri: self.callback_uri.clone(),
            timestamp: at,
        }
    }
}

/// An inbound request: context plus action-specific message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request<T> {
    pub context: Context,
    pub message: T,
}

impl<T> Request<T> {
    pub fn new(context: Context, message: T) -> Self {
        Self { context, message }
    }
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectMessage {
    pub offer_id: OfferId,
    pub quantity: u64,
}

/// One requested line of an init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitItem {
    pub offer_id: OfferId,
    pub quantity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitMessage {
    pub buyer_id: UserId,
    /// When set, every offer must belong to this provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<UserId>,
    pub items: Vec<InitItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmMessage {
    pub order_id: OrderId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub order_id: OrderId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelMessage {
    pub order_id: OrderId,
    pub cancelled_by: CancelledBy,
    #[serde(default)]
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Acknowledgements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    Ack,
    Nack,
}

/// Synchronous answer: was the request well-formed and actionable in principle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl AckResponse {
    #[must_use]
    pub fn ack() -> Self {
        Self {
            status: AckStatus::Ack,
            error: None,
        }
    }

    #[must_use]
    pub fn nack(err: &GridError) -> Self {
        Self {
            status: AckStatus::Nack,
            error: Some(WireError::from(err)),
        }
    }

    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.status == AckStatus::Ack
    }
}

/// Boundary rendering of a [`GridError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Stable machine-readable code, e.g. `INSUFFICIENT_INVENTORY`.
    pub code: String,
    pub class: ErrorClass,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortfall: Option<Shortfall>,
}

/// How far an inventory claim fell short.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    pub offer_id: OfferId,
    pub requested: u64,
    pub available: u64,
    pub missing: u64,
}

impl From<&GridError> for WireError {
    fn from(err: &GridError) -> Self {
        let shortfall = match err {
            GridError::InsufficientInventory {
                offer_id,
                requested,
                available,
            } => Some(Shortfall {
                offer_id: *offer_id,
                requested: *requested,
                available: *available,
                missing: requested.saturating_sub(*available),
            }),
            _ => None,
        };
        Self {
            code: err.wire_code().to_string(),
            class: err.class(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            shortfall,
        }
    }
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// `on_select`: the quote for the requested quantity and live availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnSelect {
    pub offer: Offer,
    pub quantity: u64,
    pub available: u64,
    pub quote: Quote,
}

/// `on_status`: where an order stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnStatus {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub fulfillment: FulfillmentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement: Option<SettlementStatus>,
}

/// Result payload of a callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackMessage {
    OnSelect(OnSelect),
    OnInit(Box<Order>),
    OnConfirm(Box<Order>),
    OnStatus(OnStatus),
    OnCancel(Box<Order>),
}

/// Asynchronous outcome delivered to the caller's callback address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Callback {
    pub context: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<CallbackMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Callback {
    #[must_use]
    pub fn success(context: Context, message: CallbackMessage) -> Self {
        Self {
            context,
            message: Some(message),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(context: Context, err: &GridError) -> Self {
        Self {
            context,
            message: None,
            error: Some(WireError::from(err)),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_request_action_has_a_callback() {
        for action in [
            Action::Select,
            Action::Init,
            Action::Confirm,
            Action::Status,
            Action::Cancel,
        ] {
            let cb = action.callback().unwrap();
            assert!(cb.is_callback());
            assert_eq!(cb.as_str(), format!("on_{}", action.as_str()));
        }
    }

    #[test]
    fn action_wire_names() {
        assert_eq!(serde_json::to_string(&Action::OnConfirm).unwrap(), "\"on_confirm\"");
        let back: Action = serde_json::from_str("\"cancel\"").unwrap();
        assert_eq!(back, Action::Cancel);
    }

    #[test]
    fn nack_carries_shortfall() {
        let offer_id = OfferId::new();
        let err = GridError::InsufficientInventory {
            offer_id,
            requested: 6,
            available: 4,
        };
        let ack = AckResponse::nack(&err);
        assert!(!ack.is_ack());
        let wire = ack.error.unwrap();
        assert_eq!(wire.code, "INSUFFICIENT_INVENTORY");
        assert!(wire.retryable);
        assert_eq!(wire.shortfall.unwrap().missing, 2);
    }

    #[test]
    fn ack_serializes_without_error() {
        let json = serde_json::to_value(AckResponse::ack()).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "ACK" }));
    }

    #[test]
    fn callback_context_keeps_correlation() {
        let ctx = Context::new("txn-1", "msg-1", Action::Confirm, "http://bap/cb", Utc::now());
        let cb_ctx = ctx.for_callback(Action::OnConfirm, Utc::now());
        assert_eq!(cb_ctx.transaction_id, ctx.transaction_id);
        assert_eq!(cb_ctx.message_id, ctx.message_id);
        assert_eq!(cb_ctx.action, Action::OnConfirm);
    }
}
