//! Ack-then-callback handling of select, init, confirm, status and cancel.
//!
//! ## Request flow
//!
//! ```text
//!   request ─▶ context checks ──bad──▶ NACK (not cached)
//!                  │
//!                  ▼
//!   claim message id ──completed──▶ cached ACK/NACK (no callback)
//!                  │ ──in flight──▶ wait for the first copy's answer
//!                  ▼ accepted
//!   request checks ──bad──▶ NACK (cached)
//!                  │
//!                  ▼
//!   ACK (cached) ─▶ spawn transition ─▶ on_<action> via CallbackDispatcher
//! ```
//!
//! The ack only says the request was well-formed and actionable in
//! principle. Outcomes that depend on live state (a short claim, a
//! cancellation inside the buffer) arrive in the callback's `error`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gridtrade_guard::{Claim, IdempotencyGuard, IdempotencyKey};
use gridtrade_orders::OrderLifecycle;
use gridtrade_settlement::SettlementEngine;
use gridtrade_types::{
    AckResponse, Action, CallbackMessage, Callback, CancelMessage, Clock, ConfirmMessage, Context,
    GridError, InitMessage, OfferId, OnSelect, OnStatus, OrderId, Quote, Request, Result,
    SelectMessage, StatusMessage, TradeId,
};
use tracing::{debug, info, warn};

use crate::catalog::OfferCatalog;
use crate::dispatcher::CallbackDispatcher;

/// How long a duplicate waits for the first copy's ack.
const DUPLICATE_ACK_WAIT: Duration = Duration::from_secs(5);

/// Entry point for inbound protocol messages.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    catalog: Arc<dyn OfferCatalog>,
    orders: Arc<OrderLifecycle>,
    settlements: Arc<SettlementEngine>,
    dispatcher: CallbackDispatcher,
    acks: Arc<IdempotencyGuard<AckResponse>>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        catalog: Arc<dyn OfferCatalog>,
        orders: Arc<OrderLifecycle>,
        settlements: Arc<SettlementEngine>,
        dispatcher: CallbackDispatcher,
        acks: Arc<IdempotencyGuard<AckResponse>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog,
            orders,
            settlements,
            dispatcher,
            acks,
            clock,
        }
    }

    // =================================================================
    // Actions
    // =================================================================

    /// `select`: quote `quantity` blocks of one offer. Answered by `on_select`.
    pub async fn select(&self, request: Request<SelectMessage>) -> AckResponse {
        let Request { context, message } = request;
        let SelectMessage { offer_id, quantity } = message;
        self.handle(
            context,
            Action::Select,
            self.check_quantity(offer_id, quantity),
            move |this| async move {
                let offer = this.catalog.offer(offer_id).await?;
                let available = this.catalog.available(offer_id).await?;
                if quantity > available {
                    return Err(GridError::InsufficientInventory {
                        offer_id,
                        requested: quantity,
                        available,
                    });
                }
                let mut quote = Quote::empty(offer.currency.clone());
                quote.add_line(offer.unit_price, quantity);
                Ok(CallbackMessage::OnSelect(OnSelect {
                    offer,
                    quantity,
                    available,
                    quote,
                }))
            },
        )
        .await
    }

    /// `init`: reserve blocks for every item and create the order.
    /// Answered by `on_init` with the PENDING order or the shortfall.
    pub async fn init(&self, request: Request<InitMessage>) -> AckResponse {
        let Request { context, message } = request;
        let transaction_id = context.transaction_id.clone();
        let checks = {
            let this = self.clone();
            let items = message.items.clone();
            async move {
                if items.is_empty() {
                    return Err(GridError::InvalidRequest {
                        reason: "init needs at least one item".into(),
                    });
                }
                for item in &items {
                    this.check_quantity(item.offer_id, item.quantity).await?;
                }
                Ok(())
            }
        };
        self.handle(context, Action::Init, checks, move |this| async move {
            let order = this.orders.init(
                &transaction_id,
                message.buyer_id,
                message.provider_id,
                &message.items,
            )?;
            Ok(CallbackMessage::OnInit(Box::new(order)))
        })
        .await
    }

    /// `confirm`: commit a PENDING order. Answered by `on_confirm`.
    pub async fn confirm(&self, request: Request<ConfirmMessage>) -> AckResponse {
        let Request { context, message } = request;
        let order_id = message.order_id;
        self.handle(
            context,
            Action::Confirm,
            std::future::ready(self.check_order(order_id)),
            move |this| async move {
                let order = this.orders.confirm(order_id).await?;
                Ok(CallbackMessage::OnConfirm(Box::new(order)))
            },
        )
        .await
    }

    /// `status`: report where an order stands. Answered by `on_status`.
    pub async fn status(&self, request: Request<StatusMessage>) -> AckResponse {
        let Request { context, message } = request;
        let order_id = message.order_id;
        self.handle(
            context,
            Action::Status,
            std::future::ready(self.check_order(order_id)),
            move |this| async move {
                let order = this.orders.get(order_id)?;
                let settlement = this
                    .settlements
                    .get(&TradeId::from(order_id))
                    .ok()
                    .map(|view| view.record.status);
                Ok(CallbackMessage::OnStatus(OnStatus {
                    order_id,
                    status: order.status,
                    payment_status: order.payment_status,
                    fulfillment: order.fulfillment(this.clock.now()),
                    settlement,
                }))
            },
        )
        .await
    }

    /// `cancel`: cancel an order under the penalty policy. Answered by `on_cancel`.
    pub async fn cancel(&self, request: Request<CancelMessage>) -> AckResponse {
        let Request { context, message } = request;
        let CancelMessage {
            order_id,
            cancelled_by,
            reason,
        } = message;
        self.handle(
            context,
            Action::Cancel,
            std::future::ready(self.check_order(order_id)),
            move |this| async move {
                let order = this.orders.cancel(order_id, cancelled_by, &reason).await?;
                Ok(CallbackMessage::OnCancel(Box::new(order)))
            },
        )
        .await
    }

    // =================================================================
    // Shared flow
    // =================================================================

    async fn handle<C, F, Fut>(&self, context: Context, expected: Action, checks: C, run: F) -> AckResponse
    where
        C: Future<Output = Result<()>>,
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = Result<CallbackMessage>> + Send + 'static,
    {
        let reply = match validate_context(&context, expected) {
            Ok(reply) => reply,
            Err(err) => {
                info!(
                    action = %expected,
                    transaction_id = %context.transaction_id,
                    message_id = %context.message_id,
                    error = %err,
                    "Request rejected"
                );
                return AckResponse::nack(&err);
            }
        };

        let key = IdempotencyKey::Message(context.message_id.clone());
        match self.acks.begin_processing(&key, None) {
            Ok(Claim::Accepted) => {}
            Ok(Claim::Completed(ack)) => {
                debug!(message_id = %context.message_id, action = %expected, "Replayed message");
                return ack;
            }
            Ok(Claim::InFlight) => return self.await_duplicate(&key).await,
            Err(err) => return AckResponse::nack(&err),
        }

        if let Err(err) = checks.await {
            info!(
                action = %expected,
                transaction_id = %context.transaction_id,
                message_id = %context.message_id,
                code = err.wire_code(),
                error = %err,
                "NACK"
            );
            let ack = AckResponse::nack(&err);
            self.acks.store_result(&key, ack.clone());
            return ack;
        }

        let ack = AckResponse::ack();
        self.acks.store_result(&key, ack.clone());
        info!(
            action = %expected,
            transaction_id = %context.transaction_id,
            message_id = %context.message_id,
            "ACK"
        );

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = run(this.clone()).await;
            let callback_context = context.for_callback(reply, this.clock.now());
            let callback = match outcome {
                Ok(message) => Callback::success(callback_context, message),
                Err(err) => {
                    warn!(
                        action = %expected,
                        transaction_id = %callback_context.transaction_id,
                        message_id = %callback_context.message_id,
                        code = err.wire_code(),
                        error = %err,
                        "Transition failed, reporting in callback"
                    );
                    Callback::failure(callback_context, &err)
                }
            };
            this.dispatcher.dispatch(callback);
        });
        ack
    }

    async fn await_duplicate(&self, key: &IdempotencyKey) -> AckResponse {
        match self.acks.wait_for_result(key, DUPLICATE_ACK_WAIT).await {
            Ok(Some(ack)) => ack,
            Ok(None) => AckResponse::nack(&GridError::RequestInFlight {
                key: key.to_string(),
            }),
            Err(err) => AckResponse::nack(&err),
        }
    }

    /// Nack-level checks on one offer line: positive quantity, known and
    /// published offer, quantity within the offer's total blocks.
    async fn check_quantity(&self, offer_id: OfferId, quantity: u64) -> Result<()> {
        if quantity == 0 {
            return Err(GridError::InvalidRequest {
                reason: "quantity must be positive".into(),
            });
        }
        let offer = self.catalog.offer(offer_id).await?;
        if !offer.is_published() {
            return Err(GridError::OfferWithdrawn(offer_id));
        }
        if quantity > offer.total_units {
            return Err(GridError::QuantityExceedsOffer {
                offer_id,
                requested: quantity,
                total: offer.total_units,
            });
        }
        Ok(())
    }

    fn check_order(&self, order_id: OrderId) -> Result<()> {
        self.orders.get(order_id).map(|_| ())
    }
}

/// Structural checks on the context. Returns the callback action.
fn validate_context(context: &Context, expected: Action) -> Result<Action> {
    if context.transaction_id.is_blank() {
        return Err(GridError::InvalidRequest {
            reason: "transaction id is required".into(),
        });
    }
    if context.message_id.is_blank() {
        return Err(GridError::InvalidRequest {
            reason: "message id is required".into(),
        });
    }
    if context
        .callback_uri
        .as_deref()
        .is_none_or(|uri| uri.trim().is_empty())
    {
        return Err(GridError::InvalidRequest {
            reason: "callback address is required".into(),
        });
    }
    if context.action != expected {
        return Err(GridError::InvalidRequest {
            reason: format!(
                "context action {} does not match endpoint {expected}",
                context.action
            ),
        });
    }
    expected.callback().ok_or_else(|| GridError::InvalidRequest {
        reason: format!("{expected} is not a request action"),
    })
}
