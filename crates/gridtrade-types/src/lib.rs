//! # gridtrade-types
//!
//! Shared types, errors, and configuration for the **GridTrade** energy
//! marketplace.
//!
//! This crate is the leaf dependency of the workspace; every other crate
//! depends on it. It defines:
//!
//! - **Identifiers**: [`OfferId`], [`BlockId`], [`OrderId`], [`UserId`], [`TransactionId`], [`MessageId`], [`ItemId`], [`TradeId`]
//! - **Offer model**: [`Offer`], [`OfferStatus`], [`DeliveryWindow`], [`Quote`]
//! - **Block model**: [`Block`], [`BlockStatus`], [`BlockStats`]
//! - **Order model**: [`Order`], [`OrderItem`], [`OrderStatus`], [`PaymentStatus`], [`Cancellation`], [`PenaltySplit`]
//! - **Settlement model**: [`SettlementRecord`], [`SettlementStatus`], [`VerificationOutcome`], [`PayoutAction`], [`SettlementView`]
//! - **Balance model**: [`BalanceEntry`], [`Currency`]
//! - **Protocol messages**: [`Context`], [`Request`], [`AckResponse`], [`Callback`]
//! - **Configuration**: [`MarketplaceConfig`] and its sections
//! - **Time**: [`Clock`], [`SystemClock`]
//! - **Errors**: [`GridError`] with `GT_ERR_` prefix codes and the [`ErrorClass`] taxonomy
//! - **Constants**: system-wide limits and defaults

pub mod balance;
pub mod block;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod ids;
pub mod offer;
pub mod order;
pub mod protocol;
pub mod settlement;

// Re-export all primary types at crate root for ergonomic imports:
//   use gridtrade_types::{Offer, Order, SettlementRecord, GridError, ...};

pub use balance::*;
pub use block::*;
pub use clock::*;
pub use config::*;
pub use error::*;
pub use ids::*;
pub use offer::*;
pub use order::*;
pub use protocol::*;
pub use settlement::*;

// Constants are accessed via `gridtrade_types::constants::FOO`
// (not re-exported to avoid name collisions).
