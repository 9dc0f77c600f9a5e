//! # gridtrade-protocol
//!
//! The outer surface of the marketplace.
//!
//! ```text
//!   caller ──request──▶ Orchestrator ──ACK/NACK──▶ caller
//!                           │ spawn
//!                           ▼
//!                    OrderLifecycle / SettlementEngine
//!                           │
//!                           ▼
//!                    CallbackDispatcher ──on_*──▶ CallbackTransport ──▶ caller
//!                           │ retries exhausted
//!                           ▼
//!                      dead letters
//! ```
//!
//! Settlement is driven directly through [`SettlementApi`]; the
//! [`Reconciler`] repairs whatever a crashed or abandoned flow left behind.
//! [`Marketplace`] wires all of it from one [`MarketplaceConfig`](gridtrade_types::MarketplaceConfig).

pub mod catalog;
pub mod dispatcher;
pub mod marketplace;
pub mod orchestrator;
pub mod reconciler;
pub mod settlement_api;
pub mod transport;

pub use catalog::{FallbackCatalog, LedgerCatalog, OfferCatalog};
pub use dispatcher::{CallbackDispatcher, DeadLetter, DispatchStats};
pub use marketplace::{Marketplace, MarketplaceParts};
pub use orchestrator::Orchestrator;
pub use reconciler::{ReconciliationReport, Reconciler};
pub use settlement_api::{SettlementApi, SettlementReply};
pub use transport::{CallbackTransport, LoggingTransport};

#[cfg(any(test, feature = "test-helpers"))]
pub use transport::RecordingTransport;
