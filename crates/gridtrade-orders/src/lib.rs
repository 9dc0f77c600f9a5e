//! # gridtrade-orders
//!
//! Order lifecycle: DRAFT → PENDING → ACTIVE → {COMPLETED, CANCELLED}.
//!
//! [`OrderLifecycle`] owns the transitions. Reservation (`init`) claims
//! blocks without a lock because nothing else can reference a fresh order;
//! confirm, cancel and complete run under the per-order lease. After every
//! successful transition the remaining availability of the touched offers
//! is re-published through a [`CatalogPublisher`], best-effort.
//!
//! An ACTIVE order whose escrow is committed to a settlement cannot be
//! cancelled until that settlement pays out; the [`SettlementGate`] reports
//! the settlement side.

pub mod catalog;
pub mod lifecycle;
pub mod policy;
pub mod settlement_gate;
pub mod store;
pub mod trust;

pub use catalog::{CatalogPublisher, NoopPublisher};
pub use lifecycle::OrderLifecycle;
pub use policy::{allocate_pro_rata, penalty_split};
pub use settlement_gate::{NoSettlements, SettlementGate};
pub use store::{DraftOutcome, OrderStore};
pub use trust::TrustRegistry;

#[cfg(any(test, feature = "test-helpers"))]
pub use catalog::{FailingPublisher, RecordingPublisher};
