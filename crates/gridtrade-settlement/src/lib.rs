//! # gridtrade-settlement
//!
//! Escrow settlement, one record per trade:
//!
//! ```text
//!   INITIATED ──confirm_funded──▶ FUNDED ──verify_outcome──▶ FUNDED(+outcome)
//!       │                           │                              │
//!       │ deadline                  │ deadline, no outcome          │ confirm_payout
//!       ▼                           ▼                              ▼
//!   ERROR_EXPIRED ◀─────────────────┘                     RELEASED | REFUNDED
//!       │
//!       └──reconcile_expired──▶ REFUNDED (manually reconciled)
//! ```
//!
//! Every transition runs under the per-trade lease and every call returns a
//! [`SettlementView`](gridtrade_types::SettlementView) with the progress
//! steps. Repeating a completed step is a no-op.

pub mod engine;
pub mod reconcile;

pub use engine::SettlementEngine;
