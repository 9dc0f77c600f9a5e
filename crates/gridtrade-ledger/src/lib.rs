//! # gridtrade-ledger
//!
//! The two ledgers every order flows through.
//!
//! - [`BlockLedger`]: the inventory primitive. Each offer owns a fixed set
//!   of blocks; claims, releases and sales against one offer serialise on
//!   that offer's lock, so the count of RESERVED + SOLD blocks can never
//!   exceed the set size.
//! - [`AccountLedger`]: available / escrowed balances per account and
//!   currency, each account behind its own lock, with a journal of every
//!   movement and a supply conservation check.

pub mod account_ledger;
pub mod block_ledger;
pub mod conservation;

pub use account_ledger::{AccountLedger, EntryKind, LedgerEntry, PLATFORM_ACCOUNT};
pub use block_ledger::BlockLedger;
pub use conservation::SupplyTracker;
