//! # gridtrade-guard
//!
//! Concurrency guards shared by the order and settlement layers.
//!
//! - [`LockManager`]: short-lived, renewable exclusive leases keyed by an
//!   order id or a trade id. Leases expire on their own so a crashed holder
//!   never strands a key, and acquisition waits a bounded time before
//!   failing with lock contention.
//! - [`IdempotencyGuard`]: atomic claim-then-process deduplication for
//!   inbound protocol messages (keyed by message id) and client requests
//!   (keyed by endpoint and client key).

pub mod idempotency;
pub mod lock_manager;

pub use idempotency::{Claim, IdempotencyGuard, IdempotencyKey, IdempotencyStatus, fingerprint};
pub use lock_manager::{LeaseGuard, LockDomain, LockKey, LockManager};
