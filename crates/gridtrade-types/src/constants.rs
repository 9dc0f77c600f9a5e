//! System-wide constants for the GridTrade marketplace.

/// Default settlement currency.
pub const DEFAULT_CURRENCY: &str = "INR";

/// Default lease TTL for order and trade locks in milliseconds.
pub const DEFAULT_LEASE_TTL_MS: u64 = 30_000;

/// Default bounded wait for lease acquisition in milliseconds.
pub const DEFAULT_LOCK_ACQUIRE_TIMEOUT_MS: u64 = 5_000;

/// Poll interval between lease acquisition attempts in milliseconds.
pub const DEFAULT_LOCK_RETRY_INTERVAL_MS: u64 = 25;

/// How long a completed idempotency record is replayable, in seconds.
pub const DEFAULT_IDEMPOTENCY_TTL_SECS: i64 = 86_400;

/// Processing lease for an idempotency key in milliseconds.
pub const DEFAULT_IDEMPOTENCY_PROCESSING_LEASE_MS: i64 = 30_000;

/// Maximum idempotency records retained before the oldest are evicted.
pub const DEFAULT_IDEMPOTENCY_MAX_ENTRIES: usize = 500_000;

/// Platform fee rate in basis points (250 = 2.5 %).
pub const DEFAULT_FEE_RATE_BPS: i64 = 250;

/// Platform fee cap in currency units.
pub const DEFAULT_FEE_CAP: i64 = 500;

/// Cancellations are refused when delivery starts within this many minutes.
pub const DEFAULT_CANCELLATION_BUFFER_MINUTES: i64 = 30;

/// PENDING orders older than this are expired by the reconciler, in seconds.
pub const DEFAULT_PENDING_ORDER_TTL_SECS: i64 = 900;

/// Default settlement verification window in seconds (24h).
pub const DEFAULT_SETTLEMENT_EXPIRY_SECS: i64 = 86_400;

/// Maximum callback delivery attempts before dead-lettering.
pub const DEFAULT_CALLBACK_MAX_ATTEMPTS: u32 = 5;

/// Base callback retry backoff in milliseconds.
pub const DEFAULT_CALLBACK_BASE_BACKOFF_MS: u64 = 200;

/// Maximum callback retry backoff in milliseconds.
pub const DEFAULT_CALLBACK_MAX_BACKOFF_MS: u64 = 30_000;

/// Reconciler sweep interval in seconds.
pub const DEFAULT_RECONCILIATION_INTERVAL_SECS: u64 = 60;

/// Initial trust score for every account.
pub const INITIAL_TRUST_SCORE: i64 = 1;

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Marketplace name.
pub const MARKETPLACE_NAME: &str = "GridTrade";
