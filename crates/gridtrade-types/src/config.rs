//! Configuration types for a GridTrade marketplace deployment.
//!
//! Every section deserialises with defaults, so a config file only needs
//! to name the values it overrides.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{GridError, Result, constants};

/// Top-level marketplace configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketplaceConfig {
    pub currency: CurrencyConfig,
    pub locks: LockConfig,
    pub idempotency: IdempotencyConfig,
    pub fees: FeeSchedule,
    pub cancellation: CancellationPolicy,
    pub orders: OrderConfig,
    pub settlement: SettlementConfig,
    pub callbacks: CallbackConfig,
    pub reconciliation: ReconciliationConfig,
    pub logging: LoggingConfig,
}

impl MarketplaceConfig {
    /// Reject configurations that would break marketplace invariants.
    pub fn validate(&self) -> Result<()> {
        if self.currency.code.trim().is_empty() {
            return Err(GridError::Configuration("currency.code is empty".into()));
        }
        if self.locks.lease_ttl_ms == 0 {
            return Err(GridError::Configuration("locks.lease_ttl_ms must be > 0".into()));
        }
        if self.locks.retry_interval_ms == 0 {
            return Err(GridError::Configuration(
                "locks.retry_interval_ms must be > 0".into(),
            ));
        }
        if self.idempotency.max_entries == 0 {
            return Err(GridError::Configuration(
                "idempotency.max_entries must be > 0".into(),
            ));
        }
        if self.fees.rate < Decimal::ZERO || self.fees.cap < Decimal::ZERO {
            return Err(GridError::Configuration("fees must be non-negative".into()));
        }
        self.cancellation.buyer.validate("cancellation.buyer")?;
        self.cancellation.provider.validate("cancellation.provider")?;
        if self.cancellation.buffer_minutes < 0 {
            return Err(GridError::Configuration(
                "cancellation.buffer_minutes must be >= 0".into(),
            ));
        }
        if self.settlement.default_expiry_secs <= 0 {
            return Err(GridError::Configuration(
                "settlement.default_expiry_secs must be > 0".into(),
            ));
        }
        if self.callbacks.max_attempts == 0 {
            return Err(GridError::Configuration(
                "callbacks.max_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Settlement currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrencyConfig {
    pub code: String,
}

impl Default for CurrencyConfig {
    fn default() -> Self {
        Self {
            code: constants::DEFAULT_CURRENCY.to_string(),
        }
    }
}

/// Lease settings for the per-order and per-trade lock domains.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease lifetime; a crashed holder strands a key for at most this long.
    pub lease_ttl_ms: u64,
    /// Bounded wait before failing with lock contention.
    pub acquire_timeout_ms: u64,
    /// Poll interval while waiting.
    pub retry_interval_ms: u64,
}

impl LockConfig {
    #[must_use]
    pub fn lease_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lease_ttl_ms)
    }

    #[must_use]
    pub fn acquire_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.acquire_timeout_ms)
    }

    #[must_use]
    pub fn retry_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: constants::DEFAULT_LEASE_TTL_MS,
            acquire_timeout_ms: constants::DEFAULT_LOCK_ACQUIRE_TIMEOUT_MS,
            retry_interval_ms: constants::DEFAULT_LOCK_RETRY_INTERVAL_MS,
        }
    }
}

/// Idempotency record retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long a completed response is replayed.
    pub record_ttl_secs: i64,
    /// How long a processing claim is honoured before another caller may take over.
    pub processing_lease_ms: i64,
    /// Capacity before the oldest records are evicted.
    pub max_entries: usize,
}

impl IdempotencyConfig {
    #[must_use]
    pub fn record_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.record_ttl_secs)
    }

    #[must_use]
    pub fn processing_lease(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.processing_lease_ms)
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            record_ttl_secs: constants::DEFAULT_IDEMPOTENCY_TTL_SECS,
            processing_lease_ms: constants::DEFAULT_IDEMPOTENCY_PROCESSING_LEASE_MS,
            max_entries: constants::DEFAULT_IDEMPOTENCY_MAX_ENTRIES,
        }
    }
}

/// Platform fee: `min(cap, principal × rate)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeSchedule {
    pub rate: Decimal,
    pub cap: Decimal,
}

impl FeeSchedule {
    #[must_use]
    pub fn fee_for(&self, principal: Decimal) -> Decimal {
        (principal * self.rate).min(self.cap)
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            rate: Decimal::new(constants::DEFAULT_FEE_RATE_BPS, 4),
            cap: Decimal::new(constants::DEFAULT_FEE_CAP, 0),
        }
    }
}

/// Cancellation rules, keyed by who cancels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CancellationPolicy {
    /// Cancellation is refused when delivery starts within this many minutes.
    pub buffer_minutes: i64,
    pub buyer: CancellationTerms,
    pub provider: CancellationTerms,
}

impl CancellationPolicy {
    #[must_use]
    pub fn buffer(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.buffer_minutes)
    }
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self {
            buffer_minutes: constants::DEFAULT_CANCELLATION_BUFFER_MINUTES,
            buyer: CancellationTerms {
                refund_rate: Decimal::new(90, 2),
                compensation_rate: Decimal::new(5, 2),
                penalty_rate: Decimal::ZERO,
                trust_penalty_per_unit: Decimal::new(1, 2),
            },
            provider: CancellationTerms {
                refund_rate: Decimal::ONE,
                compensation_rate: Decimal::ZERO,
                penalty_rate: Decimal::new(10, 2),
                trust_penalty_per_unit: Decimal::new(2, 2),
            },
        }
    }
}

/// The split applied when one party cancels.
///
/// Rates apply to the escrowed total; whatever is neither refunded nor
/// compensated is retained as platform fee. `penalty_rate` applies to the
/// principal and is charged to the provider on top of the split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationTerms {
    pub refund_rate: Decimal,
    pub compensation_rate: Decimal,
    pub penalty_rate: Decimal,
    pub trust_penalty_per_unit: Decimal,
}

impl CancellationTerms {
    fn validate(&self, section: &str) -> Result<()> {
        let rates = [
            self.refund_rate,
            self.compensation_rate,
            self.penalty_rate,
            self.trust_penalty_per_unit,
        ];
        if rates.iter().any(|r| *r < Decimal::ZERO) {
            return Err(GridError::Configuration(format!(
                "{section}: rates must be non-negative"
            )));
        }
        if self.refund_rate + self.compensation_rate > Decimal::ONE {
            return Err(GridError::Configuration(format!(
                "{section}: refund_rate + compensation_rate exceeds 1"
            )));
        }
        Ok(())
    }
}

/// Order lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    /// PENDING orders older than this are expired by the reconciler.
    pub pending_ttl_secs: i64,
}

impl OrderConfig {
    #[must_use]
    pub fn pending_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_ttl_secs)
    }
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: constants::DEFAULT_PENDING_ORDER_TTL_SECS,
        }
    }
}

/// Settlement engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Verification window used when a caller does not supply one.
    pub default_expiry_secs: i64,
}

impl SettlementConfig {
    #[must_use]
    pub fn default_expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_expiry_secs)
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            default_expiry_secs: constants::DEFAULT_SETTLEMENT_EXPIRY_SECS,
        }
    }
}

/// Callback delivery retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl CallbackConfig {
    /// Exponential backoff before retry number `attempt` (1-based), capped.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let delay = self
            .base_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        std::time::Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_CALLBACK_MAX_ATTEMPTS,
            base_backoff_ms: constants::DEFAULT_CALLBACK_BASE_BACKOFF_MS,
            max_backoff_ms: constants::DEFAULT_CALLBACK_MAX_BACKOFF_MS,
        }
    }
}

/// Background reconciliation sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: constants::DEFAULT_RECONCILIATION_INTERVAL_SECS,
        }
    }
}

/// Log output settings for the node binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,gridtrade=debug".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        MarketplaceConfig::default().validate().unwrap();
    }

    #[test]
    fn fee_is_capped() {
        let fees = FeeSchedule::default();
        assert_eq!(fees.fee_for(Decimal::new(100, 0)), Decimal::new(25, 1));
        assert_eq!(fees.fee_for(Decimal::new(1_000_000, 0)), Decimal::new(500, 0));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = CallbackConfig {
            max_attempts: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(cfg.backoff(1).as_millis(), 100);
        assert_eq!(cfg.backoff(2).as_millis(), 200);
        assert_eq!(cfg.backoff(3).as_millis(), 350);
    }

    #[test]
    fn overlapping_cancellation_rates_rejected() {
        let mut cfg = MarketplaceConfig::default();
        cfg.cancellation.buyer.refund_rate = Decimal::new(98, 2);
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, GridError::Configuration(_)));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: MarketplaceConfig =
            serde_json::from_str(r#"{"locks": {"lease_ttl_ms": 1000}}"#).unwrap();
        assert_eq!(cfg.locks.lease_ttl_ms, 1000);
        assert_eq!(
            cfg.locks.acquire_timeout_ms,
            constants::DEFAULT_LOCK_ACQUIRE_TIMEOUT_MS
        );
        assert_eq!(cfg.currency.code, "INR");
    }
}
