//! Supply conservation.
//!
//! Money only enters the ledger through deposits and only leaves through
//! withdrawals. Every other movement is a transfer between accounts or
//! between an account's available and escrowed halves, so for every
//! currency:
//!
//! ```text
//! Σ(available + escrowed) == Σ(deposits) − Σ(withdrawals)
//! ```

use std::collections::{BTreeSet, HashMap};

use gridtrade_types::{Currency, GridError, Result};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, Default)]
struct Flows {
    deposited: Decimal,
    withdrawn: Decimal,
}

/// Running deposit / withdrawal totals per currency.
#[derive(Debug, Default)]
pub struct SupplyTracker {
    flows: HashMap<Currency, Flows>,
}

impl SupplyTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_deposit(&mut self, currency: &str, amount: Decimal) {
        self.flows.entry(currency.to_string()).or_default().deposited += amount;
    }

    pub fn on_withdrawal(&mut self, currency: &str, amount: Decimal) {
        self.flows.entry(currency.to_string()).or_default().withdrawn += amount;
    }

    /// Money that should exist in `currency` right now.
    #[must_use]
    pub fn expected(&self, currency: &str) -> Decimal {
        self.flows
            .get(currency)
            .map_or(Decimal::ZERO, |f| f.deposited - f.withdrawn)
    }

    /// Compare the ledger's actual supply against the expected supply.
    ///
    /// # Errors
    /// [`GridError::SupplyInvariantViolation`] on any mismatch.
    pub fn verify(&self, currency: &str, actual: Decimal) -> Result<()> {
        let flows = self.flows.get(currency).copied().unwrap_or_default();
        let expected = flows.deposited - flows.withdrawn;
        if actual == expected {
            return Ok(());
        }
        Err(GridError::SupplyInvariantViolation {
            reason: format!(
                "{currency}: ledger holds {actual}, expected {expected} \
                 (deposited {}, withdrawn {})",
                flows.deposited, flows.withdrawn
            ),
        })
    }

    /// Currencies that have seen any flow, sorted.
    #[must_use]
    pub fn currencies(&self) -> Vec<Currency> {
        self.flows.keys().cloned().collect::<BTreeSet<_>>().into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_currency_expects_zero() {
        let tracker = SupplyTracker::new();
        assert_eq!(tracker.expected("INR"), Decimal::ZERO);
        tracker.verify("INR", Decimal::ZERO).unwrap();
    }

    #[test]
    fn deposits_minus_withdrawals() {
        let mut tracker = SupplyTracker::new();
        tracker.on_deposit("INR", Decimal::new(1000, 0));
        tracker.on_deposit("INR", Decimal::new(250, 0));
        tracker.on_withdrawal("INR", Decimal::new(100, 0));
        assert_eq!(tracker.expected("INR"), Decimal::new(1150, 0));
        tracker.verify("INR", Decimal::new(1150, 0)).unwrap();
    }

    #[test]
    fn mismatch_is_violation() {
        let mut tracker = SupplyTracker::new();
        tracker.on_deposit("INR", Decimal::new(1000, 0));
        let err = tracker.verify("INR", Decimal::new(999, 0)).unwrap_err();
        assert!(matches!(err, GridError::SupplyInvariantViolation { .. }));
        assert!(err.to_string().contains("GT_ERR_602"));
    }

    #[test]
    fn currencies_are_independent() {
        let mut tracker = SupplyTracker::new();
        tracker.on_deposit("INR", Decimal::new(10, 0));
        tracker.on_deposit("USD", Decimal::new(3, 0));
        assert_eq!(tracker.currencies(), vec!["INR".to_string(), "USD".to_string()]);
        assert_eq!(tracker.expected("USD"), Decimal::new(3, 0));
    }
}
