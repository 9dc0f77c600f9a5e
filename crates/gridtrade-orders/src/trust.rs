//! Reputation scores adjusted on cancellation.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use gridtrade_types::{UserId, constants};
use rust_decimal::Decimal;
use tracing::info;

/// Trust score per user, in `[0, 1]`. Unknown users start at 1.
#[derive(Debug, Default)]
pub struct TrustRegistry {
    scores: Mutex<HashMap<UserId, Decimal>>,
}

impl TrustRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn score(&self, user: UserId) -> Decimal {
        self.scores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user)
            .copied()
            .unwrap_or(Decimal::new(constants::INITIAL_TRUST_SCORE, 0))
    }

    /// Lower a score by `per_unit × units`, never below zero. Returns the new score.
    pub fn penalize(&self, user: UserId, units: u64, per_unit: Decimal) -> Decimal {
        let mut scores = self.scores.lock().unwrap_or_else(PoisonError::into_inner);
        let score = scores
            .entry(user)
            .or_insert(Decimal::new(constants::INITIAL_TRUST_SCORE, 0));
        let before = *score;
        *score = (before - per_unit * Decimal::from(units)).clamp(Decimal::ZERO, Decimal::ONE);
        info!(user = %user, units, before = %before, after = %*score, "Trust score lowered");
        *score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one() {
        assert_eq!(TrustRegistry::new().score(UserId::new()), Decimal::ONE);
    }

    #[test]
    fn penalty_scales_with_units() {
        let trust = TrustRegistry::new();
        let user = UserId::new();
        assert_eq!(trust.penalize(user, 5, Decimal::new(2, 2)), Decimal::new(90, 2));
        assert_eq!(trust.score(user), Decimal::new(90, 2));
    }

    #[test]
    fn clamped_at_zero() {
        let trust = TrustRegistry::new();
        let user = UserId::new();
        assert_eq!(trust.penalize(user, 500, Decimal::new(1, 2)), Decimal::ZERO);
    }
}
