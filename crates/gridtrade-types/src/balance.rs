//! Per-account money: what the owner can spend and what sits in escrow.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::ids::UserId;

/// Currency code, e.g. `"INR"`.
pub type Currency = String;

/// One (account, currency) balance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceEntry {
    pub available: Decimal,
    /// Buyer funds held for confirmed orders awaiting settlement.
    pub escrowed: Decimal,
}

impl BalanceEntry {
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.available + self.escrowed
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.available.is_zero() && self.escrowed.is_zero()
    }

    /// Take `amount` out of the spendable balance.
    ///
    /// # Errors
    /// [`GridError::InsufficientBalance`]; nothing changes.
    pub fn take_available(&mut self, owner: UserId, amount: Decimal) -> Result<()> {
        if self.available < amount {
            return Err(GridError::InsufficientBalance {
                account: owner,
                needed: amount,
                available: self.available,
            });
        }
        self.available -= amount;
        Ok(())
    }

    /// Take `amount` out of escrow.
    ///
    /// # Errors
    /// [`GridError::InsufficientEscrow`]; nothing changes.
    pub fn take_escrow(&mut self, owner: UserId, amount: Decimal) -> Result<()> {
        if self.escrowed < amount {
            return Err(GridError::InsufficientEscrow {
                account: owner,
                needed: amount,
                held: self.escrowed,
            });
        }
        self.escrowed -= amount;
        Ok(())
    }

    /// Move spendable funds into escrow.
    pub fn hold(&mut self, owner: UserId, amount: Decimal) -> Result<()> {
        self.take_available(owner, amount)?;
        self.escrowed += amount;
        Ok(())
    }

    /// Move escrowed funds back to the spendable balance.
    pub fn unhold(&mut self, owner: UserId, amount: Decimal) -> Result<()> {
        self.take_escrow(owner, amount)?;
        self.available += amount;
        Ok(())
    }
}
