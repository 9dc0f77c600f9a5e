//! Account ledger: available / escrowed balances with a movement journal.
//!
//! Each (account, currency) balance sits behind its own mutex, so unrelated
//! accounts never contend. A movement debits its source under the source's
//! lock (checking sufficiency there) and then credits each destination.
//! Multi-account movements hold the transfer gate for reading; the
//! conservation check holds it for writing, so it never observes a
//! half-applied transfer.
//!
//! Escrow is also tracked per reference (order or trade id). A release,
//! refund or split debits the hold made under its own reference, so one
//! order's payout can never spend escrow another order is still holding.
//!
//! Instances are independent: tests build their own ledger, and nothing is
//! process-global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use gridtrade_types::{BalanceEntry, Clock, Currency, GridError, Payee, Result, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::conservation::SupplyTracker;

/// The account retaining platform fees and penalties.
pub const PLATFORM_ACCOUNT: UserId = UserId(Uuid::nil());

/// Kind of journal row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Deposit,
    Withdrawal,
    /// Buyer funds moved from available into escrow.
    EscrowHold,
    /// Escrow paid out to a provider.
    EscrowRelease,
    /// Escrow returned to the buyer.
    EscrowRefund,
    /// Escrow paid to a provider on buyer cancellation.
    Compensation,
    /// Retained by the platform.
    PlatformFee,
    /// Charged to a provider on provider cancellation.
    Penalty,
}

/// One journal row. Amounts are positive; `kind` says which way they moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Order id or trade id the movement belongs to.
    pub reference: String,
    pub kind: EntryKind,
    pub account: UserId,
    pub currency: Currency,
    pub amount: Decimal,
    pub at: DateTime<Utc>,
}

type Balance = Arc<Mutex<BalanceEntry>>;

/// (reference, buyer, currency) of one escrow hold.
type HoldKey = (String, UserId, Currency);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(GridError::InvalidRequest {
            reason: format!("amount must be positive, got {amount}"),
        });
    }
    Ok(())
}

/// Injectable per-account escrow ledger.
#[derive(Debug)]
pub struct AccountLedger {
    balances: RwLock<HashMap<(UserId, Currency), Balance>>,
    holds: Mutex<HashMap<HoldKey, Decimal>>,
    journal: Mutex<Vec<LedgerEntry>>,
    supply: Mutex<SupplyTracker>,
    transfer_gate: RwLock<()>,
    clock: Arc<dyn Clock>,
}

impl AccountLedger {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            balances: RwLock::new(HashMap::new()),
            holds: Mutex::new(HashMap::new()),
            journal: Mutex::new(Vec::new()),
            supply: Mutex::new(SupplyTracker::new()),
            transfer_gate: RwLock::new(()),
            clock,
        }
    }

    fn account(&self, account: UserId, currency: &str) -> Balance {
        let key = (account, currency.to_string());
        if let Some(balance) = self
            .balances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Arc::clone(balance);
        }
        Arc::clone(
            self.balances
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key)
                .or_default(),
        )
    }

    fn record(&self, reference: &str, kind: EntryKind, account: UserId, currency: &str, amount: Decimal) {
        if amount.is_zero() {
            return;
        }
        lock(&self.journal).push(LedgerEntry {
            reference: reference.to_string(),
            kind,
            account,
            currency: currency.to_string(),
            amount,
            at: self.clock.now(),
        });
    }

    fn credit(&self, account: UserId, currency: &str, amount: Decimal) {
        lock(&self.account(account, currency)).available += amount;
    }

    /// Debit `amount` from an account's escrow, checking sufficiency under its lock.
    fn debit_escrow(&self, account: UserId, currency: &str, amount: Decimal) -> Result<()> {
        lock(&self.account(account, currency)).take_escrow(account, amount)
    }

    /// Deduct `amount` from the escrow held under `reference`.
    fn take_hold(&self, reference: &str, buyer: UserId, currency: &str, amount: Decimal) -> Result<()> {
        let key = (reference.to_string(), buyer, currency.to_string());
        let mut holds = lock(&self.holds);
        let held = holds.get(&key).copied().unwrap_or_default();
        if held < amount {
            return Err(GridError::InsufficientEscrow {
                account: buyer,
                needed: amount,
                held,
            });
        }
        if held == amount {
            holds.remove(&key);
        } else {
            holds.insert(key, held - amount);
        }
        Ok(())
    }

    fn put_hold(&self, reference: &str, buyer: UserId, currency: &str, amount: Decimal) {
        if amount.is_zero() {
            return;
        }
        *lock(&self.holds)
            .entry((reference.to_string(), buyer, currency.to_string()))
            .or_default() += amount;
    }

    /// Take `amount` from the hold under `reference` and from the buyer's escrow.
    fn debit_hold(&self, reference: &str, buyer: UserId, currency: &str, amount: Decimal) -> Result<()> {
        self.take_hold(reference, buyer, currency, amount)?;
        if let Err(err) = self.debit_escrow(buyer, currency, amount) {
            self.put_hold(reference, buyer, currency, amount);
            return Err(err);
        }
        Ok(())
    }

    fn debit_available(&self, account: UserId, currency: &str, amount: Decimal) -> Result<()> {
        lock(&self.account(account, currency)).take_available(account, amount)
    }

    // -----------------------------------------------------------------
    // External flows
    // -----------------------------------------------------------------

    pub fn deposit(&self, account: UserId, currency: &str, amount: Decimal, reference: &str) -> Result<()> {
        ensure_positive(amount)?;
        let _gate = self.transfer_gate.read().unwrap_or_else(PoisonError::into_inner);
        self.credit(account, currency, amount);
        lock(&self.supply).on_deposit(currency, amount);
        self.record(reference, EntryKind::Deposit, account, currency, amount);
        debug!(account = %account, currency, amount = %amount, "Deposit");
        Ok(())
    }

    pub fn withdraw(&self, account: UserId, currency: &str, amount: Decimal, reference: &str) -> Result<()> {
        ensure_positive(amount)?;
        let _gate = self.transfer_gate.read().unwrap_or_else(PoisonError::into_inner);
        self.debit_available(account, currency, amount)?;
        lock(&self.supply).on_withdrawal(currency, amount);
        self.record(reference, EntryKind::Withdrawal, account, currency, amount);
        debug!(account = %account, currency, amount = %amount, "Withdrawal");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Escrow
    // -----------------------------------------------------------------

    /// Move buyer funds from available into escrow.
    ///
    /// # Errors
    /// [`GridError::InsufficientBalance`]; the balance is unchanged.
    pub fn hold_escrow(&self, buyer: UserId, currency: &str, amount: Decimal, reference: &str) -> Result<()> {
        ensure_positive(amount)?;
        lock(&self.account(buyer, currency)).hold(buyer, amount)?;
        self.put_hold(reference, buyer, currency, amount);
        self.record(reference, EntryKind::EscrowHold, buyer, currency, amount);
        info!(buyer = %buyer, amount = %amount, reference, "Escrow held");
        Ok(())
    }

    /// Pay escrow out: each payee receives its amount, the platform keeps `platform_fee`.
    ///
    /// # Errors
    /// [`GridError::InsufficientEscrow`] if the buyer's escrow cannot cover
    /// the payees plus the fee; nothing moves.
    pub fn release_escrow_to(
        &self,
        buyer: UserId,
        currency: &str,
        payees: &[Payee],
        platform_fee: Decimal,
        reference: &str,
    ) -> Result<()> {
        let paid: Decimal = payees.iter().map(|p| p.amount).sum();
        let needed = paid + platform_fee;
        let _gate = self.transfer_gate.read().unwrap_or_else(PoisonError::into_inner);
        self.debit_hold(reference, buyer, currency, needed)?;
        for payee in payees {
            self.credit(payee.account, currency, payee.amount);
            self.record(reference, EntryKind::EscrowRelease, payee.account, currency, payee.amount);
        }
        self.credit(PLATFORM_ACCOUNT, currency, platform_fee);
        self.record(reference, EntryKind::PlatformFee, PLATFORM_ACCOUNT, currency, platform_fee);
        info!(buyer = %buyer, paid = %paid, fee = %platform_fee, reference, "Escrow released");
        Ok(())
    }

    /// Return `amount` of escrow to the buyer's available balance.
    pub fn refund_escrow(&self, buyer: UserId, currency: &str, amount: Decimal, reference: &str) -> Result<()> {
        ensure_positive(amount)?;
        self.take_hold(reference, buyer, currency, amount)?;
        if let Err(err) = lock(&self.account(buyer, currency)).unhold(buyer, amount) {
            self.put_hold(reference, buyer, currency, amount);
            return Err(err);
        }
        self.record(reference, EntryKind::EscrowRefund, buyer, currency, amount);
        info!(buyer = %buyer, amount = %amount, reference, "Escrow refunded");
        Ok(())
    }

    /// Divide escrow on cancellation: refund to the buyer, compensation to
    /// providers, the rest to the platform.
    pub fn split_escrow(
        &self,
        buyer: UserId,
        currency: &str,
        refund: Decimal,
        compensation: &[Payee],
        platform_fee: Decimal,
        reference: &str,
    ) -> Result<()> {
        let compensated: Decimal = compensation.iter().map(|p| p.amount).sum();
        let needed = refund + compensated + platform_fee;
        let _gate = self.transfer_gate.read().unwrap_or_else(PoisonError::into_inner);
        self.debit_hold(reference, buyer, currency, needed)?;
        self.credit(buyer, currency, refund);
        self.record(reference, EntryKind::EscrowRefund, buyer, currency, refund);
        for payee in compensation {
            self.credit(payee.account, currency, payee.amount);
            self.record(reference, EntryKind::Compensation, payee.account, currency, payee.amount);
        }
        self.credit(PLATFORM_ACCOUNT, currency, platform_fee);
        self.record(reference, EntryKind::PlatformFee, PLATFORM_ACCOUNT, currency, platform_fee);
        info!(
            buyer = %buyer,
            refund = %refund,
            compensation = %compensated,
            fee = %platform_fee,
            reference,
            "Escrow split"
        );
        Ok(())
    }

    /// Charge a provider penalty to the platform.
    pub fn debit_penalty(&self, provider: UserId, currency: &str, amount: Decimal, reference: &str) -> Result<()> {
        ensure_positive(amount)?;
        let _gate = self.transfer_gate.read().unwrap_or_else(PoisonError::into_inner);
        self.debit_available(provider, currency, amount)?;
        self.credit(PLATFORM_ACCOUNT, currency, amount);
        self.record(reference, EntryKind::Penalty, provider, currency, amount);
        info!(provider = %provider, amount = %amount, reference, "Penalty charged");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    #[must_use]
    pub fn balance(&self, account: UserId, currency: &str) -> BalanceEntry {
        let key = (account, currency.to_string());
        self.balances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map(|balance| lock(balance).clone())
            .unwrap_or_default()
    }

    /// Escrow still held for `buyer` under `reference`.
    #[must_use]
    pub fn escrowed_for(&self, buyer: UserId, currency: &str, reference: &str) -> Decimal {
        lock(&self.holds)
            .get(&(reference.to_string(), buyer, currency.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// Journal rows for one order or trade, in order.
    #[must_use]
    pub fn entries_for(&self, reference: &str) -> Vec<LedgerEntry> {
        lock(&self.journal)
            .iter()
            .filter(|e| e.reference == reference)
            .cloned()
            .collect()
    }

    /// Σ(available + escrowed) over every account in `currency`.
    #[must_use]
    pub fn total_supply(&self, currency: &str) -> Decimal {
        self.balances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((_, c), _)| c == currency)
            .map(|(_, balance)| lock(balance).total())
            .sum()
    }

    /// Check that no movement created or destroyed money.
    pub fn verify_conservation(&self, currency: &str) -> Result<()> {
        let _gate = self.transfer_gate.write().unwrap_or_else(PoisonError::into_inner);
        let actual = self.total_supply(currency);
        lock(&self.supply).verify(currency, actual)
    }
}
