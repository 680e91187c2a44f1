//! Balance collaborator
//!
//! Debits and credits carry an idempotency reference; replaying a reference is a
//! successful no-op, so settlement retries can never double-credit.

use crate::errors::AccountError;
use crate::games::types::{Amount, BettorId};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[async_trait]
pub trait AccountService: Send + Sync {
    async fn balance(&self, bettor: &BettorId) -> Result<Amount, AccountError>;

    async fn debit(&self, bettor: &BettorId, amount: Amount, reference: &str) -> Result<(), AccountError>;

    async fn credit(&self, bettor: &BettorId, amount: Amount, reference: &str) -> Result<(), AccountError>;
}

/// DashMap-backed wallet with an optional opening balance for new bettors
#[derive(Debug, Default)]
pub struct InMemoryAccounts {
    balances: DashMap<BettorId, Amount>,
    applied: DashMap<String, Amount>,
    opening_balance: Amount,
}

impl InMemoryAccounts {
    pub fn new(opening_balance: Amount) -> Self {
        Self {
            balances: DashMap::new(),
            applied: DashMap::new(),
            opening_balance,
        }
    }

    pub fn with_balances(opening_balance: Amount, seeded: impl IntoIterator<Item = (BettorId, Amount)>) -> Self {
        let accounts = Self::new(opening_balance);
        for (bettor, amount) in seeded {
            accounts.balances.insert(bettor, amount);
        }
        accounts
    }

    /// Whether a debit or credit reference has been applied
    pub fn has_applied(&self, reference: &str) -> bool {
        self.applied.contains_key(reference)
    }
}

#[async_trait]
impl AccountService for InMemoryAccounts {
    async fn balance(&self, bettor: &BettorId) -> Result<Amount, AccountError> {
        Ok(self
            .balances
            .get(bettor)
            .map(|b| *b)
            .unwrap_or(self.opening_balance))
    }

    async fn debit(&self, bettor: &BettorId, amount: Amount, reference: &str) -> Result<(), AccountError> {
        // Hold the reference entry for the whole update so a concurrent replay waits
        let Entry::Vacant(slot) = self.applied.entry(reference.to_string()) else {
            return Ok(());
        };
        let mut balance = self
            .balances
            .entry(bettor.clone())
            .or_insert(self.opening_balance);
        if *balance < amount {
            return Err(AccountError::InsufficientFunds {
                bettor: bettor.clone(),
                balance: *balance,
                requested: amount,
            });
        }
        *balance -= amount;
        slot.insert(amount);
        tracing::debug!(bettor = %bettor, amount, reference, "Debited account");
        Ok(())
    }

    async fn credit(&self, bettor: &BettorId, amount: Amount, reference: &str) -> Result<(), AccountError> {
        let Entry::Vacant(slot) = self.applied.entry(reference.to_string()) else {
            return Ok(());
        };
        let mut balance = self
            .balances
            .entry(bettor.clone())
            .or_insert(self.opening_balance);
        *balance = balance.saturating_add(amount);
        slot.insert(amount);
        tracing::debug!(bettor = %bettor, amount, reference, "Credited account");
        Ok(())
    }
}
