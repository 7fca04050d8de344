//! Wallets and the append-only transaction log.
//!
//! Every balance change goes through [`Ledger::apply_delta`], which checks the
//! resulting balance, mutates the wallet and appends the record as one step.
//! Records are never edited after the fact except for the pending status
//! transition, and a reference can only ever be applied once per wallet.

use crate::types::{Amount, CorrelationId, SubscriptionId, Timestamp, TradeId, TxId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// References the engine derives for its own legs start with this. Callers
/// may not use it, so their idempotency keys can never collide with ours.
pub const INTERNAL_REFERENCE_PREFIX: char = '@';

pub fn internal_reference(scope: impl fmt::Display, leg: &str) -> String {
    format!("{INTERNAL_REFERENCE_PREFIX}{scope}/{leg}")
}

pub fn is_internal_reference(reference: &str) -> bool {
    reference.starts_with(INTERNAL_REFERENCE_PREFIX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub owner: UserId,
    pub balance: Amount,
    pub currency: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Wallet {
    pub fn new(owner: UserId, currency: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            owner,
            balance: Amount::zero(),
            currency: currency.into(),
            created_at: timestamp,
            updated_at: timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxDirection {
    Debit,
    Credit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    SubscriptionPayment,
    Commission,
    TradeMargin,
    TradeMarginRelease,
    TradeProfit,
    TradeLoss,
    Deposit,
    Withdrawal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Success,
    Failed,
}

impl TxStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, TxStatus::Pending)
    }
}

// back-reference for audit, the ledger does not own the linked entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum TxLink {
    Trade(TradeId),
    Subscription(SubscriptionId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TxId,
    pub wallet: UserId,
    pub direction: TxDirection,
    pub kind: TxKind,
    /// Always positive. The sign is carried by `direction`.
    pub amount: Amount,
    pub currency: String,
    pub balance_before: Amount,
    pub balance_after: Amount,
    pub status: TxStatus,
    pub reference: String,
    pub correlation: CorrelationId,
    pub link: Option<TxLink>,
    pub created_at: Timestamp,
    pub finalized_at: Option<Timestamp>,
}

impl TransactionRecord {
    pub fn signed_amount(&self) -> Amount {
        match self.direction {
            TxDirection::Credit => self.amount,
            TxDirection::Debit => self.amount.negate(),
        }
    }
}

/// One balance change as requested by the settlement layer.
#[derive(Debug, Clone)]
pub struct Delta {
    pub wallet: UserId,
    /// Positive credits the wallet, negative debits it.
    pub amount: Amount,
    pub kind: TxKind,
    pub status: TxStatus,
    pub reference: String,
    pub correlation: CorrelationId,
    pub link: Option<TxLink>,
}

impl Delta {
    pub fn new(
        wallet: UserId,
        amount: Amount,
        kind: TxKind,
        reference: impl Into<String>,
        correlation: CorrelationId,
    ) -> Self {
        Self {
            wallet,
            amount,
            kind,
            status: TxStatus::Success,
            reference: reference.into(),
            correlation,
            link: None,
        }
    }

    pub fn pending(mut self) -> Self {
        self.status = TxStatus::Pending;
        self
    }

    pub fn linked(mut self, link: TxLink) -> Self {
        self.link = Some(link);
        self
    }
}

/// Result of applying a delta. `replayed` is set when the reference had
/// already been applied and the original record is returned untouched.
#[derive(Debug, Clone)]
pub struct Applied {
    pub record: TransactionRecord,
    pub replayed: bool,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    currency: String,
    wallets: HashMap<UserId, Wallet>,
    records: Vec<TransactionRecord>,
    // references are scoped to the wallet they were applied to
    by_reference: HashMap<(UserId, String), TxId>,
    next_tx_id: u64,
}

impl Ledger {
    pub fn new(currency: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            wallets: HashMap::new(),
            records: Vec::new(),
            by_reference: HashMap::new(),
            next_tx_id: 1,
        }
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn get_wallet(&self, owner: UserId) -> Result<&Wallet, LedgerError> {
        self.wallets.get(&owner).ok_or(LedgerError::WalletNotFound(owner))
    }

    pub fn wallets(&self) -> impl Iterator<Item = &Wallet> {
        self.wallets.values()
    }

    pub fn balance(&self, owner: UserId) -> Amount {
        self.wallets.get(&owner).map(|w| w.balance).unwrap_or_else(Amount::zero)
    }

    pub fn total_balance(&self) -> Amount {
        self.wallets.values().map(|w| w.balance).sum()
    }

    /// Create the wallet if it does not exist yet. Returns whether it was created.
    pub fn open_wallet(&mut self, owner: UserId, timestamp: Timestamp) -> bool {
        if self.wallets.contains_key(&owner) {
            return false;
        }
        self.wallets.insert(owner, Wallet::new(owner, self.currency.clone(), timestamp));
        true
    }

    pub fn record(&self, id: TxId) -> Option<&TransactionRecord> {
        // ids are dense and start at 1
        let index = usize::try_from(id.0.checked_sub(1)?).ok()?;
        self.records.get(index).filter(|r| r.id == id)
    }

    pub fn records(&self) -> &[TransactionRecord] {
        &self.records
    }

    pub fn find_by_reference(&self, wallet: UserId, reference: &str) -> Option<&TransactionRecord> {
        self.by_reference
            .get(&(wallet, reference.to_string()))
            .and_then(|id| self.record(*id))
    }

    pub fn transactions_for(&self, owner: UserId) -> Vec<&TransactionRecord> {
        self.records.iter().filter(|r| r.wallet == owner).collect()
    }

    pub fn transactions_by_correlation(&self, correlation: CorrelationId) -> Vec<&TransactionRecord> {
        self.records.iter().filter(|r| r.correlation == correlation).collect()
    }

    // 2.1: balance check, wallet write and record append happen together or not at all.
    pub fn apply_delta(&mut self, delta: &Delta, timestamp: Timestamp) -> Result<Applied, LedgerError> {
        if delta.amount.is_zero() {
            return Err(LedgerError::ZeroAmount);
        }

        if let Some(prior) = self.find_by_reference(delta.wallet, &delta.reference) {
            if prior.signed_amount() == delta.amount && prior.kind == delta.kind {
                return Ok(Applied { record: prior.clone(), replayed: true });
            }
            return Err(LedgerError::DuplicateReference(delta.reference.clone()));
        }

        let balance_before = match self.wallets.get(&delta.wallet) {
            Some(wallet) => wallet.balance,
            None if delta.amount.is_positive() => Amount::zero(),
            None => return Err(LedgerError::WalletNotFound(delta.wallet)),
        };

        let balance_after = balance_before
            .checked_add(delta.amount)
            .ok_or(LedgerError::Overflow(delta.wallet))?;
        if balance_after.is_negative() {
            return Err(LedgerError::InsufficientFunds {
                wallet: delta.wallet,
                requested: delta.amount.abs(),
                available: balance_before,
            });
        }

        self.open_wallet(delta.wallet, timestamp);
        let wallet = self
            .wallets
            .get_mut(&delta.wallet)
            .ok_or(LedgerError::WalletNotFound(delta.wallet))?;
        wallet.balance = balance_after;
        wallet.updated_at = timestamp;

        let id = TxId(self.next_tx_id);
        self.next_tx_id += 1;

        let record = TransactionRecord {
            id,
            wallet: delta.wallet,
            direction: if delta.amount.is_negative() { TxDirection::Debit } else { TxDirection::Credit },
            kind: delta.kind,
            amount: delta.amount.abs(),
            currency: self.currency.clone(),
            balance_before,
            balance_after,
            status: delta.status,
            reference: delta.reference.clone(),
            correlation: delta.correlation,
            link: delta.link,
            created_at: timestamp,
            finalized_at: delta.status.is_final().then_some(timestamp),
        };

        self.by_reference.insert((record.wallet, record.reference.clone()), id);
        self.records.push(record.clone());

        Ok(Applied { record, replayed: false })
    }

    // 2.2: pending -> success | failed. nothing moves once final.
    pub fn finalize(&mut self, id: TxId, status: TxStatus, timestamp: Timestamp) -> Result<TxStatus, LedgerError> {
        let index = usize::try_from(id.0.saturating_sub(1)).map_err(|_| LedgerError::TransactionNotFound(id))?;
        let record = self
            .records
            .get_mut(index)
            .filter(|r| r.id == id)
            .ok_or(LedgerError::TransactionNotFound(id))?;

        if record.status.is_final() || !status.is_final() {
            return Err(LedgerError::InvalidStatusTransition { tx: id, from: record.status, to: status });
        }

        let previous = record.status;
        record.status = status;
        record.finalized_at = Some(timestamp);
        Ok(previous)
    }

    // rollback hooks for the unit of work. only ever called in reverse order of application.

    pub(crate) fn restore_wallet(&mut self, owner: UserId, previous: Option<Wallet>) {
        match previous {
            Some(wallet) => {
                self.wallets.insert(owner, wallet);
            }
            None => {
                self.wallets.remove(&owner);
            }
        }
    }

    pub(crate) fn pop_record(&mut self, id: TxId) {
        if self.records.last().map(|r| r.id) == Some(id) {
            if let Some(record) = self.records.pop() {
                self.by_reference.remove(&(record.wallet, record.reference));
                self.next_tx_id = id.0;
            }
        }
    }

    pub(crate) fn restore_status(&mut self, id: TxId, status: TxStatus) {
        if let Some(record) = self.records.iter_mut().rev().find(|r| r.id == id) {
            record.status = status;
            record.finalized_at = None;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Insufficient funds in {wallet}: requested {requested}, available {available}")]
    InsufficientFunds { wallet: UserId, requested: Amount, available: Amount },

    #[error("Wallet for {0} not found")]
    WalletNotFound(UserId),

    #[error("Reference {0:?} was already applied with different terms")]
    DuplicateReference(String),

    #[error("Transaction {0} not found")]
    TransactionNotFound(TxId),

    #[error("Transaction {tx} cannot move from {from:?} to {to:?}")]
    InvalidStatusTransition { tx: TxId, from: TxStatus, to: TxStatus },

    #[error("Zero amount deltas are not recorded")]
    ZeroAmount,

    #[error("Balance of {0} would leave the representable range")]
    Overflow(UserId),
}
