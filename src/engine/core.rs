// 12.0 engine/core.rs: main engine. holds the config and the store, everything else
// is an impl block in a sibling file.

use super::results::EngineError;
use crate::config::PlatformConfig;
use crate::events::Event;
use crate::ledger::{is_internal_reference, Delta, TransactionRecord, TxKind, Wallet, INTERNAL_REFERENCE_PREFIX};
use crate::store::{State, Store, UnitOfWork};
use crate::types::{Amount, CorrelationId, Role, Timestamp, TxId, UserId};
use tracing::{debug, info};

/** 12.1: main engine struct. shared across request handlers behind an Arc */
#[derive(Debug)]
pub struct Engine {
    pub(super) config: PlatformConfig,
    pub(super) store: Store,
}

impl Engine {
    pub fn new(config: PlatformConfig) -> Self {
        let store = Store::new(&config.currency, config.max_events);
        let engine = Self { config, store };

        let platform = engine.config.platform_account;
        engine.store.write(|uow| {
            uow.set_role(platform, Role::Admin);
            uow.open_wallet(platform);
        });
        info!(%platform, currency = %engine.config.currency, "settlement engine ready");
        engine
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn platform_account(&self) -> UserId {
        self.config.platform_account
    }

    // time is wall clock unless pinned, tests and the simulator pin it

    pub fn set_time(&self, timestamp: Timestamp) {
        self.store.set_clock(Some(timestamp));
    }

    pub fn use_wall_clock(&self) {
        self.store.set_clock(None);
    }

    pub fn time(&self) -> Timestamp {
        self.store.read(|s| s.now())
    }

    pub fn advance_time(&self, millis: i64) {
        let next = self.time().plus_millis(millis);
        self.set_time(next);
    }

    /// Mirror an identity from the auth layer. The engine trusts the role given.
    pub fn register_user(&self, user: UserId, role: Role) {
        let previous = self.store.write(|uow| uow.set_role(user, role));
        debug!(%user, ?role, ?previous, "identity registered");
    }

    pub fn role_of(&self, user: UserId) -> Option<Role> {
        self.store.read(|s| s.role(user))
    }

    pub fn open_wallet(&self, user: UserId) -> Result<Wallet, EngineError> {
        self.store.transaction(|uow| -> Result<Wallet, EngineError> {
            require_user(uow.state(), user)?;
            if uow.open_wallet(user) {
                debug!(%user, "wallet opened");
            }
            Ok(uow.state().ledger.get_wallet(user)?.clone())
        })
    }

    pub fn get_wallet(&self, user: UserId) -> Result<Wallet, EngineError> {
        self.store.read(|s| s.ledger.get_wallet(user).cloned().map_err(EngineError::from))
    }

    pub fn balance(&self, user: UserId) -> Amount {
        self.store.read(|s| s.ledger.balance(user))
    }

    /// Sum over every wallet. Settlements never change it.
    pub fn total_balance(&self) -> Amount {
        self.store.read(|s| s.ledger.total_balance())
    }

    pub fn deposit(&self, user: UserId, amount: Amount, reference: &str) -> Result<TransactionRecord, EngineError> {
        caller_reference(reference, "deposit")?;
        let amount = self.money(amount)?;
        let record = self.store.transaction(|uow| -> Result<TransactionRecord, EngineError> {
            require_user(uow.state(), user)?;
            let correlation = uow.next_correlation();
            let applied = uow.apply_delta(&Delta::new(user, amount, TxKind::Deposit, reference, correlation))?;
            Ok(applied.record)
        })?;

        info!(%user, %amount, tx = %record.id, "deposit");
        Ok(record)
    }

    pub fn withdraw(&self, user: UserId, amount: Amount, reference: &str) -> Result<TransactionRecord, EngineError> {
        caller_reference(reference, "withdrawal")?;
        let amount = self.money(amount)?;
        let result = self.store.transaction(|uow| -> Result<TransactionRecord, EngineError> {
            require_user(uow.state(), user)?;
            let correlation = uow.next_correlation();
            let applied =
                uow.apply_delta(&Delta::new(user, amount.negate(), TxKind::Withdrawal, reference, correlation))?;
            Ok(applied.record)
        });

        match &result {
            Ok(record) => info!(%user, %amount, tx = %record.id, "withdrawal"),
            Err(err) => debug!(%user, %amount, %err, "withdrawal rejected"),
        }
        result
    }

    pub fn transactions_for(&self, user: UserId) -> Vec<TransactionRecord> {
        self.store.read(|s| s.ledger.transactions_for(user).into_iter().cloned().collect())
    }

    pub fn transactions_by_correlation(&self, correlation: CorrelationId) -> Vec<TransactionRecord> {
        self.store
            .read(|s| s.ledger.transactions_by_correlation(correlation).into_iter().cloned().collect())
    }

    /// Look up a record by the reference it was applied under in `wallet`.
    pub fn transaction_by_reference(&self, wallet: UserId, reference: &str) -> Option<TransactionRecord> {
        self.store.read(|s| s.ledger.find_by_reference(wallet, reference).cloned())
    }

    pub fn transaction(&self, id: TxId) -> Option<TransactionRecord> {
        self.store.read(|s| s.ledger.record(id).cloned())
    }

    pub fn events(&self) -> Vec<Event> {
        self.store.read(|s| s.events.iter().cloned().collect())
    }

    pub fn recent_events(&self, count: usize) -> Vec<Event> {
        self.store.read(|s| {
            let start = s.events.len().saturating_sub(count);
            s.events.iter().skip(start).cloned().collect()
        })
    }

    /// Positive and representable at the ledger scale.
    pub(super) fn money(&self, amount: Amount) -> Result<Amount, EngineError> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidInput(format!("amount must be positive, got {amount}")));
        }
        if amount.value().normalize().scale() > self.config.money_scale {
            return Err(EngineError::InvalidInput(format!(
                "amount {amount} has more than {} decimal places",
                self.config.money_scale
            )));
        }
        Ok(amount)
    }

    pub(super) fn round_money(&self, amount: Amount) -> Amount {
        amount.round(self.config.money_scale, self.config.rounding)
    }
}

/// Idempotency keys sent by callers: non-empty and outside the engine's own namespace.
pub(super) fn caller_reference(reference: &str, what: &str) -> Result<(), EngineError> {
    if reference.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{what} reference must not be empty")));
    }
    if is_internal_reference(reference) {
        return Err(EngineError::InvalidInput(format!(
            "{what} reference {reference:?} must not start with {INTERNAL_REFERENCE_PREFIX:?}"
        )));
    }
    Ok(())
}

pub(super) fn require_user(state: &State, user: UserId) -> Result<Role, EngineError> {
    state.role(user).ok_or(EngineError::UnknownUser(user))
}

pub(super) fn require_trader(uow: &UnitOfWork<'_>, user: UserId, action: &'static str) -> Result<(), EngineError> {
    if require_user(uow.state(), user)?.can_trade() {
        Ok(())
    } else {
        Err(EngineError::Unauthorized { user, action })
    }
}
