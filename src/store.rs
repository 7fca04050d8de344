//! Persisted entity store with a transactional boundary.
//!
//! All mutable state sits behind one lock. [`Store::transaction`] takes the lock,
//! hands the closure a [`UnitOfWork`] that writes in place and journals the prior
//! value of everything it touches, and either keeps the writes (closure returned
//! `Ok`) or replays the journal backwards (closure returned `Err` or panicked). Readers only
//! ever see state between units of work, so a half-applied settlement is never
//! observable. Wallet operations are serialised by the same lock, which rules out
//! two debits passing a balance check against the same stale balance.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

use crate::events::{Event, EventId, EventPayload, WalletEvent};
use crate::ledger::{Applied, Delta, Ledger, LedgerError, TxDirection, TxStatus, Wallet};
use crate::plan::Plan;
use crate::signal::Signal;
use crate::subscription::SubscriptionRecord;
use crate::trade::Trade;
use crate::types::{CorrelationId, PlanId, Role, SignalId, SubscriptionId, Timestamp, TradeId, TxId, UserId};

#[derive(Debug, Clone, Copy)]
pub(crate) struct IdCounters {
    pub plan: u64,
    pub subscription: u64,
    pub trade: u64,
    pub signal: u64,
    pub correlation: u64,
    pub event: u64,
}

impl Default for IdCounters {
    fn default() -> Self {
        Self {
            plan: 1,
            subscription: 1,
            trade: 1,
            signal: 1,
            correlation: 1,
            event: 1,
        }
    }
}

#[derive(Debug)]
pub struct State {
    pub ledger: Ledger,
    pub roles: HashMap<UserId, Role>,
    pub plans: BTreeMap<PlanId, Plan>,
    pub subscriptions: BTreeMap<SubscriptionId, SubscriptionRecord>,
    pub trades: BTreeMap<TradeId, Trade>,
    pub signals: BTreeMap<SignalId, Signal>,
    pub events: VecDeque<Event>,
    // idempotency keys belong to the user who sent them
    pub(crate) subscription_refs: HashMap<(UserId, String), SubscriptionId>,
    pub(crate) trade_refs: HashMap<(UserId, String), TradeId>,
    pub(crate) ids: IdCounters,
    pub(crate) clock: Option<Timestamp>,
}

impl State {
    fn new(currency: &str) -> Self {
        Self {
            ledger: Ledger::new(currency),
            roles: HashMap::new(),
            plans: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            trades: BTreeMap::new(),
            signals: BTreeMap::new(),
            events: VecDeque::new(),
            subscription_refs: HashMap::new(),
            trade_refs: HashMap::new(),
            ids: IdCounters::default(),
            clock: None,
        }
    }

    /// Manual clock if one was set, wall clock otherwise.
    pub fn now(&self) -> Timestamp {
        self.clock.unwrap_or_else(Timestamp::now)
    }

    pub fn role(&self, user: UserId) -> Option<Role> {
        self.roles.get(&user).copied()
    }

    pub fn subscription_by_reference(&self, subscriber: UserId, reference: &str) -> Option<&SubscriptionRecord> {
        self.subscription_refs
            .get(&(subscriber, reference.to_string()))
            .and_then(|id| self.subscriptions.get(id))
    }

    pub fn trade_id_by_reference(&self, trader: UserId, reference: &str) -> Option<TradeId> {
        self.trade_refs.get(&(trader, reference.to_string())).copied()
    }
}

// inverse of one write. replayed last-in first-out on rollback.
#[derive(Debug)]
enum Undo {
    Wallet { owner: UserId, previous: Option<Wallet> },
    Record(TxId),
    Status { tx: TxId, previous: TxStatus },
    Role { user: UserId, previous: Option<Role> },
    Plan { id: PlanId, previous: Option<Plan> },
    Subscription { id: SubscriptionId, previous: Option<SubscriptionRecord> },
    SubscriptionRef((UserId, String)),
    Trade { id: TradeId, previous: Option<Trade> },
    TradeRef((UserId, String)),
    Signal { id: SignalId, previous: Option<Signal> },
}

pub struct UnitOfWork<'a> {
    state: &'a mut State,
    journal: Vec<Undo>,
    events: Vec<EventPayload>,
    now: Timestamp,
    ids: IdCounters,
    finished: bool,
}

impl<'a> UnitOfWork<'a> {
    fn begin(state: &'a mut State) -> Self {
        let ids = state.ids;
        let now = state.now();
        Self {
            state,
            journal: Vec::new(),
            events: Vec::new(),
            now,
            ids,
            finished: false,
        }
    }

    /// One timestamp for every write in the unit.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn state(&self) -> &State {
        &*self.state
    }

    pub fn next_plan_id(&mut self) -> PlanId {
        let id = PlanId(self.state.ids.plan);
        self.state.ids.plan += 1;
        id
    }

    pub fn next_subscription_id(&mut self) -> SubscriptionId {
        let id = SubscriptionId(self.state.ids.subscription);
        self.state.ids.subscription += 1;
        id
    }

    pub fn next_trade_id(&mut self) -> TradeId {
        let id = TradeId(self.state.ids.trade);
        self.state.ids.trade += 1;
        id
    }

    pub fn next_signal_id(&mut self) -> SignalId {
        let id = SignalId(self.state.ids.signal);
        self.state.ids.signal += 1;
        id
    }

    pub fn next_correlation(&mut self) -> CorrelationId {
        let id = CorrelationId(self.state.ids.correlation);
        self.state.ids.correlation += 1;
        id
    }

    pub fn emit(&mut self, payload: EventPayload) {
        self.events.push(payload);
    }

    pub fn apply_delta(&mut self, delta: &Delta) -> Result<Applied, LedgerError> {
        let previous = self.state.ledger.get_wallet(delta.wallet).ok().cloned();
        let applied = self.state.ledger.apply_delta(delta, self.now)?;
        if applied.replayed {
            return Ok(applied);
        }

        self.journal.push(Undo::Wallet { owner: delta.wallet, previous });
        self.journal.push(Undo::Record(applied.record.id));

        let record = &applied.record;
        let event = WalletEvent {
            wallet: record.wallet,
            tx: record.id,
            amount: record.amount,
            new_balance: record.balance_after,
        };
        self.events.push(match record.direction {
            TxDirection::Credit => EventPayload::WalletCredited(event),
            TxDirection::Debit => EventPayload::WalletDebited(event),
        });

        Ok(applied)
    }

    pub fn open_wallet(&mut self, owner: UserId) -> bool {
        let created = self.state.ledger.open_wallet(owner, self.now);
        if created {
            self.journal.push(Undo::Wallet { owner, previous: None });
        }
        created
    }

    pub fn finalize_tx(&mut self, tx: TxId, status: TxStatus) -> Result<(), LedgerError> {
        let previous = self.state.ledger.finalize(tx, status, self.now)?;
        self.journal.push(Undo::Status { tx, previous });
        Ok(())
    }

    pub fn set_role(&mut self, user: UserId, role: Role) -> Option<Role> {
        let previous = self.state.roles.insert(user, role);
        self.journal.push(Undo::Role { user, previous });
        previous
    }

    pub fn put_plan(&mut self, plan: Plan) {
        let id = plan.id;
        let previous = self.state.plans.insert(id, plan);
        self.journal.push(Undo::Plan { id, previous });
    }

    pub fn remove_plan(&mut self, id: PlanId) -> Option<Plan> {
        let previous = self.state.plans.remove(&id);
        if previous.is_some() {
            self.journal.push(Undo::Plan { id, previous: previous.clone() });
        }
        previous
    }

    pub fn put_subscription(&mut self, subscription: SubscriptionRecord) {
        let id = subscription.id;
        let key = (subscription.subscriber, subscription.reference.clone());
        let previous = self.state.subscriptions.insert(id, subscription);
        self.journal.push(Undo::Subscription { id, previous });

        if !self.state.subscription_refs.contains_key(&key) {
            self.state.subscription_refs.insert(key.clone(), id);
            self.journal.push(Undo::SubscriptionRef(key));
        }
    }

    pub fn put_trade(&mut self, trade: Trade) {
        let id = trade.id;
        let previous = self.state.trades.insert(id, trade);
        self.journal.push(Undo::Trade { id, previous });
    }

    pub fn index_trade_reference(&mut self, trader: UserId, reference: &str, id: TradeId) {
        let key = (trader, reference.to_string());
        if !self.state.trade_refs.contains_key(&key) {
            self.state.trade_refs.insert(key.clone(), id);
            self.journal.push(Undo::TradeRef(key));
        }
    }

    pub fn remove_trade(&mut self, id: TradeId) -> Option<Trade> {
        let previous = self.state.trades.remove(&id);
        if previous.is_some() {
            self.journal.push(Undo::Trade { id, previous: previous.clone() });
        }
        previous
    }

    pub fn put_signal(&mut self, signal: Signal) {
        let id = signal.id;
        let previous = self.state.signals.insert(id, signal);
        self.journal.push(Undo::Signal { id, previous });
    }

    fn rollback(&mut self) {
        let state = &mut *self.state;
        let undone = self.journal.len();
        for undo in self.journal.drain(..).rev() {
            match undo {
                Undo::Wallet { owner, previous } => state.ledger.restore_wallet(owner, previous),
                Undo::Record(tx) => state.ledger.pop_record(tx),
                Undo::Status { tx, previous } => state.ledger.restore_status(tx, previous),
                Undo::Role { user, previous } => match previous {
                    Some(role) => {
                        state.roles.insert(user, role);
                    }
                    None => {
                        state.roles.remove(&user);
                    }
                },
                Undo::Plan { id, previous } => restore(&mut state.plans, id, previous),
                Undo::Subscription { id, previous } => restore(&mut state.subscriptions, id, previous),
                Undo::SubscriptionRef(key) => {
                    state.subscription_refs.remove(&key);
                }
                Undo::Trade { id, previous } => restore(&mut state.trades, id, previous),
                Undo::TradeRef(key) => {
                    state.trade_refs.remove(&key);
                }
                Undo::Signal { id, previous } => restore(&mut state.signals, id, previous),
            }
        }
        state.ids = self.ids;
        self.events.clear();
        self.finished = true;
        debug!(undone, "unit of work rolled back");
    }

    fn commit(&mut self, max_events: usize) {
        let state = &mut *self.state;
        for payload in self.events.drain(..) {
            let event = Event::new(EventId(state.ids.event), self.now, payload);
            state.ids.event += 1;
            state.events.push_back(event);
        }
        while state.events.len() > max_events {
            state.events.pop_front();
        }
        self.journal.clear();
        self.finished = true;
    }
}

// a unit dropped without commit or rollback is unwinding out of a panic
impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, previous: Option<V>) {
    match previous {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

#[derive(Debug)]
pub struct Store {
    state: Mutex<State>,
    max_events: usize,
}

impl Store {
    pub fn new(currency: &str, max_events: usize) -> Self {
        Self {
            state: Mutex::new(State::new(currency)),
            max_events,
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let state = self.state.lock();
        f(&state)
    }

    /// Run `f` as one atomic unit. Every write it made is undone if it returns `Err`.
    pub fn transaction<R, E>(&self, f: impl FnOnce(&mut UnitOfWork<'_>) -> Result<R, E>) -> Result<R, E> {
        let mut guard = self.state.lock();
        let mut uow = UnitOfWork::begin(&mut guard);

        let result = f(&mut uow);
        match result {
            Ok(_) => uow.commit(self.max_events),
            Err(_) => uow.rollback(),
        }
        result
    }

    /// Like [`Store::transaction`] for a unit that has no failure path.
    pub fn write<R>(&self, f: impl FnOnce(&mut UnitOfWork<'_>) -> R) -> R {
        let mut guard = self.state.lock();
        let mut uow = UnitOfWork::begin(&mut guard);

        let value = f(&mut uow);
        uow.commit(self.max_events);
        value
    }

    pub fn set_clock(&self, timestamp: Option<Timestamp>) {
        self.state.lock().clock = timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TxKind;
    use crate::types::Amount;
    use rust_decimal_macros::dec;

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);

    fn funded_store() -> Store {
        let store = Store::new("USD", 100);
        store.set_clock(Some(Timestamp::from_millis(0)));
        store
            .transaction(|uow| {
                let corr = uow.next_correlation();
                uow.apply_delta(&Delta::new(ALICE, Amount::new(dec!(100)), TxKind::Deposit, "dep", corr))
            })
            .unwrap();
        store
    }

    #[test]
    fn failed_unit_leaves_no_trace() {
        let store = funded_store();
        let events_before = store.read(|s| s.events.len());

        let result: Result<(), LedgerError> = store.transaction(|uow| {
            let corr = uow.next_correlation();
            uow.apply_delta(&Delta::new(ALICE, Amount::new(dec!(-60)), TxKind::SubscriptionPayment, "a", corr))?;
            uow.apply_delta(&Delta::new(BOB, Amount::new(dec!(60)), TxKind::SubscriptionPayment, "b", corr))?;
            uow.set_role(BOB, Role::Trader);
            // second debit overdraws and aborts the whole unit
            uow.apply_delta(&Delta::new(ALICE, Amount::new(dec!(-60)), TxKind::SubscriptionPayment, "c", corr))?;
            Ok(())
        });

        assert!(matches!(result, Err(LedgerError::InsufficientFunds { .. })));
        store.read(|s| {
            assert_eq!(s.ledger.balance(ALICE).value(), dec!(100));
            assert!(s.ledger.get_wallet(BOB).is_err());
            assert_eq!(s.ledger.records().len(), 1);
            assert!(s.ledger.find_by_reference(ALICE, "a").is_none());
            assert!(s.role(BOB).is_none());
            assert_eq!(s.events.len(), events_before);
            // correlation counter rewound as well
            assert_eq!(s.ids.correlation, 2);
        });
    }

    #[test]
    fn committed_unit_emits_events_in_order() {
        let store = funded_store();
        store
            .transaction(|uow| {
                let corr = uow.next_correlation();
                uow.apply_delta(&Delta::new(ALICE, Amount::new(dec!(-40)), TxKind::SubscriptionPayment, "x", corr))?;
                uow.apply_delta(&Delta::new(BOB, Amount::new(dec!(40)), TxKind::SubscriptionPayment, "y", corr))
            })
            .unwrap();

        store.read(|s| {
            let kinds: Vec<_> = s.events.iter().map(|e| e.payload.kind()).collect();
            assert_eq!(kinds, vec!["wallet_credited", "wallet_debited", "wallet_credited"]);
            assert!(s.events.iter().zip(s.events.iter().skip(1)).all(|(a, b)| a.id < b.id));
            assert_eq!(s.ledger.total_balance().value(), dec!(100));
        });
    }

    #[test]
    fn status_change_rolled_back() {
        let store = funded_store();
        let tx = store
            .transaction(|uow| {
                let corr = uow.next_correlation();
                uow.apply_delta(&Delta::new(ALICE, Amount::new(dec!(-10)), TxKind::TradeMargin, "m", corr).pending())
            })
            .unwrap()
            .record
            .id;

        let result: Result<(), LedgerError> = store.transaction(|uow| {
            uow.finalize_tx(tx, TxStatus::Success)?;
            Err(LedgerError::ZeroAmount)
        });
        assert!(result.is_err());
        store.read(|s| assert_eq!(s.ledger.record(tx).unwrap().status, TxStatus::Pending));
    }

    #[test]
    fn event_buffer_is_capped() {
        let store = Store::new("USD", 2);
        for i in 0..5 {
            store
                .transaction(|uow| {
                    let corr = uow.next_correlation();
                    uow.apply_delta(&Delta::new(ALICE, Amount::new(dec!(1)), TxKind::Deposit, format!("d{i}"), corr))
                })
                .unwrap();
        }
        store.read(|s| {
            assert_eq!(s.events.len(), 2);
            assert_eq!(s.events.back().unwrap().id, EventId(5));
        });
    }

    #[test]
    fn write_commits_infallible_units() {
        let store = funded_store();
        let previous = store.write(|uow| uow.set_role(BOB, Role::Trader));
        assert!(previous.is_none());
        store.read(|s| assert_eq!(s.role(BOB), Some(Role::Trader)));
    }

    #[test]
    fn panicking_unit_is_rolled_back() {
        let store = funded_store();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            store.transaction(|uow| -> Result<(), LedgerError> {
                let corr = uow.next_correlation();
                uow.apply_delta(&Delta::new(ALICE, Amount::new(dec!(-30)), TxKind::Withdrawal, "w", corr))?;
                uow.set_role(BOB, Role::Trader);
                panic!("storage went away");
            })
        }));

        assert!(outcome.is_err());
        store.read(|s| {
            assert_eq!(s.ledger.balance(ALICE).value(), dec!(100));
            assert_eq!(s.ledger.records().len(), 1);
            assert!(s.role(BOB).is_none());
            assert_eq!(s.ids.correlation, 2);
        });
        // the lock is usable again
        assert!(store
            .transaction(|uow| {
                let corr = uow.next_correlation();
                uow.apply_delta(&Delta::new(ALICE, Amount::new(dec!(-30)), TxKind::Withdrawal, "w", corr))
            })
            .is_ok());
    }
}
