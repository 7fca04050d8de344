//! Plan catalog and subscription purchases.

use super::core::{caller_reference, require_user, Engine};
use super::results::{EngineError, Subscription};
use crate::events::{EventPayload, PlanChange, PlanChangedEvent, RoleChangedEvent, SubscriptionEvent};
use crate::ledger::TxLink;
use crate::plan::{Plan, PlanDraft, PlanKind, PlanUpdate};
use crate::settlement::{CommissionSplit, SettlementResult};
use crate::store::{State, UnitOfWork};
use crate::subscription::SubscriptionRecord;
use crate::types::{Amount, Percent, PlanId, Role, SubscriptionId, Timestamp, UserId};
use tracing::{debug, info};

impl Engine {
    /// Buy `plan_id` for `subscriber`. Settlement, subscription record and any role
    /// promotion commit together. Retrying with the same `reference` returns the
    /// original purchase without charging again. References are per subscriber.
    ///
    /// A subscriber without a wallet yet is treated as holding a zero balance and
    /// gets `InsufficientFunds`.
    pub fn subscribe(&self, subscriber: UserId, plan_id: PlanId, reference: &str) -> Result<Subscription, EngineError> {
        caller_reference(reference, "subscription")?;

        let result = self.store.transaction(|uow| -> Result<Subscription, EngineError> {
            if let Some(existing) = uow.state().subscription_by_reference(subscriber, reference) {
                return replay_subscription(uow.state(), existing, plan_id);
            }

            let plan = uow.state().plans.get(&plan_id).cloned().ok_or(EngineError::PlanNotFound(plan_id))?;
            let now = uow.now();

            let id = uow.next_subscription_id();
            let settlement = self.settle_in(uow, subscriber, &plan, reference, Some(TxLink::Subscription(id)))?;
            let payment_tx = settlement
                .payer_record()
                .map(|r| r.id)
                .ok_or_else(|| EngineError::InvalidInput("settlement produced no payer record".into()))?;

            // 12.3: promotion rides in the same unit of work as the payment
            let promoted = plan.grants_trader() && promote(uow, subscriber);

            let record = SubscriptionRecord {
                id,
                subscriber,
                plan: plan.id,
                grants_trader: plan.grants_trader(),
                price: settlement.split.price,
                commission: settlement.split.commission,
                start: now,
                end: plan.end_date(now),
                active: true,
                payment_tx,
                promoted,
                correlation: settlement.correlation,
                reference: reference.to_string(),
                revoked_at: None,
            };
            uow.put_subscription(record.clone());
            uow.emit(EventPayload::SubscriptionCreated(SubscriptionEvent {
                subscription: id,
                subscriber,
                plan: plan.id,
                end: record.end,
            }));

            Ok(Subscription { record, settlement, promoted, replayed: false })
        });

        match &result {
            Ok(sub) if sub.replayed => debug!(%subscriber, plan = %plan_id, reference, "subscription replayed"),
            Ok(sub) => info!(
                %subscriber,
                plan = %plan_id,
                subscription = %sub.record.id,
                end = %sub.record.end,
                promoted = sub.promoted,
                "subscription created"
            ),
            Err(err) => debug!(%subscriber, plan = %plan_id, %err, "subscription rejected"),
        }
        result
    }

    /// True if `user` holds an upgrade subscription that is active and not expired.
    pub fn is_active_trader_upgrade(&self, user: UserId) -> bool {
        self.store.read(|s| has_active_upgrade(s, user, None, s.now()))
    }

    /// End a subscription early. Allowed for the subscriber, the plan owner and admins.
    /// Revoking the upgrade that promoted a user demotes them back to customer unless
    /// another upgrade is still active.
    pub fn revoke_subscription(&self, actor: UserId, id: SubscriptionId) -> Result<SubscriptionRecord, EngineError> {
        let record = self.store.transaction(|uow| -> Result<SubscriptionRecord, EngineError> {
            let actor_role = require_user(uow.state(), actor)?;
            let mut record = uow
                .state()
                .subscriptions
                .get(&id)
                .cloned()
                .ok_or(EngineError::SubscriptionNotFound(id))?;

            let plan_owner = uow.state().plans.get(&record.plan).map(|p| p.owner);
            let allowed = actor == record.subscriber || Some(actor) == plan_owner || actor_role == Role::Admin;
            if !allowed {
                return Err(EngineError::Unauthorized { user: actor, action: "revoke subscription" });
            }

            if !record.active {
                return Ok(record);
            }

            let now = uow.now();
            record.revoke(now);
            uow.put_subscription(record.clone());
            uow.emit(EventPayload::SubscriptionRevoked(SubscriptionEvent {
                subscription: id,
                subscriber: record.subscriber,
                plan: record.plan,
                end: record.end,
            }));

            let still_upgraded = has_active_upgrade(uow.state(), record.subscriber, Some(id), now);
            if record.promoted && !still_upgraded {
                demote(uow, record.subscriber);
            }
            Ok(record)
        })?;

        info!(%actor, subscription = %id, subscriber = %record.subscriber, "subscription revoked");
        Ok(record)
    }

    pub fn get_subscription(&self, id: SubscriptionId) -> Result<SubscriptionRecord, EngineError> {
        self.store
            .read(|s| s.subscriptions.get(&id).cloned())
            .ok_or(EngineError::SubscriptionNotFound(id))
    }

    /// Every subscription `user` ever bought, oldest first.
    pub fn subscriptions_for(&self, user: UserId) -> Vec<SubscriptionRecord> {
        self.store
            .read(|s| s.subscriptions.values().filter(|r| r.subscriber == user).cloned().collect())
    }

    pub fn active_subscriptions_for(&self, user: UserId) -> Vec<SubscriptionRecord> {
        self.store.read(|s| {
            let now = s.now();
            s.subscriptions
                .values()
                .filter(|r| r.subscriber == user && r.is_active_at(now))
                .cloned()
                .collect()
        })
    }

    // 12.3.1: plan catalog

    /// Trader plan draft carrying the configured default commission.
    pub fn trader_plan_draft(&self, name: impl Into<String>, price: Amount, duration_days: u32) -> PlanDraft {
        PlanDraft::trader(name, price, duration_days, self.config.default_commission)
    }

    /// Trader plans are owned by their author. Upgrade plans are admin-only and
    /// owned by the platform account.
    pub fn create_plan(&self, actor: UserId, draft: PlanDraft) -> Result<Plan, EngineError> {
        draft.validate()?;
        self.money(draft.price)?;

        let plan = self.store.transaction(|uow| -> Result<Plan, EngineError> {
            let role = require_user(uow.state(), actor)?;
            let owner = match draft.kind {
                PlanKind::Upgrade { .. } => {
                    if role != Role::Admin {
                        return Err(EngineError::Unauthorized { user: actor, action: "create upgrade plan" });
                    }
                    self.config.platform_account
                }
                PlanKind::Trader { commission } => {
                    if !role.can_trade() {
                        return Err(EngineError::Unauthorized { user: actor, action: "create trader plan" });
                    }
                    self.check_commission(commission)?;
                    actor
                }
            };

            let id = uow.next_plan_id();
            let plan = Plan::from_draft(id, owner, draft, uow.now());
            uow.put_plan(plan.clone());
            uow.emit(EventPayload::PlanChanged(PlanChangedEvent { plan: id, owner, change: PlanChange::Created }));
            Ok(plan)
        })?;

        info!(%actor, plan = %plan.id, name = %plan.name, price = %plan.price, "plan created");
        Ok(plan)
    }

    /// Owner or admin only. Existing subscriptions keep the terms they were bought at.
    pub fn update_plan(&self, actor: UserId, plan_id: PlanId, update: PlanUpdate) -> Result<Plan, EngineError> {
        if let Some(price) = update.price {
            self.money(price)?;
        }
        if let Some(commission) = update.commission {
            self.check_commission(commission)?;
        }

        self.store.transaction(|uow| -> Result<Plan, EngineError> {
            let mut plan = owned_plan(uow, actor, plan_id, "update plan")?;
            let was_active = plan.active;
            update.apply(&mut plan, uow.now())?;

            let change = if was_active && !plan.active { PlanChange::Deactivated } else { PlanChange::Updated };
            uow.put_plan(plan.clone());
            uow.emit(EventPayload::PlanChanged(PlanChangedEvent { plan: plan_id, owner: plan.owner, change }));
            debug!(%actor, plan = %plan_id, ?change, "plan updated");
            Ok(plan)
        })
    }

    /// Removes the plan, or only deactivates it when subscriptions still point at it.
    pub fn delete_plan(&self, actor: UserId, plan_id: PlanId) -> Result<PlanChange, EngineError> {
        let change = self.store.transaction(|uow| -> Result<PlanChange, EngineError> {
            let mut plan = owned_plan(uow, actor, plan_id, "delete plan")?;
            let referenced = uow.state().subscriptions.values().any(|s| s.plan == plan_id);

            let change = if referenced {
                plan.active = false;
                plan.updated_at = uow.now();
                uow.put_plan(plan.clone());
                PlanChange::Deactivated
            } else {
                uow.remove_plan(plan_id);
                PlanChange::Deleted
            };
            uow.emit(EventPayload::PlanChanged(PlanChangedEvent { plan: plan_id, owner: plan.owner, change }));
            Ok(change)
        })?;

        info!(%actor, plan = %plan_id, ?change, "plan deleted");
        Ok(change)
    }

    pub fn get_plan(&self, plan_id: PlanId) -> Result<Plan, EngineError> {
        self.store
            .read(|s| s.plans.get(&plan_id).cloned())
            .ok_or(EngineError::PlanNotFound(plan_id))
    }

    pub fn list_plans(&self) -> Vec<Plan> {
        self.store.read(|s| s.plans.values().cloned().collect())
    }

    pub fn active_plans(&self) -> Vec<Plan> {
        self.store.read(|s| s.plans.values().filter(|p| p.active).cloned().collect())
    }

    pub fn plans_by(&self, owner: UserId) -> Vec<Plan> {
        self.store
            .read(|s| s.plans.values().filter(|p| p.owner == owner).cloned().collect())
    }

    fn check_commission(&self, commission: Percent) -> Result<(), EngineError> {
        if commission > self.config.max_commission {
            return Err(EngineError::InvalidInput(format!(
                "commission {commission} exceeds the maximum of {}",
                self.config.max_commission
            )));
        }
        Ok(())
    }
}

fn owned_plan(uow: &UnitOfWork<'_>, actor: UserId, plan_id: PlanId, action: &'static str) -> Result<Plan, EngineError> {
    let role = require_user(uow.state(), actor)?;
    let plan = uow.state().plans.get(&plan_id).cloned().ok_or(EngineError::PlanNotFound(plan_id))?;
    if plan.owner != actor && role != Role::Admin {
        return Err(EngineError::Unauthorized { user: actor, action });
    }
    Ok(plan)
}

fn has_active_upgrade(state: &State, user: UserId, except: Option<SubscriptionId>, now: Timestamp) -> bool {
    state
        .subscriptions
        .values()
        .any(|s| s.subscriber == user && s.grants_trader && s.is_active_at(now) && Some(s.id) != except)
}

// customers become traders. traders and admins keep what they have.
fn promote(uow: &mut UnitOfWork<'_>, user: UserId) -> bool {
    if uow.state().role(user) != Some(Role::Customer) {
        return false;
    }
    uow.set_role(user, Role::Trader);
    uow.emit(EventPayload::RoleChanged(RoleChangedEvent { user, from: Role::Customer, to: Role::Trader }));
    true
}

fn demote(uow: &mut UnitOfWork<'_>, user: UserId) {
    if uow.state().role(user) != Some(Role::Trader) {
        return;
    }
    uow.set_role(user, Role::Customer);
    uow.emit(EventPayload::RoleChanged(RoleChangedEvent { user, from: Role::Trader, to: Role::Customer }));
}

// same request seen again: hand back what it produced the first time
fn replay_subscription(
    state: &State,
    existing: &SubscriptionRecord,
    plan_id: PlanId,
) -> Result<Subscription, EngineError> {
    if existing.plan != plan_id {
        return Err(EngineError::InvalidInput(format!(
            "reference {:?} belongs to a different purchase",
            existing.reference
        )));
    }

    let records = state
        .ledger
        .transactions_by_correlation(existing.correlation)
        .into_iter()
        .cloned()
        .collect();

    Ok(Subscription {
        record: existing.clone(),
        settlement: SettlementResult {
            correlation: existing.correlation,
            plan: existing.plan,
            payer: existing.subscriber,
            split: CommissionSplit {
                price: existing.price,
                commission: existing.commission,
                recipient_share: existing.price.sub(existing.commission),
            },
            records,
            settled_at: existing.start,
        },
        promoted: existing.promoted,
        replayed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::events::EventPayload;
    use rust_decimal_macros::dec;

    const PLATFORM: UserId = UserId(0);
    const CUSTOMER: UserId = UserId(1);
    const TRADER: UserId = UserId(2);
    const ADMIN: UserId = UserId(9);

    fn engine() -> Engine {
        let engine = Engine::new(PlatformConfig::default());
        engine.set_time(Timestamp::from_millis(0));
        engine.register_user(CUSTOMER, Role::Customer);
        engine.register_user(TRADER, Role::Trader);
        engine.register_user(ADMIN, Role::Admin);
        engine.deposit(CUSTOMER, Amount::new(dec!(1000)), "seed").unwrap();
        engine
    }

    fn upgrade_plan(engine: &Engine) -> Plan {
        engine
            .create_plan(ADMIN, PlanDraft::upgrade("pro", Amount::new(dec!(250)), 30))
            .unwrap()
    }

    #[test]
    fn upgrade_promotes_and_pays_platform() {
        let engine = engine();
        let plan = upgrade_plan(&engine);
        assert_eq!(plan.owner, PLATFORM);

        let sub = engine.subscribe(CUSTOMER, plan.id, "req-1").unwrap();
        assert!(sub.promoted);
        assert_eq!(sub.settlement.records.len(), 2);
        assert_eq!(engine.role_of(CUSTOMER), Some(Role::Trader));
        assert_eq!(engine.balance(PLATFORM).value(), dec!(250));
        assert!(engine.is_active_trader_upgrade(CUSTOMER));

        let kinds: Vec<_> = engine.events().iter().map(|e| e.payload.kind()).collect();
        assert!(kinds.contains(&"role_changed"));
    }

    #[test]
    fn second_upgrade_while_active_is_rejected() {
        let engine = engine();
        let plan = upgrade_plan(&engine);
        let other = engine
            .create_plan(ADMIN, PlanDraft::upgrade("pro-yearly", Amount::new(dec!(100)), 365))
            .unwrap();

        engine.subscribe(CUSTOMER, plan.id, "req-1").unwrap();
        let err = engine.subscribe(CUSTOMER, other.id, "req-2").unwrap_err();
        assert_eq!(err, EngineError::AlreadySubscribed { subscriber: CUSTOMER, plan: other.id });
        assert_eq!(engine.balance(CUSTOMER).value(), dec!(750));
    }

    #[test]
    fn expired_upgrade_can_be_bought_again() {
        let engine = engine();
        let plan = upgrade_plan(&engine);
        engine.subscribe(CUSTOMER, plan.id, "req-1").unwrap();

        engine.advance_time(30 * crate::types::MILLIS_PER_DAY);
        assert!(!engine.is_active_trader_upgrade(CUSTOMER));
        let again = engine.subscribe(CUSTOMER, plan.id, "req-2").unwrap();
        // already a trader from the first purchase
        assert!(!again.promoted);
        assert_eq!(engine.balance(CUSTOMER).value(), dec!(500));
    }

    #[test]
    fn revoking_upgrade_demotes() {
        let engine = engine();
        let plan = upgrade_plan(&engine);
        let sub = engine.subscribe(CUSTOMER, plan.id, "req-1").unwrap();

        let revoked = engine.revoke_subscription(CUSTOMER, sub.record.id).unwrap();
        assert!(!revoked.active);
        assert_eq!(engine.role_of(CUSTOMER), Some(Role::Customer));
        // money stays where it went
        assert_eq!(engine.balance(CUSTOMER).value(), dec!(750));
    }

    #[test]
    fn revoke_needs_a_party_to_the_subscription() {
        let engine = engine();
        let plan = engine
            .create_plan(TRADER, engine.trader_plan_draft("alpha", Amount::new(dec!(100)), 30))
            .unwrap();
        let sub = engine.subscribe(CUSTOMER, plan.id, "req-1").unwrap();

        engine.register_user(UserId(7), Role::Customer);
        assert!(matches!(
            engine.revoke_subscription(UserId(7), sub.record.id),
            Err(EngineError::Unauthorized { .. })
        ));
        // plan owner may revoke
        assert!(engine.revoke_subscription(TRADER, sub.record.id).is_ok());
    }

    #[test]
    fn replayed_reference_charges_once() {
        let engine = engine();
        let plan = engine
            .create_plan(TRADER, engine.trader_plan_draft("alpha", Amount::new(dec!(100)), 30))
            .unwrap();

        let first = engine.subscribe(CUSTOMER, plan.id, "req-1").unwrap();
        let second = engine.subscribe(CUSTOMER, plan.id, "req-1").unwrap();
        assert!(second.replayed);
        assert_eq!(first.record.id, second.record.id);
        assert_eq!(second.settlement.records.len(), 3);
        assert_eq!(engine.balance(CUSTOMER).value(), dec!(900));
        assert_eq!(engine.subscriptions_for(CUSTOMER).len(), 1);

        let beta = engine
            .create_plan(TRADER, engine.trader_plan_draft("beta", Amount::new(dec!(50)), 30))
            .unwrap();
        let mismatch = engine.subscribe(CUSTOMER, beta.id, "req-1");
        assert!(matches!(mismatch, Err(EngineError::InvalidInput(_))));
        assert_eq!(engine.balance(CUSTOMER).value(), dec!(900));
    }

    #[test]
    fn references_belong_to_their_subscriber() {
        let engine = engine();
        let neighbour = UserId(8);
        engine.register_user(neighbour, Role::Customer);
        engine.deposit(neighbour, Amount::new(dec!(100)), "dep-1").unwrap();
        let plan = engine
            .create_plan(TRADER, engine.trader_plan_draft("alpha", Amount::new(dec!(100)), 30))
            .unwrap();

        let mine = engine.subscribe(CUSTOMER, plan.id, "req-1").unwrap();
        let theirs = engine.subscribe(neighbour, plan.id, "req-1").unwrap();

        assert!(!theirs.replayed);
        assert_ne!(mine.record.id, theirs.record.id);
        assert!(engine.balance(neighbour).is_zero());
        assert_eq!(engine.balance(TRADER).value(), dec!(160));
    }

    #[test]
    fn plan_permissions() {
        let engine = engine();
        assert!(matches!(
            engine.create_plan(TRADER, PlanDraft::upgrade("x", Amount::new(dec!(10)), 1)),
            Err(EngineError::Unauthorized { .. })
        ));
        assert!(matches!(
            engine.create_plan(CUSTOMER, engine.trader_plan_draft("x", Amount::new(dec!(10)), 1)),
            Err(EngineError::Unauthorized { .. })
        ));

        let greedy = PlanDraft::trader("x", Amount::new(dec!(10)), 1, Percent::new(dec!(75)).unwrap());
        assert!(matches!(engine.create_plan(TRADER, greedy), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn update_and_delete_plan() {
        let engine = engine();
        let plan = engine
            .create_plan(TRADER, engine.trader_plan_draft("alpha", Amount::new(dec!(100)), 30))
            .unwrap();

        let update = PlanUpdate { price: Some(Amount::new(dec!(120))), ..Default::default() };
        assert!(matches!(
            engine.update_plan(CUSTOMER, plan.id, update.clone()),
            Err(EngineError::Unauthorized { .. })
        ));
        let updated = engine.update_plan(TRADER, plan.id, update).unwrap();
        assert_eq!(updated.price.value(), dec!(120));

        engine.subscribe(CUSTOMER, plan.id, "req-1").unwrap();
        assert_eq!(engine.delete_plan(TRADER, plan.id).unwrap(), PlanChange::Deactivated);
        assert!(!engine.get_plan(plan.id).unwrap().active);

        let unused = engine
            .create_plan(TRADER, engine.trader_plan_draft("beta", Amount::new(dec!(5)), 7))
            .unwrap();
        assert_eq!(engine.delete_plan(TRADER, unused.id).unwrap(), PlanChange::Deleted);
        assert_eq!(engine.get_plan(unused.id), Err(EngineError::PlanNotFound(unused.id)));
    }

    #[test]
    fn failed_purchase_emits_nothing() {
        let engine = engine();
        let plan = engine
            .create_plan(TRADER, engine.trader_plan_draft("pricey", Amount::new(dec!(5000)), 30))
            .unwrap();
        let before = engine.events().len();

        let err = engine.subscribe(CUSTOMER, plan.id, "req-1").unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        assert_eq!(engine.events().len(), before);
        assert!(engine
            .events()
            .iter()
            .all(|e| !matches!(e.payload, EventPayload::SubscriptionCreated(_))));
    }
}
