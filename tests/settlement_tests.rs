//! Settlement and subscription tests.
//!
//! Every purchase either moves money for all parties or for none, and the
//! amounts always net to zero across the wallets involved.

use rust_decimal_macros::dec;
use settlement_core::*;

const CUSTOMER: UserId = UserId(1);
const TRADER: UserId = UserId(2);
const ADMIN: UserId = UserId(3);
const START: i64 = 1_700_000_000_000;
const DAY_MS: i64 = 86_400_000;

fn setup() -> Engine {
    let engine = Engine::new(PlatformConfig::default());
    engine.set_time(Timestamp::from_millis(START));
    engine.register_user(CUSTOMER, Role::Customer);
    engine.register_user(TRADER, Role::Trader);
    engine.register_user(ADMIN, Role::Admin);
    engine
}

fn trader_plan(engine: &Engine, price: rust_decimal::Decimal) -> Plan {
    engine
        .create_plan(TRADER, engine.trader_plan_draft("Alpha Calls", Amount::new(price), 30))
        .unwrap()
}

fn upgrade_plan(engine: &Engine) -> Plan {
    engine
        .create_plan(ADMIN, PlanDraft::upgrade("Pro Trader", Amount::new(dec!(250)), 30))
        .unwrap()
}

#[test]
fn three_way_split_moves_money_for_everyone() {
    let engine = setup();
    let platform = engine.platform_account();
    engine.deposit(CUSTOMER, Amount::new(dec!(1000)), "dep-1").unwrap();
    let plan = trader_plan(&engine, dec!(100));

    let sub = engine.subscribe(CUSTOMER, plan.id, "sub-1").unwrap();

    assert_eq!(engine.balance(CUSTOMER).value(), dec!(900));
    assert_eq!(engine.balance(platform).value(), dec!(20));
    assert_eq!(engine.balance(TRADER).value(), dec!(80));
    assert!(sub.settlement.net().is_zero());

    assert_eq!(sub.settlement.records.len(), 3);
    assert!(sub
        .settlement
        .records
        .iter()
        .all(|r| r.correlation == sub.settlement.correlation && r.status == TxStatus::Success));

    let payer = sub.settlement.payer_record().unwrap();
    assert_eq!(payer.direction, TxDirection::Debit);
    assert_eq!(payer.kind, TxKind::SubscriptionPayment);
    assert_eq!(payer.balance_before.value(), dec!(1000));
    assert_eq!(payer.balance_after.value(), dec!(900));

    assert_eq!(sub.record.start, Timestamp::from_millis(START));
    assert_eq!(sub.record.end, Timestamp::from_millis(START + 30 * DAY_MS));
    assert_eq!(sub.record.commission.value(), dec!(20));
    assert_eq!(sub.record.payment_tx, payer.id);
    assert!(!sub.promoted);
}

#[test]
fn insufficient_funds_changes_nothing() {
    let engine = setup();
    engine.deposit(CUSTOMER, Amount::new(dec!(50)), "dep-1").unwrap();
    let plan = trader_plan(&engine, dec!(100));
    let records_before = engine.transactions_for(CUSTOMER).len();
    let events_before = engine.events().len();

    let err = engine.subscribe(CUSTOMER, plan.id, "sub-1").unwrap_err();
    assert_eq!(
        err,
        EngineError::InsufficientFunds {
            wallet: CUSTOMER,
            requested: Amount::new(dec!(100)),
            available: Amount::new(dec!(50)),
        }
    );

    assert_eq!(engine.balance(CUSTOMER).value(), dec!(50));
    assert!(engine.balance(TRADER).is_zero());
    assert!(engine.balance(engine.platform_account()).is_zero());
    assert_eq!(engine.transactions_for(CUSTOMER).len(), records_before);
    assert!(engine.subscriptions_for(CUSTOMER).is_empty());
    assert_eq!(engine.events().len(), events_before);
}

#[test]
fn payer_without_wallet_holds_nothing() {
    let engine = setup();
    let plan = trader_plan(&engine, dec!(100));

    assert_eq!(
        engine.subscribe(CUSTOMER, plan.id, "sub-1").unwrap_err(),
        EngineError::InsufficientFunds {
            wallet: CUSTOMER,
            requested: Amount::new(dec!(100)),
            available: Amount::zero(),
        }
    );
    assert!(engine.get_wallet(CUSTOMER).is_err());
}

#[test]
fn second_active_subscription_is_rejected() {
    let engine = setup();
    engine.deposit(CUSTOMER, Amount::new(dec!(1000)), "dep-1").unwrap();
    let plan = trader_plan(&engine, dec!(100));

    engine.subscribe(CUSTOMER, plan.id, "sub-1").unwrap();
    assert_eq!(
        engine.subscribe(CUSTOMER, plan.id, "sub-2").unwrap_err(),
        EngineError::AlreadySubscribed { subscriber: CUSTOMER, plan: plan.id }
    );
    assert_eq!(engine.balance(CUSTOMER).value(), dec!(900));

    // once the first one lapses the plan can be bought again
    engine.advance_time(31 * DAY_MS);
    engine.subscribe(CUSTOMER, plan.id, "sub-3").unwrap();
    assert_eq!(engine.balance(CUSTOMER).value(), dec!(800));
    assert_eq!(engine.active_subscriptions_for(CUSTOMER).len(), 1);
}

#[test]
fn owner_cannot_buy_own_plan() {
    let engine = setup();
    engine.deposit(TRADER, Amount::new(dec!(1000)), "dep-1").unwrap();
    let plan = trader_plan(&engine, dec!(100));

    assert_eq!(
        engine.subscribe(TRADER, plan.id, "sub-1").unwrap_err(),
        EngineError::SelfSubscriptionForbidden(TRADER)
    );
    assert_eq!(engine.balance(TRADER).value(), dec!(1000));
}

#[test]
fn inactive_and_unknown_plans_are_rejected() {
    let engine = setup();
    engine.deposit(CUSTOMER, Amount::new(dec!(1000)), "dep-1").unwrap();
    let draft = engine.trader_plan_draft("Paused", Amount::new(dec!(100)), 30).inactive();
    let paused = engine.create_plan(TRADER, draft).unwrap();

    assert_eq!(
        engine.subscribe(CUSTOMER, paused.id, "sub-1").unwrap_err(),
        EngineError::PlanInactive(paused.id)
    );
    assert_eq!(
        engine.subscribe(CUSTOMER, PlanId(999), "sub-2").unwrap_err(),
        EngineError::PlanNotFound(PlanId(999))
    );
    assert_eq!(engine.balance(CUSTOMER).value(), dec!(1000));
}

#[test]
fn upgrade_pays_platform_and_promotes() {
    let engine = setup();
    let platform = engine.platform_account();
    engine.deposit(CUSTOMER, Amount::new(dec!(500)), "dep-1").unwrap();
    let plan = upgrade_plan(&engine);

    let sub = engine.subscribe(CUSTOMER, plan.id, "up-1").unwrap();

    assert!(sub.promoted);
    assert_eq!(sub.settlement.records.len(), 2);
    assert!(sub.settlement.net().is_zero());
    assert_eq!(engine.balance(CUSTOMER).value(), dec!(250));
    assert_eq!(engine.balance(platform).value(), dec!(250));
    assert_eq!(engine.role_of(CUSTOMER), Some(Role::Trader));
    assert!(engine.is_active_trader_upgrade(CUSTOMER));

    let role_events = engine
        .events()
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::RoleChanged(_)))
        .count();
    assert_eq!(role_events, 1);

    // promoted customer can now publish
    let draft = engine.trader_plan_draft("New Desk", Amount::new(dec!(10)), 7);
    assert!(engine.create_plan(CUSTOMER, draft).is_ok());
}

#[test]
fn failed_upgrade_keeps_role() {
    let engine = setup();
    engine.deposit(CUSTOMER, Amount::new(dec!(100)), "dep-1").unwrap();
    let plan = upgrade_plan(&engine);

    assert!(matches!(
        engine.subscribe(CUSTOMER, plan.id, "up-1"),
        Err(EngineError::InsufficientFunds { .. })
    ));
    assert_eq!(engine.role_of(CUSTOMER), Some(Role::Customer));
    assert!(!engine.is_active_trader_upgrade(CUSTOMER));
}

#[test]
fn retry_with_same_reference_is_charged_once() {
    let engine = setup();
    engine.deposit(CUSTOMER, Amount::new(dec!(1000)), "dep-1").unwrap();
    let plan = trader_plan(&engine, dec!(100));

    let first = engine.subscribe(CUSTOMER, plan.id, "sub-1").unwrap();
    let again = engine.subscribe(CUSTOMER, plan.id, "sub-1").unwrap();

    assert!(!first.replayed);
    assert!(again.replayed);
    assert_eq!(again.record.id, first.record.id);
    assert_eq!(again.settlement.correlation, first.settlement.correlation);
    assert_eq!(again.settlement.records.len(), 3);
    assert_eq!(engine.balance(CUSTOMER).value(), dec!(900));
    assert_eq!(engine.subscriptions_for(CUSTOMER).len(), 1);
}

#[test]
fn commission_rounds_to_money_scale() {
    let engine = setup();
    engine.deposit(CUSTOMER, Amount::new(dec!(100)), "dep-1").unwrap();
    let rate = Percent::new(dec!(12.5)).unwrap();
    let plan = engine
        .create_plan(TRADER, PlanDraft::trader("Odd Price", Amount::new(dec!(9.99)), 30, rate))
        .unwrap();

    let preview = engine.preview_settlement(plan.id).unwrap();
    let sub = engine.subscribe(CUSTOMER, plan.id, "sub-1").unwrap();

    assert_eq!(sub.settlement.split, preview);
    assert_eq!(engine.balance(engine.platform_account()).value(), dec!(1.25));
    assert_eq!(engine.balance(TRADER).value(), dec!(8.74));
    assert_eq!(engine.balance(CUSTOMER).value(), dec!(90.01));
    assert!(sub.settlement.net().is_zero());
}

#[test]
fn revoking_upgrade_demotes() {
    let engine = setup();
    engine.deposit(CUSTOMER, Amount::new(dec!(500)), "dep-1").unwrap();
    let plan = upgrade_plan(&engine);
    let sub = engine.subscribe(CUSTOMER, plan.id, "up-1").unwrap();

    assert!(matches!(
        engine.revoke_subscription(TRADER, sub.record.id),
        Err(EngineError::Unauthorized { .. })
    ));

    let revoked = engine.revoke_subscription(CUSTOMER, sub.record.id).unwrap();
    assert!(!revoked.active);
    assert!(revoked.revoked_at.is_some());
    assert_eq!(engine.role_of(CUSTOMER), Some(Role::Customer));
    assert!(!engine.is_active_trader_upgrade(CUSTOMER));
    // no refund
    assert_eq!(engine.balance(CUSTOMER).value(), dec!(250));
}
