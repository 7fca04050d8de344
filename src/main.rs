//! Settlement Engine Simulation.
//!
//! Walks the engine through plan purchases, an upgrade, a trade lifecycle and a
//! short signal sweep. Set RUST_LOG=settlement_core=debug for the full trace.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use settlement_core::*;
use tracing_subscriber::EnvFilter;

const CUSTOMER: UserId = UserId(1);
const TRADER: UserId = UserId(2);
const ADMIN: UserId = UserId(3);

type SimResult<T = ()> = Result<T, Box<dyn Error>>;

#[tokio::main]
async fn main() -> SimResult {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => PlatformConfig::load(std::path::Path::new(&path))?,
        None => Environment::Development.config(),
    };
    config.validate()?;

    println!("Settlement Engine Simulation");
    println!("Currency {}, platform account {}\n", config.currency, config.platform_account);

    scenario_1_trader_plan(&config)?;
    scenario_2_insufficient_funds(&config)?;
    scenario_3_upgrade(&config)?;
    scenario_4_trade_lifecycle(&config)?;
    scenario_5_signal_sweep(&config).await?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

fn setup(config: &PlatformConfig) -> Engine {
    let engine = Engine::new(config.clone());
    engine.set_time(Timestamp::from_millis(1_700_000_000_000));
    engine.register_user(CUSTOMER, Role::Customer);
    engine.register_user(TRADER, Role::Trader);
    engine.register_user(ADMIN, Role::Admin);
    engine
}

fn money(value: Decimal) -> Amount {
    Amount::new(value)
}

fn price(value: Decimal) -> SimResult<Price> {
    Price::new(value).ok_or_else(|| format!("invalid price {value}").into())
}

/// Three-way split: customer pays, platform takes commission, trader gets the rest.
fn scenario_1_trader_plan(config: &PlatformConfig) -> SimResult {
    println!("Scenario 1: Trader Plan Subscription\n");

    let engine = setup(config);
    engine.deposit(CUSTOMER, money(dec!(1000)), "dep-1")?;

    let plan = engine.create_plan(TRADER, engine.trader_plan_draft("Alpha Calls", money(dec!(100)), 30))?;
    println!("  Trader lists '{}' at {} for {} days", plan.name, plan.price, plan.duration_days);

    let sub = engine.subscribe(CUSTOMER, plan.id, "sub-req-1")?;
    println!("  Customer subscribes, correlation {}", sub.settlement.correlation);
    for record in &sub.settlement.records {
        println!(
            "    {} {:?} {:?} {} ({} -> {})",
            record.wallet, record.direction, record.kind, record.amount, record.balance_before, record.balance_after
        );
    }
    println!("  Net across parties: {}", sub.settlement.net());
    println!("  Subscription ends {}", sub.record.end);

    let again = engine.subscribe(CUSTOMER, plan.id, "sub-req-1")?;
    println!("  Retry with same reference replayed: {}", again.replayed);
    println!("  Customer balance: {}\n", engine.balance(CUSTOMER));
    Ok(())
}

fn scenario_2_insufficient_funds(config: &PlatformConfig) -> SimResult {
    println!("Scenario 2: Insufficient Funds\n");

    let engine = setup(config);
    engine.deposit(CUSTOMER, money(dec!(50)), "dep-1")?;
    let plan = engine.create_plan(TRADER, engine.trader_plan_draft("Alpha Calls", money(dec!(100)), 30))?;

    match engine.subscribe(CUSTOMER, plan.id, "sub-req-1") {
        Ok(_) => println!("  Unexpected success"),
        Err(err) => println!("  Rejected: {err}"),
    }
    println!("  Customer balance still {}", engine.balance(CUSTOMER));
    println!("  Subscriptions on record: {}\n", engine.subscriptions_for(CUSTOMER).len());
    Ok(())
}

/// Two-way settlement plus role promotion in one unit of work.
fn scenario_3_upgrade(config: &PlatformConfig) -> SimResult {
    println!("Scenario 3: Upgrade To Trader\n");

    let engine = setup(config);
    engine.deposit(CUSTOMER, money(dec!(500)), "dep-1")?;
    let plan = engine.create_plan(ADMIN, PlanDraft::upgrade("Pro Trader", money(dec!(250)), 30))?;

    let sub = engine.subscribe(CUSTOMER, plan.id, "upgrade-1")?;
    println!("  Customer buys '{}', promoted: {}", plan.name, sub.promoted);
    println!("  Role now {:?}, active upgrade: {}", engine.role_of(CUSTOMER), engine.is_active_trader_upgrade(CUSTOMER));

    if let Err(err) = engine.subscribe(CUSTOMER, plan.id, "upgrade-2") {
        println!("  Second purchase rejected: {err}");
    }

    engine.revoke_subscription(ADMIN, sub.record.id)?;
    println!("  Admin revokes, role back to {:?}\n", engine.role_of(CUSTOMER));
    Ok(())
}

fn scenario_4_trade_lifecycle(config: &PlatformConfig) -> SimResult {
    println!("Scenario 4: Trade Lifecycle\n");

    let engine = setup(config);
    engine.deposit(TRADER, money(dec!(1000)), "dep-1")?;

    let quantity = Quantity::new(dec!(2)).ok_or("invalid quantity")?;
    let leverage = Leverage::new(dec!(5)).ok_or("invalid leverage")?;

    let order = OrderRequest::market("BTC-USD", Side::Buy, price(dec!(100))?, quantity, leverage, "ord-1");
    let trade = engine.place_trade(TRADER, order)?;
    println!("  Buy 2 BTC-USD @ 100 x5, margin {}, status {:?}", trade.margin, trade.status);
    println!("  Balance after reservation: {}", engine.balance(TRADER));

    let close = engine.close_trade(TRADER, trade.id, price(dec!(110))?)?;
    println!("  Closed @ 110, pnl {}, balance {}", close.realized_pnl, engine.balance(TRADER));

    let limit = OrderRequest::market("ETH-USD", Side::Sell, price(dec!(50))?, quantity, leverage, "ord-2")
        .with_kind(OrderKind::Limit);
    let pending = engine.place_trade(TRADER, limit)?;
    println!("  Sell limit ETH-USD @ 50 placed, status {:?}", pending.status);

    let cancel = engine.cancel_trade(TRADER, pending.id)?;
    println!("  Cancelled, released {}, balance {}\n", cancel.margin_release.amount, engine.balance(TRADER));
    Ok(())
}

async fn scenario_5_signal_sweep(config: &PlatformConfig) -> SimResult {
    println!("Scenario 5: Signal Sweep\n");

    let engine = Arc::new(setup(config));
    let draft = SignalDraft::new("BTC-USD", price(dec!(100))?, price(dec!(90))?, price(dec!(120))?);
    let signal = engine.create_signal(TRADER, draft)?;

    let feed = Arc::new(MockPriceFeed::new());
    feed.set_price("BTC-USD", price(dec!(105))?);

    let sweep = SweepConfig {
        price_refresh_ms: 20,
        status_eval_ms: 30,
        price_ttl_ms: 1_000,
        check_trade_triggers: true,
    };
    let handle = SignalSweeper::new(Arc::clone(&engine), feed.clone()).with_config(sweep).spawn();

    tokio::time::sleep(Duration::from_millis(120)).await;
    println!("  Price 105: status {}", engine.get_signal(signal.id)?.status);

    feed.set_price("BTC-USD", price(dec!(89))?);
    tokio::time::sleep(Duration::from_millis(120)).await;
    println!("  Price 89: status {}", engine.get_signal(signal.id)?.status);

    handle.shutdown().await;
    println!("  Sweeper stopped, {} events recorded", engine.events().len());
    Ok(())
}
