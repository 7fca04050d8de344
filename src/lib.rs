// settlement-core: settlement and trade lifecycle engine for a trading platform.
// money-first architecture: every balance change is an atomic, journaled ledger delta.
// deterministic core, the only I/O is the price feed used by the sweeper.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: ids, Amount, Price, Quantity, Leverage, Percent, Timestamp
//   2.x  ledger.rs: wallets, transaction records, atomic apply_delta
//   3.x  store.rs: locked state + unit of work with rollback journal
//   4.x  plan.rs: plan catalog, trader vs upgrade plans
//   5.x  settlement.rs: commission split, settlement legs
//   6.x  subscription.rs: subscription records, lazy expiry
//   7.x  trade.rs: trade state machine, margin, pnl, stop/take triggers
//   8.x  signal.rs: signal status machine
//   9.x  sweeper.rs: price refresh + status evaluation loops
//   9.5  price_feed.rs: price feed trait, TTL cache, mock feed (mocked upstream)
//   10.x config.rs: platform account, money rules, sweep cadence, env presets
//   11.x events.rs: state transition events for audit
//   12.x engine/: core engine: settlement, subscriptions, trades, signals

// ledger and money movement
pub mod ledger;
pub mod settlement;
pub mod store;
pub mod types;

// catalog and lifecycle
pub mod engine;
pub mod plan;
pub mod signal;
pub mod subscription;
pub mod trade;

// integration modules
pub mod config;
pub mod events;
pub mod price_feed;
pub mod sweeper;

// re exports for convenience
pub use config::{ConfigError, Environment, PlatformConfig, SweepConfig};
pub use engine::*;
pub use events::*;
pub use ledger::{Delta, Ledger, LedgerError, TransactionRecord, TxDirection, TxKind, TxLink, TxStatus, Wallet};
pub use plan::{Plan, PlanDraft, PlanError, PlanKind, PlanUpdate};
pub use price_feed::{MockPriceFeed, PriceCache, PriceFeed, PriceFeedError, PriceUpdate};
pub use settlement::{CommissionSplit, SettlementResult, Split};
pub use signal::{Signal, SignalDraft, SignalStatus, SignalTransition};
pub use subscription::SubscriptionRecord;
pub use sweeper::{SignalSweeper, SweeperHandle};
pub use trade::{CloseReason, OrderKind, OrderRequest, Trade, TradeStatus};
pub use types::*;
