// 12.0: settlement engine facade. coordinates wallets, plan purchases, trade lifecycle
// and signal status on top of one transactional store. every public mutation is a
// single unit of work: it either commits completely or leaves no trace.

mod core;
mod results;
mod settlement;
mod signals;
mod subscriptions;
mod trades;

pub use core::Engine;
pub use results::{CancelResult, CloseResult, EngineError, LivePnl, Subscription, SweepReport};
