// 12.0.2: result types and errors for engine operations.

use crate::ledger::{LedgerError, TransactionRecord};
use crate::plan::PlanError;
use crate::settlement::SettlementResult;
use crate::signal::{SignalStatus, SignalTransition};
use crate::subscription::SubscriptionRecord;
use crate::trade::{Trade, TradeStatus};
use crate::types::{Amount, PlanId, Price, SignalId, SubscriptionId, TradeId, UserId};
use serde::Serialize;

/// Outcome of a subscription purchase.
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub record: SubscriptionRecord,
    pub settlement: SettlementResult,
    /// Subscriber was moved from customer to trader by this purchase.
    pub promoted: bool,
    /// The request reference had already been processed; nothing was charged.
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseResult {
    pub trade: Trade,
    pub realized_pnl: Amount,
    pub margin_release: TransactionRecord,
    pub pnl_record: Option<TransactionRecord>,
    /// Part of a loss the wallet could not cover. Zero for profits.
    pub shortfall: Amount,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResult {
    pub trade: Trade,
    pub margin_release: TransactionRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct LivePnl {
    pub trade: TradeId,
    pub symbol: String,
    pub mark: Price,
    pub unrealized_pnl: Amount,
}

/// What one status-evaluation pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub evaluated: usize,
    pub transitions: Vec<SignalTransition>,
    pub skipped: Vec<SignalId>,
    pub trades_closed: Vec<TradeId>,
}

impl SweepReport {
    pub fn count_to(&self, status: SignalStatus) -> usize {
        self.transitions.iter().filter(|t| t.to == status).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Insufficient funds in {wallet}: requested {requested}, available {available}")]
    InsufficientFunds { wallet: UserId, requested: Amount, available: Amount },

    #[error("Plan {0} is not active")]
    PlanInactive(PlanId),

    #[error("Plan {0} not found")]
    PlanNotFound(PlanId),

    #[error("{subscriber} already holds an active subscription to {plan}")]
    AlreadySubscribed { subscriber: UserId, plan: PlanId },

    #[error("{0} cannot subscribe to their own plan")]
    SelfSubscriptionForbidden(UserId),

    #[error("Wallet for {0} not found")]
    WalletNotFound(UserId),

    #[error("Trade {trade} is {status:?}, cannot {action}")]
    InvalidTradeState { trade: TradeId, status: TradeStatus, action: &'static str },

    #[error("Trade {0} not found")]
    TradeNotFound(TradeId),

    #[error("{user} is not allowed to {action}")]
    Unauthorized { user: UserId, action: &'static str },

    #[error("{0} is not a registered identity")]
    UnknownUser(UserId),

    #[error("Subscription {0} not found")]
    SubscriptionNotFound(SubscriptionId),

    #[error("Signal {0} not found")]
    SignalNotFound(SignalId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Ledger error: {0}")]
    Ledger(LedgerError),
}

// the two ledger errors callers act on keep their own kind
impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { wallet, requested, available } => {
                EngineError::InsufficientFunds { wallet, requested, available }
            }
            LedgerError::WalletNotFound(wallet) => EngineError::WalletNotFound(wallet),
            overflow @ LedgerError::Overflow(_) => EngineError::InvalidInput(overflow.to_string()),
            other => EngineError::Ledger(other),
        }
    }
}
