// 11.0: every committed state change produces an event. used for audit trails and
// notifying the calling layer. events from a rolled-back unit of work are dropped
// with it, so the log only ever shows what actually happened.

use crate::signal::SignalStatus;
use crate::trade::CloseReason;
use crate::types::{
    Amount, CorrelationId, PlanId, Price, Role, Side, SignalId, SubscriptionId, Timestamp, TradeId, TxId, UserId,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    // Wallet events
    WalletCredited(WalletEvent),
    WalletDebited(WalletEvent),

    // Settlement and subscription events
    SettlementCompleted(SettlementEvent),
    SubscriptionCreated(SubscriptionEvent),
    SubscriptionRevoked(SubscriptionEvent),
    RoleChanged(RoleChangedEvent),
    PlanChanged(PlanChangedEvent),

    // Trade events
    TradePlaced(TradePlacedEvent),
    TradeOpened(TradeOpenedEvent),
    TradeClosed(TradeClosedEvent),
    TradeCancelled(TradeCancelledEvent),

    // Signal events
    SignalStatusChanged(SignalStatusChangedEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletEvent {
    pub wallet: UserId,
    pub tx: TxId,
    pub amount: Amount,
    pub new_balance: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub correlation: CorrelationId,
    pub plan: PlanId,
    pub payer: UserId,
    pub price: Amount,
    pub commission: Amount,
    pub recipient_share: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub subscription: SubscriptionId,
    pub subscriber: UserId,
    pub plan: PlanId,
    pub end: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleChangedEvent {
    pub user: UserId,
    pub from: Role,
    pub to: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanChangedEvent {
    pub plan: PlanId,
    pub owner: UserId,
    pub change: PlanChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanChange {
    Created,
    Updated,
    Deactivated,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePlacedEvent {
    pub trade: TradeId,
    pub trader: UserId,
    pub symbol: String,
    pub side: Side,
    pub margin: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOpenedEvent {
    pub trade: TradeId,
    pub executed_price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeClosedEvent {
    pub trade: TradeId,
    pub close_price: Price,
    pub realized_pnl: Amount,
    pub reason: CloseReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeCancelledEvent {
    pub trade: TradeId,
    pub margin_released: Amount,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalStatusChangedEvent {
    pub signal: SignalId,
    pub from: SignalStatus,
    pub to: SignalStatus,
    pub price: Price,
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::WalletCredited(_) => "wallet_credited",
            EventPayload::WalletDebited(_) => "wallet_debited",
            EventPayload::SettlementCompleted(_) => "settlement_completed",
            EventPayload::SubscriptionCreated(_) => "subscription_created",
            EventPayload::SubscriptionRevoked(_) => "subscription_revoked",
            EventPayload::RoleChanged(_) => "role_changed",
            EventPayload::PlanChanged(_) => "plan_changed",
            EventPayload::TradePlaced(_) => "trade_placed",
            EventPayload::TradeOpened(_) => "trade_opened",
            EventPayload::TradeClosed(_) => "trade_closed",
            EventPayload::TradeCancelled(_) => "trade_cancelled",
            EventPayload::SignalStatusChanged(_) => "signal_status_changed",
        }
    }
}
