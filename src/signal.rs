// 8.0: published trade ideas and their price-driven status.
//   Pending -> Active -> {StopLoss, TargetHit}
// one direction only. the sweeper feeds prices in through Signal::observe.

use crate::types::{Price, SignalId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Pending,
    Active,
    StopLoss,
    TargetHit,
}

impl SignalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SignalStatus::StopLoss | SignalStatus::TargetHit)
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SignalStatus::Pending => "Pending",
            SignalStatus::Active => "Active",
            SignalStatus::StopLoss => "Stop Loss",
            SignalStatus::TargetHit => "Target Hit",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDraft {
    pub symbol: String,
    pub entry_price: Price,
    pub stop_loss: Price,
    pub target_price: Price,
}

impl SignalDraft {
    pub fn new(symbol: impl Into<String>, entry_price: Price, stop_loss: Price, target_price: Price) -> Self {
        Self {
            symbol: symbol.into(),
            entry_price,
            stop_loss,
            target_price,
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.stop_loss < self.entry_price && self.entry_price < self.target_price
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    pub trader: UserId,
    pub symbol: String,
    pub entry_price: Price,
    pub stop_loss: Price,
    pub target_price: Price,
    pub current_price: Option<Price>,
    pub status: SignalStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalTransition {
    pub signal: SignalId,
    pub from: SignalStatus,
    pub to: SignalStatus,
    pub price: Price,
}

impl Signal {
    pub fn from_draft(id: SignalId, trader: UserId, draft: SignalDraft, timestamp: Timestamp) -> Self {
        Self {
            id,
            trader,
            symbol: draft.symbol,
            entry_price: draft.entry_price,
            stop_loss: draft.stop_loss,
            target_price: draft.target_price,
            current_price: None,
            status: SignalStatus::Pending,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    /// Record a market price and advance the status if a threshold was crossed.
    /// At most one step per observation. Terminal signals are left untouched.
    pub fn observe(&mut self, price: Price, timestamp: Timestamp) -> Option<SignalTransition> {
        if self.status.is_terminal() {
            return None;
        }

        self.current_price = Some(price);
        self.updated_at = timestamp;

        let next = next_status(self.status, self.entry_price, self.stop_loss, self.target_price, price)?;
        let transition = SignalTransition {
            signal: self.id,
            from: self.status,
            to: next,
            price,
        };
        self.status = next;
        Some(transition)
    }
}

pub fn next_status(
    status: SignalStatus,
    entry_price: Price,
    stop_loss: Price,
    target_price: Price,
    price: Price,
) -> Option<SignalStatus> {
    match status {
        SignalStatus::Pending if price >= entry_price => Some(SignalStatus::Active),
        SignalStatus::Active if price <= stop_loss => Some(SignalStatus::StopLoss),
        SignalStatus::Active if price >= target_price => Some(SignalStatus::TargetHit),
        _ => None,
    }
}
