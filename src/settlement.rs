// 5.0 settlement.rs: how a purchase price is divided between the parties.
// the engine side (engine/settlement.rs) turns these legs into ledger deltas
// inside one unit of work.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::{TransactionRecord, TxKind};
use crate::types::{Amount, CorrelationId, Percent, PlanId, RoundingRule, Timestamp, UserId};

// 5.1: commission rounded to the ledger scale, the recipient gets the exact remainder.
// rounding only ever moves value between platform and recipient, never creates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSplit {
    pub price: Amount,
    pub commission: Amount,
    pub recipient_share: Amount,
}

pub fn split_commission(price: Amount, commission: Percent, scale: u32, rounding: RoundingRule) -> CommissionSplit {
    let commission = price.mul(commission.as_fraction()).round(scale, rounding);
    CommissionSplit {
        price,
        commission,
        recipient_share: price.sub(commission),
    }
}

/// Who receives what in a settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Split {
    /// Platform collects the whole price.
    PlatformOnly,
    /// Recipient collects the price minus the platform's commission.
    Commission { recipient: UserId, rate: Percent },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegRole {
    Payer,
    Platform,
    Recipient,
}

/// One party's side of a settlement before it hits the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementLeg {
    pub party: UserId,
    pub role: LegRole,
    /// Signed: negative for the payer.
    pub amount: Amount,
    pub kind: TxKind,
}

// 5.2: payer debit first so an insufficient balance fails before any credit is staged.
// zero-value legs are dropped (0% or 100% commission).
pub fn settlement_legs(
    payer: UserId,
    platform: UserId,
    price: Amount,
    split: Split,
    scale: u32,
    rounding: RoundingRule,
) -> (CommissionSplit, Vec<SettlementLeg>) {
    let mut legs = vec![SettlementLeg {
        party: payer,
        role: LegRole::Payer,
        amount: price.negate(),
        kind: TxKind::SubscriptionPayment,
    }];

    let split_amounts = match split {
        Split::PlatformOnly => {
            legs.push(SettlementLeg {
                party: platform,
                role: LegRole::Platform,
                amount: price,
                kind: TxKind::SubscriptionPayment,
            });
            CommissionSplit {
                price,
                commission: price,
                recipient_share: Amount::zero(),
            }
        }
        Split::Commission { recipient, rate } => {
            let amounts = split_commission(price, rate, scale, rounding);
            if !amounts.commission.is_zero() {
                legs.push(SettlementLeg {
                    party: platform,
                    role: LegRole::Platform,
                    amount: amounts.commission,
                    kind: TxKind::Commission,
                });
            }
            if !amounts.recipient_share.is_zero() {
                legs.push(SettlementLeg {
                    party: recipient,
                    role: LegRole::Recipient,
                    amount: amounts.recipient_share,
                    kind: TxKind::SubscriptionPayment,
                });
            }
            amounts
        }
    };

    (split_amounts, legs)
}

/// What a committed settlement produced. One record per party, all sharing
/// the same correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementResult {
    pub correlation: CorrelationId,
    pub plan: PlanId,
    pub payer: UserId,
    pub split: CommissionSplit,
    pub records: Vec<TransactionRecord>,
    pub settled_at: Timestamp,
}

impl SettlementResult {
    /// Sum of every balance change. Zero for any committed settlement.
    pub fn net(&self) -> Amount {
        self.records.iter().map(|r| r.signed_amount()).sum()
    }

    pub fn payer_record(&self) -> Option<&TransactionRecord> {
        self.records.iter().find(|r| r.wallet == self.payer)
    }
}

pub fn is_balanced(legs: &[SettlementLeg]) -> bool {
    legs.iter().map(|l| l.amount.value()).sum::<Decimal>().is_zero()
}
