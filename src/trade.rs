// 7.0: trade state machine and the money math around it.
//   Pending -> Open -> Closed
//   Pending -> Cancelled
// terminal states never move again. 7.1 is margin, 7.2 pnl, 7.3 stop/take triggers.

use crate::types::{Amount, Leverage, Price, Quantity, RoundingRule, Side, Timestamp, TradeId, TxId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Open,
    Closed,
    Cancelled,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Closed | TradeStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        matches!(
            (self, next),
            (TradeStatus::Pending, TradeStatus::Open)
                | (TradeStatus::Pending, TradeStatus::Cancelled)
                | (TradeStatus::Open, TradeStatus::Closed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
}

/// An order as submitted by a trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub entry_price: Price,
    pub quantity: Quantity,
    pub leverage: Leverage,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    /// Idempotency reference for the margin reservation.
    pub reference: String,
}

impl OrderRequest {
    pub fn market(
        symbol: impl Into<String>,
        side: Side,
        entry_price: Price,
        quantity: Quantity,
        leverage: Leverage,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            kind: OrderKind::Market,
            entry_price,
            quantity,
            leverage,
            stop_loss: None,
            take_profit: None,
            reference: reference.into(),
        }
    }

    pub fn with_kind(mut self, kind: OrderKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_protection(mut self, stop_loss: Option<Price>, take_profit: Option<Price>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub trader: UserId,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub entry_price: Price,
    pub quantity: Quantity,
    pub leverage: Leverage,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    pub status: TradeStatus,
    pub margin: Amount,
    pub margin_tx: TxId,
    pub executed_price: Option<Price>,
    pub close_price: Option<Price>,
    pub realized_pnl: Option<Amount>,
    pub close_reason: Option<CloseReason>,
    pub created_at: Timestamp,
    pub opened_at: Option<Timestamp>,
    pub closed_at: Option<Timestamp>,
}

impl Trade {
    pub fn new(
        id: TradeId,
        trader: UserId,
        order: &OrderRequest,
        margin: Amount,
        margin_tx: TxId,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            trader,
            symbol: order.symbol.clone(),
            side: order.side,
            kind: order.kind,
            entry_price: order.entry_price,
            quantity: order.quantity,
            leverage: order.leverage,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            status: TradeStatus::Pending,
            margin,
            margin_tx,
            executed_price: None,
            close_price: None,
            realized_pnl: None,
            close_reason: None,
            created_at: timestamp,
            opened_at: None,
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    pub fn accepts_edits(&self) -> bool {
        matches!(self.status, TradeStatus::Pending | TradeStatus::Open)
    }

    pub fn open(&mut self, executed_price: Price, timestamp: Timestamp) {
        debug_assert!(self.status.can_transition_to(TradeStatus::Open));
        self.status = TradeStatus::Open;
        self.executed_price = Some(executed_price);
        self.opened_at = Some(timestamp);
    }

    pub fn close(&mut self, close_price: Price, pnl: Amount, reason: CloseReason, timestamp: Timestamp) {
        debug_assert!(self.status.can_transition_to(TradeStatus::Closed));
        self.status = TradeStatus::Closed;
        self.close_price = Some(close_price);
        self.realized_pnl = Some(pnl);
        self.close_reason = Some(reason);
        self.closed_at = Some(timestamp);
    }

    pub fn cancel(&mut self, timestamp: Timestamp) {
        debug_assert!(self.status.can_transition_to(TradeStatus::Cancelled));
        self.status = TradeStatus::Cancelled;
        self.closed_at = Some(timestamp);
    }

    /// Paper P&L at `mark`. Zero unless the trade is open, `None` if the move
    /// does not fit in a decimal.
    pub fn unrealized_pnl(&self, mark: Price) -> Option<Amount> {
        match (self.status, self.executed_price) {
            (TradeStatus::Open, Some(executed)) => {
                calculate_pnl(self.side, executed, mark, self.quantity, self.leverage)
            }
            _ => Some(Amount::zero()),
        }
    }

    /// Which protective level, if any, `price` has crossed.
    pub fn triggered_by(&self, price: Price) -> Option<CloseReason> {
        if !self.is_open() {
            return None;
        }
        check_trigger(self.side, self.stop_loss, self.take_profit, price)
    }
}

// 7.1: margin = quantity * entry / leverage, rounded to the ledger scale.
// None when the notional overflows.
pub fn required_margin(
    quantity: Quantity,
    entry_price: Price,
    leverage: Leverage,
    scale: u32,
    rounding: RoundingRule,
) -> Option<Amount> {
    let margin = notional(quantity, entry_price)?.checked_div(leverage.value())?;
    Some(Amount::new(margin).round(scale, rounding))
}

// 7.2: the pnl formula. (close - executed) * qty * leverage, mirrored for sells.
// None when the result overflows.
pub fn calculate_pnl(
    side: Side,
    executed_price: Price,
    close_price: Price,
    quantity: Quantity,
    leverage: Leverage,
) -> Option<Amount> {
    let move_per_unit = close_price.value().checked_sub(executed_price.value())?;
    let pnl = (side.sign() * move_per_unit)
        .checked_mul(quantity.value())?
        .checked_mul(leverage.value())?;
    Some(Amount::new(pnl))
}

// 7.3: a buy is stopped below and takes profit above, a sell the reverse.
// stop-loss wins if both are somehow crossed.
pub fn check_trigger(
    side: Side,
    stop_loss: Option<Price>,
    take_profit: Option<Price>,
    price: Price,
) -> Option<CloseReason> {
    let (stop_hit, take_hit) = match side {
        Side::Buy => (
            stop_loss.is_some_and(|sl| price <= sl),
            take_profit.is_some_and(|tp| price >= tp),
        ),
        Side::Sell => (
            stop_loss.is_some_and(|sl| price >= sl),
            take_profit.is_some_and(|tp| price <= tp),
        ),
    };

    if stop_hit {
        Some(CloseReason::StopLoss)
    } else if take_hit {
        Some(CloseReason::TakeProfit)
    } else {
        None
    }
}

/// Protective levels must sit on the losing/winning side of the reference price.
pub fn protection_is_consistent(
    side: Side,
    reference: Price,
    stop_loss: Option<Price>,
    take_profit: Option<Price>,
) -> bool {
    let r = reference.value();
    let sl_ok = stop_loss.map_or(true, |sl| match side {
        Side::Buy => sl.value() < r,
        Side::Sell => sl.value() > r,
    });
    let tp_ok = take_profit.map_or(true, |tp| match side {
        Side::Buy => tp.value() > r,
        Side::Sell => tp.value() < r,
    });
    sl_ok && tp_ok
}

pub fn notional(quantity: Quantity, price: Price) -> Option<Decimal> {
    quantity.value().checked_mul(price.value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn p(v: Decimal) -> Price {
        Price::new_unchecked(v)
    }

    fn q(v: Decimal) -> Quantity {
        Quantity::new(v).unwrap()
    }

    fn lev(v: Decimal) -> Leverage {
        Leverage::new(v).unwrap()
    }

    #[test]
    fn legal_transitions() {
        use TradeStatus::*;
        assert!(Pending.can_transition_to(Open));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Open.can_transition_to(Closed));
        assert!(!Open.can_transition_to(Cancelled));
        for terminal in [Closed, Cancelled] {
            for next in [Pending, Open, Closed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn margin_scales_down_with_leverage() {
        let margin = required_margin(q(dec!(2)), p(dec!(100)), lev(dec!(5)), 2, RoundingRule::HalfEven);
        assert_eq!(margin.map(|m| m.value()), Some(dec!(40)));

        let odd = required_margin(q(dec!(1)), p(dec!(10)), lev(dec!(3)), 2, RoundingRule::HalfEven);
        assert_eq!(odd.map(|m| m.value()), Some(dec!(3.33)));
    }

    #[test]
    fn oversized_notional_has_no_margin() {
        let huge = dec!(1_000_000_000_000_000);
        assert!(notional(q(huge), p(huge)).is_none());
        assert!(required_margin(q(huge), p(huge), lev(dec!(1)), 2, RoundingRule::HalfEven).is_none());
        assert!(calculate_pnl(Side::Buy, p(dec!(1)), p(huge), q(huge), lev(dec!(100))).is_none());
    }

    #[test]
    fn buy_pnl_scenario() {
        let pnl = calculate_pnl(Side::Buy, p(dec!(100)), p(dec!(110)), q(dec!(2)), lev(dec!(5))).unwrap();
        assert_eq!(pnl.value(), dec!(100));
    }

    #[test]
    fn sell_pnl_mirrors_buy() {
        let pnl = calculate_pnl(Side::Sell, p(dec!(100)), p(dec!(110)), q(dec!(2)), lev(dec!(5))).unwrap();
        assert_eq!(pnl.value(), dec!(-100));
    }

    #[test]
    fn buy_triggers() {
        let sl = Some(p(dec!(90)));
        let tp = Some(p(dec!(120)));
        assert_eq!(check_trigger(Side::Buy, sl, tp, p(dec!(90))), Some(CloseReason::StopLoss));
        assert_eq!(check_trigger(Side::Buy, sl, tp, p(dec!(125))), Some(CloseReason::TakeProfit));
        assert_eq!(check_trigger(Side::Buy, sl, tp, p(dec!(100))), None);
    }

    #[test]
    fn sell_triggers() {
        let sl = Some(p(dec!(110)));
        let tp = Some(p(dec!(80)));
        assert_eq!(check_trigger(Side::Sell, sl, tp, p(dec!(111))), Some(CloseReason::StopLoss));
        assert_eq!(check_trigger(Side::Sell, sl, tp, p(dec!(80))), Some(CloseReason::TakeProfit));
        assert_eq!(check_trigger(Side::Sell, None, None, p(dec!(1))), None);
    }

    #[test]
    fn protection_sides() {
        assert!(protection_is_consistent(Side::Buy, p(dec!(100)), Some(p(dec!(90))), Some(p(dec!(110)))));
        assert!(!protection_is_consistent(Side::Buy, p(dec!(100)), Some(p(dec!(105))), None));
        assert!(protection_is_consistent(Side::Sell, p(dec!(100)), Some(p(dec!(105))), Some(p(dec!(95)))));
        assert!(!protection_is_consistent(Side::Sell, p(dec!(100)), None, Some(p(dec!(101)))));
    }

    #[test]
    fn unrealized_only_when_open() {
        let order = OrderRequest::market("BTC", Side::Buy, p(dec!(100)), q(dec!(1)), Leverage::one(), "o-1");
        let mut trade = Trade::new(TradeId(1), UserId(1), &order, Amount::new(dec!(100)), TxId(1), Timestamp::from_millis(0));
        assert_eq!(trade.unrealized_pnl(p(dec!(150))), Some(Amount::zero()));

        trade.open(p(dec!(100)), Timestamp::from_millis(1));
        assert_eq!(trade.unrealized_pnl(p(dec!(150))), Some(Amount::new(dec!(50))));

        trade.close(p(dec!(120)), Amount::new(dec!(20)), CloseReason::Manual, Timestamp::from_millis(2));
        assert_eq!(trade.unrealized_pnl(p(dec!(150))), Some(Amount::zero()));
        assert!(trade.status.is_terminal());
    }
}
