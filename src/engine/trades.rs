//! Trade lifecycle: margin reservation, fills, closes, cancels and live P&L.

use std::collections::{BTreeSet, HashMap};

use super::core::{caller_reference, require_trader, require_user, Engine};
use super::results::{CancelResult, CloseResult, EngineError, LivePnl};
use crate::events::{EventPayload, TradeCancelledEvent, TradeClosedEvent, TradeOpenedEvent, TradePlacedEvent};
use crate::ledger::{internal_reference, Delta, LedgerError, TxKind, TxLink, TxStatus};
use crate::price_feed::PriceFeed;
use crate::store::UnitOfWork;
use crate::trade::{
    calculate_pnl, protection_is_consistent, required_margin, CloseReason, OrderKind, OrderRequest, Trade,
    TradeStatus,
};
use crate::types::{Amount, Price, Role, TradeId, UserId};
use tracing::{debug, info, warn};

impl Engine {
    /// Reserve margin and record the trade. Market orders open at their entry price
    /// straight away, limit and stop orders wait for [`Engine::fill_trade`].
    pub fn place_trade(&self, trader: UserId, order: OrderRequest) -> Result<Trade, EngineError> {
        self.validate_order(&order)?;

        let result = self.store.transaction(|uow| -> Result<Trade, EngineError> {
            require_trader(uow, trader, "place trade")?;

            if let Some(id) = uow.state().trade_id_by_reference(trader, &order.reference) {
                return match uow.state().trades.get(&id) {
                    Some(existing) => Ok(existing.clone()),
                    None => Err(EngineError::InvalidInput(format!(
                        "order reference {:?} was already used",
                        order.reference
                    ))),
                };
            }

            let margin = required_margin(
                order.quantity,
                order.entry_price,
                order.leverage,
                self.config.money_scale,
                self.config.rounding,
            )
            .ok_or_else(|| {
                EngineError::InvalidInput(format!(
                    "notional of {} at {} is too large",
                    order.quantity, order.entry_price
                ))
            })?;
            if !margin.is_positive() {
                return Err(EngineError::InvalidInput("order is too small to reserve any margin".into()));
            }

            let id = uow.next_trade_id();
            let correlation = uow.next_correlation();
            let now = uow.now();

            // 12.4: margin is held as a pending debit until the trade opens or is cancelled
            let delta = Delta::new(
                trader,
                margin.negate(),
                TxKind::TradeMargin,
                internal_reference(id, "margin"),
                correlation,
            )
            .pending()
            .linked(TxLink::Trade(id));
            let reservation = uow.apply_delta(&delta)?;

            let mut trade = Trade::new(id, trader, &order, margin, reservation.record.id, now);
            uow.emit(EventPayload::TradePlaced(TradePlacedEvent {
                trade: id,
                trader,
                symbol: trade.symbol.clone(),
                side: trade.side,
                margin,
            }));

            if order.kind == OrderKind::Market {
                open_in(uow, &mut trade, order.entry_price)?;
            }

            uow.put_trade(trade.clone());
            uow.index_trade_reference(trader, &order.reference, id);
            Ok(trade)
        });

        match &result {
            Ok(trade) => info!(
                %trader,
                trade = %trade.id,
                symbol = %trade.symbol,
                side = ?trade.side,
                margin = %trade.margin,
                status = ?trade.status,
                "trade placed"
            ),
            Err(err) => debug!(%trader, symbol = %order.symbol, %err, "trade rejected"),
        }
        result
    }

    /// Pending -> Open for a limit or stop order that executed at `executed_price`.
    pub fn fill_trade(&self, actor: UserId, trade_id: TradeId, executed_price: Price) -> Result<Trade, EngineError> {
        let trade = self.store.transaction(|uow| -> Result<Trade, EngineError> {
            let mut trade = owned_trade(uow, actor, trade_id, "fill trade")?;
            if trade.status != TradeStatus::Pending {
                return Err(invalid_state(&trade, "fill"));
            }
            open_in(uow, &mut trade, executed_price)?;
            uow.put_trade(trade.clone());
            Ok(trade)
        })?;

        info!(trade = %trade_id, price = %executed_price, "trade filled");
        Ok(trade)
    }

    /// Close an open trade at `close_price`. Margin comes back and P&L is booked on top.
    pub fn close_trade(&self, actor: UserId, trade_id: TradeId, close_price: Price) -> Result<CloseResult, EngineError> {
        self.store.transaction(|uow| -> Result<CloseResult, EngineError> {
            let trade = owned_trade(uow, actor, trade_id, "close trade")?;
            self.close_in(uow, trade, close_price, CloseReason::Manual)
        })
    }

    // 12.4.1: release the reservation, then book the pnl as its own record. a loss is
    // taken from whatever the wallet holds after the release, the rest is shortfall.
    fn close_in(
        &self,
        uow: &mut UnitOfWork<'_>,
        mut trade: Trade,
        close_price: Price,
        reason: CloseReason,
    ) -> Result<CloseResult, EngineError> {
        let executed = match (trade.status, trade.executed_price) {
            (TradeStatus::Open, Some(executed)) => executed,
            _ => return Err(invalid_state(&trade, "close")),
        };

        let pnl = calculate_pnl(trade.side, executed, close_price, trade.quantity, trade.leverage)
            .map(|pnl| self.round_money(pnl))
            .ok_or_else(|| EngineError::InvalidInput(format!("pnl of {} at {close_price} is too large", trade.id)))?;
        let correlation = uow.next_correlation();
        let link = TxLink::Trade(trade.id);

        let release = uow
            .apply_delta(
                &Delta::new(
                    trade.trader,
                    trade.margin,
                    TxKind::TradeMarginRelease,
                    internal_reference(trade.id, "release"),
                    correlation,
                )
                .linked(link),
            )?
            .record;

        let mut shortfall = Amount::zero();
        let booked = if pnl.is_positive() {
            pnl
        } else {
            let available = release.balance_after;
            let covered = pnl.abs().min(available);
            shortfall = pnl.abs().sub(covered);
            covered.negate()
        };

        let pnl_record = if booked.is_zero() {
            None
        } else {
            let kind = if booked.is_positive() { TxKind::TradeProfit } else { TxKind::TradeLoss };
            let delta = Delta::new(trade.trader, booked, kind, internal_reference(trade.id, "pnl"), correlation)
                .linked(link);
            Some(uow.apply_delta(&delta)?.record)
        };

        trade.close(close_price, pnl, reason, uow.now());
        uow.emit(EventPayload::TradeClosed(TradeClosedEvent {
            trade: trade.id,
            close_price,
            realized_pnl: pnl,
            reason,
        }));
        uow.put_trade(trade.clone());

        if shortfall.is_positive() {
            warn!(trade = %trade.id, trader = %trade.trader, %shortfall, "loss exceeded wallet balance");
        }
        info!(trade = %trade.id, price = %close_price, %pnl, ?reason, "trade closed");

        Ok(CloseResult {
            trade,
            realized_pnl: pnl,
            margin_release: release,
            pnl_record,
            shortfall,
        })
    }

    /// Pending -> Cancelled. The reservation stands as applied and the margin is
    /// credited back by a release record under the same correlation.
    pub fn cancel_trade(&self, actor: UserId, trade_id: TradeId) -> Result<CancelResult, EngineError> {
        let result = self.store.transaction(|uow| -> Result<CancelResult, EngineError> {
            let trade = owned_trade(uow, actor, trade_id, "cancel trade")?;
            cancel_in(uow, trade, false)
        })?;

        info!(trade = %trade_id, released = %result.margin_release.amount, "trade cancelled");
        Ok(result)
    }

    /// Remove a pending trade. Its margin is released first, the ledger keeps the records.
    pub fn delete_trade(&self, actor: UserId, trade_id: TradeId) -> Result<CancelResult, EngineError> {
        let result = self.store.transaction(|uow| -> Result<CancelResult, EngineError> {
            let trade = owned_trade(uow, actor, trade_id, "delete trade")?;
            if trade.status != TradeStatus::Pending {
                return Err(invalid_state(&trade, "delete"));
            }
            let result = cancel_in(uow, trade, true)?;
            uow.remove_trade(trade_id);
            Ok(result)
        })?;

        info!(trade = %trade_id, "trade deleted");
        Ok(result)
    }

    /// Replace stop-loss and take-profit. Only pending and open trades accept edits.
    pub fn update_protection(
        &self,
        actor: UserId,
        trade_id: TradeId,
        stop_loss: Option<Price>,
        take_profit: Option<Price>,
    ) -> Result<Trade, EngineError> {
        self.store.transaction(|uow| -> Result<Trade, EngineError> {
            let mut trade = owned_trade(uow, actor, trade_id, "edit trade")?;
            if !trade.accepts_edits() {
                return Err(invalid_state(&trade, "edit protection"));
            }

            let reference = trade.executed_price.unwrap_or(trade.entry_price);
            if !protection_is_consistent(trade.side, reference, stop_loss, take_profit) {
                return Err(EngineError::InvalidInput(format!(
                    "stop-loss/take-profit on the wrong side of {reference} for a {:?}",
                    trade.side
                )));
            }

            trade.stop_loss = stop_loss;
            trade.take_profit = take_profit;
            uow.put_trade(trade.clone());
            debug!(trade = %trade_id, ?stop_loss, ?take_profit, "protection updated");
            Ok(trade)
        })
    }

    /// Close every open trade on `symbol` whose stop-loss or take-profit `price` crossed.
    /// Each close is its own unit of work; one failure does not stop the rest.
    pub fn check_trade_triggers(&self, symbol: &str, price: Price) -> Vec<CloseResult> {
        let triggered: Vec<(TradeId, CloseReason)> = self.store.read(|s| {
            s.trades
                .values()
                .filter(|t| t.symbol == symbol)
                .filter_map(|t| t.triggered_by(price).map(|reason| (t.id, reason)))
                .collect()
        });

        let mut closed = Vec::with_capacity(triggered.len());
        for (id, reason) in triggered {
            let result = self.store.transaction(|uow| -> Result<CloseResult, EngineError> {
                let trade = uow.state().trades.get(&id).cloned().ok_or(EngineError::TradeNotFound(id))?;
                self.close_in(uow, trade, price, reason)
            });
            match result {
                Ok(close) => closed.push(close),
                Err(err) => warn!(trade = %id, %symbol, %err, "triggered close failed"),
            }
        }
        closed
    }

    pub fn get_trade(&self, trade_id: TradeId) -> Result<Trade, EngineError> {
        self.store
            .read(|s| s.trades.get(&trade_id).cloned())
            .ok_or(EngineError::TradeNotFound(trade_id))
    }

    pub fn trades_for(&self, trader: UserId) -> Vec<Trade> {
        self.store
            .read(|s| s.trades.values().filter(|t| t.trader == trader).cloned().collect())
    }

    pub fn open_trades(&self) -> Vec<Trade> {
        self.store
            .read(|s| s.trades.values().filter(|t| t.is_open()).cloned().collect())
    }

    /// Symbols with at least one open trade.
    pub fn open_trade_symbols(&self) -> BTreeSet<String> {
        self.store
            .read(|s| s.trades.values().filter(|t| t.is_open()).map(|t| t.symbol.clone()).collect())
    }

    pub fn live_pnl(&self, trade_id: TradeId, mark: Price) -> Result<LivePnl, EngineError> {
        let trade = self.get_trade(trade_id)?;
        if !trade.is_open() {
            return Err(invalid_state(&trade, "value"));
        }
        Ok(LivePnl {
            trade: trade.id,
            symbol: trade.symbol.clone(),
            mark,
            unrealized_pnl: trade
                .unrealized_pnl(mark)
                .map(|pnl| self.round_money(pnl))
                .ok_or_else(|| EngineError::InvalidInput(format!("pnl of {} at {mark} is too large", trade.id)))?,
        })
    }

    /// Mark every open trade against `feed`. Symbols the feed cannot price are skipped.
    pub async fn unrealized_pnl_report(&self, feed: &dyn PriceFeed) -> Vec<LivePnl> {
        let trades = self.open_trades();
        let symbols: BTreeSet<&str> = trades.iter().map(|t| t.symbol.as_str()).collect();

        let mut marks = HashMap::new();
        for symbol in symbols {
            match feed.latest_price(symbol).await {
                Ok(update) => {
                    marks.insert(symbol, update.price);
                }
                Err(err) => warn!(%symbol, %err, "no mark for live pnl"),
            }
        }

        trades
            .iter()
            .filter_map(|trade| {
                let mark = *marks.get(trade.symbol.as_str())?;
                let Some(pnl) = trade.unrealized_pnl(mark) else {
                    warn!(trade = %trade.id, %mark, "live pnl out of range");
                    return None;
                };
                Some(LivePnl {
                    trade: trade.id,
                    symbol: trade.symbol.clone(),
                    mark,
                    unrealized_pnl: self.round_money(pnl),
                })
            })
            .collect()
    }

    fn validate_order(&self, order: &OrderRequest) -> Result<(), EngineError> {
        if order.symbol.trim().is_empty() {
            return Err(EngineError::InvalidInput("symbol must not be empty".into()));
        }
        caller_reference(&order.reference, "order")?;
        if order.leverage > self.config.max_leverage {
            return Err(EngineError::InvalidInput(format!(
                "leverage {} exceeds the maximum of {}",
                order.leverage, self.config.max_leverage
            )));
        }
        if !protection_is_consistent(order.side, order.entry_price, order.stop_loss, order.take_profit) {
            return Err(EngineError::InvalidInput(format!(
                "stop-loss/take-profit on the wrong side of {} for a {:?}",
                order.entry_price, order.side
            )));
        }
        Ok(())
    }
}

fn owned_trade(uow: &UnitOfWork<'_>, actor: UserId, trade_id: TradeId, action: &'static str) -> Result<Trade, EngineError> {
    let role = require_user(uow.state(), actor)?;
    let trade = uow
        .state()
        .trades
        .get(&trade_id)
        .cloned()
        .ok_or(EngineError::TradeNotFound(trade_id))?;
    if trade.trader != actor && role != Role::Admin {
        return Err(EngineError::Unauthorized { user: actor, action });
    }
    Ok(trade)
}

fn invalid_state(trade: &Trade, action: &'static str) -> EngineError {
    EngineError::InvalidTradeState { trade: trade.id, status: trade.status, action }
}

fn open_in(uow: &mut UnitOfWork<'_>, trade: &mut Trade, executed_price: Price) -> Result<(), EngineError> {
    uow.finalize_tx(trade.margin_tx, TxStatus::Success)?;
    trade.open(executed_price, uow.now());
    uow.emit(EventPayload::TradeOpened(TradeOpenedEvent { trade: trade.id, executed_price }));
    Ok(())
}

fn cancel_in(uow: &mut UnitOfWork<'_>, mut trade: Trade, deleted: bool) -> Result<CancelResult, EngineError> {
    if !trade.status.can_transition_to(TradeStatus::Cancelled) {
        return Err(invalid_state(&trade, "cancel"));
    }

    let margin_tx = uow
        .state()
        .ledger
        .record(trade.margin_tx)
        .cloned()
        .ok_or(EngineError::Ledger(LedgerError::TransactionNotFound(trade.margin_tx)))?;
    // the debit really happened; the release below is what undoes it
    uow.finalize_tx(trade.margin_tx, TxStatus::Success)?;

    let release = uow
        .apply_delta(
            &Delta::new(
                trade.trader,
                trade.margin,
                TxKind::TradeMarginRelease,
                internal_reference(trade.id, "release"),
                margin_tx.correlation,
            )
            .linked(TxLink::Trade(trade.id)),
        )?
        .record;

    trade.cancel(uow.now());
    uow.emit(EventPayload::TradeCancelled(TradeCancelledEvent {
        trade: trade.id,
        margin_released: release.amount,
        deleted,
    }));
    if !deleted {
        uow.put_trade(trade.clone());
    }

    Ok(CancelResult { trade, margin_release: release })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::price_feed::MockPriceFeed;
    use crate::types::{Leverage, Quantity, Side, Timestamp};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    const TRADER: UserId = UserId(2);

    fn p(v: Decimal) -> Price {
        Price::new_unchecked(v)
    }

    fn engine(balance: Decimal) -> Engine {
        let engine = Engine::new(PlatformConfig::default());
        engine.set_time(Timestamp::from_millis(0));
        engine.register_user(TRADER, Role::Trader);
        engine.deposit(TRADER, Amount::new(balance), "seed").unwrap();
        engine
    }

    fn order(side: Side, reference: &str) -> OrderRequest {
        OrderRequest::market(
            "BTC-USD",
            side,
            p(dec!(100)),
            Quantity::new(dec!(2)).unwrap(),
            Leverage::new(dec!(5)).unwrap(),
            reference,
        )
    }

    #[test]
    fn market_order_opens_and_reserves_margin() {
        let engine = engine(dec!(1000));
        let trade = engine.place_trade(TRADER, order(Side::Buy, "o-1")).unwrap();

        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.margin.value(), dec!(40));
        assert_eq!(engine.balance(TRADER).value(), dec!(960));
        let margin_tx = engine.store.read(|s| s.ledger.record(trade.margin_tx).cloned()).unwrap();
        assert_eq!(margin_tx.status, TxStatus::Success);
        assert_eq!(margin_tx.kind, TxKind::TradeMargin);
    }

    #[test]
    fn customers_cannot_trade() {
        let engine = engine(dec!(1000));
        engine.register_user(UserId(1), Role::Customer);
        assert_eq!(
            engine.place_trade(UserId(1), order(Side::Buy, "o-1")),
            Err(EngineError::Unauthorized { user: UserId(1), action: "place trade" })
        );
    }

    #[test]
    fn same_reference_returns_same_trade() {
        let engine = engine(dec!(1000));
        let first = engine.place_trade(TRADER, order(Side::Buy, "o-1")).unwrap();
        let second = engine.place_trade(TRADER, order(Side::Buy, "o-1")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(engine.balance(TRADER).value(), dec!(960));
    }

    #[test]
    fn loss_beyond_balance_is_capped() {
        let engine = engine(dec!(40));
        let trade = engine.place_trade(TRADER, order(Side::Buy, "o-1")).unwrap();
        assert!(engine.balance(TRADER).is_zero());

        // (50 - 100) * 2 * 5 = -500, wallet holds 40 after release
        let close = engine.close_trade(TRADER, trade.id, p(dec!(50))).unwrap();
        assert_eq!(close.realized_pnl.value(), dec!(-500));
        assert_eq!(close.shortfall.value(), dec!(460));
        assert!(engine.balance(TRADER).is_zero());
    }

    #[test]
    fn breakeven_close_books_no_pnl() {
        let engine = engine(dec!(1000));
        let trade = engine.place_trade(TRADER, order(Side::Sell, "o-1")).unwrap();
        let close = engine.close_trade(TRADER, trade.id, p(dec!(100))).unwrap();
        assert!(close.pnl_record.is_none());
        assert_eq!(engine.balance(TRADER).value(), dec!(1000));
    }

    #[test]
    fn protection_edits_follow_state() {
        let engine = engine(dec!(1000));
        let trade = engine.place_trade(TRADER, order(Side::Buy, "o-1")).unwrap();

        let bad = engine.update_protection(TRADER, trade.id, Some(p(dec!(120))), None);
        assert!(matches!(bad, Err(EngineError::InvalidInput(_))));

        let edited = engine.update_protection(TRADER, trade.id, Some(p(dec!(90))), Some(p(dec!(130)))).unwrap();
        assert_eq!(edited.stop_loss, Some(p(dec!(90))));

        engine.close_trade(TRADER, trade.id, p(dec!(101))).unwrap();
        let frozen = engine.update_protection(TRADER, trade.id, None, None);
        assert!(matches!(frozen, Err(EngineError::InvalidTradeState { .. })));
    }

    #[test]
    fn triggers_close_crossed_trades_only() {
        let engine = engine(dec!(1000));
        let guarded = engine
            .place_trade(TRADER, order(Side::Buy, "o-1").with_protection(Some(p(dec!(95))), Some(p(dec!(110)))))
            .unwrap();
        let naked = engine.place_trade(TRADER, order(Side::Buy, "o-2")).unwrap();

        assert!(engine.check_trade_triggers("BTC-USD", p(dec!(100))).is_empty());
        let closed = engine.check_trade_triggers("BTC-USD", p(dec!(94)));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].trade.id, guarded.id);
        assert_eq!(closed[0].trade.close_reason, Some(CloseReason::StopLoss));
        assert!(engine.get_trade(naked.id).unwrap().is_open());
    }

    #[tokio::test]
    async fn live_pnl_skips_unpriced_symbols() {
        let engine = engine(dec!(1000));
        let btc = engine.place_trade(TRADER, order(Side::Buy, "o-1")).unwrap();
        let mut eth = order(Side::Sell, "o-2");
        eth.symbol = "ETH-USD".into();
        engine.place_trade(TRADER, eth).unwrap();

        let feed = MockPriceFeed::new();
        feed.set_price("BTC-USD", p(dec!(103)));

        let report = engine.unrealized_pnl_report(&feed).await;
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].trade, btc.id);
        assert_eq!(report[0].unrealized_pnl.value(), dec!(30));
    }
}
