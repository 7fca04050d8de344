//! Signal catalog and the synchronous half of the status sweep.

use std::collections::{BTreeSet, HashMap};

use super::core::{require_trader, Engine};
use super::results::{EngineError, SweepReport};
use crate::events::{EventPayload, SignalStatusChangedEvent};
use crate::signal::{Signal, SignalDraft, SignalTransition};
use crate::types::{Price, SignalId, UserId};
use tracing::{debug, info, warn};

impl Engine {
    /// Publish a trade idea. Thresholds must read stop-loss < entry < target.
    pub fn create_signal(&self, trader: UserId, draft: SignalDraft) -> Result<Signal, EngineError> {
        if draft.symbol.trim().is_empty() {
            return Err(EngineError::InvalidInput("symbol must not be empty".into()));
        }
        if !draft.is_ordered() {
            return Err(EngineError::InvalidInput(format!(
                "expected stop-loss {} < entry {} < target {}",
                draft.stop_loss, draft.entry_price, draft.target_price
            )));
        }

        let signal = self.store.transaction(|uow| -> Result<Signal, EngineError> {
            require_trader(uow, trader, "publish signal")?;
            let id = uow.next_signal_id();
            let signal = Signal::from_draft(id, trader, draft, uow.now());
            uow.put_signal(signal.clone());
            Ok(signal)
        })?;

        info!(%trader, signal = %signal.id, symbol = %signal.symbol, "signal published");
        Ok(signal)
    }

    pub fn get_signal(&self, id: SignalId) -> Result<Signal, EngineError> {
        self.store
            .read(|s| s.signals.get(&id).cloned())
            .ok_or(EngineError::SignalNotFound(id))
    }

    pub fn list_signals(&self) -> Vec<Signal> {
        self.store.read(|s| s.signals.values().cloned().collect())
    }

    pub fn signals_by(&self, trader: UserId) -> Vec<Signal> {
        self.store
            .read(|s| s.signals.values().filter(|sig| sig.trader == trader).cloned().collect())
    }

    /// Symbols that still have a signal waiting on price.
    pub fn tracked_symbols(&self) -> BTreeSet<String> {
        self.store.read(|s| {
            s.signals
                .values()
                .filter(|sig| !sig.status.is_terminal())
                .map(|sig| sig.symbol.clone())
                .collect()
        })
    }

    /// Feed one observed price to one signal. Returns the transition if it moved.
    pub fn apply_signal_price(&self, id: SignalId, price: Price) -> Result<Option<SignalTransition>, EngineError> {
        self.store.transaction(|uow| -> Result<Option<SignalTransition>, EngineError> {
            let mut signal = uow.state().signals.get(&id).cloned().ok_or(EngineError::SignalNotFound(id))?;
            if signal.status.is_terminal() {
                return Ok(None);
            }

            let transition = signal.observe(price, uow.now());
            uow.put_signal(signal);

            if let Some(t) = transition {
                uow.emit(EventPayload::SignalStatusChanged(SignalStatusChangedEvent {
                    signal: t.signal,
                    from: t.from,
                    to: t.to,
                    price: t.price,
                }));
                info!(signal = %id, from = %t.from, to = %t.to, %price, "signal status changed");
            }
            Ok(transition)
        })
    }

    // 12.5: one evaluation pass. signals without a price are skipped, never fatal.
    pub fn evaluate_signals(&self, prices: &HashMap<String, Price>) -> SweepReport {
        let pending: Vec<(SignalId, String)> = self.store.read(|s| {
            s.signals
                .values()
                .filter(|sig| !sig.status.is_terminal())
                .map(|sig| (sig.id, sig.symbol.clone()))
                .collect()
        });

        let mut report = SweepReport::default();
        for (id, symbol) in pending {
            let Some(price) = prices.get(&symbol).copied() else {
                warn!(signal = %id, %symbol, "no market price, signal skipped");
                report.skipped.push(id);
                continue;
            };

            report.evaluated += 1;
            match self.apply_signal_price(id, price) {
                Ok(Some(transition)) => report.transitions.push(transition),
                Ok(None) => {}
                Err(err) => {
                    warn!(signal = %id, %err, "signal evaluation failed");
                    report.skipped.push(id);
                }
            }
        }

        debug!(
            evaluated = report.evaluated,
            transitions = report.transitions.len(),
            skipped = report.skipped.len(),
            "signal sweep done"
        );
        report
    }
}
