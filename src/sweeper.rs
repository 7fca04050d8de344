// 9.0 sweeper.rs: background status sweep. two independent timers:
//   price refresh: upstream feed -> PriceCache, for every watched symbol
//   status evaluation: PriceCache -> signal transitions (+ trade stop/take closes)
// neither loop holds the store lock across an await. a slow provider only delays
// the refresh loop, evaluation keeps running on whatever the cache still holds.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SweepConfig;
use crate::engine::{Engine, SweepReport};
use crate::price_feed::{PriceCache, PriceFeed};
use crate::types::Price;

pub struct SignalSweeper {
    engine: Arc<Engine>,
    upstream: Arc<dyn PriceFeed>,
    cache: Arc<PriceCache>,
    config: SweepConfig,
}

impl SignalSweeper {
    /// Sweep cadence comes from the engine's config.
    pub fn new(engine: Arc<Engine>, upstream: Arc<dyn PriceFeed>) -> Self {
        let config = engine.config().sweep.clone();
        Self {
            cache: Arc::new(PriceCache::new(config.price_ttl_ms)),
            engine,
            upstream,
            config,
        }
    }

    pub fn with_config(mut self, config: SweepConfig) -> Self {
        self.cache = Arc::new(PriceCache::new(config.price_ttl_ms));
        self.config = config;
        self
    }

    pub fn cache(&self) -> Arc<PriceCache> {
        Arc::clone(&self.cache)
    }

    fn watched_symbols(&self) -> BTreeSet<String> {
        let mut symbols = self.engine.tracked_symbols();
        if self.config.check_trade_triggers {
            symbols.extend(self.engine.open_trade_symbols());
        }
        symbols
    }

    // 9.1: pull the latest price for every watched symbol. failures keep the old cache entry.
    pub async fn refresh_prices(&self) -> usize {
        let mut refreshed = 0;
        for symbol in self.watched_symbols() {
            match self.upstream.latest_price(&symbol).await {
                Ok(update) => {
                    self.cache.update(update);
                    refreshed += 1;
                }
                Err(err) => warn!(%symbol, %err, "price refresh failed"),
            }
        }
        debug!(refreshed, cached = self.cache.len(), "prices refreshed");
        refreshed
    }

    // 9.2: one evaluation pass against the cache. stale or missing prices skip their signals.
    pub async fn evaluate(&self) -> SweepReport {
        let mut prices: HashMap<String, Price> = HashMap::new();
        for symbol in self.watched_symbols() {
            match self.cache.latest_price(&symbol).await {
                Ok(update) => {
                    prices.insert(symbol, update.price);
                }
                Err(err) => debug!(%symbol, %err, "no usable cached price"),
            }
        }

        let mut report = self.engine.evaluate_signals(&prices);

        if self.config.check_trade_triggers {
            for (symbol, price) in &prices {
                let closed = self.engine.check_trade_triggers(symbol, *price);
                report.trades_closed.extend(closed.into_iter().map(|c| c.trade.id));
            }
        }

        if !report.transitions.is_empty() || !report.trades_closed.is_empty() {
            info!(
                transitions = report.transitions.len(),
                trades_closed = report.trades_closed.len(),
                skipped = report.skipped.len(),
                "sweep applied changes"
            );
        }
        report
    }

    pub async fn run_price_refresh(&self, mut shutdown: broadcast::Receiver<()>) {
        let period = Duration::from_millis(self.config.price_refresh_ms.max(1));
        info!(?period, "price refresh loop started");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh_prices().await;
                }
                _ = shutdown.recv() => {
                    info!("price refresh loop shutting down");
                    break;
                }
            }
        }
    }

    pub async fn run_status_evaluation(&self, mut shutdown: broadcast::Receiver<()>) {
        let period = Duration::from_millis(self.config.status_eval_ms.max(1));
        info!(?period, "status evaluation loop started");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate().await;
                }
                _ = shutdown.recv() => {
                    info!("status evaluation loop shutting down");
                    break;
                }
            }
        }
    }

    /// Start both loops on the current tokio runtime.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, _) = broadcast::channel(1);
        let sweeper = Arc::new(self);

        let refresh = {
            let sweeper = Arc::clone(&sweeper);
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move { sweeper.run_price_refresh(shutdown).await })
        };
        let evaluation = {
            let sweeper = Arc::clone(&sweeper);
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move { sweeper.run_status_evaluation(shutdown).await })
        };

        SweeperHandle {
            shutdown_tx,
            tasks: vec![refresh, evaluation],
        }
    }
}

pub struct SweeperHandle {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop both loops and wait for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(%err, "sweeper task ended abnormally");
            }
        }
    }
}
