// Per-symbol task wiring: tick loop, executor and shutdown
use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::exchange::Exchange;
use crate::execution::{poll_all, OrderExecutor, PriceFeed, RetryPolicy};
use crate::models::{Decision, OrderResult};
use crate::notify::{Event, Notifier};
use crate::persistence::PositionStore;
use crate::risk::RiskLimits;
use crate::settings::{ConfigStore, Settings};
use crate::strategy::{ArbitrageDetector, StrategyEngine};

/// Shape of the runtime, usually derived from [`Settings`]
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub symbols: Vec<String>,
    pub primary_venue: String,
    pub secondary_venue: Option<String>,
    pub poll_interval: Duration,
    /// Oldest sample an arbitrage check accepts
    pub staleness: Duration,
    /// Largest timestamp gap between the two samples of an arbitrage check
    pub max_skew: Duration,
    /// Taker fee per venue, in percent
    pub fees: HashMap<String, Decimal>,
    pub risk: RiskLimits,
    pub retry: RetryPolicy,
}

impl From<&Settings> for RuntimeOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            symbols: settings.symbols.clone(),
            primary_venue: settings.primary_venue.clone(),
            secondary_venue: settings.secondary_venue.clone(),
            poll_interval: settings.poll_interval(),
            staleness: settings.staleness(),
            max_skew: settings.max_skew(),
            fees: settings.taker_fees(),
            risk: settings.risk.clone(),
            retry: settings.execution.retry_policy(),
        }
    }
}

/// Owns the shared collaborators and spawns one task pair per symbol
pub struct Runtime {
    options: RuntimeOptions,
    feeds: Vec<Arc<dyn PriceFeed>>,
    exchanges: HashMap<String, Arc<dyn Exchange>>,
    config: ConfigStore,
    store: Arc<dyn PositionStore>,
    notifier: Notifier,
}

impl Runtime {
    pub fn new(
        options: RuntimeOptions,
        feeds: Vec<Arc<dyn PriceFeed>>,
        exchanges: HashMap<String, Arc<dyn Exchange>>,
        config: ConfigStore,
        store: Arc<dyn PositionStore>,
        notifier: Notifier,
    ) -> Self {
        Self {
            options,
            feeds,
            exchanges,
            config,
            store,
            notifier,
        }
    }

    /// Run every symbol until `shutdown` flips to true
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let feeds = self.symbol_feeds();
        if feeds.is_empty() {
            tracing::error!(venue = %self.options.primary_venue, "No feed for the primary venue");
            return;
        }

        let mut handles = Vec::with_capacity(self.options.symbols.len());
        for symbol in &self.options.symbols {
            let (task, executor) = self.symbol_task(symbol, feeds.clone(), shutdown.clone()).await;
            handles.push(tokio::spawn(task.run(executor)));
        }

        tracing::info!(symbols = handles.len(), "Symbol loops spawned");

        for (symbol, joined) in self.options.symbols.iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                tracing::error!(symbol = %symbol, "Symbol loop panicked: {}", e);
            }
        }
    }

    /// Feeds for the configured venues, primary first
    fn symbol_feeds(&self) -> Vec<Arc<dyn PriceFeed>> {
        let mut venues = vec![self.options.primary_venue.as_str()];
        if let Some(secondary) = self.options.secondary_venue.as_deref() {
            venues.push(secondary);
        }

        venues
            .into_iter()
            .filter_map(|venue| self.feeds.iter().find(|f| f.venue() == venue).cloned())
            .collect()
    }

    async fn symbol_task(
        &self,
        symbol: &str,
        feeds: Vec<Arc<dyn PriceFeed>>,
        shutdown: watch::Receiver<bool>,
    ) -> (SymbolTask, OrderExecutor) {
        let arbitrage = self.options.fees.iter().fold(
            ArbitrageDetector::new(self.options.staleness).with_max_skew(self.options.max_skew),
            |detector, (venue, fee)| detector.with_fee(venue.clone(), *fee),
        );

        let mut engine = StrategyEngine::new(
            symbol,
            self.options.primary_venue.clone(),
            self.options.secondary_venue.clone(),
            self.config.clone(),
            arbitrage,
            self.options.risk.clone(),
        );

        match self.store.load(symbol).await {
            Ok(Some(record)) => {
                if let Err(e) = engine.restore(record) {
                    tracing::warn!(symbol = %symbol, "Ignoring persisted position: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(symbol = %symbol, "Failed to load position: {}", e),
        }

        let executor = OrderExecutor::new(
            self.exchanges.clone(),
            self.config.clone(),
            self.options.retry.clone(),
        );

        let task = SymbolTask {
            symbol: symbol.to_string(),
            engine,
            feeds,
            config: self.config.clone(),
            poll_interval: self.options.poll_interval,
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            shutdown,
            paused: false,
        };
        (task, executor)
    }
}

struct SymbolTask {
    symbol: String,
    engine: StrategyEngine,
    feeds: Vec<Arc<dyn PriceFeed>>,
    config: ConfigStore,
    poll_interval: Duration,
    store: Arc<dyn PositionStore>,
    notifier: Notifier,
    shutdown: watch::Receiver<bool>,
    paused: bool,
}

impl SymbolTask {
    async fn run(mut self, executor: OrderExecutor) {
        let (decision_tx, decision_rx) = mpsc::unbounded_channel::<Decision>();
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<OrderResult>();

        let executor: JoinHandle<()> = tokio::spawn(run_executor(
            self.symbol.clone(),
            executor,
            decision_rx,
            result_tx,
            self.shutdown.clone(),
        ));

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(symbol = %self.symbol, interval = ?self.poll_interval, "Symbol loop starting");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }

                Some(result) = result_rx.recv() => {
                    self.on_result(result).await;
                }

                _ = ticker.tick(), if !self.paused => {
                    self.on_tick(&decision_tx).await;
                }
            }
        }

        tracing::info!(symbol = %self.symbol, "Symbol loop stopping");

        // Let the executor finish its in-flight order and apply what it reports
        drop(decision_tx);
        if let Err(e) = executor.await {
            tracing::error!(symbol = %self.symbol, "Executor task panicked: {}", e);
        }
        while let Some(result) = result_rx.recv().await {
            self.on_result(result).await;
        }

        tracing::info!(symbol = %self.symbol, "Symbol loop stopped");
    }

    /// One polling round: feed every venue's sample, then look for arbitrage once
    async fn on_tick(&mut self, decisions: &mpsc::UnboundedSender<Decision>) {
        let quantity = self.config.snapshot().order_size;

        let polled = tokio::select! {
            biased;

            _ = self.shutdown.changed() => {
                tracing::info!(symbol = %self.symbol, "Shutdown during poll, round abandoned");
                return;
            }

            polled = poll_all(&self.feeds, &self.symbol, quantity) => polled,
        };

        for (venue, polled) in polled {
            let sample = match polled {
                Ok(sample) => sample,
                Err(e) => {
                    tracing::warn!(symbol = %self.symbol, venue = %venue, "Feed error: {}", e);
                    continue;
                }
            };

            let outcome = match self.engine.on_tick(sample, Utc::now()) {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(symbol = %self.symbol, venue = %venue, "Skipping tick: {}", e);
                    continue;
                }
            };

            if outcome.position_changed {
                self.persist().await;
            }
            self.emit(outcome.decisions, decisions).await;
        }

        let pair = self.engine.evaluate_arbitrage(Utc::now());
        self.emit(pair, decisions).await;
    }

    async fn emit(&self, emitted: Vec<Decision>, decisions: &mpsc::UnboundedSender<Decision>) {
        for decision in emitted {
            tracing::info!(
                symbol = %self.symbol,
                id = %decision.id,
                kind = ?decision.kind,
                price = %decision.target_price,
                "Decision: {}",
                decision.reason
            );
            self.notifier
                .send(Event::DecisionEmitted(decision.clone()))
                .await;

            if decisions.send(decision).is_err() {
                tracing::error!(symbol = %self.symbol, "Executor is gone, decision dropped");
            }
        }
    }

    async fn on_result(&mut self, result: OrderResult) {
        if self.engine.on_order_result(&result, Utc::now()) {
            self.persist().await;
        }

        let fatal = result.fatal;
        let reason = result.error.clone().unwrap_or_default();

        if result.is_filled() {
            self.notifier.send(Event::OrderFilled(result)).await;
        } else {
            self.notifier.send(Event::OrderFailed(result)).await;
        }

        if fatal && !self.paused {
            self.paused = true;
            tracing::error!(symbol = %self.symbol, "Pausing symbol: {}", reason);
            self.notifier
                .send(Event::SymbolPaused {
                    symbol: self.symbol.clone(),
                    reason,
                })
                .await;
        }
    }

    async fn persist(&self) {
        let outcome = match self.engine.position_record() {
            Some(record) => self.store.save(&record).await,
            None => self.store.remove(&self.symbol).await,
        };

        if let Err(e) = outcome {
            tracing::error!(symbol = %self.symbol, "Failed to persist position: {}", e);
        }
    }
}

/// Execute decisions for one symbol in FIFO order
///
/// A decision already handed to the exchange always runs to completion;
/// on shutdown whatever is still queued is dropped. After a fatal result
/// the remaining decisions are dropped as well.
async fn run_executor(
    symbol: String,
    mut executor: OrderExecutor,
    mut decisions: mpsc::UnboundedReceiver<Decision>,
    results: mpsc::UnboundedSender<OrderResult>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut halted = false;

    loop {
        let decision = tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }

            next = decisions.recv() => match next {
                Some(decision) => decision,
                None => break,
            },
        };

        if halted {
            tracing::warn!(symbol = %symbol, id = %decision.id, "Symbol paused, dropping decision");
            continue;
        }

        let result = executor.execute(decision).await;
        halted |= result.fatal;

        if results.send(result).is_err() {
            tracing::warn!(symbol = %symbol, "Result receiver gone");
            break;
        }
    }

    decisions.close();
    let mut dropped = 0;
    while decisions.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        tracing::warn!(symbol = %symbol, dropped, "Discarded queued decisions on shutdown");
    }
}
