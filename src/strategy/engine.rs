use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::arbitrage::ArbitrageDetector;
use super::trailing_stop::TrailingStopTracker;
use crate::error::BotError;
use crate::indicators::moving_average::{deviation_pct, MovingAverageTracker};
use crate::models::{
    Decision, DecisionKind, OrderResult, PositionRecord, PositionState, PriceSample,
};
use crate::risk::{RiskLimits, TradingState};
use crate::settings::{ConfigSnapshot, ConfigStore};
use crate::Result;

/// What one tick produced
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub decisions: Vec<Decision>,
    /// The persisted position record should be rewritten
    pub position_changed: bool,
}

/// Per-symbol signal engine
///
/// Owns the moving average, the open position's trailing stop and the
/// arbitrage in-flight marker for one symbol. Not shared: a single task
/// drives it, so every mutation for the symbol is serialized.
///
/// A polling round feeds every venue's sample through [`on_tick`](Self::on_tick)
/// and then calls [`evaluate_arbitrage`](Self::evaluate_arbitrage) once, so
/// arbitrage only ever compares samples taken in the same round.
pub struct StrategyEngine {
    symbol: String,
    primary_venue: String,
    secondary_venue: Option<String>,
    config: ConfigStore,
    moving_average: MovingAverageTracker,
    arbitrage: ArbitrageDetector,
    risk_limits: RiskLimits,
    trading_state: TradingState,
    position: Option<TrailingStopTracker>,
    pending_entry: Option<Uuid>,
    arbitrage_in_flight: HashSet<Uuid>,
    latest: HashMap<String, PriceSample>,
    /// Venues that delivered a sample since the last arbitrage evaluation
    fresh: HashSet<String>,
}

impl StrategyEngine {
    pub fn new(
        symbol: impl Into<String>,
        primary_venue: impl Into<String>,
        secondary_venue: Option<String>,
        config: ConfigStore,
        arbitrage: ArbitrageDetector,
        risk_limits: RiskLimits,
    ) -> Self {
        let window = config.snapshot().ma_window;
        Self {
            symbol: symbol.into(),
            primary_venue: primary_venue.into(),
            secondary_venue,
            config,
            moving_average: MovingAverageTracker::new(window),
            arbitrage,
            risk_limits,
            trading_state: TradingState::new(),
            position: None,
            pending_entry: None,
            arbitrage_in_flight: HashSet::new(),
            latest: HashMap::new(),
            fresh: HashSet::new(),
        }
    }

    /// Resume a position loaded from persistence
    pub fn restore(&mut self, record: PositionRecord) -> Result<()> {
        if record.position.symbol != self.symbol {
            return Err(BotError::InvalidInput(format!(
                "record for {} cannot resume on {}",
                record.position.symbol, self.symbol
            )));
        }
        let tracker = TrailingStopTracker::restore(record)?;
        tracing::info!(
            symbol = %self.symbol,
            state = ?tracker.state(),
            entry = %tracker.position().entry_price,
            "Resumed position"
        );
        self.position = Some(tracker);
        Ok(())
    }

    /// Process one venue's sample for the current round
    ///
    /// Bad samples (wrong symbol, unknown venue, non-positive price, timestamp
    /// not after the previous one from the same venue) are returned as errors
    /// without touching any state; the caller logs and skips them.
    pub fn on_tick(&mut self, sample: PriceSample, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.validate(&sample)?;

        let cfg = self.config.snapshot();
        self.moving_average.resize(cfg.ma_window);
        self.trading_state.roll_day(now);

        let mut outcome = TickOutcome::default();

        if sample.venue == self.primary_venue {
            let mean = self.moving_average.update(sample.price)?;
            self.evaluate_position(&sample, mean, &cfg, &mut outcome);
        }

        self.fresh.insert(sample.venue.clone());
        self.latest.insert(sample.venue.clone(), sample);

        Ok(outcome)
    }

    fn validate(&self, sample: &PriceSample) -> Result<()> {
        if sample.symbol != self.symbol {
            return Err(BotError::InvalidInput(format!(
                "sample for {} routed to {} engine",
                sample.symbol, self.symbol
            )));
        }

        let known_venue = sample.venue == self.primary_venue
            || self.secondary_venue.as_deref() == Some(sample.venue.as_str());
        if !known_venue {
            return Err(BotError::InvalidInput(format!(
                "unknown venue {} for {}",
                sample.venue, self.symbol
            )));
        }

        if sample.price <= rust_decimal::Decimal::ZERO {
            return Err(BotError::InvalidInput(format!(
                "non-positive price {} from {}",
                sample.price, sample.venue
            )));
        }

        if let Some(previous) = self.latest.get(&sample.venue) {
            if sample.timestamp <= previous.timestamp {
                return Err(BotError::InvalidInput(format!(
                    "non-monotonic timestamp from {}: {} after {}",
                    sample.venue, sample.timestamp, previous.timestamp
                )));
            }
        }

        Ok(())
    }

    fn evaluate_position(
        &mut self,
        sample: &PriceSample,
        mean: rust_decimal::Decimal,
        cfg: &ConfigSnapshot,
        outcome: &mut TickOutcome,
    ) {
        if let Some(tracker) = self.position.as_mut() {
            let update = tracker.on_price(sample.price, cfg);
            outcome.position_changed |= update.changed;
            outcome.decisions.extend(update.decision);
            return;
        }

        if self.pending_entry.is_some() || !self.moving_average.is_full() {
            return;
        }

        let deviation = deviation_pct(sample.price, mean);
        tracing::debug!(
            symbol = %self.symbol,
            price = %sample.price,
            mean = %mean.round_dp(6),
            deviation = %deviation.round_dp(2),
            "Moving average updated"
        );

        if deviation < cfg.breakout_threshold_pct {
            return;
        }

        if let Err(trip) = self.risk_limits.check(&self.trading_state) {
            tracing::warn!(symbol = %self.symbol, trip = ?trip, "Entry blocked by circuit breaker");
            return;
        }

        let decision = Decision::new(
            DecisionKind::Enter,
            self.symbol.clone(),
            self.primary_venue.clone(),
            sample.price,
            cfg.order_size,
            format!(
                "price {} is {}% above the {}-sample average {}",
                sample.price,
                deviation.round_dp(2),
                self.moving_average.len(),
                mean.round_dp(6)
            ),
        );
        self.pending_entry = Some(decision.id);
        outcome.decisions.push(decision);
    }

    /// Close a polling round: compare the venues if both reported in it
    ///
    /// Emits at most one buy/sell pair, and none while a previous pair is
    /// still unresolved.
    pub fn evaluate_arbitrage(&mut self, now: DateTime<Utc>) -> Vec<Decision> {
        let fresh = std::mem::take(&mut self.fresh);

        let Some(secondary) = self.secondary_venue.as_deref() else {
            return Vec::new();
        };
        if !self.arbitrage_in_flight.is_empty() {
            return Vec::new();
        }
        if !fresh.contains(&self.primary_venue) || !fresh.contains(secondary) {
            return Vec::new();
        }
        let (Some(a), Some(b)) = (self.latest.get(&self.primary_venue), self.latest.get(secondary))
        else {
            return Vec::new();
        };

        let cfg = self.config.snapshot();
        let spread = match self.arbitrage.evaluate(a, b, cfg.arbitrage_threshold_pct, now) {
            Ok(Some(spread)) => spread,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::debug!(symbol = %self.symbol, error = %e, "Arbitrage pair skipped");
                return Vec::new();
            }
        };

        if let Err(trip) = self.risk_limits.check(&self.trading_state) {
            tracing::warn!(symbol = %self.symbol, trip = ?trip, "Arbitrage blocked by circuit breaker");
            return Vec::new();
        }

        let reason = format!(
            "spread {}% ({}% net of fees) between {} @ {} and {} @ {}",
            spread.spread_pct.abs().round_dp(2),
            spread.net_pct.round_dp(2),
            spread.buy_venue,
            spread.buy_price,
            spread.sell_venue,
            spread.sell_price
        );
        let buy = Decision::new(
            DecisionKind::ArbitrageBuy,
            self.symbol.clone(),
            spread.buy_venue.clone(),
            spread.buy_price,
            cfg.order_size,
            reason.clone(),
        );
        let sell = Decision::new(
            DecisionKind::ArbitrageSell,
            self.symbol.clone(),
            spread.sell_venue.clone(),
            spread.sell_price,
            cfg.order_size,
            reason,
        );

        self.arbitrage_in_flight.insert(buy.id);
        self.arbitrage_in_flight.insert(sell.id);
        vec![buy, sell]
    }

    /// Fold an executor result back into the engine
    ///
    /// Returns true when the persisted position record should be rewritten.
    pub fn on_order_result(&mut self, result: &OrderResult, now: DateTime<Utc>) -> bool {
        let decision = &result.decision;
        self.trading_state.record(result);

        match decision.kind {
            DecisionKind::Enter => {
                if self.pending_entry != Some(decision.id) {
                    tracing::warn!(symbol = %self.symbol, id = %decision.id, "Result for unknown entry");
                    return false;
                }
                self.pending_entry = None;

                if !result.is_filled() {
                    return false;
                }

                let entry_price = result.fill_price.unwrap_or(decision.target_price);
                match TrailingStopTracker::open(
                    self.symbol.clone(),
                    decision.venue.clone(),
                    entry_price,
                    decision.quantity,
                    now,
                ) {
                    Ok(tracker) => {
                        tracing::info!(
                            symbol = %self.symbol,
                            entry = %entry_price,
                            quantity = %decision.quantity,
                            "Position opened"
                        );
                        self.position = Some(tracker);
                        true
                    }
                    Err(e) => {
                        tracing::error!(symbol = %self.symbol, error = %e, "Could not open position");
                        false
                    }
                }
            }

            DecisionKind::ExitTrailingStop | DecisionKind::ExitDefensive => {
                let Some(tracker) = self.position.as_mut() else {
                    return false;
                };
                if !tracker.on_exit_result(result) {
                    return false;
                }
                if tracker.is_closed() {
                    self.position = None;
                }
                true
            }

            DecisionKind::ArbitrageBuy | DecisionKind::ArbitrageSell => {
                self.arbitrage_in_flight.remove(&decision.id);
                if self.arbitrage_in_flight.is_empty() {
                    tracing::debug!(symbol = %self.symbol, "Arbitrage pair resolved");
                }
                false
            }
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn position_state(&self) -> PositionState {
        self.position
            .as_ref()
            .map(|t| t.state())
            .unwrap_or(PositionState::Flat)
    }

    pub fn position_record(&self) -> Option<PositionRecord> {
        self.position.as_ref().and_then(|t| t.record())
    }

    pub fn has_pending_entry(&self) -> bool {
        self.pending_entry.is_some()
    }

    pub fn has_arbitrage_in_flight(&self) -> bool {
        !self.arbitrage_in_flight.is_empty()
    }

    pub fn moving_average(&self) -> &MovingAverageTracker {
        &self.moving_average
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;
    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    const SYMBOL: &str = "POLS-USDT";

    fn store(window: usize) -> ConfigStore {
        ConfigStore::new(ConfigSnapshot {
            ma_window: window,
            ..Default::default()
        })
        .unwrap()
    }

    fn single_venue(window: usize) -> StrategyEngine {
        StrategyEngine::new(
            SYMBOL,
            "kucoin",
            None,
            store(window),
            ArbitrageDetector::new(Duration::from_secs(60)),
            RiskLimits::default(),
        )
    }

    fn dual_venue(config: ConfigStore) -> StrategyEngine {
        StrategyEngine::new(
            SYMBOL,
            "A",
            Some("B".to_string()),
            config,
            ArbitrageDetector::new(Duration::from_secs(60)),
            RiskLimits::default(),
        )
    }

    struct Clock {
        base: DateTime<Utc>,
        step: i64,
    }

    impl Clock {
        fn new() -> Self {
            Self {
                base: Utc::now(),
                step: 0,
            }
        }

        fn next(&mut self) -> DateTime<Utc> {
            self.step += 1;
            self.base + ChronoDuration::seconds(self.step)
        }
    }

    fn feed(
        engine: &mut StrategyEngine,
        clock: &mut Clock,
        venue: &str,
        price: Decimal,
    ) -> TickOutcome {
        let at = clock.next();
        engine
            .on_tick(PriceSample::new(SYMBOL, venue, price, at), at)
            .unwrap()
    }

    fn enter(engine: &mut StrategyEngine, clock: &mut Clock) -> Decision {
        for price in [dec!(100), dec!(100), dec!(100)] {
            assert!(feed(engine, clock, "kucoin", price).decisions.is_empty());
        }
        let mut outcome = feed(engine, clock, "kucoin", dec!(135));
        assert_eq!(outcome.decisions.len(), 1);
        outcome.decisions.remove(0)
    }

    #[test]
    fn test_breakout_emits_entry() {
        let mut engine = single_venue(3);
        let mut clock = Clock::new();

        let decision = enter(&mut engine, &mut clock);

        assert_eq!(decision.kind, DecisionKind::Enter);
        assert_eq!(decision.venue, "kucoin");
        assert_eq!(decision.target_price, dec!(135));
        assert_eq!(decision.quantity, dec!(10));
        assert!(engine.has_pending_entry());
        assert_eq!(engine.position_state(), PositionState::Flat);
    }

    #[test]
    fn test_no_entry_until_window_full() {
        let mut engine = single_venue(3);
        let mut clock = Clock::new();

        assert!(feed(&mut engine, &mut clock, "kucoin", dec!(100)).decisions.is_empty());
        // Far above the one-sample mean, but the window is not yet full
        assert!(feed(&mut engine, &mut clock, "kucoin", dec!(200)).decisions.is_empty());
        assert!(!engine.has_pending_entry());
    }

    #[test]
    fn test_pending_entry_blocks_duplicates() {
        let mut engine = single_venue(3);
        let mut clock = Clock::new();
        enter(&mut engine, &mut clock);

        let outcome = feed(&mut engine, &mut clock, "kucoin", dec!(180));
        assert!(outcome.decisions.is_empty());
    }

    #[test]
    fn test_rejected_entry_allows_retry() {
        let mut engine = single_venue(3);
        let mut clock = Clock::new();
        let decision = enter(&mut engine, &mut clock);

        let result = OrderResult::failed(decision, OrderStatus::Rejected, "no");
        assert!(!engine.on_order_result(&result, Utc::now()));
        assert!(!engine.has_pending_entry());
        assert_eq!(engine.position_state(), PositionState::Flat);

        let outcome = feed(&mut engine, &mut clock, "kucoin", dec!(200));
        assert_eq!(outcome.decisions.len(), 1);
    }

    #[test]
    fn test_fill_opens_position_and_trails() {
        let mut engine = single_venue(3);
        let mut clock = Clock::new();
        let decision = enter(&mut engine, &mut clock);

        let result = OrderResult::filled(decision, "ord-1".into(), dec!(135));
        assert!(engine.on_order_result(&result, Utc::now()));
        assert_eq!(engine.position_state(), PositionState::Entered);

        // 135 × 1.10 = 148.5 activates the trailing stop
        let outcome = feed(&mut engine, &mut clock, "kucoin", dec!(150));
        assert!(outcome.position_changed);
        assert!(outcome.decisions.is_empty());
        assert_eq!(engine.position_state(), PositionState::TrailingActive);

        // 150 × 0.98 = 147
        let mut outcome = feed(&mut engine, &mut clock, "kucoin", dec!(146));
        assert_eq!(outcome.decisions.len(), 1);
        let exit = outcome.decisions.remove(0);
        assert_eq!(exit.kind, DecisionKind::ExitTrailingStop);
        assert_eq!(exit.quantity, dec!(10));

        let result = OrderResult::filled(exit, "ord-2".into(), dec!(146));
        assert!(engine.on_order_result(&result, Utc::now()));
        assert_eq!(engine.position_state(), PositionState::Flat);
        assert!(engine.position_record().is_none());
    }

    #[test]
    fn test_drop_before_breakout_exits_defensively() {
        let mut engine = single_venue(3);
        let mut clock = Clock::new();
        let decision = enter(&mut engine, &mut clock);
        engine.on_order_result(
            &OrderResult::filled(decision, "ord-1".into(), dec!(135)),
            Utc::now(),
        );

        // Floor is 135 × 0.98 = 132.3
        let outcome = feed(&mut engine, &mut clock, "kucoin", dec!(133));
        assert!(outcome.decisions.is_empty());

        let outcome = feed(&mut engine, &mut clock, "kucoin", dec!(130));
        assert_eq!(outcome.decisions.len(), 1);
        assert_eq!(outcome.decisions[0].kind, DecisionKind::ExitDefensive);
    }

    #[test]
    fn test_bad_samples_leave_state_untouched() {
        let mut engine = single_venue(3);
        let mut clock = Clock::new();
        feed(&mut engine, &mut clock, "kucoin", dec!(100));
        let at = clock.next();
        feed(&mut engine, &mut clock, "kucoin", dec!(101));

        let negative = PriceSample::new(SYMBOL, "kucoin", dec!(-1), clock.next());
        assert!(matches!(
            engine.on_tick(negative, Utc::now()),
            Err(BotError::InvalidInput(_))
        ));

        let backwards = PriceSample::new(SYMBOL, "kucoin", dec!(102), at);
        assert!(matches!(
            engine.on_tick(backwards, Utc::now()),
            Err(BotError::InvalidInput(_))
        ));

        let other = PriceSample::new("BTC-USDT", "kucoin", dec!(102), clock.next());
        assert!(engine.on_tick(other, Utc::now()).is_err());

        let unknown = PriceSample::new(SYMBOL, "binance", dec!(102), clock.next());
        assert!(engine.on_tick(unknown, Utc::now()).is_err());

        assert_eq!(engine.moving_average().len(), 2);
        assert_eq!(engine.moving_average().mean(), Some(dec!(100.5)));
    }

    #[test]
    fn test_window_change_applies_on_next_tick() {
        let config = store(3);
        let mut engine = StrategyEngine::new(
            SYMBOL,
            "kucoin",
            None,
            config.clone(),
            ArbitrageDetector::new(Duration::from_secs(60)),
            RiskLimits::default(),
        );
        let mut clock = Clock::new();
        for price in [dec!(1), dec!(2), dec!(3)] {
            feed(&mut engine, &mut clock, "kucoin", price);
        }

        config.update(|cfg| cfg.ma_window = 2).unwrap();
        feed(&mut engine, &mut clock, "kucoin", dec!(4));

        assert_eq!(engine.moving_average().capacity(), 2);
        assert_eq!(engine.moving_average().mean(), Some(dec!(3.5)));
    }

    /// Feed one polling round and close it
    fn round(engine: &mut StrategyEngine, clock: &mut Clock, prices: &[(&str, Decimal)]) -> Vec<Decision> {
        let mut decisions = Vec::new();
        for (venue, price) in prices {
            decisions.extend(feed(engine, clock, venue, *price).decisions);
        }
        decisions.extend(engine.evaluate_arbitrage(clock.base + ChronoDuration::seconds(clock.step)));
        decisions
    }

    fn arbitrage_engine() -> StrategyEngine {
        let config = ConfigStore::new(ConfigSnapshot {
            arbitrage_threshold_pct: dec!(2),
            ..Default::default()
        })
        .unwrap();
        dual_venue(config)
    }

    #[test]
    fn test_one_arbitrage_pair_in_flight() {
        let mut engine = arbitrage_engine();
        let mut clock = Clock::new();

        let decisions = round(&mut engine, &mut clock, &[("A", dec!(50.5)), ("B", dec!(49.0))]);
        assert_eq!(decisions.len(), 2);
        let buy = decisions[0].clone();
        let sell = decisions[1].clone();
        assert_eq!(buy.kind, DecisionKind::ArbitrageBuy);
        assert_eq!(buy.venue, "B");
        assert_eq!(sell.kind, DecisionKind::ArbitrageSell);
        assert_eq!(sell.venue, "A");
        assert!(engine.has_arbitrage_in_flight());

        // Spread persists but the first pair has not resolved
        assert!(round(&mut engine, &mut clock, &[("A", dec!(50.6)), ("B", dec!(49.1))]).is_empty());

        engine.on_order_result(&OrderResult::filled(buy, "1".into(), dec!(49)), Utc::now());
        assert!(engine.has_arbitrage_in_flight());
        engine.on_order_result(
            &OrderResult::failed(sell, OrderStatus::TimedOut, "slow"),
            Utc::now(),
        );
        assert!(!engine.has_arbitrage_in_flight());

        let decisions = round(&mut engine, &mut clock, &[("A", dec!(50.7)), ("B", dec!(49.1))]);
        assert_eq!(decisions.len(), 2);
    }

    #[test]
    fn test_arbitrage_compares_samples_of_the_same_round() {
        let mut engine = arbitrage_engine();
        let mut clock = Clock::new();

        assert!(round(&mut engine, &mut clock, &[("A", dec!(49)), ("B", dec!(49))]).is_empty());

        // A moved, and B moved with it in the same round: no real spread
        assert!(round(&mut engine, &mut clock, &[("A", dec!(50.5)), ("B", dec!(50.5))]).is_empty());
        assert!(!engine.has_arbitrage_in_flight());

        // B's feed failed this round; its previous price must not pair with A
        assert!(round(&mut engine, &mut clock, &[("A", dec!(52))]).is_empty());
        assert!(!engine.has_arbitrage_in_flight());

        // Both fresh again and apart
        let decisions = round(&mut engine, &mut clock, &[("A", dec!(52)), ("B", dec!(50))]);
        assert_eq!(decisions.len(), 2);
    }

    #[test]
    fn test_only_primary_venue_drives_average() {
        let mut engine = dual_venue(store(3));
        let mut clock = Clock::new();

        feed(&mut engine, &mut clock, "A", dec!(100));
        feed(&mut engine, &mut clock, "B", dec!(100.1));
        feed(&mut engine, &mut clock, "B", dec!(100.2));

        assert_eq!(engine.moving_average().len(), 1);
    }

    #[test]
    fn test_restore_resumes_trailing() {
        let mut source = single_venue(3);
        let mut clock = Clock::new();
        let decision = enter(&mut source, &mut clock);
        source.on_order_result(
            &OrderResult::filled(decision, "ord-1".into(), dec!(135)),
            Utc::now(),
        );
        feed(&mut source, &mut clock, "kucoin", dec!(150));
        let record = source.position_record().unwrap();

        let mut engine = single_venue(3);
        engine.restore(record).unwrap();
        assert_eq!(engine.position_state(), PositionState::TrailingActive);

        let mut clock = Clock::new();
        let outcome = feed(&mut engine, &mut clock, "kucoin", dec!(146));
        assert_eq!(outcome.decisions.len(), 1);
        assert_eq!(outcome.decisions[0].kind, DecisionKind::ExitTrailingStop);
    }

    #[test]
    fn test_circuit_breaker_blocks_entry() {
        let mut engine = StrategyEngine::new(
            SYMBOL,
            "kucoin",
            None,
            store(3),
            ArbitrageDetector::new(Duration::from_secs(60)),
            RiskLimits {
                max_daily_trades: 20,
                max_consecutive_failures: 1,
            },
        );
        let mut clock = Clock::new();
        let decision = enter(&mut engine, &mut clock);
        engine.on_order_result(
            &OrderResult::failed(decision, OrderStatus::Rejected, "no"),
            Utc::now(),
        );

        let outcome = feed(&mut engine, &mut clock, "kucoin", dec!(200));
        assert!(outcome.decisions.is_empty());
    }
}
