use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::OrderResult;

/// Circuit breakers gating new exposure
///
/// Exits are never blocked; only entries and arbitrage legs consult these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskLimits {
    pub max_daily_trades: u32,
    pub max_consecutive_failures: u32,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_daily_trades: 20,        // filled orders per UTC day
            max_consecutive_failures: 3, // rejected / timed out in a row
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradingState {
    pub daily_trades: u32,
    pub consecutive_failures: u32,
    pub last_reset: DateTime<Utc>,
}

impl TradingState {
    pub fn new() -> Self {
        Self {
            daily_trades: 0,
            consecutive_failures: 0,
            last_reset: Utc::now(),
        }
    }

    /// Reset counters when the UTC date rolls over
    pub fn roll_day(&mut self, now: DateTime<Utc>) {
        if now.date_naive() != self.last_reset.date_naive() {
            self.daily_trades = 0;
            self.consecutive_failures = 0;
            self.last_reset = now;
        }
    }

    /// Fold an order outcome into the counters
    pub fn record(&mut self, result: &OrderResult) {
        if result.is_filled() {
            self.daily_trades += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
    }
}

impl Default for TradingState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerTrip {
    DailyTradeLimit,
    ConsecutiveFailures,
}

impl RiskLimits {
    pub fn check(&self, state: &TradingState) -> Result<(), CircuitBreakerTrip> {
        if state.daily_trades >= self.max_daily_trades {
            return Err(CircuitBreakerTrip::DailyTradeLimit);
        }

        if state.consecutive_failures >= self.max_consecutive_failures {
            return Err(CircuitBreakerTrip::ConsecutiveFailures);
        }

        Ok(())
    }
}
