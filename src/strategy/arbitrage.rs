use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::BotError;
use crate::models::PriceSample;
use crate::Result;

/// A cross-venue price gap worth acting on
#[derive(Debug, Clone, PartialEq)]
pub struct Spread {
    /// (a − b) / min(a, b) × 100 on ticker prices, signed relative to the first argument
    pub spread_pct: Decimal,
    /// Profit of buying at `buy_price` and selling at `sell_price` after both
    /// venues' taker fees, in percent of the buy cost
    pub net_pct: Decimal,
    pub buy_venue: String,
    pub buy_price: Decimal,
    pub sell_venue: String,
    pub sell_price: Decimal,
}

/// Compares two venues' samples for the same symbol
///
/// Holds only configuration: the staleness bounds and per-venue taker fees.
#[derive(Debug, Clone)]
pub struct ArbitrageDetector {
    max_age: ChronoDuration,
    max_skew: ChronoDuration,
    fees: HashMap<String, Decimal>,
}

fn chrono_duration(d: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

impl ArbitrageDetector {
    /// Samples older than `max_age` are stale; two samples may be at most
    /// half of it apart unless [`with_max_skew`](Self::with_max_skew) says otherwise.
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age: chrono_duration(max_age),
            max_skew: chrono_duration(max_age / 2),
            fees: HashMap::new(),
        }
    }

    pub fn with_max_skew(mut self, max_skew: Duration) -> Self {
        self.max_skew = chrono_duration(max_skew);
        self
    }

    /// Taker fee charged by `venue`, in percent of notional
    pub fn with_fee(mut self, venue: impl Into<String>, fee_pct: Decimal) -> Self {
        self.fees.insert(venue.into(), fee_pct);
        self
    }

    fn fee_rate(&self, venue: &str) -> Decimal {
        self.fees.get(venue).copied().unwrap_or(Decimal::ZERO) / Decimal::ONE_HUNDRED
    }

    /// Signed spread of `a` over `b` in percent of the cheaper price
    pub fn spread_pct(a: Decimal, b: Decimal) -> Result<Decimal> {
        if a <= Decimal::ZERO || b <= Decimal::ZERO {
            return Err(BotError::InvalidInput(format!(
                "spread needs positive prices, got {} and {}",
                a, b
            )));
        }
        (a - b)
            .checked_div(a.min(b))
            .and_then(|r| r.checked_mul(Decimal::ONE_HUNDRED))
            .ok_or_else(|| BotError::InvalidInput(format!("spread of {} over {} overflows", a, b)))
    }

    /// Net profit in percent of cost for buying on `buy` and selling on `sell`
    fn net_pct(&self, buy: &PriceSample, sell: &PriceSample) -> Result<Decimal> {
        let overflow = || BotError::InvalidInput("net spread overflows".into());
        let cost = buy
            .buy_price()
            .checked_mul(Decimal::ONE + self.fee_rate(&buy.venue))
            .ok_or_else(overflow)?;
        let revenue = sell
            .sell_price()
            .checked_mul(Decimal::ONE - self.fee_rate(&sell.venue))
            .ok_or_else(overflow)?;
        if cost <= Decimal::ZERO {
            return Err(BotError::InvalidInput(format!(
                "non-positive buy cost {} on {}",
                cost, buy.venue
            )));
        }
        revenue
            .checked_sub(cost)
            .and_then(|gain| gain.checked_div(cost))
            .and_then(|r| r.checked_mul(Decimal::ONE_HUNDRED))
            .ok_or_else(overflow)
    }

    /// Evaluate a pair of samples against `threshold_pct`
    ///
    /// Returns `Stale` when either sample is older than the age bound or the
    /// two were taken further apart than the skew bound, so misaligned prices
    /// never produce a signal. The threshold applies to the better direction's
    /// net-of-fee profit, using depth-weighted prices when the samples carry them.
    pub fn evaluate(
        &self,
        a: &PriceSample,
        b: &PriceSample,
        threshold_pct: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<Spread>> {
        if a.symbol != b.symbol {
            return Err(BotError::InvalidInput(format!(
                "cannot compare {} with {}",
                a.symbol, b.symbol
            )));
        }

        let skew = (a.timestamp - b.timestamp).abs();
        if skew > self.max_skew {
            return Err(BotError::Stale(format!(
                "{} samples {}s apart between {} and {}",
                a.symbol,
                skew.num_seconds(),
                a.venue,
                b.venue
            )));
        }

        let oldest = a.timestamp.min(b.timestamp);
        if now - oldest > self.max_age {
            return Err(BotError::Stale(format!(
                "{} sample from {} is too old",
                a.symbol, oldest
            )));
        }

        let spread_pct = Self::spread_pct(a.price, b.price)?;

        let a_to_b = self.net_pct(a, b)?;
        let b_to_a = self.net_pct(b, a)?;
        let (cheap, dear, net_pct) = if a_to_b >= b_to_a {
            (a, b, a_to_b)
        } else {
            (b, a, b_to_a)
        };

        if net_pct < threshold_pct {
            return Ok(None);
        }

        Ok(Some(Spread {
            spread_pct,
            net_pct,
            buy_venue: cheap.venue.clone(),
            buy_price: cheap.buy_price(),
            sell_venue: dear.venue.clone(),
            sell_price: dear.sell_price(),
        }))
    }
}
