use rust_decimal::Decimal;
use std::collections::VecDeque;

use crate::error::BotError;
use crate::Result;

/// Rolling simple moving average over the last `capacity` prices
///
/// Keeps a running sum so each update is O(1).
#[derive(Debug, Clone)]
pub struct MovingAverageTracker {
    capacity: usize,
    prices: VecDeque<Decimal>,
    sum: Decimal,
}

impl MovingAverageTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            prices: VecDeque::with_capacity(capacity),
            sum: Decimal::ZERO,
        }
    }

    /// Push a price and return the recomputed mean
    ///
    /// Non-positive prices are rejected and leave the window untouched.
    pub fn update(&mut self, price: Decimal) -> Result<Decimal> {
        if price <= Decimal::ZERO {
            return Err(BotError::InvalidInput(format!(
                "non-positive price {}",
                price
            )));
        }

        let sum = self.sum.checked_add(price).ok_or_else(|| {
            BotError::InvalidInput(format!("price {} overflows the window sum", price))
        })?;
        self.prices.push_back(price);
        self.sum = sum;

        while self.prices.len() > self.capacity {
            if let Some(evicted) = self.prices.pop_front() {
                self.sum -= evicted;
            }
        }

        // len >= 1 here
        Ok(self.sum / Decimal::from(self.prices.len()))
    }

    /// Current mean, `None` while empty
    pub fn mean(&self) -> Option<Decimal> {
        if self.prices.is_empty() {
            None
        } else {
            Some(self.sum / Decimal::from(self.prices.len()))
        }
    }

    /// Change the window size, keeping the most recent prices
    pub fn resize(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        if capacity == self.capacity {
            return;
        }

        while self.prices.len() > capacity {
            self.prices.pop_front();
        }
        self.sum = self.prices.iter().copied().sum();
        self.capacity = capacity;

        tracing::debug!(capacity, kept = self.prices.len(), "Resized moving average window");
    }

    pub fn is_full(&self) -> bool {
        self.prices.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Percentage deviation of `price` from `mean`
///
/// Saturates at `Decimal::MAX` when the price dwarfs the mean.
pub fn deviation_pct(price: Decimal, mean: Decimal) -> Decimal {
    (price - mean)
        .checked_div(mean)
        .and_then(|r| r.checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or(Decimal::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rust_decimal_macros::dec;

    #[test]
    fn test_mean_of_partial_window() {
        let mut ma = MovingAverageTracker::new(5);
        assert_eq!(ma.update(dec!(100)).unwrap(), dec!(100));
        assert_eq!(ma.update(dec!(102)).unwrap(), dec!(101));
        assert!(!ma.is_full());
    }

    #[test]
    fn test_window_of_three() {
        let mut ma = MovingAverageTracker::new(3);
        let mut mean = Decimal::ZERO;
        for price in [dec!(100), dec!(102), dec!(101), dec!(98)] {
            mean = ma.update(price).unwrap();
        }

        // (102 + 101 + 98) / 3
        assert_eq!(mean.round_dp(2), dec!(100.33));
        assert!(ma.is_full());

        let deviation = deviation_pct(dec!(98), mean);
        assert!((deviation - dec!(-2.3256)).abs() < dec!(0.001));
        assert!(deviation < dec!(10)); // no breakout
    }

    #[test]
    fn test_invalid_price_leaves_state() {
        let mut ma = MovingAverageTracker::new(3);
        ma.update(dec!(10)).unwrap();

        assert!(matches!(ma.update(dec!(0)), Err(BotError::InvalidInput(_))));
        assert!(matches!(ma.update(dec!(-1)), Err(BotError::InvalidInput(_))));

        assert_eq!(ma.len(), 1);
        assert_eq!(ma.mean(), Some(dec!(10)));
    }

    #[test]
    fn test_resize_keeps_most_recent() {
        let mut ma = MovingAverageTracker::new(4);
        for price in [dec!(1), dec!(2), dec!(3), dec!(4)] {
            ma.update(price).unwrap();
        }

        ma.resize(2);
        assert_eq!(ma.mean(), Some(dec!(3.5)));
        assert!(ma.is_full());

        ma.resize(5);
        assert!(!ma.is_full());
        // (3 + 4 + 6) / 3
        assert_eq!(ma.update(dec!(6)).unwrap(), dec!(13) / dec!(3));
    }

    #[test]
    fn test_sliding_window_matches_naive_mean() {
        let mut rng = StdRng::seed_from_u64(7);

        for capacity in 1..=8 {
            let mut ma = MovingAverageTracker::new(capacity);
            let mut history = Vec::new();

            for _ in 0..40 {
                let price = Decimal::new(rng.gen_range(1..1_000_000), 4);
                history.push(price);
                let mean = ma.update(price).unwrap();

                let window = &history[history.len().saturating_sub(capacity)..];
                let expected: Decimal =
                    window.iter().copied().sum::<Decimal>() / Decimal::from(window.len());
                assert_eq!(mean, expected);
            }
        }
    }

    #[test]
    fn test_huge_prices_do_not_panic() {
        let mut ma = MovingAverageTracker::new(3);
        ma.update(Decimal::MAX).unwrap();
        assert!(matches!(ma.update(Decimal::MAX), Err(BotError::InvalidInput(_))));
        assert_eq!(ma.len(), 1);

        assert_eq!(deviation_pct(Decimal::MAX, dec!(0.0000001)), Decimal::MAX);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let ma = MovingAverageTracker::new(0);
        assert_eq!(ma.capacity(), 1);
        assert!(ma.is_empty());
    }
}
