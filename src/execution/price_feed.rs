use async_trait::async_trait;
use futures::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::error::FeedError;
use crate::models::PriceSample;

/// Polling source of prices on one venue
#[async_trait]
pub trait PriceFeed: Send + Sync {
    fn venue(&self) -> &str;

    /// Current price for `symbol`
    async fn poll(&self, symbol: &str) -> Result<PriceSample, FeedError>;

    /// Current price for `symbol`, with fill prices for `quantity` when the
    /// venue can walk its order book
    async fn quote(&self, symbol: &str, _quantity: Decimal) -> Result<PriceSample, FeedError> {
        self.poll(symbol).await
    }
}

/// Quote every feed for `symbol` concurrently
///
/// Results come back in feed order, each tagged with its venue.
pub async fn poll_all(
    feeds: &[Arc<dyn PriceFeed>],
    symbol: &str,
    quantity: Decimal,
) -> Vec<(String, Result<PriceSample, FeedError>)> {
    let polls = feeds.iter().map(|feed| async move {
        let result = feed.quote(symbol, quantity).await;
        (feed.venue().to_string(), result)
    });

    join_all(polls).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct SlowFeed {
        venue: &'static str,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl PriceFeed for SlowFeed {
        fn venue(&self) -> &str {
            self.venue
        }

        async fn poll(&self, symbol: &str) -> Result<PriceSample, FeedError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(FeedError::Network("connection reset".into()));
            }
            Ok(PriceSample::new(symbol, self.venue, dec!(1), Utc::now()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_all_keeps_feed_order() {
        let feeds: Vec<Arc<dyn PriceFeed>> = vec![
            Arc::new(SlowFeed {
                venue: "A",
                delay: Duration::from_secs(3),
                fail: false,
            }),
            Arc::new(SlowFeed {
                venue: "B",
                delay: Duration::from_secs(1),
                fail: true,
            }),
        ];

        let started = tokio::time::Instant::now();
        let results = poll_all(&feeds, "POLS-USDT", dec!(10)).await;

        // Concurrent: bounded by the slowest feed, not the sum
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(results[0].0, "A");
        assert!(results[0].1.is_ok());
        assert_eq!(results[1].0, "B");
        assert!(matches!(results[1].1, Err(FeedError::Network(_))));
    }
}
