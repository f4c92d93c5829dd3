use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::future::Future;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::error::{BotError, FeedError};
use crate::execution::PriceFeed;
use crate::models::{DepthQuote, PriceSample};
use crate::Result;

const LEVEL1_PATH: &str = "/api/v1/market/orderbook/level1";
const LEVEL2_PATH: &str = "/api/v1/market/orderbook/level2_20";
const SUCCESS_CODE: &str = "200000";
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

type FeedRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: String,
    #[serde(default)]
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Level1 {
    /// Exchange time in milliseconds
    time: i64,
    price: String,
}

/// Top of book, best levels first, each level `[price, size]`
#[derive(Debug, Deserialize)]
struct Level2 {
    time: i64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

/// Public level-1 ticker of a KuCoin-compatible venue
///
/// Cloneable; clones share the rate limiter.
#[derive(Clone)]
pub struct HttpPriceFeed {
    client: Client,
    venue: String,
    base_url: String,
    rate_limiter: Arc<FeedRateLimiter>,
    max_retries: u32,
    initial_backoff: Duration,
    use_order_book: bool,
}

impl HttpPriceFeed {
    pub fn new(
        venue: impl Into<String>,
        base_url: impl Into<String>,
        requests_per_second: u32,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| BotError::NetworkFailure(format!("failed to build HTTP client: {}", e)))?;

        let rps = NonZeroU32::new(requests_per_second).ok_or_else(|| {
            BotError::InvalidInput("requests_per_second must be at least 1".into())
        })?;

        let base_url: String = base_url.into();

        Ok(Self {
            client,
            venue: venue.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
            max_retries: MAX_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            use_order_book: false,
        })
    }

    /// Override the retry schedule
    pub fn with_retries(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    /// Quote fill prices from the level-2 book instead of the last trade
    pub fn with_order_book(mut self, enabled: bool) -> Self {
        self.use_order_book = enabled;
        self
    }

    async fn get<T>(&self, path: &str, symbol: &str) -> std::result::Result<T, FeedError>
    where
        T: for<'de> Deserialize<'de>,
    {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", symbol)])
            .send()
            .await
            .map_err(|e| FeedError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(FeedError::Network(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(FeedError::Malformed(format!("HTTP {}", status)));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| FeedError::Malformed(e.to_string()))?;

        if envelope.code != SUCCESS_CODE {
            return Err(FeedError::Malformed(format!(
                "code {}: {}",
                envelope.code,
                envelope.msg.unwrap_or_default()
            )));
        }

        // Unknown pairs come back as a success with no data
        envelope
            .data
            .ok_or_else(|| FeedError::InvalidSymbol(symbol.to_string()))
    }

    async fn fetch_once(&self, symbol: &str) -> std::result::Result<PriceSample, FeedError> {
        let level1: Level1 = self.get(LEVEL1_PATH, symbol).await?;

        let price = Decimal::from_str(&level1.price)
            .map_err(|e| FeedError::Malformed(format!("price {:?}: {}", level1.price, e)))?;
        let timestamp = exchange_time(level1.time)?;

        Ok(PriceSample::new(symbol, self.venue.clone(), price, timestamp))
    }

    async fn fetch_book(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> std::result::Result<PriceSample, FeedError> {
        let book: Level2 = self.get(LEVEL2_PATH, symbol).await?;

        let asks = parse_levels(&book.asks)?;
        let bids = parse_levels(&book.bids)?;
        let (Some(&(best_ask, _)), Some(&(best_bid, _))) = (asks.first(), bids.first()) else {
            return Err(FeedError::Malformed(format!("empty order book for {}", symbol)));
        };

        let depth = DepthQuote::from_book(quantity, &asks, &bids)
            .map_err(|e| FeedError::Malformed(format!("{} order book: {}", symbol, e)))?;
        let mid = best_ask / Decimal::TWO + best_bid / Decimal::TWO;
        let timestamp = exchange_time(book.time)?;

        Ok(PriceSample::new(symbol, self.venue.clone(), mid, timestamp).with_depth(depth))
    }

    /// Retry transient failures with exponential backoff
    async fn retrying<F, Fut>(
        &self,
        symbol: &str,
        mut fetch: F,
    ) -> std::result::Result<PriceSample, FeedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<PriceSample, FeedError>>,
    {
        let mut last_error = FeedError::Network("no attempt made".into());

        for attempt in 1..=self.max_retries {
            match fetch().await {
                Ok(sample) => {
                    if attempt > 1 {
                        tracing::info!(
                            "Fetched {} from {} after {} attempts",
                            symbol,
                            self.venue,
                            attempt
                        );
                    }
                    return Ok(sample);
                }
                Err(e @ FeedError::Network(_)) => {
                    last_error = e;

                    if attempt < self.max_retries {
                        let backoff = self.initial_backoff * 2_u32.pow(attempt - 1);
                        tracing::warn!(
                            "Attempt {}/{} failed for {} on {}: {}. Retrying in {:?}...",
                            attempt,
                            self.max_retries,
                            symbol,
                            self.venue,
                            last_error,
                            backoff
                        );
                        sleep(backoff).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }
}

fn exchange_time(millis: i64) -> std::result::Result<chrono::DateTime<Utc>, FeedError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| FeedError::Malformed(format!("time {}", millis)))
}

fn parse_levels(levels: &[[String; 2]]) -> std::result::Result<Vec<(Decimal, Decimal)>, FeedError> {
    levels
        .iter()
        .map(|[price, size]| {
            let price = Decimal::from_str(price)
                .map_err(|e| FeedError::Malformed(format!("price {:?}: {}", price, e)))?;
            let size = Decimal::from_str(size)
                .map_err(|e| FeedError::Malformed(format!("size {:?}: {}", size, e)))?;
            Ok((price, size))
        })
        .collect()
}

#[async_trait]
impl PriceFeed for HttpPriceFeed {
    fn venue(&self) -> &str {
        &self.venue
    }

    /// Includes retry logic with exponential backoff for transient failures
    async fn poll(&self, symbol: &str) -> std::result::Result<PriceSample, FeedError> {
        self.retrying(symbol, || self.fetch_once(symbol)).await
    }

    async fn quote(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> std::result::Result<PriceSample, FeedError> {
        if !self.use_order_book {
            return self.poll(symbol).await;
        }
        self.retrying(symbol, || self.fetch_book(symbol, quantity)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use rust_decimal_macros::dec;

    fn feed(url: &str) -> HttpPriceFeed {
        HttpPriceFeed::new("kucoin", url, 50)
            .unwrap()
            .with_retries(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_poll_parses_level1() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", LEVEL1_PATH)
            .match_query(Matcher::UrlEncoded("symbol".into(), "POLS-USDT".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"code":"200000","data":{"time":1700000000123,"sequence":"1","price":"0.3712","size":"10","bestBid":"0.371","bestBidSize":"5","bestAsk":"0.3713","bestAskSize":"7"}}"#,
            )
            .create_async()
            .await;

        let sample = feed(&server.url()).poll("POLS-USDT").await.unwrap();

        mock.assert_async().await;
        assert_eq!(sample.symbol, "POLS-USDT");
        assert_eq!(sample.venue, "kucoin");
        assert_eq!(sample.price, dec!(0.3712));
        assert_eq!(sample.timestamp.timestamp_millis(), 1700000000123);
    }

    #[tokio::test]
    async fn test_unknown_symbol() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", LEVEL1_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"code":"200000","data":null}"#)
            .create_async()
            .await;

        let result = feed(&server.url()).poll("NOPE-USDT").await;
        assert_eq!(result, Err(FeedError::InvalidSymbol("NOPE-USDT".into())));
    }

    #[tokio::test]
    async fn test_garbage_price_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", LEVEL1_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"code":"200000","data":{"time":1700000000123,"price":"n/a"}}"#)
            .create_async()
            .await;

        let result = feed(&server.url()).poll("POLS-USDT").await;
        assert!(matches!(result, Err(FeedError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", LEVEL1_PATH)
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let result = feed(&server.url()).poll("POLS-USDT").await;

        failing.assert_async().await;
        assert!(matches!(result, Err(FeedError::Network(_))));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", LEVEL1_PATH)
            .match_query(Matcher::Any)
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let result = feed(&server.url()).poll("POLS-USDT").await;

        mock.assert_async().await;
        assert!(matches!(result, Err(FeedError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_quote_walks_order_book() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", LEVEL2_PATH)
            .match_query(Matcher::UrlEncoded("symbol".into(), "POLS-USDT".into()))
            .with_status(200)
            .with_body(
                r#"{"code":"200000","data":{"time":1700000000123,"sequence":"9","bids":[["0.95","50"],["0.90","100"]],"asks":[["1.00","40"],["1.10","100"]]}}"#,
            )
            .create_async()
            .await;

        let sample = feed(&server.url())
            .with_order_book(true)
            .quote("POLS-USDT", dec!(100))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(sample.price, dec!(0.975));
        assert_eq!(sample.buy_price(), dec!(1.06));
        assert_eq!(sample.sell_price(), dec!(0.925));
    }

    #[tokio::test]
    async fn test_thin_book_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", LEVEL2_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"code":"200000","data":{"time":1700000000123,"bids":[["0.95","5"]],"asks":[["1.00","5"]]}}"#,
            )
            .create_async()
            .await;

        let result = feed(&server.url())
            .with_order_book(true)
            .quote("POLS-USDT", dec!(100))
            .await;
        assert!(matches!(result, Err(FeedError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_quote_without_order_book_uses_ticker() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", LEVEL1_PATH)
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"code":"200000","data":{"time":1700000000123,"price":"0.5"}}"#)
            .create_async()
            .await;

        let sample = feed(&server.url()).quote("POLS-USDT", dec!(100)).await.unwrap();

        mock.assert_async().await;
        assert_eq!(sample.price, dec!(0.5));
        assert!(sample.depth.is_none());
    }

    #[test]
    fn test_zero_rate_is_rejected() {
        assert!(HttpPriceFeed::new("kucoin", "http://localhost", 0).is_err());
    }

    #[tokio::test]
    #[ignore] // Ignore by default to avoid hitting API in tests
    async fn test_poll_live() {
        let feed = HttpPriceFeed::new("kucoin", "https://api.kucoin.com", 5).unwrap();
        let sample = feed.poll("BTC-USDT").await.unwrap();
        assert!(sample.price > Decimal::ZERO);
    }
}
