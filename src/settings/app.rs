use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::ConfigSnapshot;
use crate::execution::RetryPolicy;
use crate::risk::RiskLimits;
use crate::Result;

/// A venue we can poll prices from
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct VenueSettings {
    pub name: String,
    /// Base URL of a KuCoin-compatible public market API
    pub feed_url: String,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    /// Taker fee charged on each fill, in percent
    #[serde(default = "default_taker_fee_pct")]
    pub taker_fee_pct: Decimal,
    /// Quote depth-weighted fill prices from the level-2 book
    #[serde(default)]
    pub use_order_book: bool,
}

fn default_requests_per_second() -> u32 {
    5
}

fn default_taker_fee_pct() -> Decimal {
    Decimal::new(1, 1) // 0.1%
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionSettings {
    pub order_timeout_secs: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub backoff_factor: u32,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            order_timeout_secs: 10,
            max_attempts: 2, // one retry
            base_backoff_ms: 1000,
            backoff_factor: 2,
        }
    }
}

impl ExecutionSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_backoff_ms),
            factor: self.backoff_factor.max(1),
            attempt_timeout: Duration::from_secs(self.order_timeout_secs),
        }
    }
}

/// Process settings, loaded once at startup
///
/// Sources, later ones winning: built-in defaults, an optional settings file,
/// `BOT__*` environment variables (`BOT__STRATEGY__ORDER_SIZE=25`).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub symbols: Vec<String>,
    pub primary_venue: String,
    pub secondary_venue: Option<String>,
    pub venues: Vec<VenueSettings>,
    pub poll_interval_secs: u64,
    /// Maximum sample age for arbitrage; defaults to one poll interval
    pub staleness_secs: Option<u64>,
    /// Maximum timestamp gap between the two arbitrage samples; defaults to half the staleness
    pub max_skew_secs: Option<u64>,
    pub redis_url: Option<String>,
    pub strategy: ConfigSnapshot,
    pub execution: ExecutionSettings,
    pub risk: RiskLimits,
    pub paper_balances: HashMap<String, Decimal>,
    pub operators: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            symbols: vec!["POLS-USDT".to_string()],
            primary_venue: "kucoin".to_string(),
            secondary_venue: None,
            venues: vec![VenueSettings {
                name: "kucoin".to_string(),
                feed_url: "https://api.kucoin.com".to_string(),
                requests_per_second: default_requests_per_second(),
                taker_fee_pct: default_taker_fee_pct(),
                use_order_book: false,
            }],
            poll_interval_secs: 60,
            staleness_secs: None,
            max_skew_secs: None,
            redis_url: None,
            strategy: ConfigSnapshot::default(),
            execution: ExecutionSettings::default(),
            risk: RiskLimits::default(),
            paper_balances: HashMap::new(),
            operators: vec!["operator".to_string()],
        }
    }
}

impl Settings {
    /// Load settings from `path` (extension optional, file optional) and the environment
    pub fn load(path: &str) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("BOT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("symbols")
                    .with_list_parse_key("operators"),
            );

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.strategy.validate()?;

        // Map keys come back lowercased; assets are matched uppercase
        settings.paper_balances = settings
            .paper_balances
            .into_iter()
            .map(|(asset, amount)| (asset.to_uppercase(), amount))
            .collect();

        Ok(settings)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs.unwrap_or(self.poll_interval_secs).max(1))
    }

    pub fn max_skew(&self) -> Duration {
        match self.max_skew_secs {
            Some(secs) => Duration::from_secs(secs.max(1)),
            None => self.staleness() / 2,
        }
    }

    /// Taker fee per venue name, in percent
    pub fn taker_fees(&self) -> HashMap<String, Decimal> {
        self.venues
            .iter()
            .map(|v| (v.name.clone(), v.taker_fee_pct))
            .collect()
    }

    pub fn venue(&self, name: &str) -> Option<&VenueSettings> {
        self.venues.iter().find(|v| v.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.poll_interval(), Duration::from_secs(60));
        assert_eq!(settings.staleness(), Duration::from_secs(60));
        assert_eq!(settings.max_skew(), Duration::from_secs(30));
        assert_eq!(settings.taker_fees().get("kucoin"), Some(&dec!(0.1)));
        assert!(settings.venue("kucoin").is_some());

        let policy = settings.execution.retry_policy();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("breakoutbot-settings-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("Settings.toml");

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
symbols = ["POLS-USDT", "BTC-USDT"]
primary_venue = "kucoin"
secondary_venue = "mirror"
poll_interval_secs = 30

[[venues]]
name = "kucoin"
feed_url = "https://api.kucoin.com"

[[venues]]
name = "mirror"
feed_url = "http://localhost:9000"
requests_per_second = 2
taker_fee_pct = 0.25
use_order_book = true

[strategy]
ma_window = 5
breakout_threshold_pct = 8
drop_threshold_pct = 2
trailing_distance_pct = 3
limit_offset_pct = 1
order_size = 25
arbitrage_threshold_pct = 0.5

[paper_balances]
USDT = 1000
Pols = 5
"#
        )
        .unwrap();

        let settings = Settings::load(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.symbols.len(), 2);
        assert_eq!(settings.secondary_venue.as_deref(), Some("mirror"));
        assert_eq!(settings.venue("mirror").unwrap().requests_per_second, 2);
        assert_eq!(settings.strategy.ma_window, 5);
        assert_eq!(settings.strategy.order_size, dec!(25));
        assert_eq!(settings.staleness(), Duration::from_secs(30));
        assert_eq!(settings.max_skew(), Duration::from_secs(15));
        assert_eq!(settings.taker_fees().get("mirror"), Some(&dec!(0.25)));
        assert!(settings.venue("mirror").unwrap().use_order_book);
        assert!(!settings.venue("kucoin").unwrap().use_order_book);
        assert_eq!(settings.paper_balances.get("USDT"), Some(&dec!(1000)));
        assert_eq!(settings.paper_balances.get("POLS"), Some(&dec!(5)));
        assert!(settings.paper_balances.keys().all(|k| k == &k.to_uppercase()));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load("/nonexistent/breakoutbot/Settings").unwrap();
        assert_eq!(settings.primary_venue, "kucoin");
    }
}
