// Order execution and price collection
pub mod executor;
pub mod price_feed;

pub use executor::{OrderExecutor, RetryPolicy};
pub use price_feed::{poll_all, PriceFeed};
