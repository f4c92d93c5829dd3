pub mod kucoin;

pub use kucoin::HttpPriceFeed;
