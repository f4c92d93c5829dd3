// Signal generation: breakout entries, trailing stops and cross-venue arbitrage
pub mod arbitrage;
pub mod engine;
pub mod trailing_stop;

pub use arbitrage::{ArbitrageDetector, Spread};
pub use engine::{StrategyEngine, TickOutcome};
pub use trailing_stop::{TrailingStopTracker, TrailingUpdate};
