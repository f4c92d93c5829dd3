// Core modules
pub mod api;
pub mod commands;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod risk;
pub mod runtime;
pub mod settings;
pub mod strategy;

// Re-export commonly used types
pub use error::{BotError, ExchangeError, FeedError};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, BotError>;
