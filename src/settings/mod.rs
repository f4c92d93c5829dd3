// Process settings and the live strategy configuration
pub mod app;
pub mod snapshot;

pub use app::{ExecutionSettings, Settings, VenueSettings};
pub use snapshot::{ConfigSnapshot, ConfigStore};
