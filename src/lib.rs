pub mod config;
pub mod error;
pub mod replicator;
pub mod wake;

pub mod kafka;
pub mod postgres;

pub use config::Config;
pub use error::{Error, Result};
pub use replicator::{RelaySettings, RelayStats, Replicator};
pub use wake::{WakeEvent, WakeSource};
