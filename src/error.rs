//! Error types and result handling for pg-relay.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Every variant is fatal to the relay loop. The queue itself is the retry
//! mechanism: an event whose publish was never confirmed is never marked
//! processed, so a restarted process picks it up again in the same position.
//!
//! # Example
//!
//! ```rust
//! use pg_relay::{Error, Result};
//!
//! fn mark(id: i64) -> Result<()> {
//!     Err(Error::storage(format!("marking event {} as processed", id), "connection reset"))
//! }
//!
//! match mark(7) {
//!     Ok(()) => println!("marked"),
//!     Err(Error::Storage { message }) => eprintln!("queue unavailable: {}", message),
//!     Err(e) => eprintln!("other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for pg-relay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from an invalid file, environment variable or flag.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection-level PostgreSQL error (connect, LISTEN, provisioning).
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Kafka client construction error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// The event could not be marshaled into its wire payload.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from reading provisioning scripts.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The event queue was unreachable or a fetch/update against it failed.
    #[error("Storage error: {message}")]
    Storage {
        /// What was being attempted and why it failed
        message: String,
    },

    /// The topic is unknown to the broker or the metadata lookup timed out.
    #[error("Metadata error for topic '{topic}': {message}")]
    Metadata {
        /// Topic whose partition count was requested
        topic: String,
        /// Description of the failure
        message: String,
    },

    /// The broker did not acknowledge a published message.
    #[error("Delivery error for event {event_id} on topic '{topic}': {message}")]
    Delivery {
        /// Queue id of the event that failed to deliver
        event_id: i64,
        /// Destination topic
        topic: String,
        /// Broker-reported reason
        message: String,
    },

    /// The liveness ping on the notification connection failed.
    #[error("Keepalive error: {message}")]
    Keepalive {
        /// Description of the ping failure
        message: String,
    },

    /// The notification connection closed; no further wake-ups can arrive.
    #[error("Notification listener closed")]
    ListenerClosed,

    /// A background task panicked or was cancelled.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Builds a [`Error::Storage`] from the attempted action and its cause.
    pub fn storage(action: impl std::fmt::Display, cause: impl std::fmt::Display) -> Self {
        Error::Storage {
            message: format!("{}: {}", action, cause),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

/// A convenient Result type alias for pg-relay operations.
///
/// This is equivalent to `std::result::Result<T, pg_relay::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
