//! Error types for the broker and for individual deliveries.

use thiserror::Error;

/// Main error type for broker operations.
#[derive(Debug, Error)]
pub enum SubPubError {
    #[error("Broker is closed")]
    Closed,

    #[error("Close timed out before all deliveries drained")]
    Timeout,

    #[error("Queue full for {dropped} subscriber(s) on {subject}")]
    QueueFull { subject: String, dropped: usize },

    #[error("Failed to spawn delivery worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Outcome of a single delivery that did not reach a clean handler return.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The subscription was drained by a close before this turn came up.
    #[error("Subscription already drained")]
    Drained,

    /// The handler panicked. The completion signal was still posted.
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, SubPubError>;
