//! Subscription configuration and in-flight delivery state
//!
//! A `SubscriptionConfig` binds a queue name to its processing limits.
//! Subscriptions are created at startup from configuration and are
//! immutable for the process lifetime.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for one queue subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Queue to consume from (must be non-empty)
    pub queue: String,

    /// Maximum number of deliveries processed concurrently (>= 1).
    /// Unfetched messages stay queued at the broker, which is the
    /// backpressure mechanism.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Delivery attempts before a failing message is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Handler timeout in milliseconds; a handler running past this is
    /// aborted and the delivery dead-lettered
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
}

fn default_max_concurrency() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_handler_timeout_ms() -> u64 {
    30_000 // 30 seconds
}

impl SubscriptionConfig {
    /// Create a config for the given queue with default limits
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            max_concurrency: default_max_concurrency(),
            max_attempts: default_max_attempts(),
            handler_timeout_ms: default_handler_timeout_ms(),
        }
    }

    /// Set the concurrency limit
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Set the retry limit
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the handler timeout
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Handler timeout as a `Duration`
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Validate the configuration, fatal at startup if invalid
    pub fn validate(&self) -> Result<()> {
        if self.queue.trim().is_empty() {
            return Err(Error::Config("queue name must be non-empty".to_string()));
        }
        if self.max_concurrency < 1 {
            return Err(Error::Config(format!(
                "max_concurrency must be >= 1 for queue '{}'",
                self.queue
            )));
        }
        if self.max_attempts < 1 {
            return Err(Error::Config(format!(
                "max_attempts must be >= 1 for queue '{}'",
                self.queue
            )));
        }
        if self.handler_timeout_ms == 0 {
            return Err(Error::Config(format!(
                "handler_timeout_ms must be > 0 for queue '{}'",
                self.queue
            )));
        }
        Ok(())
    }
}

/// Terminal outcome of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckOutcome {
    /// Handler succeeded, delivery acknowledged
    Acked,
    /// Handler failed; requeued for retry or routed to the dead-letter
    /// queue once retries are exhausted
    Nacked { requeued: bool },
    /// Handler exceeded its timeout; nacked straight to the dead-letter
    /// queue without consuming further retry credit
    TimedOut,
}

/// Processing state of one in-flight delivery.
///
/// Every delivery moves `Received -> Processing -> Settled(_)` and
/// reaches exactly one terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightState {
    /// Fetched from the broker, not yet handed to a worker slot
    Received,
    /// A worker slot is running the handler
    Processing,
    /// Terminal state recorded
    Settled(AckOutcome),
}

impl InFlightState {
    /// True once a terminal outcome has been recorded
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled(_))
    }
}
