//! Subscription registry
//!
//! Maps queue names to handlers and their processing limits. Populated
//! explicitly at startup from configuration (replacing annotation-driven
//! subscription), validated eagerly, then sealed read-only for the
//! process lifetime.

use std::sync::Arc;

use relayq_types::{Error, Result, SubscriptionConfig};
use tracing::info;

use crate::handler::Handler;

/// One registered queue subscription
#[derive(Clone)]
pub struct Subscription {
    /// Validated subscription configuration
    pub config: SubscriptionConfig,
    /// Handler invoked for each delivery
    pub handler: Arc<dyn Handler>,
}

/// Mutable registry used during startup
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a queue.
    ///
    /// Fails with `Error::Config` on invalid limits or a duplicate
    /// queue; configuration errors are fatal at startup.
    pub fn register(&mut self, config: SubscriptionConfig, handler: Arc<dyn Handler>) -> Result<()> {
        config.validate()?;

        if self.entries.iter().any(|s| s.config.queue == config.queue) {
            return Err(Error::Config(format!(
                "duplicate subscription for queue '{}'",
                config.queue
            )));
        }

        info!(
            queue = %config.queue,
            max_concurrency = config.max_concurrency,
            max_attempts = config.max_attempts,
            "Subscription registered"
        );
        self.entries.push(Subscription { config, handler });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze the registry. The dispatcher only consumes a sealed
    /// registry; a consumer with nothing to consume is a config error.
    pub fn seal(self) -> Result<SealedRegistry> {
        if self.entries.is_empty() {
            return Err(Error::Config(
                "at least one subscription is required".to_string(),
            ));
        }
        Ok(SealedRegistry {
            subscriptions: self.entries,
        })
    }
}

/// Immutable registry consumed by the dispatcher
pub struct SealedRegistry {
    subscriptions: Vec<Subscription>,
}

impl SealedRegistry {
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub(crate) fn into_subscriptions(self) -> Vec<Subscription> {
        self.subscriptions
    }
}
