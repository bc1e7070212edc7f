//! RelayQ Core - Consumer side of the queue runtime
//!
//! This crate contains the dispatch machinery:
//! - `Handler`: the business-logic boundary, injected per subscription
//! - `SubscriptionRegistry`: validated queue -> handler bindings
//! - `Dispatcher`: per-subscription pull loops with bounded concurrency,
//!   ack/nack discipline, bounded retry, and dead-lettering
//! - `DeliveryLedger`: one terminal outcome per delivery, enforced

pub mod dispatch;
pub mod handler;
pub mod ledger;
pub mod registry;

// Re-exports
pub use dispatch::{Dispatcher, DispatcherConfig, DispatcherHandle};
pub use handler::Handler;
pub use ledger::{DeliveryLedger, LedgerCounts};
pub use registry::{SealedRegistry, Subscription, SubscriptionRegistry};
