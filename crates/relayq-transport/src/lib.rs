//! RelayQ Transport - Broker side of the consumer
//!
//! This crate provides:
//! - The `Transport` trait: AMQP-style fetch/ack/nack semantics
//! - An in-memory broker implementation (default, for development/testing)
//! - The `ConnectionManager`: reconnect with exponential backoff and
//!   connectivity-state events consumed by the dispatch loop

pub mod connection;
pub mod traits;

#[cfg(feature = "memory")]
pub mod memory;

// Re-exports
pub use connection::{ConnectionManager, ConnectionState, ReconnectConfig};
pub use traits::{dead_letter_queue, Transport};

#[cfg(feature = "memory")]
pub use memory::MemoryTransport;
