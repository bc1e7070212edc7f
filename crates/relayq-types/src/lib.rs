//! RelayQ Types - Core domain types for the queue consumer
//!
//! This crate contains all shared types used across RelayQ components.

pub mod error;
pub mod message;
pub mod subscription;

// Re-export commonly used types
pub use error::{Error, HandlerError, Result};
pub use message::{Delivery, DeliveryTag, Message, MessageId};
pub use subscription::{AckOutcome, InFlightState, SubscriptionConfig};
