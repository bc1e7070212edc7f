//! Handler trait - the business-logic boundary
//!
//! The original listener stubs embedded processing in the subscription
//! callback; here the use case is a capability injected into the
//! dispatch loop instead.

use async_trait::async_trait;
use relayq_types::{Delivery, HandlerError};

/// Processes one delivery.
///
/// Implementations receive the raw payload plus delivery metadata and
/// report success or failure; the dispatch loop owns acknowledgement,
/// retry, and timeout enforcement. A handler must not block
/// indefinitely: anything running past the subscription's timeout is
/// aborted and the delivery dead-lettered.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn process(&self, delivery: &Delivery) -> Result<(), HandlerError>;
}
