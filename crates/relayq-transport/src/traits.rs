//! Transport trait definition
//!
//! Defines the interface every broker transport must implement. The
//! contract follows AMQP manual-acknowledgement semantics: a fetched
//! delivery stays unacknowledged at the broker until the consumer acks
//! or nacks its delivery tag.

use async_trait::async_trait;
use relayq_types::{Delivery, DeliveryTag, Message, MessageId, Result};

/// Conventional dead-letter queue name for a queue
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}.dlq", queue)
}

/// Broker transport trait - all transports implement this
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declare a queue, creating it if it does not exist
    async fn declare_queue(&self, name: &str) -> Result<()>;

    /// Publish a message to a queue
    async fn publish(&self, queue: &str, message: Message) -> Result<MessageId>;

    /// Fetch the next pending message from a queue.
    ///
    /// The message becomes unacknowledged at the broker and is stamped
    /// with a fresh delivery tag and its attempt count. Returns `None`
    /// when the queue is empty.
    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery, discarding it at the broker.
    ///
    /// Acking an unknown or already-settled tag fails with
    /// `Error::UnknownDeliveryTag`.
    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<()>;

    /// Negatively acknowledge a delivery.
    ///
    /// With `requeue` the message returns to the front of the queue for
    /// redelivery; without it the message is routed to the queue's
    /// dead-letter destination.
    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<()>;

    /// Number of pending (fetchable) messages in a queue
    async fn queue_depth(&self, queue: &str) -> Result<u64>;

    /// Cheap liveness probe used by the connection manager
    async fn ping(&self) -> Result<()>;

    /// Close the consumer side of the connection.
    ///
    /// Any deliveries still unacknowledged return to their queues so
    /// they redeliver on the next run.
    async fn close(&self) -> Result<()>;
}
