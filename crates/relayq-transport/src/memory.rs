//! In-memory broker transport
//!
//! Fast, non-persistent broker for development and testing. All data is
//! lost when the process exits. A fault-injection switch simulates
//! transport outages for reconnect tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use relayq_types::{Delivery, DeliveryTag, Error, Message, MessageId, Result};
use tracing::{debug, info};

use crate::traits::{dead_letter_queue, Transport};

/// A message held by the broker, with its delivery bookkeeping
struct QueuedMessage {
    message: Message,
    attempts: u32,
}

/// Internal queue state
#[derive(Default)]
struct QueueState {
    /// Messages waiting to be fetched
    pending: VecDeque<QueuedMessage>,
    /// Deliveries handed out but not yet settled, by delivery tag
    unacked: HashMap<u64, QueuedMessage>,
}

/// In-memory transport implementation
pub struct MemoryTransport {
    /// Queues stored by name
    queues: DashMap<String, QueueState>,
    /// Monotonic delivery-tag counter for this connection
    next_tag: AtomicU64,
    /// Fault-injection switch: while false, every operation fails with
    /// a connection error
    connected: AtomicBool,
}

impl MemoryTransport {
    /// Create a new in-memory transport
    pub fn new() -> Self {
        info!("Initializing in-memory transport");
        Self {
            queues: DashMap::new(),
            next_tag: AtomicU64::new(0),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate a transport outage (false) or recovery (true).
    ///
    /// Losing the connection invalidates all outstanding delivery tags,
    /// as an AMQP channel close would: unacknowledged deliveries go back
    /// to the front of their queues for redelivery.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        info!(connected, "Transport connectivity changed");
        if !connected {
            let requeued = self.requeue_unacked();
            if requeued > 0 {
                info!(
                    count = requeued,
                    "Unacknowledged deliveries returned after connection loss"
                );
            }
        }
    }

    /// Number of messages in a queue's dead-letter destination
    pub fn dead_letter_depth(&self, queue: &str) -> u64 {
        self.queues
            .get(&dead_letter_queue(queue))
            .map(|q| q.pending.len() as u64)
            .unwrap_or(0)
    }

    /// Drain every queue's unacked map back into pending
    fn requeue_unacked(&self) -> u64 {
        let mut requeued = 0u64;
        for mut queue_state in self.queues.iter_mut() {
            let unacked: Vec<_> = queue_state.unacked.drain().collect();
            for (_, queued) in unacked {
                queue_state.pending.push_front(queued);
                requeued += 1;
            }
        }
        requeued
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Connection("transport is down".to_string()))
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.ensure_connected()?;

        if self.queues.contains_key(name) {
            return Ok(());
        }

        self.queues.insert(name.to_string(), QueueState::default());
        info!(queue = %name, "Queue declared");
        Ok(())
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<MessageId> {
        self.ensure_connected()?;

        let mut queue_state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

        let message_id = message.id.clone();
        queue_state.pending.push_back(QueuedMessage {
            message,
            attempts: 0,
        });

        debug!(queue = %queue, message_id = %message_id, "Message published");
        Ok(message_id)
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>> {
        self.ensure_connected()?;

        let mut queue_state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

        let Some(mut queued) = queue_state.pending.pop_front() else {
            return Ok(None);
        };

        queued.attempts += 1;
        let tag = DeliveryTag(self.next_tag.fetch_add(1, Ordering::SeqCst) + 1);
        let delivery = Delivery {
            message: queued.message.clone(),
            queue: queue.to_string(),
            tag,
            redelivered: queued.attempts > 1,
            attempt: queued.attempts,
            received_at: Utc::now(),
        };
        queue_state.unacked.insert(tag.0, queued);

        debug!(
            queue = %queue,
            message_id = %delivery.message.id,
            tag = %tag,
            attempt = delivery.attempt,
            "Message fetched"
        );

        Ok(Some(delivery))
    }

    async fn ack(&self, queue: &str, tag: DeliveryTag) -> Result<()> {
        self.ensure_connected()?;

        let mut queue_state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

        match queue_state.unacked.remove(&tag.0) {
            Some(_) => {
                debug!(queue = %queue, tag = %tag, "Delivery acknowledged");
                Ok(())
            }
            None => Err(Error::UnknownDeliveryTag {
                queue: queue.to_string(),
                tag: tag.0,
            }),
        }
    }

    async fn nack(&self, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.ensure_connected()?;

        // Settle under the queue lock, dead-letter after releasing it
        let dead = {
            let mut queue_state = self
                .queues
                .get_mut(queue)
                .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

            let queued = queue_state
                .unacked
                .remove(&tag.0)
                .ok_or_else(|| Error::UnknownDeliveryTag {
                    queue: queue.to_string(),
                    tag: tag.0,
                })?;

            if requeue {
                debug!(queue = %queue, tag = %tag, "Delivery returned to queue");
                queue_state.pending.push_front(queued);
                None
            } else {
                Some(queued)
            }
        };

        if let Some(queued) = dead {
            let dlq = dead_letter_queue(queue);
            let mut dlq_state = self.queues.entry(dlq.clone()).or_default();
            dlq_state.pending.push_back(QueuedMessage {
                message: queued.message,
                attempts: 0,
            });
            debug!(queue = %queue, dlq = %dlq, tag = %tag, "Delivery dead-lettered");
        }

        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        self.ensure_connected()?;

        let queue_state = self
            .queues
            .get(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

        Ok(queue_state.pending.len() as u64)
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_connected()
    }

    async fn close(&self) -> Result<()> {
        let requeued = self.requeue_unacked();
        if requeued > 0 {
            info!(count = requeued, "Unacknowledged deliveries returned on close");
        }
        Ok(())
    }
}
