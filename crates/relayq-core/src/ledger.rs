//! Delivery outcome ledger
//!
//! Tracks every in-flight delivery from receipt to its terminal state
//! and enforces the core invariant: exactly one terminal outcome per
//! delivery, no double settlement, no silent drop. Entries live only
//! while a delivery is in flight; settling removes the entry and folds
//! the outcome into the running counts, so the map stays bounded by the
//! number of concurrent deliveries rather than growing with throughput.

use std::collections::HashMap;

use parking_lot::Mutex;
use relayq_types::{AckOutcome, DeliveryTag, Error, InFlightState, Result};

/// Running totals of terminal outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    /// Handler succeeded
    pub acked: u64,
    /// Handler failed, delivery requeued for retry
    pub requeued: u64,
    /// Retries exhausted, delivery dead-lettered
    pub dead_lettered: u64,
    /// Handler timed out, delivery dead-lettered
    pub timed_out: u64,
}

impl LedgerCounts {
    /// Total number of settled deliveries
    pub fn settled(&self) -> u64 {
        self.acked + self.requeued + self.dead_lettered + self.timed_out
    }
}

#[derive(Default)]
struct LedgerInner {
    states: HashMap<(String, u64), InFlightState>,
    counts: LedgerCounts,
}

/// Records one terminal outcome per delivery tag
#[derive(Default)]
pub struct DeliveryLedger {
    inner: Mutex<LedgerInner>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery as received
    pub fn track(&self, queue: &str, tag: DeliveryTag) {
        let mut inner = self.inner.lock();
        inner
            .states
            .insert((queue.to_string(), tag.0), InFlightState::Received);
    }

    /// Mark a tracked delivery as processing
    pub fn begin(&self, queue: &str, tag: DeliveryTag) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.states.get_mut(&(queue.to_string(), tag.0)) {
            *state = InFlightState::Processing;
        }
    }

    /// Record the terminal outcome for a delivery and retire its entry.
    ///
    /// Every fetched delivery is tracked before it is processed, and
    /// tags are monotonic per connection, so a tag with no entry here
    /// was settled before: that fails with `AlreadySettled`.
    pub fn settle(&self, queue: &str, tag: DeliveryTag, outcome: AckOutcome) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = (queue.to_string(), tag.0);

        if inner.states.remove(&key).is_none() {
            return Err(Error::AlreadySettled(tag.0));
        }

        match outcome {
            AckOutcome::Acked => inner.counts.acked += 1,
            AckOutcome::Nacked { requeued: true } => inner.counts.requeued += 1,
            AckOutcome::Nacked { requeued: false } => inner.counts.dead_lettered += 1,
            AckOutcome::TimedOut => inner.counts.timed_out += 1,
        }
        Ok(())
    }

    /// Drop a tracked delivery without recording an outcome.
    ///
    /// Used when a settlement fails at the transport: the broker has
    /// invalidated the tag and will redeliver the message under a new
    /// one, so this attempt no longer has an outcome to record.
    pub fn abandon(&self, queue: &str, tag: DeliveryTag) {
        let mut inner = self.inner.lock();
        inner.states.remove(&(queue.to_string(), tag.0));
    }

    /// Current state of an in-flight delivery. `None` once settled.
    pub fn state(&self, queue: &str, tag: DeliveryTag) -> Option<InFlightState> {
        self.inner
            .lock()
            .states
            .get(&(queue.to_string(), tag.0))
            .copied()
    }

    /// Number of deliveries currently in the Processing state for a queue
    pub fn processing_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .states
            .iter()
            .filter(|((q, _), state)| q.as_str() == queue && **state == InFlightState::Processing)
            .count()
    }

    /// Number of deliveries currently tracked across all queues
    pub fn in_flight(&self) -> usize {
        self.inner.lock().states.len()
    }

    /// Terminal-outcome totals across all queues
    pub fn counts(&self) -> LedgerCounts {
        self.inner.lock().counts
    }
}
