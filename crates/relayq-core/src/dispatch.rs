//! Dispatch loop
//!
//! One pull loop per sealed subscription. Each loop acquires a worker
//! slot before fetching, so unfetched messages stay queued at the broker
//! and the number of concurrently processing deliveries never exceeds
//! the subscription's limit. Handlers run in their own task under a
//! timeout; success acks, failure nacks with bounded retry, timeout and
//! exhausted retries dead-letter. Ack/nack calls for a subscription are
//! serialized through a dedicated settle task.

use std::sync::Arc;
use std::time::Duration;

use relayq_transport::{ConnectionState, Transport};
use relayq_types::{AckOutcome, Delivery, DeliveryTag, Result, SubscriptionConfig};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::handler::Handler;
use crate::ledger::DeliveryLedger;
use crate::registry::SealedRegistry;

/// Dispatcher tuning knobs
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Delay before polling again when a queue is empty
    pub idle_poll_interval: Duration,
    /// Delay after a transport error during fetch
    pub error_backoff: Duration,
    /// How long shutdown waits for in-flight deliveries to drain
    pub shutdown_grace: Duration,
    /// Buffer size of the per-subscription settle channel
    pub settle_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            idle_poll_interval: Duration::from_millis(50),
            error_backoff: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(10),
            settle_buffer: 64,
        }
    }
}

/// Runs the dispatch loops for a sealed registry
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    conn_rx: watch::Receiver<ConnectionState>,
    registry: SealedRegistry,
    config: DispatcherConfig,
    ledger: Arc<DeliveryLedger>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        conn_rx: watch::Receiver<ConnectionState>,
        registry: SealedRegistry,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            transport,
            conn_rx,
            registry,
            config,
            ledger: Arc::new(DeliveryLedger::new()),
        }
    }

    pub fn ledger(&self) -> Arc<DeliveryLedger> {
        Arc::clone(&self.ledger)
    }

    /// Spawn the pull loop and settle task for every subscription
    pub fn start(self) -> DispatcherHandle {
        let Self {
            transport,
            conn_rx,
            registry,
            config,
            ledger,
        } = self;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        for subscription in registry.into_subscriptions() {
            let (settle_tx, settle_rx) = mpsc::channel(config.settle_buffer.max(1));

            tasks.spawn(settle_loop(
                subscription.config.queue.clone(),
                Arc::clone(&transport),
                Arc::clone(&ledger),
                settle_rx,
            ));

            let max_concurrency = subscription.config.max_concurrency;
            let loop_state = SubscriptionLoop {
                transport: Arc::clone(&transport),
                handler: subscription.handler,
                config: subscription.config,
                tuning: config.clone(),
                ledger: Arc::clone(&ledger),
                semaphore: Arc::new(Semaphore::new(max_concurrency)),
                settle_tx,
                conn_rx: conn_rx.clone(),
                shutdown_rx: shutdown_rx.clone(),
            };
            tasks.spawn(loop_state.run());
        }

        info!(subscriptions = tasks.len() / 2, "Dispatcher started");

        DispatcherHandle {
            tasks,
            shutdown_tx,
            transport,
            ledger,
            grace: config.shutdown_grace,
        }
    }
}

/// Handle to a running dispatcher
pub struct DispatcherHandle {
    tasks: JoinSet<()>,
    shutdown_tx: watch::Sender<bool>,
    transport: Arc<dyn Transport>,
    ledger: Arc<DeliveryLedger>,
    grace: Duration,
}

impl DispatcherHandle {
    pub fn ledger(&self) -> Arc<DeliveryLedger> {
        Arc::clone(&self.ledger)
    }

    /// Stop fetching, drain in-flight deliveries up to the grace period,
    /// then force-close the connection so anything still unacknowledged
    /// returns to its queue.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Dispatcher shutting down");
        let _ = self.shutdown_tx.send(true);

        let grace = self.grace;
        let drained = tokio::time::timeout(grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "Shutdown grace expired with deliveries still in flight; forcing close"
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        self.transport.close().await
    }
}

/// Verdict for one delivery, sent to the settle task
struct Settle {
    tag: DeliveryTag,
    outcome: AckOutcome,
}

/// Applies ack/nack verdicts for one subscription.
///
/// Single-writer discipline: every ack/nack for the queue goes through
/// this task, so settlement calls on the shared connection never race.
async fn settle_loop(
    queue: String,
    transport: Arc<dyn Transport>,
    ledger: Arc<DeliveryLedger>,
    mut rx: mpsc::Receiver<Settle>,
) {
    while let Some(settle) = rx.recv().await {
        let result = match settle.outcome {
            AckOutcome::Acked => transport.ack(&queue, settle.tag).await,
            AckOutcome::Nacked { requeued } => transport.nack(&queue, settle.tag, requeued).await,
            AckOutcome::TimedOut => transport.nack(&queue, settle.tag, false).await,
        };

        match result {
            Ok(()) => {
                if let Err(e) = ledger.settle(&queue, settle.tag, settle.outcome) {
                    error!(queue = %queue, tag = %settle.tag, error = %e, "Ledger rejected settlement");
                }
            }
            Err(e) => {
                // The broker requeues unacknowledged deliveries when the
                // connection is lost, so a failed settlement means
                // redelivery under a fresh tag, not loss. This attempt
                // has no outcome to record; drop its ledger entry.
                warn!(queue = %queue, tag = %settle.tag, error = %e, "Failed to settle delivery");
                ledger.abandon(&queue, settle.tag);
            }
        }
    }
    debug!(queue = %queue, "Settle task stopped");
}

/// Per-subscription pull loop state
struct SubscriptionLoop {
    transport: Arc<dyn Transport>,
    handler: Arc<dyn Handler>,
    config: SubscriptionConfig,
    tuning: DispatcherConfig,
    ledger: Arc<DeliveryLedger>,
    semaphore: Arc<Semaphore>,
    settle_tx: mpsc::Sender<Settle>,
    conn_rx: watch::Receiver<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SubscriptionLoop {
    async fn run(mut self) {
        info!(
            queue = %self.config.queue,
            max_concurrency = self.config.max_concurrency,
            "Subscription loop started"
        );

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            if !self.wait_until_up().await {
                break;
            }

            // Worker slot before fetch: unfetched messages stay at the
            // broker, which is the backpressure mechanism.
            let permit = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown_rx.changed() => continue,
            };

            match self.transport.fetch(&self.config.queue).await {
                Ok(Some(delivery)) => {
                    self.ledger.track(&self.config.queue, delivery.tag);
                    self.spawn_worker(permit, delivery);
                }
                Ok(None) => {
                    drop(permit);
                    self.pause(self.tuning.idle_poll_interval).await;
                }
                Err(e) => {
                    drop(permit);
                    warn!(queue = %self.config.queue, error = %e, "Fetch failed");
                    self.pause(self.tuning.error_backoff).await;
                }
            }
        }

        self.drain().await;
        info!(queue = %self.config.queue, "Subscription loop stopped");
    }

    /// Sleep, waking early on shutdown
    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown_rx.changed() => {}
        }
    }

    /// Block while the connection is down. Returns false on shutdown.
    async fn wait_until_up(&mut self) -> bool {
        loop {
            if *self.shutdown_rx.borrow() {
                return false;
            }
            if *self.conn_rx.borrow() == ConnectionState::Up {
                return true;
            }

            debug!(queue = %self.config.queue, "Connection down; dispatch paused");
            tokio::select! {
                changed = self.conn_rx.changed() => {
                    if changed.is_err() {
                        // Connection manager gone; keep whatever state we last saw
                        return *self.conn_rx.borrow() == ConnectionState::Up;
                    }
                }
                _ = self.shutdown_rx.changed() => {}
            }
        }
    }

    /// Run the handler for one delivery in a worker task.
    ///
    /// The handler itself runs in a nested task so that a panic becomes
    /// a JoinError instead of leaking the delivery: every path out of
    /// here sends exactly one settle verdict.
    fn spawn_worker(&self, permit: OwnedSemaphorePermit, delivery: Delivery) {
        let handler = Arc::clone(&self.handler);
        let settle_tx = self.settle_tx.clone();
        let ledger = Arc::clone(&self.ledger);
        let timeout = self.config.handler_timeout();
        let timeout_ms = self.config.handler_timeout_ms;
        let max_attempts = self.config.max_attempts;
        let queue = self.config.queue.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let tag = delivery.tag;
            let attempt = delivery.attempt;
            let message_id = delivery.message.id.clone();

            ledger.begin(&queue, tag);
            debug!(queue = %queue, message_id = %message_id, tag = %tag, attempt, "Processing delivery");

            let work = tokio::spawn(async move { handler.process(&delivery).await });
            let abort = work.abort_handle();

            let outcome = match tokio::time::timeout(timeout, work).await {
                Ok(Ok(Ok(()))) => {
                    debug!(queue = %queue, message_id = %message_id, tag = %tag, "Delivery processed");
                    AckOutcome::Acked
                }
                Ok(Ok(Err(e))) => {
                    let outcome = failure_outcome(attempt, max_attempts);
                    warn!(
                        queue = %queue,
                        message_id = %message_id,
                        tag = %tag,
                        attempt,
                        error = %e,
                        requeued = matches!(outcome, AckOutcome::Nacked { requeued: true }),
                        "Handler failed"
                    );
                    outcome
                }
                Ok(Err(join_err)) => {
                    let outcome = failure_outcome(attempt, max_attempts);
                    error!(
                        queue = %queue,
                        message_id = %message_id,
                        tag = %tag,
                        attempt,
                        panicked = join_err.is_panic(),
                        "Handler crashed"
                    );
                    outcome
                }
                Err(_) => {
                    abort.abort();
                    warn!(
                        queue = %queue,
                        message_id = %message_id,
                        tag = %tag,
                        timeout_ms,
                        "Handler timed out; dead-lettering delivery"
                    );
                    AckOutcome::TimedOut
                }
            };

            if settle_tx.send(Settle { tag, outcome }).await.is_err() {
                debug!(queue = %queue, tag = %tag, "Settle channel closed during shutdown");
            }
        });
    }

    /// Wait until every worker slot has been released
    async fn drain(&self) {
        debug!(queue = %self.config.queue, "Draining in-flight deliveries");
        let _ = self
            .semaphore
            .acquire_many(self.config.max_concurrency as u32)
            .await;
    }
}

/// Failure settles as requeue until the retry budget is spent
fn failure_outcome(attempt: u32, max_attempts: u32) -> AckOutcome {
    AckOutcome::Nacked {
        requeued: attempt < max_attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SubscriptionRegistry;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relayq_transport::{ConnectionManager, MemoryTransport, ReconnectConfig};
    use relayq_types::{HandlerError, Message};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn test_tuning() -> DispatcherConfig {
        DispatcherConfig {
            idle_poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(5),
            settle_buffer: 16,
        }
    }

    async fn start_dispatcher(
        transport: &Arc<MemoryTransport>,
        conn_rx: watch::Receiver<ConnectionState>,
        config: SubscriptionConfig,
        handler: Arc<dyn Handler>,
    ) -> DispatcherHandle {
        transport.declare_queue(&config.queue).await.unwrap();
        let mut registry = SubscriptionRegistry::new();
        registry.register(config, handler).unwrap();

        Dispatcher::new(
            Arc::clone(transport) as Arc<dyn Transport>,
            conn_rx,
            registry.seal().unwrap(),
            test_tuning(),
        )
        .start()
    }

    /// Poll a condition under the paused clock
    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..3000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 30s of virtual time");
    }

    struct Recorder {
        bodies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn process(&self, delivery: &Delivery) -> std::result::Result<(), HandlerError> {
            self.bodies
                .lock()
                .push(delivery.message.body_as_str().unwrap_or("").to_string());
            Ok(())
        }
    }

    struct FailingHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Handler for FailingHandler {
        async fn process(&self, _delivery: &Delivery) -> std::result::Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::new("boom"))
        }
    }

    struct SleepyHandler {
        started: AtomicU32,
        completed: AtomicU32,
        sleep: Duration,
    }

    impl SleepyHandler {
        fn new(sleep: Duration) -> Self {
            Self {
                started: AtomicU32::new(0),
                completed: AtomicU32::new(0),
                sleep,
            }
        }
    }

    #[async_trait]
    impl Handler for SleepyHandler {
        async fn process(&self, _delivery: &Delivery) -> std::result::Result<(), HandlerError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.sleep).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PanickyHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Handler for PanickyHandler {
        async fn process(&self, _delivery: &Delivery) -> std::result::Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("handler exploded");
        }
    }

    struct ConcurrencyProbe {
        current: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl Handler for ConcurrencyProbe {
        async fn process(&self, _delivery: &Delivery) -> std::result::Result<(), HandlerError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_deliveries_are_acked_exactly_once() {
        let transport = Arc::new(MemoryTransport::new());
        let (_conn_tx, conn_rx) = watch::channel(ConnectionState::Up);
        let handler = Arc::new(Recorder {
            bodies: Mutex::new(Vec::new()),
        });

        let handle = start_dispatcher(
            &transport,
            conn_rx,
            SubscriptionConfig::new("orders"),
            handler.clone(),
        )
        .await;

        for i in 0..3 {
            transport
                .publish("orders", Message::new(format!("m{i}")))
                .await
                .unwrap();
        }

        let ledger = handle.ledger();
        wait_until(|| ledger.counts().acked == 3).await;

        let counts = ledger.counts();
        assert_eq!(counts.settled(), 3);
        assert_eq!(counts.acked, 3);
        assert_eq!(transport.queue_depth("orders").await.unwrap(), 0);
        assert!(transport.fetch("orders").await.unwrap().is_none());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_slot_processes_in_receipt_order() {
        let transport = Arc::new(MemoryTransport::new());
        let (_conn_tx, conn_rx) = watch::channel(ConnectionState::Up);
        let handler = Arc::new(Recorder {
            bodies: Mutex::new(Vec::new()),
        });

        let handle = start_dispatcher(
            &transport,
            conn_rx,
            SubscriptionConfig::new("orders").with_max_concurrency(1),
            handler.clone(),
        )
        .await;

        for name in ["M1", "M2", "M3"] {
            transport.publish("orders", Message::new(name)).await.unwrap();
        }

        let ledger = handle.ledger();
        wait_until(|| ledger.counts().acked == 3).await;

        assert_eq!(*handler.bodies.lock(), vec!["M1", "M2", "M3"]);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_is_never_exceeded() {
        let transport = Arc::new(MemoryTransport::new());
        let (_conn_tx, conn_rx) = watch::channel(ConnectionState::Up);
        let probe = Arc::new(ConcurrencyProbe {
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });

        let handle = start_dispatcher(
            &transport,
            conn_rx,
            SubscriptionConfig::new("orders").with_max_concurrency(2),
            probe.clone(),
        )
        .await;

        for i in 0..10 {
            transport
                .publish("orders", Message::new(format!("m{i}")))
                .await
                .unwrap();
        }

        let ledger = handle.ledger();
        wait_until(|| ledger.counts().acked == 10).await;

        assert!(probe.max_seen.load(Ordering::SeqCst) <= 2);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_handler_is_retried_then_dead_lettered() {
        let transport = Arc::new(MemoryTransport::new());
        let (_conn_tx, conn_rx) = watch::channel(ConnectionState::Up);
        let handler = Arc::new(FailingHandler {
            calls: AtomicU32::new(0),
        });

        let handle = start_dispatcher(
            &transport,
            conn_rx,
            SubscriptionConfig::new("orders").with_max_attempts(3),
            handler.clone(),
        )
        .await;

        transport.publish("orders", Message::new("poison")).await.unwrap();

        let ledger = handle.ledger();
        wait_until(|| ledger.counts().dead_lettered == 1).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let counts = ledger.counts();
        assert_eq!(counts.requeued, 2);
        assert_eq!(counts.dead_lettered, 1);
        assert_eq!(transport.dead_letter_depth("orders"), 1);
        assert_eq!(transport.queue_depth("orders").await.unwrap(), 0);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out_and_dead_letters() {
        let transport = Arc::new(MemoryTransport::new());
        let (_conn_tx, conn_rx) = watch::channel(ConnectionState::Up);
        let handler = Arc::new(SleepyHandler::new(Duration::from_millis(200)));

        let handle = start_dispatcher(
            &transport,
            conn_rx,
            SubscriptionConfig::new("orders").with_handler_timeout(Duration::from_millis(50)),
            handler.clone(),
        )
        .await;

        transport.publish("orders", Message::new("slow")).await.unwrap();

        let ledger = handle.ledger();
        wait_until(|| ledger.counts().timed_out == 1).await;

        // One attempt, aborted mid-sleep, no requeue
        assert_eq!(handler.started.load(Ordering::SeqCst), 1);
        assert_eq!(handler.completed.load(Ordering::SeqCst), 0);
        assert_eq!(transport.dead_letter_depth("orders"), 1);
        assert_eq!(transport.queue_depth("orders").await.unwrap(), 0);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_still_settles() {
        let transport = Arc::new(MemoryTransport::new());
        let (_conn_tx, conn_rx) = watch::channel(ConnectionState::Up);
        let handler = Arc::new(PanickyHandler {
            calls: AtomicU32::new(0),
        });

        let handle = start_dispatcher(
            &transport,
            conn_rx,
            SubscriptionConfig::new("orders").with_max_attempts(2),
            handler.clone(),
        )
        .await;

        transport.publish("orders", Message::new("kaboom")).await.unwrap();

        let ledger = handle.ledger();
        wait_until(|| ledger.counts().dead_lettered == 1).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        let counts = ledger.counts();
        assert_eq!(counts.requeued, 1);
        assert_eq!(counts.dead_lettered, 1);
        assert_eq!(transport.dead_letter_depth("orders"), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_pauses_while_down_and_resumes() {
        let transport = Arc::new(MemoryTransport::new());
        let (conn_tx, conn_rx) = watch::channel(ConnectionState::Up);
        let handler = Arc::new(Recorder {
            bodies: Mutex::new(Vec::new()),
        });

        let handle = start_dispatcher(
            &transport,
            conn_rx,
            SubscriptionConfig::new("orders"),
            handler.clone(),
        )
        .await;

        conn_tx.send(ConnectionState::Down).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        transport.publish("orders", Message::new("m1")).await.unwrap();
        transport.publish("orders", Message::new("m2")).await.unwrap();

        // Paused: nothing is fetched
        tokio::time::sleep(Duration::from_millis(200)).await;
        let ledger = handle.ledger();
        assert_eq!(ledger.counts().settled(), 0);
        assert_eq!(transport.queue_depth("orders").await.unwrap(), 2);

        conn_tx.send(ConnectionState::Up).unwrap();
        wait_until(|| ledger.counts().acked == 2).await;

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_with_backoff_resumes_dispatch() {
        let transport = Arc::new(MemoryTransport::new());
        transport.declare_queue("orders").await.unwrap();

        let manager = ConnectionManager::connect(
            Arc::clone(&transport) as Arc<dyn Transport>,
            ReconnectConfig {
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(1),
                probe_interval: Duration::from_millis(50),
            },
        )
        .await
        .unwrap();
        let supervision = manager.start_supervision();

        let handler = Arc::new(Recorder {
            bodies: Mutex::new(Vec::new()),
        });
        let handle = start_dispatcher(
            &transport,
            manager.subscribe(),
            SubscriptionConfig::new("orders"),
            handler.clone(),
        )
        .await;

        transport.publish("orders", Message::new("before")).await.unwrap();
        let ledger = handle.ledger();
        wait_until(|| ledger.counts().acked == 1).await;

        // Drop the connection and wait for the supervisor to notice
        let mut state_rx = manager.subscribe();
        transport.set_connected(false);
        state_rx.changed().await.unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Down);

        // Broker comes back; messages published during the outage are
        // processed once a backoff retry flips the state to Up
        transport.set_connected(true);
        transport.publish("orders", Message::new("during-1")).await.unwrap();
        transport.publish("orders", Message::new("during-2")).await.unwrap();

        wait_until(|| ledger.counts().acked == 3).await;
        assert_eq!(handler.bodies.lock().len(), 3);

        supervision.abort();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_settlement_failure_during_outage_leads_to_redelivery() {
        let transport = Arc::new(MemoryTransport::new());
        let (conn_tx, conn_rx) = watch::channel(ConnectionState::Up);
        let handler = Arc::new(SleepyHandler::new(Duration::from_millis(100)));

        let handle = start_dispatcher(
            &transport,
            conn_rx,
            SubscriptionConfig::new("orders"),
            handler.clone(),
        )
        .await;

        transport.publish("orders", Message::new("m")).await.unwrap();
        wait_until(|| handler.started.load(Ordering::SeqCst) == 1).await;

        // Connection drops while the handler is mid-flight: the broker
        // requeues the delivery and the ack that follows cannot land
        transport.set_connected(false);
        conn_tx.send(ConnectionState::Down).unwrap();
        wait_until(|| handler.completed.load(Ordering::SeqCst) == 1).await;

        let ledger = handle.ledger();
        assert_eq!(ledger.counts().settled(), 0);

        transport.set_connected(true);
        conn_tx.send(ConnectionState::Up).unwrap();
        wait_until(|| ledger.counts().acked == 1).await;

        // Processed twice, acked once; nothing stranded anywhere
        assert_eq!(handler.started.load(Ordering::SeqCst), 2);
        assert_eq!(handler.completed.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.counts().settled(), 1);
        assert_eq!(ledger.in_flight(), 0);
        assert_eq!(transport.queue_depth("orders").await.unwrap(), 0);
        assert_eq!(transport.dead_letter_depth("orders"), 0);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_in_flight_deliveries() {
        let transport = Arc::new(MemoryTransport::new());
        let (_conn_tx, conn_rx) = watch::channel(ConnectionState::Up);
        let handler = Arc::new(SleepyHandler::new(Duration::from_millis(100)));

        let handle = start_dispatcher(
            &transport,
            conn_rx,
            SubscriptionConfig::new("orders"),
            handler.clone(),
        )
        .await;

        transport.publish("orders", Message::new("m")).await.unwrap();
        wait_until(|| handler.started.load(Ordering::SeqCst) == 1).await;

        let ledger = handle.ledger();
        handle.shutdown().await.unwrap();

        assert_eq!(handler.completed.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.counts().acked, 1);
        assert_eq!(transport.queue_depth("orders").await.unwrap(), 0);
    }
}
