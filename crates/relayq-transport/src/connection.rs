//! Connection manager
//!
//! Owns the broker transport's liveness: probes it periodically, and on
//! failure retries with exponential backoff while publishing
//! connectivity-state events the dispatch loop uses to pause and resume.

use std::sync::Arc;
use std::time::Duration;

use relayq_types::{Error, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::traits::Transport;

/// Connectivity state published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is reachable; dispatch may fetch
    Up,
    /// Transport is unreachable; dispatch pauses until reconnect
    Down,
}

/// Reconnect/backoff settings
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// First retry delay after a failure
    pub initial_backoff: Duration,
    /// Backoff cap; delays double up to this value
    pub max_backoff: Duration,
    /// How often the supervisor probes a healthy transport
    pub probe_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            probe_interval: Duration::from_secs(5),
        }
    }
}

impl ReconnectConfig {
    /// Next delay in the exponential sequence, capped at `max_backoff`
    pub fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_backoff)
    }
}

/// Manages the transport connection lifecycle
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    reconnect: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    /// Connect to the broker, failing fast if it is unreachable.
    ///
    /// Startup is the one place a connection failure is not retried;
    /// a broker that is down at boot is an operator problem.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        reconnect: ReconnectConfig,
    ) -> Result<Arc<Self>> {
        transport
            .ping()
            .await
            .map_err(|e| Error::Connection(format!("initial connect failed: {e}")))?;

        let (state_tx, _) = watch::channel(ConnectionState::Up);
        info!("Broker connection established");

        Ok(Arc::new(Self {
            transport,
            reconnect,
            state_tx,
        }))
    }

    /// Subscribe to connectivity-state events
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Current connectivity state
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Start the supervision loop: probe the transport, and on failure
    /// reconnect with exponential backoff until it answers again.
    pub fn start_supervision(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.reconnect.probe_interval);

            loop {
                interval.tick().await;

                if manager.transport.ping().await.is_ok() {
                    continue;
                }

                warn!("Broker connection lost; dispatch paused");
                let _ = manager.state_tx.send(ConnectionState::Down);

                let mut delay = manager.reconnect.initial_backoff;
                loop {
                    tokio::time::sleep(delay).await;
                    match manager.transport.ping().await {
                        Ok(()) => {
                            info!("Broker connection re-established; dispatch resumed");
                            let _ = manager.state_tx.send(ConnectionState::Up);
                            break;
                        }
                        Err(e) => {
                            warn!(
                                error = %e,
                                retry_in_ms = delay.as_millis() as u64,
                                "Reconnect attempt failed"
                            );
                            delay = manager.reconnect.next_backoff(delay);
                        }
                    }
                }

                interval.reset();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ReconnectConfig::default();
        let mut delay = config.initial_backoff;
        let mut observed = vec![delay];
        for _ in 0..6 {
            delay = config.next_backoff(delay);
            observed.push(delay);
        }

        let secs: Vec<u64> = observed.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test]
    async fn test_connect_fails_when_broker_down() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_connected(false);

        let result =
            ConnectionManager::connect(transport as Arc<dyn Transport>, ReconnectConfig::default())
                .await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervision_reports_down_and_recovers() {
        let transport = Arc::new(MemoryTransport::new());
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

        let mut state_rx = manager.subscribe();
        let supervision = manager.start_supervision();

        // Drop the transport; the next probe must flip the state
        transport.set_connected(false);
        state_rx.changed().await.unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Down);

        // Restore; a backoff retry must flip it back
        transport.set_connected(true);
        state_rx.changed().await.unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Up);

        supervision.abort();
    }
}
