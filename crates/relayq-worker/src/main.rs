//! RelayQ Worker - Queue consumer process
//!
//! Loads subscriptions from configuration, connects to the broker,
//! registers a handler per queue, and dispatches until a shutdown
//! signal, then drains in-flight deliveries.

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use relayq_core::{Dispatcher, DispatcherConfig, Handler, SubscriptionRegistry};
use relayq_transport::{ConnectionManager, MemoryTransport, Transport};
use relayq_types::{Delivery, HandlerError};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::WorkerConfig;

/// Default handler: validates and logs each delivery.
///
/// Stands in for the business use case until one is injected; JSON
/// payloads that do not parse are rejected so they retry and eventually
/// dead-letter instead of being acked blind.
struct LogHandler;

#[async_trait]
impl Handler for LogHandler {
    async fn process(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        info!(
            queue = %delivery.queue,
            message_id = %delivery.message.id,
            bytes = delivery.message.body.len(),
            attempt = delivery.attempt,
            "Processing message"
        );

        if delivery.message.content_type.as_deref() == Some("application/json") {
            delivery
                .message
                .body_as_json::<serde_json::Value>()
                .map_err(|e| HandlerError::new(format!("invalid JSON payload: {e}")))?;
        }

        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relayq=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::load().context("invalid worker configuration")?;
    info!(subscriptions = config.subscriptions.len(), "Configuration loaded");

    let transport = Arc::new(MemoryTransport::new());
    for subscription in &config.subscriptions {
        transport.declare_queue(&subscription.queue).await?;
    }

    let manager = ConnectionManager::connect(
        Arc::clone(&transport) as Arc<dyn Transport>,
        config.connection.reconnect(),
    )
    .await?;
    let supervision = manager.start_supervision();

    let mut registry = SubscriptionRegistry::new();
    for subscription in config.subscriptions.clone() {
        registry.register(subscription, Arc::new(LogHandler))?;
    }

    let dispatcher = Dispatcher::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        manager.subscribe(),
        registry.seal()?,
        DispatcherConfig {
            shutdown_grace: config.shutdown_grace(),
            ..DispatcherConfig::default()
        },
    );
    let ledger = dispatcher.ledger();
    let handle = dispatcher.start();

    // Periodic outcome stats
    let stats = tokio::spawn({
        let ledger = Arc::clone(&ledger);
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let counts = ledger.counts();
                info!(
                    acked = counts.acked,
                    requeued = counts.requeued,
                    dead_lettered = counts.dead_lettered,
                    timed_out = counts.timed_out,
                    in_flight = ledger.in_flight(),
                    "Delivery outcomes"
                );
            }
        }
    });

    info!("RelayQ worker running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    stats.abort();
    supervision.abort();
    handle.shutdown().await?;

    let counts = ledger.counts();
    info!(settled = counts.settled(), "Worker stopped");
    Ok(())
}
