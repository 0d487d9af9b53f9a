use std::sync::Arc;

use anyhow::Result;
use bar_queue::{
    api::{rate_limit::TokenBucketLimiter, rpc::Dispatcher, service::QueueEngine},
    config,
    domain::{clock::SystemClock, event::EventNotifier},
    infrastructure::{
        nats::{forward, NatsEventTransport, NatsRpc},
        postgres::{self, PgQueueStore, PgVenues},
    },
};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::parse();

    config::configure_tracing();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.storage_timeout())
        .connect(&config.database_url)
        .await?;
    if config.migrate {
        postgres::migrate(&pool).await?;
        info!("Schema applied");
    }
    let nc = async_nats::connect(&config.nats_url).await?;

    let notifier = EventNotifier::new(config.event_buffer);
    let store = PgQueueStore::new(pool.clone(), config.storage_timeout());
    let venues = PgVenues::new(pool);
    let engine = QueueEngine::new(
        store,
        venues,
        notifier.clone(),
        Arc::new(SystemClock),
        config.storage_timeout(),
    );

    let limiter = Arc::new(TokenBucketLimiter::new(config.rate_limit()));
    let sweeper = limiter.spawn_sweeper(config.sweep_interval());

    let service = Dispatcher::new(engine, limiter);
    let rpc = NatsRpc::new(nc.clone(), "queue".to_string());
    let event = NatsEventTransport::new(nc);

    info!(env = %config.env, "Queue service starting");

    tokio::select! {
        _ = forward(notifier.subscribe(), event) => {
            error!("Event forwarder exited");
        }
        result = rpc.listen(service) => {
            if let Err(err) = result {
                error!(error = ?err, "RPC listener failed");
            } else {
                error!("RPC listener exited");
            }
        }
    }

    sweeper.abort();
    info!("Exiting");

    Ok(())
}
