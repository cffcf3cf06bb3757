use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use printworks_api::config::{init_tracing, load_config};
use printworks_api::db::{establish_connection_from_app_config, run_migrations};
use printworks_api::events::{event_channel, process_events};
use printworks_api::handlers::AppServices;
use printworks_api::message_queue::{InMemoryMessageQueue, MessageQueue};
use printworks_api::services::fulfillment::{run_fulfillment_consumer, run_reconciliation_sweep};
use printworks_api::{app_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(load_config()?);
    init_tracing(config.log_level(), config.log_json);
    info!(environment = %config.environment, "Starting printworks-api");

    let db = Arc::new(establish_connection_from_app_config(&config).await?);
    if config.auto_migrate {
        run_migrations(&db).await?;
    }

    let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryMessageQueue::new(
        Duration::from_secs(config.queue_visibility_timeout_secs),
        config.queue_max_deliveries,
    ));

    let (events, event_rx) = event_channel(config.event_channel_capacity);
    let services = AppServices::new(db.clone(), queue.clone(), events.clone(), &config)?;

    let state = Arc::new(AppState {
        db,
        config: config.clone(),
        services: services.clone(),
        events,
        queue: queue.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let event_task = tokio::spawn(process_events(event_rx));

    let consumer_task = tokio::spawn(run_fulfillment_consumer(
        queue,
        services.orders.clone(),
        services.fulfillment.clone(),
        Duration::from_secs(config.consumer_poll_interval_secs),
        shutdown_rx.clone(),
    ));

    let reconciliation_task = if config.reconciliation_enabled {
        Some(tokio::spawn(run_reconciliation_sweep(
            services.orders.clone(),
            Duration::from_secs(config.reconciliation_interval_secs),
            Duration::from_secs(config.reconciliation_stale_after_secs),
            shutdown_rx,
        )))
    } else {
        None
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped; shutting down background workers");
    let _ = shutdown_tx.send(true);

    if let Err(err) = consumer_task.await {
        error!(error = %err, "fulfillment consumer task panicked");
    }
    if let Some(task) = reconciliation_task {
        if let Err(err) = task.await {
            error!(error = %err, "reconciliation task panicked");
        }
    }
    // The event channel closes once all senders drop with the state.
    event_task.abort();

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
