//! Run the event stitching pipeline: intake workers, stitcher workers, and
//! the diagnostics HTTP surface, all against one Postgres store.

use std::sync::Arc;

use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stitch_core::health::HealthRegistry;
use stitch_core::metrics::setup_metrics_recorder;
use stitch_core::pg::PgStore;
use stitch_core::schema;
use stitch_core::types::NewEvent;
use stitch_server::config::Config;
use stitch_server::handlers;
use stitch_server::ingest::IngestService;
use stitch_server::stitcher::StitchingService;

async fn shutdown_signal() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    if config.ingest_workers + config.stitching_workers > config.max_pg_connections as usize {
        warn!("more workers than pool connections, workers will contend for connections");
    }

    let store = PgStore::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to connect to postgres");

    if config.reset_schema {
        warn!("RESET_SCHEMA is set, dropping and recreating tables");
        schema::reset_schema(store.pool())
            .await
            .expect("failed to reset database schema");
    } else {
        schema::ensure_schema(store.pool())
            .await
            .expect("failed to ensure database schema");
    }

    let store = Arc::new(store);
    let liveness = HealthRegistry::new();
    let token = CancellationToken::new();

    let ingest = IngestService::new(store.clone(), config.ingest_workers, config.intake_capacity);
    let (intake, ingest_handles) = ingest.start(&token);

    let stitcher = StitchingService::new(
        store.clone(),
        config.stitching_interval.0,
        config.stitching_workers,
        config.stitching_batch_size,
    );
    let stitch_handles = stitcher.start(&token, &liveness);

    let recorder_handle = setup_metrics_recorder();
    let app = handlers::app(liveness, Some(recorder_handle));
    let bind = config.bind();
    let server_token = token.clone();
    let server = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .expect("failed to bind diagnostics listener");
        info!(%bind, "listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(server_token.cancelled_owned())
            .await
            .expect("diagnostics server failed");
    });

    if config.seed_events > 0 {
        let intake = intake.clone();
        let count = config.seed_events;
        tokio::spawn(async move {
            info!(count, "seeding random events through intake");
            for _ in 0..count {
                // Sending blocks when the backlog is full; a closed backlog
                // means we are shutting down.
                if intake.send(NewEvent::random()).await.is_err() {
                    break;
                }
            }
        });
    }

    info!(
        stitching_workers = config.stitching_workers,
        ingest_workers = config.ingest_workers,
        batch_size = config.stitching_batch_size,
        "event stitcher started"
    );

    shutdown_signal().await;
    info!("shutting down");
    token.cancel();
    drop(intake);

    for handle in ingest_handles.into_iter().chain(stitch_handles) {
        let _ = handle.await;
    }
    let _ = server.await;
    info!("shutdown complete");
}
