use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::{routing::get, Router};
use envconfig::Envconfig;
use health::HealthRegistry;
use telemetry_common::influx::InfluxStore;
use telemetry_common::metrics::{serve, setup_metrics_routes};
use telemetry_worker::checkpoint::{CheckpointCoordinator, CoordinatorState, LocalCheckpointStore};
use telemetry_worker::config::Config;
use telemetry_worker::error::WorkerError;
use telemetry_worker::sink::KafkaRecordSink;
use telemetry_worker::source::KafkaSources;
use telemetry_worker::supervisor::Supervisor;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const PRODUCER_LIVENESS_DEADLINE: Duration = Duration::from_secs(30);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

/// Ready while the checkpoint coordinator is running or snapshotting.
fn readiness(state: &watch::Receiver<CoordinatorState>) -> (StatusCode, &'static str) {
    let state = *state.borrow();
    match state {
        CoordinatorState::Running | CoordinatorState::Snapshotting => {
            (StatusCode::OK, state.as_str())
        }
        CoordinatorState::Failed | CoordinatorState::Restarting => {
            (StatusCode::SERVICE_UNAVAILABLE, state.as_str())
        }
    }
}

pub async fn index() -> &'static str {
    "telemetry worker"
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env()?;
    let shutdown = CancellationToken::new();
    let liveness = HealthRegistry::new("liveness");

    let processed_producer = common_kafka::kafka_producer::create_kafka_producer(
        &config.kafka,
        liveness.register("processed_producer", PRODUCER_LIVENESS_DEADLINE),
    )
    .await?;
    let dead_letter_producer = common_kafka::kafka_producer::create_kafka_producer(
        &config.kafka,
        liveness.register("dead_letter_producer", PRODUCER_LIVENESS_DEADLINE),
    )
    .await?;
    let processed = Arc::new(KafkaRecordSink::new(
        processed_producer,
        config.topics.kafka_topic_processed.as_str(),
    ));
    let dead_letter = Arc::new(KafkaRecordSink::new(
        dead_letter_producer,
        config.topics.kafka_topic_dlq.as_str(),
    ));

    let store = Arc::new(InfluxStore::new(
        config.influx.influx_url.as_str(),
        config.influx.influx_token.as_str(),
        config.influx.influx_org.as_str(),
        config.influx.influx_bucket.as_str(),
        // Executors enforce the per-call timeouts, this only bounds the client.
        config
            .pipeline
            .write_timeout
            .0
            .max(config.pipeline.delete_timeout.0),
    )?);

    let checkpoints = LocalCheckpointStore::open(
        &config.checkpoint.checkpoint_dir,
        config.checkpoint.checkpoint_retained,
    )
    .await?;
    let coordinator =
        CheckpointCoordinator::new(checkpoints, config.checkpoint.checkpoint_interval.0);
    let state = coordinator.subscribe();

    let bind = config.bind();
    let sources = Box::new(KafkaSources::new(config.kafka.clone()));
    let supervisor = Supervisor::new(
        config,
        sources,
        store,
        processed.clone(),
        dead_letter.clone(),
        coordinator,
        &liveness,
    )?;

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let status = liveness.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(move || ready(readiness(&state))))
        .route("/_liveness", get(move || ready(status.get_status())));
    let router = setup_metrics_routes(router);
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind, server_shutdown).await {
            error!("failed to serve health and metrics endpoints: {}", e);
        }
    });

    let result = supervisor.run(shutdown.clone()).await;
    shutdown.cancel();

    for sink in [&processed, &dead_letter] {
        if let Err(e) = sink.flush(FLUSH_TIMEOUT) {
            warn!("failed to flush producer queue: {}", e);
        }
    }

    match &result {
        Ok(()) => info!("shut down cleanly"),
        Err(e) => error!("worker failed: {}", e),
    }
    result
}
