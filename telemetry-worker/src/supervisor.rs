//! Runs both pipelines as one unit and restarts them on failure.
//!
//! A run ends on shutdown or on the first failure reported by any component.
//! Either way the sources are stopped first, a final checkpoint is attempted,
//! and the executors get the grace period to drain. After a failure the
//! restart policy decides whether, and after how long, a new run starts from
//! the newest checkpoint.

use std::sync::Arc;
use std::time::Duration;

use health::{HealthHandle, HealthRegistry};
use telemetry_common::executor::BoundedExecutor;
use telemetry_common::retry::RestartPolicy;
use telemetry_common::store::TimeSeriesStore;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointCoordinator, CheckpointParticipant, CoordinatorState};
use crate::config::Config;
use crate::error::{failure_channel, PipelineError, WorkerError};
use crate::ingest::IngestHandler;
use crate::purge::PurgeHandler;
use crate::sink::{DeadLetterSink, KeyedRepublisher, RecordSink};
use crate::source::{MessageHandler, SourceFactory, SourceOptions};

const LIVENESS_DEADLINE: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

struct Liveness {
    telemetry: HealthHandle,
    deletions: HealthHandle,
    checkpoint: HealthHandle,
}

impl Liveness {
    fn report_healthy(&self) {
        self.telemetry.report_healthy();
        self.deletions.report_healthy();
        self.checkpoint.report_healthy();
    }
}

pub struct Supervisor {
    config: Config,
    restart_policy: RestartPolicy,
    sources: Box<dyn SourceFactory>,
    store: Arc<dyn TimeSeriesStore>,
    processed: Arc<dyn RecordSink>,
    dead_letter: Arc<dyn RecordSink>,
    coordinator: CheckpointCoordinator,
    liveness: Liveness,
}

impl Supervisor {
    /// Fails on an invalid restart policy, so that it is caught at startup
    /// rather than on the first restart.
    pub fn new(
        config: Config,
        sources: Box<dyn SourceFactory>,
        store: Arc<dyn TimeSeriesStore>,
        processed: Arc<dyn RecordSink>,
        dead_letter: Arc<dyn RecordSink>,
        coordinator: CheckpointCoordinator,
        registry: &HealthRegistry,
    ) -> Result<Self, WorkerError> {
        let restart_policy = config.restart.policy()?;
        let liveness = Liveness {
            telemetry: registry.register("telemetry_source", LIVENESS_DEADLINE),
            deletions: registry.register("deletions_source", LIVENESS_DEADLINE),
            checkpoint: registry.register("checkpoint_coordinator", LIVENESS_DEADLINE),
        };

        Ok(Self {
            config,
            restart_policy,
            sources,
            store,
            processed,
            dead_letter,
            coordinator,
            liveness,
        })
    }

    /// Run until `shutdown` fires, or until failures exhaust the restart budget.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let mut restarts = self.restart_policy.tracker();

        loop {
            restarts.started(Instant::now().into_std());
            let Some(failure) = self.run_once(&shutdown).await else {
                info!("pipelines stopped");
                return Ok(());
            };

            if shutdown.is_cancelled() {
                warn!("pipeline failed while shutting down: {}", failure);
                return Ok(());
            }

            self.coordinator.set_state(CoordinatorState::Failed);
            let Some(delay) = restarts.failed(Instant::now().into_std()) else {
                error!(
                    restarts = restarts.restarts(),
                    "restart budget exhausted, giving up"
                );
                return Err(WorkerError::RestartsExhausted {
                    restarts: restarts.restarts(),
                    last: failure,
                });
            };

            metrics::counter!("pipeline_restarts_total").increment(1);
            warn!(
                restart = restarts.restarts(),
                ?delay,
                "restarting pipelines after failure: {}",
                failure
            );
            self.coordinator.set_state(CoordinatorState::Restarting);

            if !self.backoff(delay, &shutdown).await {
                info!("shutdown requested during restart backoff");
                return Ok(());
            }
        }
    }

    /// Sleep out a restart delay, staying live meanwhile. Returns `false` if
    /// shutdown was requested.
    async fn backoff(&self, delay: Duration, shutdown: &CancellationToken) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = &mut sleep => return true,
                _ = heartbeat.tick() => self.liveness.report_healthy(),
            }
        }
    }

    /// One run of both pipelines. Returns the failure that ended it, or `None`
    /// on shutdown.
    async fn run_once(&mut self, shutdown: &CancellationToken) -> Option<PipelineError> {
        let checkpoint = match self.coordinator.restore().await {
            Ok(checkpoint) => checkpoint,
            Err(e) => return Some(e.into()),
        };

        let pipeline = &self.config.pipeline;
        let grace = pipeline.shutdown_grace_period.0;
        let write_executor = BoundedExecutor::new(
            "influx_write",
            pipeline.write_max_concurrency,
            pipeline.write_timeout.0,
        );
        let delete_executor = BoundedExecutor::new(
            "influx_delete",
            pipeline.delete_max_concurrency,
            pipeline.delete_timeout.0,
        );

        let outcome = self
            .run_pipelines(
                checkpoint.as_ref(),
                write_executor.clone(),
                delete_executor.clone(),
                shutdown,
            )
            .await;

        let (writes, deletes) = tokio::join!(
            write_executor.shutdown(grace),
            delete_executor.shutdown(grace)
        );
        if writes + deletes > 0 {
            warn!(
                writes,
                deletes, "cancelled unfinished store calls, they will be redelivered"
            );
        }

        outcome
    }

    async fn run_pipelines(
        &mut self,
        checkpoint: Option<&Checkpoint>,
        write_executor: BoundedExecutor,
        delete_executor: BoundedExecutor,
        shutdown: &CancellationToken,
    ) -> Option<PipelineError> {
        let (failures, mut failure_rx) = failure_channel();
        let measurement = self.config.influx.influx_measurement.as_str();
        let max_in_flight = self.config.pipeline.max_in_flight_messages;

        let ingest: Arc<dyn MessageHandler> = Arc::new(IngestHandler::new(
            self.store.clone(),
            measurement,
            write_executor,
            self.config.pipeline.write_retry_policy(),
            KeyedRepublisher::new(self.processed.clone()),
            DeadLetterSink::new(self.dead_letter.clone()),
            failures.clone(),
        ));
        let purge: Arc<dyn MessageHandler> = Arc::new(PurgeHandler::new(
            self.store.clone(),
            measurement,
            delete_executor,
            self.config.pipeline.purge_range_end,
            failures,
        ));

        let telemetry = SourceOptions {
            name: "telemetry",
            consumer: self.config.telemetry_consumer(),
            max_in_flight,
            checkpoint,
            liveness: self.liveness.telemetry.clone(),
        };
        let telemetry = match self.sources.create(telemetry, ingest) {
            Ok(source) => source,
            Err(e) => return Some(e),
        };
        let deletions = SourceOptions {
            name: "deletions",
            consumer: self.config.deletions_consumer(),
            max_in_flight,
            checkpoint,
            liveness: self.liveness.deletions.clone(),
        };
        let deletions = match self.sources.create(deletions, purge) {
            Ok(source) => source,
            Err(e) => return Some(e),
        };

        let participants: Vec<Arc<dyn CheckpointParticipant>> =
            vec![telemetry.participant(), deletions.participant()];

        let sources_shutdown = shutdown.child_token();
        let mut sources = JoinSet::new();
        sources.spawn(telemetry.run(sources_shutdown.clone()));
        sources.spawn(deletions.run(sources_shutdown.clone()));

        self.coordinator.set_state(CoordinatorState::Running);
        info!("pipelines running");

        let outcome = self
            .wait_for_exit(&participants, &mut sources, &mut failure_rx, shutdown)
            .await;

        sources_shutdown.cancel();
        while let Some(joined) = sources.join_next().await {
            if let Some(e) = source_exit(joined) {
                warn!("source failed while stopping: {}", e);
            }
        }

        if let Err(e) = self.coordinator.snapshot(&participants).await {
            warn!("final checkpoint failed, progress since the last one will be redelivered: {}", e);
        }

        outcome
    }

    async fn wait_for_exit(
        &mut self,
        participants: &[Arc<dyn CheckpointParticipant>],
        sources: &mut JoinSet<Result<(), PipelineError>>,
        failure_rx: &mut mpsc::UnboundedReceiver<PipelineError>,
        shutdown: &CancellationToken,
    ) -> Option<PipelineError> {
        tokio::select! {
            _ = shutdown.cancelled() => None,
            Some(failure) = failure_rx.recv() => Some(failure),
            Err(e) = self.coordinator.run(participants, &self.liveness.checkpoint) => Some(e.into()),
            Some(joined) = sources.join_next() => source_exit(joined),
        }
    }
}

fn source_exit(joined: Result<Result<(), PipelineError>, JoinError>) -> Option<PipelineError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(PipelineError::SourceTask(e)),
    }
}
