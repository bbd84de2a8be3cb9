mod common;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{record, MemorySink, MemoryStore};
use envconfig::Envconfig;
use futures::future::BoxFuture;
use futures::FutureExt;
use health::HealthRegistry;
use telemetry_worker::checkpoint::{
    CheckpointCoordinator, CheckpointParticipant, CoordinatorState, LocalCheckpointStore,
};
use telemetry_worker::config::Config;
use telemetry_worker::error::{CheckpointError, PipelineError, WorkerError};
use telemetry_worker::source::{
    Dispatcher, MessageHandler, PipelineSource, SourceFactory, SourceOptions, SourceRecord,
};
use telemetry_worker::supervisor::Supervisor;
use telemetry_worker::tracker::{OffsetTracker, PartitionOffset};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const RAW_TOPIC: &str = "iot-telemetry-raw";
const READING: &str =
    r#"{"deviceId":"d1","timestamp":"2024-01-01T00:00:00Z","data":{"currentTemperature":21.5}}"#;

/// Feeds the same records on every run, then idles until shutdown.
struct ReplaySource {
    tracker: Arc<OffsetTracker>,
    dispatcher: Dispatcher<Arc<dyn MessageHandler>>,
    records: Vec<SourceRecord>,
}

struct TrackerOffsets(Arc<OffsetTracker>);

impl CheckpointParticipant for TrackerOffsets {
    fn name(&self) -> &str {
        "replay"
    }

    fn snapshot(&self) -> Vec<PartitionOffset> {
        self.0.committable()
    }

    fn commit(&self, _offsets: &[PartitionOffset]) -> Result<(), CheckpointError> {
        Ok(())
    }
}

impl PipelineSource for ReplaySource {
    fn participant(&self) -> Arc<dyn CheckpointParticipant> {
        Arc::new(TrackerOffsets(self.tracker.clone()))
    }

    fn run(
        self: Box<Self>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, Result<(), PipelineError>> {
        async move {
            for record in self.records.iter().cloned() {
                if !self.dispatcher.dispatch(record).await? {
                    break;
                }
            }
            shutdown.cancelled().await;
            self.tracker.close();
            Ok(())
        }
        .boxed()
    }
}

#[derive(Default)]
struct ReplaySources {
    records: HashMap<&'static str, Vec<SourceRecord>>,
    /// Id of the checkpoint each telemetry source resumed from.
    resumed_from: Arc<Mutex<Vec<Option<u64>>>>,
}

impl ReplaySources {
    fn telemetry(records: Vec<SourceRecord>) -> Self {
        Self {
            records: HashMap::from([("telemetry", records)]),
            ..Default::default()
        }
    }
}

impl SourceFactory for ReplaySources {
    fn create(
        &self,
        options: SourceOptions<'_>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn PipelineSource>, PipelineError> {
        if options.name == "telemetry" {
            self.resumed_from
                .lock()
                .unwrap()
                .push(options.checkpoint.map(|c| c.id));
        }

        let tracker = OffsetTracker::new(
            options.name,
            &options.consumer.kafka_consumer_topic,
            options.max_in_flight,
        );
        Ok(Box::new(ReplaySource {
            dispatcher: Dispatcher::new(tracker.clone(), options.checkpoint, handler),
            tracker,
            records: self.records.get(options.name).cloned().unwrap_or_default(),
        }))
    }
}

/// Restarts wait a minute each, and the budget runs out after 100 seconds,
/// which is during the third run.
fn config(checkpoint_dir: &Path, overrides: &[(&str, &str)]) -> Config {
    let mut env: HashMap<String, String> = [
        ("KAFKA_HOSTS", "localhost:9092"),
        ("KAFKA_TOPIC_RAW", RAW_TOPIC),
        ("KAFKA_TOPIC_PROCESSED", "iot-telemetry-processed"),
        ("KAFKA_TOPIC_DELETIONS", "device-deletions"),
        ("INFLUX_URL", "http://localhost:8086"),
        ("INFLUX_TOKEN", "token"),
        ("INFLUX_ORG", "acme"),
        ("INFLUX_BUCKET", "thermostats"),
        ("CHECKPOINT_INTERVAL", "3600000"),
        ("RESTART_INITIAL_BACKOFF", "60000"),
        ("RESTART_MAX_BACKOFF", "60000"),
        ("RESTART_BACKOFF_MULTIPLIER", "1.0"),
        ("RESTART_JITTER_FACTOR", "0"),
        ("RESTART_MAX_ELAPSED", "100000"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    env.insert(
        "CHECKPOINT_DIR".to_string(),
        checkpoint_dir.display().to_string(),
    );
    for (key, value) in overrides {
        env.insert(key.to_string(), value.to_string());
    }

    Config::init_from_hashmap(&env).expect("config should load")
}

async fn supervisor(
    config: Config,
    sources: ReplaySources,
    store: Arc<MemoryStore>,
) -> Result<(Supervisor, watch::Receiver<CoordinatorState>), WorkerError> {
    let checkpoints = LocalCheckpointStore::open(&config.checkpoint.checkpoint_dir, 3).await?;
    let coordinator =
        CheckpointCoordinator::new(checkpoints, config.checkpoint.checkpoint_interval.0);
    let state = coordinator.subscribe();

    let supervisor = Supervisor::new(
        config,
        Box::new(sources),
        store,
        Arc::new(MemorySink::default()),
        Arc::new(MemorySink::default()),
        coordinator,
        &HealthRegistry::new("liveness"),
    )?;
    Ok((supervisor, state))
}

/// Every distinct coordinator state published until the coordinator is dropped.
fn observe(
    mut state: watch::Receiver<CoordinatorState>,
) -> tokio::task::JoinHandle<Vec<CoordinatorState>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            if seen.last() != Some(&current) {
                seen.push(current);
            }
        }
        seen
    })
}

#[tokio::test(start_paused = true)]
async fn failed_run_restarts_from_the_last_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    // Fails every attempt of the first run, then recovers.
    let store = MemoryStore::failing_times(3);
    let sources = ReplaySources::telemetry(vec![record(RAW_TOPIC, 0, Some(READING))]);
    let resumed_from = sources.resumed_from.clone();
    let (supervisor, state) = supervisor(config(dir.path(), &[]), sources, store.clone())
        .await
        .unwrap();
    let states = observe(state.clone());

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(supervisor.run(shutdown.clone()));

    tokio::time::timeout(Duration::from_secs(600), async {
        while store.points().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the reading should be written after the restart");
    // Let the write acknowledge its message.
    tokio::time::sleep(Duration::from_secs(1)).await;

    shutdown.cancel();
    run.await.unwrap().expect("shutdown should be clean");

    assert_eq!(store.write_attempts(), 4);
    assert_eq!(store.points().len(), 1);
    // The failed message was pinned, so the second run redelivered it.
    assert_eq!(*resumed_from.lock().unwrap(), vec![None, Some(1)]);

    let seen = states.await.unwrap();
    let restarting = seen
        .iter()
        .position(|s| *s == CoordinatorState::Restarting)
        .expect("restart should be observable");
    assert!(seen[restarting..].contains(&CoordinatorState::Running));
    assert_eq!(*state.borrow(), CoordinatorState::Running);

    // The final checkpoint of the second run moved past the written reading.
    let latest = LocalCheckpointStore::open(dir.path(), 3)
        .await
        .unwrap()
        .latest()
        .await
        .unwrap()
        .expect("final checkpoint should exist");
    assert_eq!(latest.id, 2);
    assert_eq!(latest.offsets_for(RAW_TOPIC), HashMap::from([(0, 1)]));
}

#[tokio::test(start_paused = true)]
async fn persistent_failures_exhaust_the_restart_budget() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::failing();
    let sources = ReplaySources::telemetry(vec![record(RAW_TOPIC, 0, Some(READING))]);
    let resumed_from = sources.resumed_from.clone();
    let (supervisor, state) = supervisor(config(dir.path(), &[]), sources, store.clone())
        .await
        .unwrap();

    let result = supervisor.run(CancellationToken::new()).await;

    match result {
        Err(WorkerError::RestartsExhausted { restarts, last }) => {
            assert_eq!(restarts, 2);
            assert!(matches!(last, PipelineError::WriteFailed { .. }));
        }
        other => panic!("expected the restart budget to run out, got {:?}", other),
    }
    assert_eq!(*state.borrow(), CoordinatorState::Failed);
    // Three runs, each attempting the pinned reading three times.
    assert_eq!(store.write_attempts(), 9);
    assert_eq!(*resumed_from.lock().unwrap(), vec![None, Some(1), Some(2)]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_takes_a_final_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());
    let sources = ReplaySources::telemetry(vec![
        record(RAW_TOPIC, 10, Some(READING)),
        record(RAW_TOPIC, 11, Some(READING)),
    ]);
    let (supervisor, state) = supervisor(config(dir.path(), &[]), sources, store.clone())
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(supervisor.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.cancel();
    run.await.unwrap().expect("shutdown should be clean");

    assert_eq!(store.points().len(), 2);
    assert_eq!(*state.borrow(), CoordinatorState::Running);
    let latest = LocalCheckpointStore::open(dir.path(), 3)
        .await
        .unwrap()
        .latest()
        .await
        .unwrap()
        .expect("final checkpoint should exist");
    assert_eq!(latest.id, 1);
    assert_eq!(latest.offsets_for(RAW_TOPIC), HashMap::from([(0, 12)]));
}

#[tokio::test]
async fn invalid_restart_policy_fails_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &[("RESTART_BACKOFF_MULTIPLIER", "-1.5")]);

    let result = supervisor(
        config,
        ReplaySources::default(),
        Arc::new(MemoryStore::default()),
    )
    .await;

    assert!(matches!(result, Err(WorkerError::RestartPolicy(_))));
}
