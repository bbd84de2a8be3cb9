use rdkafka::error::KafkaError;
use telemetry_common::executor::ExecutorError;
use telemetry_common::retry::{AttemptError, InvalidRestartPolicy, RetryError};
use telemetry_common::store::StoreError;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Errors of producing to a Kafka topic.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to enqueue record for {topic}: {error}")]
    Enqueue { topic: String, error: KafkaError },
    #[error("broker rejected record for {topic}: {error}")]
    Delivery { topic: String, error: KafkaError },
    #[error("record for {0} was dropped before delivery")]
    Cancelled(String),
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint storage failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint could not be encoded or decoded: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("failed to commit offsets of {source_name}: {error}")]
    Commit {
        source_name: String,
        error: KafkaError,
    },
}

/// Failures that end the current pipeline run. These are what the supervisor
/// receives on the failure channel, and each one costs a restart.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("store write for device {device_id} failed permanently: {error}")]
    WriteFailed {
        device_id: String,
        #[source]
        error: RetryError<StoreError>,
    },
    #[error("purge of device {device_id} failed: {error}")]
    PurgeFailed {
        device_id: String,
        #[source]
        error: AttemptError<StoreError>,
    },
    #[error("dead-letter publish failed: {0}")]
    DeadLetter(#[source] SinkError),
    #[error("checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("executor refused work: {0}")]
    Executor(#[from] ExecutorError),
    #[error("kafka consumer failed: {0}")]
    Consumer(#[from] KafkaError),
    #[error("source task died: {0}")]
    SourceTask(#[from] tokio::task::JoinError),
}

/// The failure channel: background tasks report terminal failures here, and
/// the supervisor restarts the pipelines on the first one it receives.
#[derive(Clone)]
pub struct FailureSender(mpsc::UnboundedSender<PipelineError>);

impl FailureSender {
    pub fn report(&self, failure: PipelineError) {
        error!("pipeline failure: {}", failure);
        if self.0.send(failure).is_err() {
            warn!("failure reported after the pipeline stopped");
        }
    }
}

pub fn failure_channel() -> (FailureSender, mpsc::UnboundedReceiver<PipelineError>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FailureSender(tx), rx)
}

/// Enumeration of errors that stop the worker process.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] envconfig::Error),
    #[error("invalid restart policy: {0}")]
    RestartPolicy(#[from] InvalidRestartPolicy),
    #[error("failed to set up kafka clients: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to set up the time-series store client: {0}")]
    Store(#[from] StoreError),
    #[error("failed to set up checkpoint storage: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("gave up after {restarts} restarts, last failure: {last}")]
    RestartsExhausted {
        restarts: u32,
        #[source]
        last: PipelineError,
    },
}
