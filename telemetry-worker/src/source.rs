use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use common_kafka::kafka_consumer::create_kafka_consumer;
use futures::future::BoxFuture;
use futures::FutureExt;
use health::HealthHandle;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::message::BorrowedMessage;
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointParticipant};
use crate::error::{CheckpointError, PipelineError};
use crate::tracker::{Ack, OffsetTracker, PartitionOffset};

/// One consumed message, detached from the consumer.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

impl From<&BorrowedMessage<'_>> for SourceRecord {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        SourceRecord {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec),
        }
    }
}

/// Per-pipeline processing of consumed messages.
///
/// Handlers must not block: they dispatch the message's work and return. The
/// `Ack` is completed once that work reached a terminal success, and is
/// dropped uncompleted on a terminal failure.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, record: SourceRecord, ack: Ack) -> Result<(), PipelineError>;
}

impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    fn handle(&self, record: SourceRecord, ack: Ack) -> Result<(), PipelineError> {
        (**self).handle(record, ack)
    }
}

/// What one pipeline run needs to build its consumption loop.
pub struct SourceOptions<'a> {
    pub name: &'static str,
    pub consumer: ConsumerConfig,
    pub max_in_flight: usize,
    /// Checkpoint the run resumes from.
    pub checkpoint: Option<&'a Checkpoint>,
    pub liveness: HealthHandle,
}

/// A consumption loop, run at most once.
pub trait PipelineSource: Send {
    /// Commits the progress of this loop when checkpoints are taken.
    fn participant(&self) -> Arc<dyn CheckpointParticipant>;

    /// Consume until `shutdown` fires or the handler fails.
    fn run(
        self: Box<Self>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, Result<(), PipelineError>>;
}

/// Builds fresh consumption loops for every pipeline run.
pub trait SourceFactory: Send + Sync {
    fn create(
        &self,
        options: SourceOptions<'_>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn PipelineSource>, PipelineError>;
}

/// Sources consuming from the configured Kafka cluster.
pub struct KafkaSources {
    kafka: KafkaConfig,
}

impl KafkaSources {
    pub fn new(kafka: KafkaConfig) -> Self {
        Self { kafka }
    }
}

impl SourceFactory for KafkaSources {
    fn create(
        &self,
        options: SourceOptions<'_>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn PipelineSource>, PipelineError> {
        let source = KafkaSource::new(
            options.name,
            &self.kafka,
            &options.consumer,
            options.max_in_flight,
            options.checkpoint,
            handler,
            options.liveness,
        )?;
        Ok(Box::new(source))
    }
}

/// Consumer context dropping the offset bookkeeping of revoked partitions.
pub struct SourceContext {
    tracker: Arc<OffsetTracker>,
}

impl ClientContext for SourceContext {}

impl ConsumerContext for SourceContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                let revoked: Vec<i32> = partitions
                    .elements()
                    .iter()
                    .filter(|e| e.topic() == self.tracker.topic())
                    .map(|e| e.partition())
                    .collect();
                info!(topic = self.tracker.topic(), ?revoked, "partitions revoked");
                self.tracker.revoke(&revoked);
            }
            Rebalance::Assign(partitions) => {
                info!(
                    topic = self.tracker.topic(),
                    count = partitions.count(),
                    "partitions assigned"
                );
            }
            Rebalance::Error(e) => {
                error!("rebalance error: {}", e);
            }
        }
    }
}

/// Tracks consumed records and hands them to the handler, acknowledging
/// directly what a restored checkpoint says was already processed.
pub struct Dispatcher<H> {
    tracker: Arc<OffsetTracker>,
    /// Per partition, the first offset not covered by the restored checkpoint.
    restored: HashMap<i32, i64>,
    handler: H,
}

impl<H: MessageHandler> Dispatcher<H> {
    pub fn new(tracker: Arc<OffsetTracker>, checkpoint: Option<&Checkpoint>, handler: H) -> Self {
        let restored = checkpoint
            .map(|c| c.offsets_for(tracker.topic()))
            .unwrap_or_default();
        Self {
            tracker,
            restored,
            handler,
        }
    }

    /// Returns `false` once the tracker refuses new work.
    pub async fn dispatch(&self, record: SourceRecord) -> Result<bool, PipelineError> {
        let Some(ack) = self.tracker.track(record.partition, record.offset).await else {
            return Ok(false);
        };

        if let Some(resume_at) = self.restored.get(&record.partition) {
            if record.offset < *resume_at {
                debug!(
                    partition = record.partition,
                    offset = record.offset,
                    "skipping message covered by checkpoint"
                );
                ack.complete();
                return Ok(true);
            }
        }

        self.handler.handle(record, ack)?;
        Ok(true)
    }
}

/// Commits checkpointed offsets of one consumer to its group.
pub struct SourceOffsets {
    name: &'static str,
    tracker: Arc<OffsetTracker>,
    consumer: Arc<StreamConsumer<SourceContext>>,
}

impl CheckpointParticipant for SourceOffsets {
    fn name(&self) -> &str {
        self.name
    }

    fn snapshot(&self) -> Vec<PartitionOffset> {
        self.tracker.committable()
    }

    fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), CheckpointError> {
        let commit_error = |error| CheckpointError::Commit {
            source_name: self.name.to_owned(),
            error,
        };

        let mut list = TopicPartitionList::new();
        for o in offsets.iter().filter(|o| o.topic == self.tracker.topic()) {
            list.add_partition_offset(&o.topic, o.partition, Offset::Offset(o.offset))
                .map_err(commit_error)?;
        }
        if list.count() == 0 {
            return Ok(());
        }

        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(commit_error)
    }
}

/// A consumption loop over one topic.
pub struct KafkaSource<H> {
    name: &'static str,
    consumer: Arc<StreamConsumer<SourceContext>>,
    tracker: Arc<OffsetTracker>,
    dispatcher: Dispatcher<H>,
    liveness: HealthHandle,
}

impl<H: MessageHandler> KafkaSource<H> {
    pub fn new(
        name: &'static str,
        kafka: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        max_in_flight: usize,
        checkpoint: Option<&Checkpoint>,
        handler: H,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let tracker = OffsetTracker::new(
            name,
            &consumer_config.kafka_consumer_topic,
            max_in_flight,
        );
        let context = SourceContext {
            tracker: tracker.clone(),
        };
        let consumer = Arc::new(create_kafka_consumer(kafka, consumer_config, context)?);

        Ok(Self {
            name,
            consumer,
            dispatcher: Dispatcher::new(tracker.clone(), checkpoint, handler),
            tracker,
            liveness,
        })
    }

    async fn consume(self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        let mut heartbeat = tokio::time::interval(Duration::from_secs(10));

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                _ = heartbeat.tick() => self.liveness.report_healthy(),

                message = self.consumer.recv() => {
                    let record = match message {
                        Ok(message) => SourceRecord::from(&message),
                        Err(e) => {
                            metrics::counter!("kafka_consumer_errors_total", "source" => self.name).increment(1);
                            warn!(source = self.name, "error receiving message: {}", e);
                            continue;
                        }
                    };

                    // Waiting on the watermark must not hold up shutdown.
                    let dispatched = tokio::select! {
                        dispatched = self.dispatcher.dispatch(record) => dispatched?,
                        _ = shutdown.cancelled() => break,
                    };
                    if !dispatched {
                        break;
                    }
                }
            }
        }

        self.tracker.close();
        info!(source = self.name, in_flight = self.tracker.in_flight(), "source stopped");
        Ok(())
    }
}

impl<H: MessageHandler> PipelineSource for KafkaSource<H> {
    fn participant(&self) -> Arc<dyn CheckpointParticipant> {
        Arc::new(SourceOffsets {
            name: self.name,
            tracker: self.tracker.clone(),
            consumer: self.consumer.clone(),
        })
    }

    fn run(
        self: Box<Self>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, Result<(), PipelineError>> {
        (*self).consume(shutdown).boxed()
    }
}
