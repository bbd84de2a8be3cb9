use std::sync::Arc;
use std::time::Duration;

use common_kafka::kafka_producer::KafkaContext;
use futures::future::BoxFuture;
use futures::FutureExt;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use telemetry_common::event::TelemetryEvent;
use tracing::{debug, error};

use crate::error::SinkError;

/// Resolves once the broker acknowledged, or finally rejected, a record.
pub type DeliveryAck = BoxFuture<'static, Result<(), SinkError>>;

/// Outbound seam for Kafka topics.
///
/// `enqueue` is synchronous: once it returns, the record holds its place in
/// the producer queue, so records for one key keep the order they were
/// enqueued in.
pub trait RecordSink: Send + Sync {
    fn topic(&self) -> &str;

    fn enqueue(&self, key: Option<&str>, payload: &[u8]) -> Result<DeliveryAck, SinkError>;
}

pub struct KafkaRecordSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaRecordSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: &str) -> Self {
        Self {
            producer,
            topic: topic.to_owned(),
        }
    }

    /// Wait for queued records to be delivered, used once at shutdown.
    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer.flush(Timeout::After(timeout))
    }
}

impl RecordSink for KafkaRecordSink {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn enqueue(&self, key: Option<&str>, payload: &[u8]) -> Result<DeliveryAck, SinkError> {
        let record = FutureRecord::<str, [u8]> {
            topic: self.topic.as_str(),
            payload: Some(payload),
            partition: None,
            key,
            timestamp: None,
            headers: None,
        };

        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((error, _)) => {
                return Err(SinkError::Enqueue {
                    topic: self.topic.clone(),
                    error,
                })
            }
        };

        let topic = self.topic.clone();
        Ok(async move {
            match delivery.await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err((error, _))) => Err(SinkError::Delivery { topic, error }),
                // Cancelled due to timeout while retrying
                Err(_) => Err(SinkError::Cancelled(topic)),
            }
        }
        .boxed())
    }
}

/// Quarantine for raw payloads that failed validation. Payloads are forwarded
/// unmodified and without a key. Losing one is never acceptable, so every
/// error surfaces to the caller.
#[derive(Clone)]
pub struct DeadLetterSink {
    sink: Arc<dyn RecordSink>,
}

impl DeadLetterSink {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink }
    }

    pub fn quarantine(&self, payload: &[u8]) -> Result<DeliveryAck, SinkError> {
        let delivery = self.sink.enqueue(None, payload)?;
        Ok(async move {
            delivery.await?;
            metrics::counter!("dead_letter_published").increment(1);
            Ok(())
        }
        .boxed())
    }
}

/// Republishes validated readings keyed by device id, so that one device's
/// readings share a partition of the processed topic. Republishing is best
/// effort: every failure is logged, counted and dropped.
#[derive(Clone)]
pub struct KeyedRepublisher {
    sink: Arc<dyn RecordSink>,
}

impl KeyedRepublisher {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink }
    }

    /// Returns a future tracking delivery, or `None` if the event was dropped.
    pub fn republish(&self, event: &TelemetryEvent) -> Option<BoxFuture<'static, ()>> {
        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(device_id = event.device_id, "failed to serialize event for republish: {}", e);
                report_dropped("serialization");
                return None;
            }
        };

        let delivery = match self.sink.enqueue(Some(&event.device_id), &payload) {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(device_id = event.device_id, "failed to republish event: {}", e);
                report_dropped("enqueue");
                return None;
            }
        };

        let device_id = event.device_id.clone();
        Some(
            async move {
                match delivery.await {
                    Ok(()) => {
                        metrics::counter!("telemetry_republished").increment(1);
                        debug!(device_id, "republished event");
                    }
                    Err(e) => {
                        error!(device_id, "republished event was not delivered: {}", e);
                        report_dropped("delivery");
                    }
                }
            }
            .boxed(),
        )
    }
}

fn report_dropped(cause: &'static str) {
    metrics::counter!("telemetry_republish_dropped", "cause" => cause).increment(1);
}
