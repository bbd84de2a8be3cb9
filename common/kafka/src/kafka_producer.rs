use std::time::Duration;

use health::HealthHandle;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::{ClientConfig, ClientContext, Statistics};
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;

const STATISTICS_INTERVAL: Duration = Duration::from_secs(10);
const METADATA_TIMEOUT: Duration = Duration::from_secs(15);

/// Producer context. librdkafka only emits statistics while its poll loop is
/// alive, so each statistics callback doubles as a liveness report.
pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(liveness: HealthHandle) -> Self {
        KafkaContext { liveness }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, stats: Statistics) {
        self.liveness.report_healthy();

        let producer = self.liveness.component().to_owned();
        metrics::gauge!("kafka_producer_queue_depth", "producer" => producer.clone())
            .set(stats.msg_cnt as f64);
        metrics::gauge!("kafka_producer_queue_depth_limit", "producer" => producer)
            .set(stats.msg_max as f64);
    }
}

fn producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set(
            "statistics.interval.ms",
            STATISTICS_INTERVAL.as_millis().to_string(),
        )
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set("message.timeout.ms", config.kafka_message_timeout_ms.to_string())
        .set("compression.codec", &config.kafka_compression_codec)
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );
    config.apply_security(&mut client_config);
    client_config
}

/// Create a producer and check that the brokers answer a metadata request,
/// so that a wrong bootstrap address fails startup instead of the first send.
pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let component = liveness.component().to_owned();
    let client_config = producer_config(config);
    debug!(producer = component, "rdkafka producer configuration: {:?}", client_config);

    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(liveness.into())?;

    let metadata = producer
        .client()
        .fetch_metadata(None, METADATA_TIMEOUT)
        .inspect_err(|e| warn!(producer = component, "kafka brokers unreachable: {}", e))?;
    info!(
        producer = component,
        brokers = metadata.brokers().len(),
        topics = metadata.topics().len(),
        "connected to kafka"
    );

    Ok(producer)
}
