use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::ClientConfig;
use tracing::{debug, info};

use crate::config::{ConsumerConfig, KafkaConfig};

/// Build a subscribed consumer whose offsets are only ever committed explicitly.
///
/// Both auto commit and auto offset storing are disabled: the caller decides
/// when an offset is safe to commit, which is what makes consumption
/// at-least-once.
pub fn create_kafka_consumer<C>(
    common_config: &KafkaConfig,
    consumer_config: &ConsumerConfig,
    context: C,
) -> Result<StreamConsumer<C>, KafkaError>
where
    C: ConsumerContext + 'static,
{
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &common_config.kafka_hosts)
        .set("group.id", &consumer_config.kafka_consumer_group)
        .set(
            "auto.offset.reset",
            &consumer_config.kafka_consumer_offset_reset,
        )
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false");

    common_config.apply_security(&mut client_config);

    debug!("rdkafka consumer configuration: {:?}", client_config);
    let consumer: StreamConsumer<C> = client_config.create_with_context(context)?;
    consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

    info!(
        topic = consumer_config.kafka_consumer_topic,
        group = consumer_config.kafka_consumer_group,
        "subscribed Kafka consumer"
    );

    Ok(consumer)
}
