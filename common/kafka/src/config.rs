use envconfig::Envconfig;
use rdkafka::ClientConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    pub kafka_hosts: String,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Pass-through security settings, only applied when set.
    pub kafka_security_protocol: Option<String>,
    pub kafka_sasl_mechanism: Option<String>,
    pub kafka_sasl_username: Option<String>,
    pub kafka_sasl_password: Option<String>,
}

impl KafkaConfig {
    /// Apply the TLS and SASL settings shared by producers and consumers.
    pub fn apply_security(&self, client_config: &mut ClientConfig) {
        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        // An explicit protocol wins over the kafka_tls shorthand.
        if let Some(protocol) = &self.kafka_security_protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(mechanism) = &self.kafka_sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &self.kafka_sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(password) = &self.kafka_sasl_password {
            client_config.set("sasl.password", password);
        }
    }
}

/// Settings of one consumption loop. Built by the application from its own
/// config, since topic and group differ per pipeline.
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,
    // earliest, latest
    pub kafka_consumer_offset_reset: String,
}
