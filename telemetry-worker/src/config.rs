use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use chrono::{DateTime, Utc};
use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;
use telemetry_common::retry::{InvalidRestartPolicy, RestartPolicy, RetryPolicy};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub topics: TopicConfig,

    #[envconfig(nested = true)]
    pub influx: InfluxConfig,

    #[envconfig(nested = true)]
    pub checkpoint: CheckpointConfig,

    #[envconfig(nested = true)]
    pub restart: RestartConfig,

    #[envconfig(nested = true)]
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn telemetry_consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            kafka_consumer_group: self.topics.kafka_group_id_telemetry.clone(),
            kafka_consumer_topic: self.topics.kafka_topic_raw.0.clone(),
            kafka_consumer_offset_reset: self.topics.kafka_consumer_offset_reset.clone(),
        }
    }

    pub fn deletions_consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            kafka_consumer_group: self.topics.kafka_group_id_deletions.clone(),
            kafka_consumer_topic: self.topics.kafka_topic_deletions.0.clone(),
            kafka_consumer_offset_reset: self.topics.kafka_consumer_offset_reset.clone(),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct TopicConfig {
    pub kafka_topic_raw: NonEmptyString,

    pub kafka_topic_processed: NonEmptyString,

    pub kafka_topic_deletions: NonEmptyString,

    #[envconfig(default = "iot-telemetry-dlq")]
    pub kafka_topic_dlq: NonEmptyString,

    #[envconfig(default = "telemetry-ingest-group")]
    pub kafka_group_id_telemetry: String,

    #[envconfig(default = "telemetry-purge-group")]
    pub kafka_group_id_deletions: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest
}

#[derive(Envconfig, Clone)]
pub struct InfluxConfig {
    pub influx_url: NonEmptyString,

    pub influx_token: NonEmptyString,

    pub influx_org: NonEmptyString,

    pub influx_bucket: NonEmptyString,

    #[envconfig(default = "telemetry")]
    pub influx_measurement: NonEmptyString,
}

#[derive(Envconfig, Clone)]
pub struct CheckpointConfig {
    #[envconfig(default = "/tmp/telemetry-checkpoints")]
    pub checkpoint_dir: PathBuf,

    #[envconfig(default = "60000")]
    pub checkpoint_interval: EnvMsDuration,

    #[envconfig(default = "3")]
    pub checkpoint_retained: usize,
}

#[derive(Envconfig, Clone)]
pub struct RestartConfig {
    #[envconfig(default = "2000")]
    pub restart_initial_backoff: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub restart_max_backoff: EnvMsDuration,

    #[envconfig(default = "1.5")]
    pub restart_backoff_multiplier: f64,

    #[envconfig(default = "0.1")]
    pub restart_jitter_factor: f64,

    #[envconfig(default = "600000")]
    pub restart_max_elapsed: EnvMsDuration,
}

impl RestartConfig {
    pub fn policy(&self) -> Result<RestartPolicy, InvalidRestartPolicy> {
        let policy = RestartPolicy {
            initial_backoff: self.restart_initial_backoff.0,
            max_backoff: self.restart_max_backoff.0,
            multiplier: self.restart_backoff_multiplier,
            jitter: self.restart_jitter_factor,
            max_elapsed: self.restart_max_elapsed.0,
        };
        policy.validate()?;
        Ok(policy)
    }
}

#[derive(Envconfig, Clone)]
pub struct PipelineConfig {
    #[envconfig(default = "20")]
    pub write_max_concurrency: usize,

    #[envconfig(default = "5000")]
    pub write_timeout: EnvMsDuration,

    #[envconfig(default = "3")]
    pub write_max_attempts: u32,

    #[envconfig(default = "200")]
    pub write_backoff_base: EnvMsDuration,

    #[envconfig(default = "5")]
    pub delete_max_concurrency: usize,

    #[envconfig(default = "10000")]
    pub delete_timeout: EnvMsDuration,

    #[envconfig(default = "now")]
    pub purge_range_end: PurgeRangeEnd,

    #[envconfig(default = "1000")]
    pub max_in_flight_messages: usize,

    #[envconfig(default = "30000")]
    pub shutdown_grace_period: EnvMsDuration,
}

impl PipelineConfig {
    pub fn write_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.write_max_attempts, self.write_backoff_base.0, None)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Upper bound of the time range a purge deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeRangeEnd {
    /// The time the delete is issued.
    Now,
    Fixed(DateTime<Utc>),
}

impl PurgeRangeEnd {
    pub fn resolve(&self) -> DateTime<Utc> {
        match self {
            PurgeRangeEnd::Now => Utc::now(),
            PurgeRangeEnd::Fixed(end) => *end,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsePurgeRangeEndError;

impl FromStr for PurgeRangeEnd {
    type Err = ParsePurgeRangeEndError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("now") {
            return Ok(PurgeRangeEnd::Now);
        }

        DateTime::parse_from_rfc3339(s)
            .map(|end| PurgeRangeEnd::Fixed(end.with_timezone(&Utc)))
            .map_err(|_| ParsePurgeRangeEndError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn required() -> HashMap<String, String> {
        [
            ("KAFKA_HOSTS", "kafka:9092"),
            ("KAFKA_TOPIC_RAW", "iot-telemetry-raw"),
            ("KAFKA_TOPIC_PROCESSED", "iot-telemetry-processed"),
            ("KAFKA_TOPIC_DELETIONS", "device-deletions"),
            ("INFLUX_URL", "http://influxdb:8086"),
            ("INFLUX_TOKEN", "token"),
            ("INFLUX_ORG", "acme"),
            ("INFLUX_BUCKET", "thermostats"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn defaults_apply_when_only_required_keys_are_set() {
        let config = Config::init_from_hashmap(&required()).expect("config should load");

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert_eq!(config.topics.kafka_topic_dlq.as_str(), "iot-telemetry-dlq");
        assert_eq!(config.influx.influx_measurement.as_str(), "telemetry");
        assert_eq!(
            config.checkpoint.checkpoint_interval.0,
            time::Duration::from_secs(60)
        );
        assert_eq!(config.checkpoint.checkpoint_retained, 3);
        assert_eq!(config.pipeline.write_max_concurrency, 20);
        assert_eq!(config.pipeline.write_max_attempts, 3);
        assert_eq!(config.pipeline.delete_max_concurrency, 5);
        assert_eq!(config.pipeline.purge_range_end, PurgeRangeEnd::Now);

        let restart = config.restart.policy().expect("default restart policy is valid");
        assert_eq!(restart.initial_backoff, time::Duration::from_secs(2));
        assert_eq!(restart.max_backoff, time::Duration::from_secs(60));
        assert_eq!(restart.multiplier, 1.5);
        assert_eq!(restart.max_elapsed, time::Duration::from_secs(600));

        let telemetry = config.telemetry_consumer();
        assert_eq!(telemetry.kafka_consumer_topic, "iot-telemetry-raw");
        assert_eq!(telemetry.kafka_consumer_group, "telemetry-ingest-group");
        assert_eq!(telemetry.kafka_consumer_offset_reset, "earliest");
    }

    #[test]
    fn missing_or_empty_required_keys_fail() {
        let mut env = required();
        env.remove("INFLUX_TOKEN");
        assert!(Config::init_from_hashmap(&env).is_err());

        let mut env = required();
        env.insert("KAFKA_TOPIC_RAW".to_string(), String::new());
        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn invalid_restart_settings_are_rejected() {
        let load = |key: &str, value: &str| {
            let mut env = required();
            env.insert(key.to_string(), value.to_string());
            Config::init_from_hashmap(&env)
                .expect("config should load")
                .restart
                .policy()
        };

        assert_eq!(
            load("RESTART_BACKOFF_MULTIPLIER", "-1.5").unwrap_err(),
            InvalidRestartPolicy::Multiplier(-1.5)
        );
        assert_eq!(
            load("RESTART_JITTER_FACTOR", "2").unwrap_err(),
            InvalidRestartPolicy::Jitter(2.0)
        );
        assert_eq!(
            load("RESTART_INITIAL_BACKOFF", "0").unwrap_err(),
            InvalidRestartPolicy::ZeroDuration("initial backoff")
        );
        assert!(load("RESTART_BACKOFF_MULTIPLIER", "2.0").is_ok());
    }

    #[test]
    fn purge_range_end_parsing() {
        assert_eq!("now".parse(), Ok(PurgeRangeEnd::Now));
        assert_eq!("NOW".parse(), Ok(PurgeRangeEnd::Now));
        assert_eq!(
            "2099-12-31T23:59:59Z".parse(),
            Ok(PurgeRangeEnd::Fixed(
                Utc.with_ymd_and_hms(2099, 12, 31, 23, 59, 59).unwrap()
            ))
        );
        assert_eq!(
            "tomorrow".parse::<PurgeRangeEnd>(),
            Err(ParsePurgeRangeEndError)
        );
    }
}
