//! The telemetry ingest pipeline: validate each raw reading, quarantine what
//! is invalid, and for valid readings write a point to the store and
//! republish the reading keyed by device.

use std::sync::Arc;
use std::time::Instant;

use telemetry_common::event::{validate, Validation};
use telemetry_common::executor::BoundedExecutor;
use telemetry_common::retry::{RetryError, RetryPolicy};
use telemetry_common::store::{Point, TimeSeriesStore};
use tracing::{debug, warn};

use crate::error::{FailureSender, PipelineError};
use crate::sink::{DeadLetterSink, KeyedRepublisher};
use crate::source::{MessageHandler, SourceRecord};
use crate::tracker::Ack;

pub struct IngestHandler {
    store: Arc<dyn TimeSeriesStore>,
    measurement: String,
    executor: BoundedExecutor,
    retry_policy: RetryPolicy,
    republisher: KeyedRepublisher,
    dead_letter: DeadLetterSink,
    failures: FailureSender,
}

impl IngestHandler {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        measurement: &str,
        executor: BoundedExecutor,
        retry_policy: RetryPolicy,
        republisher: KeyedRepublisher,
        dead_letter: DeadLetterSink,
        failures: FailureSender,
    ) -> Self {
        Self {
            store,
            measurement: measurement.to_owned(),
            executor,
            retry_policy,
            republisher,
            dead_letter,
            failures,
        }
    }

    fn quarantine(&self, payload: Vec<u8>, ack: Ack) -> Result<(), PipelineError> {
        let delivery = self
            .dead_letter
            .quarantine(&payload)
            .map_err(PipelineError::DeadLetter)?;

        let failures = self.failures.clone();
        self.executor.spawn_driver(async move {
            match delivery.await {
                Ok(()) => ack.complete(),
                Err(e) => failures.report(PipelineError::DeadLetter(e)),
            }
        })?;
        Ok(())
    }
}

impl MessageHandler for IngestHandler {
    fn handle(&self, record: SourceRecord, ack: Ack) -> Result<(), PipelineError> {
        // A tombstone is as invalid as any other payload.
        let payload = record.payload.unwrap_or_default();

        let event = match validate(&payload) {
            Validation::Valid(event) => event,
            Validation::DeadLetter { payload, reason } => {
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    reason = reason.as_str(),
                    "invalid telemetry, forwarding to dead-letter topic: {}",
                    reason
                );
                return self.quarantine(payload, ack);
            }
        };

        // Enqueued before anything else, so that the processed topic sees each
        // device's readings in arrival order.
        let republished = self.republisher.republish(&event);

        let point = Arc::new(Point::from_event(&self.measurement, &event));
        let device_id = event.device_id;
        let store = self.store.clone();
        let executor = self.executor.clone();
        let retry_policy = self.retry_policy;
        let failures = self.failures.clone();

        self.executor.spawn_driver(async move {
            let start = Instant::now();
            let mut attempt = 0;
            let written = retry_policy
                .run(&executor, || {
                    attempt += 1;
                    if attempt > 1 {
                        metrics::counter!("influx_write_retries").increment(1);
                    }
                    let store = store.clone();
                    let point = point.clone();
                    async move { store.write(&point).await }
                })
                .await;
            metrics::histogram!("influx_write_duration_seconds")
                .record(start.elapsed().as_secs_f64());

            if let Some(republished) = republished {
                republished.await;
            }

            match written {
                Ok(()) => {
                    metrics::counter!("influx_writes_success").increment(1);
                    ack.complete();
                }
                Err(RetryError::Interrupted { attempts }) => {
                    // Left uncompleted, the message is redelivered after restart.
                    debug!(device_id, attempts, "store write interrupted by shutdown");
                }
                Err(error) => {
                    metrics::counter!("influx_writes_failed").increment(1);
                    failures.report(PipelineError::WriteFailed { device_id, error });
                }
            }
        })?;

        Ok(())
    }
}
