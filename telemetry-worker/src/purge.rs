//! The purge pipeline: for every `PURGE` request, delete the whole history of
//! the named device from the store.

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use telemetry_common::event::DeletionRequest;
use telemetry_common::executor::{BoundedExecutor, ExecutorError};
use telemetry_common::retry::AttemptError;
use telemetry_common::sanitize::sanitize_device_id;
use telemetry_common::store::{DeleteRequest, TimeSeriesStore};
use tracing::{debug, error, info, warn};

use crate::config::PurgeRangeEnd;
use crate::error::{FailureSender, PipelineError};
use crate::source::{MessageHandler, SourceRecord};
use crate::tracker::Ack;

pub struct PurgeHandler {
    store: Arc<dyn TimeSeriesStore>,
    measurement: String,
    executor: BoundedExecutor,
    range_end: PurgeRangeEnd,
    failures: FailureSender,
}

impl PurgeHandler {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        measurement: &str,
        executor: BoundedExecutor,
        range_end: PurgeRangeEnd,
        failures: FailureSender,
    ) -> Self {
        Self {
            store,
            measurement: measurement.to_owned(),
            executor,
            range_end,
            failures,
        }
    }
}

fn count_outcome(outcome: &'static str) {
    metrics::counter!("purge_requests_total", "outcome" => outcome).increment(1);
}

impl MessageHandler for PurgeHandler {
    fn handle(&self, record: SourceRecord, ack: Ack) -> Result<(), PipelineError> {
        let request = match record.payload.as_deref().and_then(DeletionRequest::parse) {
            Some(request) => request,
            None => {
                debug!(
                    partition = record.partition,
                    offset = record.offset,
                    "dropping unparseable deletion request"
                );
                count_outcome("malformed");
                ack.complete();
                return Ok(());
            }
        };

        if !request.is_purge() {
            count_outcome("ignored");
            ack.complete();
            return Ok(());
        }

        let device_id = match sanitize_device_id(request.device_id.as_deref()) {
            Ok(device_id) => device_id,
            Err(e) if !e.is_security_violation() => {
                warn!(offset = record.offset, "dropping purge request: {}", e);
                count_outcome("invalid");
                ack.complete();
                return Ok(());
            }
            Err(e) => {
                // Only the bounded preview inside the error is logged.
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    "security violation in purge request, dropped: {}",
                    e
                );
                count_outcome("rejected");
                ack.complete();
                return Ok(());
            }
        };

        let delete = DeleteRequest::for_device(
            &self.measurement,
            &device_id,
            DateTime::<Utc>::from(UNIX_EPOCH),
            self.range_end.resolve(),
        );
        let store = self.store.clone();
        let deleted = self
            .executor
            .submit(async move { store.delete(&delete).await })?;

        let failures = self.failures.clone();
        self.executor.spawn_driver(async move {
            let error = match deleted.await {
                Ok(Ok(())) => {
                    info!(device_id, "purged device history");
                    count_outcome("purged");
                    ack.complete();
                    return;
                }
                Ok(Err(e)) => AttemptError::Operation(e),
                Err(ExecutorError::ShuttingDown) | Err(ExecutorError::Cancelled) => {
                    debug!(device_id, "purge interrupted by shutdown");
                    return;
                }
                Err(e) => AttemptError::Executor(e),
            };
            count_outcome("failed");
            failures.report(PipelineError::PurgeFailed { device_id, error });
        })?;

        Ok(())
    }
}
