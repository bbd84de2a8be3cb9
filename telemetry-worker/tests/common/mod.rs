//! In-memory stand-ins for the store and Kafka sinks, shared by the pipeline tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use telemetry_common::executor::BoundedExecutor;
use telemetry_common::store::{DeleteRequest, Point, StoreError, TimeSeriesStore};
use telemetry_worker::error::SinkError;
use telemetry_worker::sink::{DeliveryAck, RecordSink};
use telemetry_worker::source::SourceRecord;

#[derive(Default)]
pub struct MemoryStore {
    pub points: Mutex<Vec<Point>>,
    pub deletes: Mutex<Vec<DeleteRequest>>,
    pub write_attempts: AtomicU32,
    /// Writes still to fail before the store recovers.
    pub write_failures: AtomicU32,
}

#[allow(dead_code)] // Not every test file exercises failures
impl MemoryStore {
    pub fn failing() -> Arc<Self> {
        Self::failing_times(u32::MAX)
    }

    pub fn failing_times(writes: u32) -> Arc<Self> {
        Arc::new(Self {
            write_failures: AtomicU32::new(writes),
            ..Default::default()
        })
    }

    pub fn points(&self) -> Vec<Point> {
        self.points.lock().unwrap().clone()
    }

    pub fn write_attempts(&self) -> u32 {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn write(&self, point: &Point) -> Result<(), StoreError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::ResponseError {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                body: "unavailable".to_string(),
            });
        }
        self.points.lock().unwrap().push(point.clone());
        Ok(())
    }

    async fn delete(&self, request: &DeleteRequest) -> Result<(), StoreError> {
        self.deletes.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// Keeps every enqueued record, delivering them all immediately.
#[allow(dead_code)] // Used by ingest_pipeline, not purge_pipeline
#[derive(Default)]
pub struct MemorySink {
    pub records: Mutex<Vec<(Option<String>, Vec<u8>)>>,
}

#[allow(dead_code)]
impl MemorySink {
    pub fn records(&self) -> Vec<(Option<String>, Vec<u8>)> {
        self.records.lock().unwrap().clone()
    }
}

impl RecordSink for MemorySink {
    fn topic(&self) -> &str {
        "memory"
    }

    fn enqueue(&self, key: Option<&str>, payload: &[u8]) -> Result<DeliveryAck, SinkError> {
        self.records
            .lock()
            .unwrap()
            .push((key.map(str::to_owned), payload.to_vec()));
        Ok(async { Ok(()) }.boxed())
    }
}

pub fn record(topic: &str, offset: i64, payload: Option<&str>) -> SourceRecord {
    SourceRecord {
        topic: topic.to_string(),
        partition: 0,
        offset,
        payload: payload.map(|p| p.as_bytes().to_vec()),
    }
}

/// Wait for everything the handler dispatched to finish. Shutting the executor
/// down instead would interrupt drivers that did not submit their first
/// attempt yet.
pub async fn drain(executor: &BoundedExecutor) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while executor.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("dispatched work should finish");
}
