//! Per-partition bookkeeping of which consumed offsets are still in flight.
//!
//! A message is in flight from the moment the source loop reads it until all
//! of its downstream work reached a terminal success. The committable offset of
//! a partition is the lowest offset still in flight, or one past the highest
//! offset seen once nothing is in flight, so a commit never skips past work
//! that could still be lost. Messages whose work failed terminally are never
//! completed: they pin the partition's offset until the pipeline restarts.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// The next offset to read for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

struct PartitionState {
    generation: u64,
    in_flight: BTreeSet<i64>,
    /// One past the highest offset seen.
    next: i64,
}

#[derive(Default)]
struct TrackerState {
    partitions: HashMap<i32, PartitionState>,
    next_generation: u64,
    in_flight: usize,
}

pub struct OffsetTracker {
    source: &'static str,
    topic: String,
    state: Mutex<TrackerState>,
    /// Bounds the number of in-flight messages. Once exhausted the source loop
    /// stops reading until some work completes.
    watermark: Arc<Semaphore>,
}

impl OffsetTracker {
    pub fn new(source: &'static str, topic: &str, max_in_flight: usize) -> Arc<Self> {
        Arc::new(Self {
            source,
            topic: topic.to_owned(),
            state: Mutex::new(TrackerState::default()),
            watermark: Arc::new(Semaphore::new(max_in_flight.max(1))),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Start tracking a message, waiting while the watermark is reached.
    /// Returns `None` once the tracker is closed.
    pub async fn track(self: &Arc<Self>, partition: i32, offset: i64) -> Option<Ack> {
        let permit = self.watermark.clone().acquire_owned().await.ok()?;

        let mut guard = self.lock();
        let state = &mut *guard;
        let partition_state = state.partitions.entry(partition).or_insert_with(|| {
            state.next_generation += 1;
            PartitionState {
                generation: state.next_generation,
                in_flight: BTreeSet::new(),
                next: offset,
            }
        });

        let generation = partition_state.generation;
        if partition_state.in_flight.insert(offset) {
            state.in_flight += 1;
        }
        partition_state.next = partition_state.next.max(offset + 1);
        self.report_in_flight(state.in_flight);

        Some(Ack {
            tracker: self.clone(),
            partition,
            offset,
            generation,
            _permit: permit,
        })
    }

    fn complete(&self, partition: i32, offset: i64, generation: u64) {
        let mut state = self.lock();
        let removed = match state.partitions.get_mut(&partition) {
            Some(partition_state) if partition_state.generation == generation => {
                partition_state.in_flight.remove(&offset)
            }
            // The partition was revoked since; its new owner will redo the work.
            _ => false,
        };
        if removed {
            state.in_flight -= 1;
        }
        self.report_in_flight(state.in_flight);
    }

    /// Committable offsets of every partition currently owned.
    pub fn committable(&self) -> Vec<PartitionOffset> {
        let state = self.lock();
        let mut offsets: Vec<PartitionOffset> = state
            .partitions
            .iter()
            .map(|(partition, partition_state)| PartitionOffset {
                topic: self.topic.clone(),
                partition: *partition,
                offset: partition_state
                    .in_flight
                    .first()
                    .copied()
                    .unwrap_or(partition_state.next),
            })
            .collect();
        offsets.sort_by_key(|o| o.partition);
        offsets
    }

    /// Forget revoked partitions. Acks of their outstanding messages become no-ops.
    pub fn revoke(&self, partitions: &[i32]) {
        let mut state = self.lock();
        for partition in partitions {
            if let Some(removed) = state.partitions.remove(partition) {
                debug!(
                    source = self.source,
                    partition,
                    abandoned = removed.in_flight.len(),
                    "partition revoked"
                );
                state.in_flight -= removed.in_flight.len();
            }
        }
        self.report_in_flight(state.in_flight);
    }

    /// Wake up and refuse every pending and future `track` call.
    pub fn close(&self) {
        self.watermark.close();
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        // The state stays consistent even if a holder panicked, every update is
        // a single insert or remove.
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!(source = self.source, "offset tracker lock was poisoned");
            poisoned.into_inner()
        })
    }

    fn report_in_flight(&self, in_flight: usize) {
        metrics::gauge!("offset_tracker_in_flight", "source" => self.source).set(in_flight as f64);
    }
}

/// Completion token of one tracked message. Completing it releases the
/// message's offset; dropping it without completing keeps the offset pinned.
pub struct Ack {
    tracker: Arc<OffsetTracker>,
    partition: i32,
    offset: i64,
    generation: u64,
    _permit: OwnedSemaphorePermit,
}

impl Ack {
    pub fn complete(self) {
        self.tracker
            .complete(self.partition, self.offset, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn offsets(tracker: &OffsetTracker) -> Vec<(i32, i64)> {
        tracker
            .committable()
            .into_iter()
            .map(|o| (o.partition, o.offset))
            .collect()
    }

    #[tokio::test]
    async fn committable_offset_is_lowest_in_flight() {
        let tracker = OffsetTracker::new("test", "raw", 10);
        let a = tracker.track(0, 5).await.unwrap();
        let b = tracker.track(0, 6).await.unwrap();
        let c = tracker.track(0, 7).await.unwrap();

        assert_eq!(offsets(&tracker), vec![(0, 5)]);

        // Out of order completion does not move the offset past 5.
        c.complete();
        b.complete();
        assert_eq!(offsets(&tracker), vec![(0, 5)]);

        a.complete();
        assert_eq!(offsets(&tracker), vec![(0, 8)]);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn failed_messages_pin_the_offset() {
        let tracker = OffsetTracker::new("test", "raw", 10);
        let failed = tracker.track(1, 10).await.unwrap();
        let ok = tracker.track(1, 11).await.unwrap();
        let other = tracker.track(2, 3).await.unwrap();

        drop(failed);
        ok.complete();
        other.complete();

        assert_eq!(offsets(&tracker), vec![(1, 10), (2, 4)]);
    }

    #[tokio::test]
    async fn revoked_partitions_are_forgotten() {
        let tracker = OffsetTracker::new("test", "raw", 10);
        let stale = tracker.track(0, 1).await.unwrap();
        tracker.track(1, 1).await.unwrap().complete();

        tracker.revoke(&[0]);
        assert_eq!(offsets(&tracker), vec![(1, 2)]);

        // Reassigned and redelivered: the stale ack must not release the new one.
        let fresh = tracker.track(0, 1).await.unwrap();
        stale.complete();
        assert_eq!(offsets(&tracker), vec![(0, 1), (1, 2)]);

        fresh.complete();
        assert_eq!(offsets(&tracker), vec![(0, 2), (1, 2)]);
    }

    #[tokio::test]
    async fn watermark_bounds_in_flight_messages() {
        let tracker = OffsetTracker::new("test", "raw", 2);
        let first = tracker.track(0, 0).await.unwrap();
        let _second = tracker.track(0, 1).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), tracker.track(0, 2)).await;
        assert!(blocked.is_err(), "third message should wait for a slot");

        first.complete();
        let third = tokio::time::timeout(Duration::from_millis(50), tracker.track(0, 2)).await;
        assert!(matches!(third, Ok(Some(_))));
    }

    #[tokio::test]
    async fn close_releases_waiting_sources() {
        let tracker = OffsetTracker::new("test", "raw", 1);
        let _held = tracker.track(0, 0).await.unwrap();

        let waiting = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.track(0, 1).await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.close();

        assert!(waiting.await.unwrap());
    }
}
