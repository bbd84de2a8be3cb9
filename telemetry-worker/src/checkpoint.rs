//! Periodic, durable snapshots of consumption progress.
//!
//! The coordinator collects the committable offsets of every source, writes
//! them to local storage as one record, and only once that record is durable
//! commits the offsets to the consumer group. A crash between the two steps
//! leaves Kafka behind the checkpoint, never ahead of it, so nothing that was
//! not fully processed is ever skipped on restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use health::HealthHandle;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::CheckpointError;
use crate::tracker::PartitionOffset;

pub const CHECKPOINT_NAME_PREFIX: &str = "chkpt_";
const CHECKPOINT_NAME_SUFFIX: &str = ".json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub offsets: Vec<PartitionOffset>,
}

impl Checkpoint {
    /// Next offset to process per partition of `topic`.
    pub fn offsets_for(&self, topic: &str) -> HashMap<i32, i64> {
        self.offsets
            .iter()
            .filter(|o| o.topic == topic)
            .map(|o| (o.partition, o.offset))
            .collect()
    }
}

/// A party whose progress is captured by checkpoints.
pub trait CheckpointParticipant: Send + Sync {
    fn name(&self) -> &str;

    /// Offsets that are safe to resume from right now.
    fn snapshot(&self) -> Vec<PartitionOffset>;

    /// Called once the checkpoint holding `offsets` is durable.
    fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), CheckpointError>;
}

/// Checkpoints as JSON files in one local directory, newest `retained` kept.
pub struct LocalCheckpointStore {
    dir: PathBuf,
    retained: usize,
}

impl LocalCheckpointStore {
    pub async fn open(dir: &Path, retained: usize) -> Result<Self, CheckpointError> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
            retained: retained.max(1),
        })
    }

    fn path_for(&self, id: u64) -> PathBuf {
        // Zero padded so that names sort like ids.
        self.dir.join(format!(
            "{}{:020}{}",
            CHECKPOINT_NAME_PREFIX, id, CHECKPOINT_NAME_SUFFIX
        ))
    }

    /// Ids and paths of all complete checkpoints, oldest first.
    async fn list(&self) -> Result<Vec<(u64, PathBuf)>, CheckpointError> {
        let mut checkpoints = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let id = name
                .to_str()
                .and_then(|n| n.strip_prefix(CHECKPOINT_NAME_PREFIX))
                .and_then(|n| n.strip_suffix(CHECKPOINT_NAME_SUFFIX))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(id) = id {
                checkpoints.push((id, entry.path()));
            }
        }
        checkpoints.sort_by_key(|(id, _)| *id);
        Ok(checkpoints)
    }

    /// The newest checkpoint that can be read. Unreadable ones are skipped.
    pub async fn latest(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        for (id, path) in self.list().await?.into_iter().rev() {
            let read = async {
                let bytes = tokio::fs::read(&path).await?;
                Ok::<Checkpoint, CheckpointError>(serde_json::from_slice(&bytes)?)
            };
            match read.await {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => warn!(id, path = %path.display(), "skipping unreadable checkpoint: {}", e),
            }
        }
        Ok(None)
    }

    /// Write `checkpoint` atomically: to a temporary file first, then renamed
    /// into place. Older checkpoints beyond the retention are deleted.
    pub async fn persist(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        let path = self.path_for(checkpoint.id);
        let tmp_path = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path).await?;

        let checkpoints = self.list().await?;
        let expired = checkpoints.len().saturating_sub(self.retained);
        for (id, old) in checkpoints.into_iter().take(expired) {
            debug!(id, "removing expired checkpoint");
            if let Err(e) = tokio::fs::remove_file(&old).await {
                warn!(id, "failed to remove expired checkpoint: {}", e);
            }
        }

        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    Snapshotting,
    Failed,
    Restarting,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Running => "running",
            CoordinatorState::Snapshotting => "snapshotting",
            CoordinatorState::Failed => "failed",
            CoordinatorState::Restarting => "restarting",
        }
    }

    fn as_gauge(&self) -> f64 {
        match self {
            CoordinatorState::Running => 0.0,
            CoordinatorState::Snapshotting => 1.0,
            CoordinatorState::Failed => 2.0,
            CoordinatorState::Restarting => 3.0,
        }
    }
}

pub struct CheckpointCoordinator {
    store: LocalCheckpointStore,
    interval: Duration,
    state: watch::Sender<CoordinatorState>,
    last: Option<Checkpoint>,
}

impl CheckpointCoordinator {
    pub fn new(store: LocalCheckpointStore, interval: Duration) -> Self {
        let (state, _) = watch::channel(CoordinatorState::Running);
        Self {
            store,
            interval,
            state,
            last: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: CoordinatorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(
                from = previous.as_str(),
                to = state.as_str(),
                "checkpoint coordinator state changed"
            );
        }
        metrics::gauge!("checkpoint_coordinator_state").set(state.as_gauge());
    }

    /// Load the newest durable checkpoint to resume from.
    pub async fn restore(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        let latest = self.store.latest().await?;
        match &latest {
            Some(checkpoint) => info!(
                id = checkpoint.id,
                partitions = checkpoint.offsets.len(),
                "restoring from checkpoint"
            ),
            None => info!("no checkpoint found, starting from committed group offsets"),
        }
        self.last = latest.clone();
        Ok(latest)
    }

    /// Take one checkpoint across `participants`, persist it, then commit.
    pub async fn snapshot(
        &mut self,
        participants: &[Arc<dyn CheckpointParticipant>],
    ) -> Result<Checkpoint, CheckpointError> {
        let start = Instant::now();
        self.set_state(CoordinatorState::Snapshotting);

        let result = self.take_snapshot(participants).await;

        metrics::histogram!("checkpoint_duration_seconds").record(start.elapsed().as_secs_f64());
        match &result {
            Ok(checkpoint) => {
                metrics::counter!("checkpoints_total", "result" => "success").increment(1);
                self.set_state(CoordinatorState::Running);
                debug!(id = checkpoint.id, "checkpoint complete");
            }
            Err(e) => {
                metrics::counter!("checkpoints_total", "result" => "failure").increment(1);
                self.set_state(CoordinatorState::Failed);
                warn!("checkpoint failed: {}", e);
            }
        }
        result
    }

    async fn take_snapshot(
        &mut self,
        participants: &[Arc<dyn CheckpointParticipant>],
    ) -> Result<Checkpoint, CheckpointError> {
        let current: Vec<(usize, Vec<PartitionOffset>)> = participants
            .iter()
            .enumerate()
            .map(|(index, participant)| (index, participant.snapshot()))
            .collect();

        let mut offsets: Vec<PartitionOffset> = current
            .iter()
            .flat_map(|(_, offsets)| offsets.iter().cloned())
            .collect();

        // Partitions we do not own right now keep their last known offsets.
        if let Some(last) = &self.last {
            for previous in &last.offsets {
                let owned = offsets
                    .iter()
                    .any(|o| o.topic == previous.topic && o.partition == previous.partition);
                if !owned {
                    offsets.push(previous.clone());
                }
            }
        }
        offsets.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));

        let checkpoint = Checkpoint {
            id: self.last.as_ref().map_or(1, |last| last.id + 1),
            created_at: Utc::now(),
            offsets,
        };
        self.store.persist(&checkpoint).await?;
        self.last = Some(checkpoint.clone());

        // Committing is only a courtesy to the consumer group: restarts resume
        // from the checkpoint, so a failed commit does not fail the checkpoint.
        for (index, offsets) in current {
            if offsets.is_empty() {
                continue;
            }
            if let Err(e) = participants[index].commit(&offsets) {
                metrics::counter!("checkpoint_commit_failures_total").increment(1);
                warn!(
                    participant = participants[index].name(),
                    "failed to commit offsets: {}", e
                );
            }
        }

        Ok(checkpoint)
    }

    /// Snapshot every `interval` until an error occurs. Never returns `Ok`; the
    /// caller stops it by dropping the future.
    pub async fn run(
        &mut self,
        participants: &[Arc<dyn CheckpointParticipant>],
        liveness: &HealthHandle,
    ) -> Result<(), CheckpointError> {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip first tick to avoid an immediate checkpoint
        interval.tick().await;

        // Report liveness more often than checkpointing, the interval is long.
        let mut heartbeat = tokio::time::interval(Duration::from_secs(10));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.snapshot(participants).await?;
                    liveness.report_healthy();
                }
                _ = heartbeat.tick() => liveness.report_healthy(),
            }
        }
    }
}
