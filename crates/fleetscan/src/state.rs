// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared run state.
//!
//! [`FleetState`] maps every partition to its entry. Each entry sits behind
//! its own mutex so partition tasks never contend with each other; there is
//! no lock over the whole fleet.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{FailureReason, Result};
use crate::partition::{PartitionId, PartitionStatus, WorkPartition};

/// Lifecycle of a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Create call succeeded, not observed yet
    Requested,
    /// Provider reports the instance is still starting
    Booting,
    /// Provider reports the instance is up
    Running,
    /// Worker finished successfully
    Completed,
    /// Worker or instance failed
    Failed,
    /// Instance has been deleted
    Terminated,
}

impl LifecycleState {
    /// Whether the instance can still make progress on its partition.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Requested | Self::Booting | Self::Running)
    }
}

/// One remote instance working on a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Deterministic instance name
    pub name: String,
    /// Partition the instance works on
    pub partition_id: PartitionId,
    /// Zone
    pub zone: String,
    /// Machine type
    pub machine_type: String,
    /// Current lifecycle state
    pub lifecycle_state: LifecycleState,
    /// When the instance was created or adopted
    pub created_at: DateTime<Utc>,
}

/// Verified local copy of a partition's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// Partition the output belongs to
    pub partition_id: PartitionId,
    /// Local directory holding the output
    pub local_path: PathBuf,
    /// Total size of all collected files
    pub byte_count: u64,
    /// Collected files, sorted
    pub files: Vec<PathBuf>,
}

/// Everything known about one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionEntry {
    /// The partition itself
    pub partition: WorkPartition,
    /// Current (most recent) instance
    pub instance: Option<Instance>,
    /// Earlier instances replaced after failing
    pub superseded: Vec<Instance>,
    /// Collected result, once verified
    pub result: Option<ExtractionResult>,
    /// Number of instances provisioned for the partition
    pub attempts: u32,
    /// Last failure
    pub failure: Option<FailureReason>,
}

impl PartitionEntry {
    /// Fresh entry for a pending partition.
    pub fn new(partition: WorkPartition) -> Self {
        Self {
            partition,
            instance: None,
            superseded: Vec::new(),
            result: None,
            attempts: 0,
            failure: None,
        }
    }

    /// The current instance if it is still active.
    pub fn active_instance(&self) -> Option<&Instance> {
        self.instance
            .as_ref()
            .filter(|i| i.lifecycle_state.is_active())
    }

    /// Make `instance` the partition's current instance.
    ///
    /// A previous instance is moved to `superseded` so the cleaner still sees it.
    pub fn attach_instance(&mut self, instance: Instance) {
        if let Some(previous) = self.instance.take() {
            self.superseded.push(previous);
        }
        self.instance = Some(instance);
        self.attempts += 1;
        self.partition.status = PartitionStatus::Provisioned;
        self.failure = None;
    }

    /// Update the current instance's lifecycle state.
    pub fn set_instance_state(&mut self, state: LifecycleState) {
        if let Some(instance) = self.instance.as_mut() {
            instance.lifecycle_state = state;
        }
    }

    /// Record the verified result; the partition is complete.
    pub fn record_result(&mut self, result: ExtractionResult) {
        self.result = Some(result);
        self.partition.status = PartitionStatus::Completed;
        self.failure = None;
        self.set_instance_state(LifecycleState::Completed);
    }

    /// Mark the partition (and its active instance) failed.
    pub fn fail(&mut self, reason: FailureReason) {
        self.partition.status = PartitionStatus::Failed;
        self.failure = Some(reason);
        if self.active_instance().is_some() {
            self.set_instance_state(LifecycleState::Failed);
        }
    }

    /// Every instance ever provisioned for the partition, oldest first.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.superseded.iter().chain(self.instance.iter())
    }

    /// Mutable access to every instance of the partition.
    pub fn instances_mut(&mut self) -> impl Iterator<Item = &mut Instance> {
        self.superseded.iter_mut().chain(self.instance.iter_mut())
    }

    /// Completed with a verified local result.
    pub fn is_collected(&self) -> bool {
        self.partition.status == PartitionStatus::Completed && self.result.is_some()
    }
}

/// Run state shared by all partition tasks.
///
/// Cloning is cheap; clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct FleetState {
    run_id: Option<Uuid>,
    entries: Arc<BTreeMap<PartitionId, Arc<Mutex<PartitionEntry>>>>,
}

impl FleetState {
    /// Create state for a freshly partitioned run.
    pub fn new(partitions: Vec<WorkPartition>) -> Self {
        let entries = partitions
            .into_iter()
            .map(|p| (p.id, Arc::new(Mutex::new(PartitionEntry::new(p)))))
            .collect();
        Self {
            run_id: None,
            entries: Arc::new(entries),
        }
    }

    /// Create state for run `run_id`; snapshots record the id.
    pub fn with_run_id(run_id: Uuid, partitions: Vec<WorkPartition>) -> Self {
        Self {
            run_id: Some(run_id),
            ..Self::new(partitions)
        }
    }

    /// Entry of one partition.
    pub fn entry(&self, id: PartitionId) -> Option<Arc<Mutex<PartitionEntry>>> {
        self.entries.get(&id).cloned()
    }

    /// All partition ids in time order.
    pub fn ids(&self) -> Vec<PartitionId> {
        self.entries.keys().copied().collect()
    }

    /// Iterate over all entries in partition order.
    pub fn iter(&self) -> impl Iterator<Item = (PartitionId, &Arc<Mutex<PartitionEntry>>)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    /// Number of partitions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the run has no partitions.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy every entry into a serializable snapshot.
    pub async fn snapshot(&self) -> FleetSnapshot {
        let mut partitions = Vec::with_capacity(self.entries.len());
        for entry in self.entries.values() {
            partitions.push(entry.lock().await.clone());
        }
        FleetSnapshot {
            run_id: self.run_id,
            captured_at: Utc::now(),
            partitions,
        }
    }
}

/// Point-in-time copy of the fleet state, persisted as `fleet_state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    /// Run that produced the snapshot
    #[serde(default)]
    pub run_id: Option<Uuid>,
    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,
    /// Entries in partition order
    pub partitions: Vec<PartitionEntry>,
}

impl FleetSnapshot {
    /// File name used inside the output directory.
    pub const FILE_NAME: &'static str = "fleet_state.json";

    /// Whether every partition reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.partitions
            .iter()
            .all(|e| e.partition.status.is_terminal())
    }

    /// Number of partitions with a verified result.
    pub fn collected_count(&self) -> usize {
        self.partitions.iter().filter(|e| e.is_collected()).count()
    }

    /// Write the snapshot as pretty JSON.
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Read a snapshot written by [`FleetSnapshot::write_to`].
    pub async fn read_from(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
