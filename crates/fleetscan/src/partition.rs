// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Splitting the requested time range into contiguous work partitions.
//!
//! Partitions are half-open intervals `[start, end)` measured in whole
//! seconds. When the range does not divide evenly, the first
//! `total % count` partitions are one second longer than the rest.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifier of a partition, `0..count` in time order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{:03}", self.0)
    }
}

/// Partition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    /// Created by the partitioner, no instance yet.
    Pending,
    /// An instance has been requested for the partition.
    Provisioned,
    /// The instance reported healthy at least once.
    Running,
    /// Results were collected and verified locally.
    Completed,
    /// The current instance failed, or the partition was given up on.
    Failed,
}

impl PartitionStatus {
    /// Whether no further work will happen for this partition.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One contiguous sub-range of the extraction job.
///
/// `start` and `end` never change after partitioning; only `status` moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPartition {
    /// Partition identifier
    pub id: PartitionId,
    /// Inclusive start of the range
    pub start: DateTime<Utc>,
    /// Exclusive end of the range
    pub end: DateTime<Utc>,
    /// Current status
    pub status: PartitionStatus,
}

impl WorkPartition {
    /// Length of the partition's range.
    pub fn duration(&self) -> ChronoDuration {
        self.end - self.start
    }

    /// Length of the partition's range in (fractional) hours.
    pub fn span_hours(&self) -> f64 {
        self.duration().num_seconds() as f64 / 3600.0
    }
}

/// Split `[start, end)` into `count` contiguous partitions of near-equal length.
///
/// Fails with [`Error::InvalidRange`] if `start >= end`, `count < 1`, or the
/// range has fewer whole seconds than requested partitions.
pub fn partition_range(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    count: usize,
) -> Result<Vec<WorkPartition>> {
    if start >= end {
        return Err(Error::InvalidRange(format!(
            "start {} is not before end {}",
            start, end
        )));
    }
    if count < 1 {
        return Err(Error::InvalidRange(
            "partition count must be at least 1".to_string(),
        ));
    }

    let total = (end - start).num_seconds();
    let n = i64::try_from(count)
        .map_err(|_| Error::InvalidRange(format!("partition count {} is too large", count)))?;
    if n > total {
        return Err(Error::InvalidRange(format!(
            "cannot split {}s into {} partitions",
            total, count
        )));
    }

    let base = total / n;
    let remainder = total % n;

    let mut partitions = Vec::with_capacity(count);
    let mut cursor = start;
    for i in 0..n {
        let len = base + i64::from(i < remainder);
        // Sub-second leftovers of the range go to the last partition.
        let next = if i == n - 1 {
            end
        } else {
            cursor + ChronoDuration::seconds(len)
        };
        partitions.push(WorkPartition {
            id: PartitionId(i as u32),
            start: cursor,
            end: next,
            status: PartitionStatus::Pending,
        });
        cursor = next;
    }

    Ok(partitions)
}
