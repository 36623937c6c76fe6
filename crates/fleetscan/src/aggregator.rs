// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Merging collected partition outputs.
//!
//! Collected CSV files are grouped into datasets by file name
//! (`20240101-0000_transactions.csv` belongs to `transactions`). For every
//! dataset the records of all contributing partitions are concatenated in
//! partition start order into `{output_dir}/aggregated/{dataset}.csv`.
//!
//! Partitions are half-open, but workers may still emit a record that sits
//! exactly on a boundary twice. A record whose key was already emitted by the
//! previous contributing partition is dropped from the later one.
//!
//! Fields that are not valid UTF-8 are decoded lossily. A file or dataset
//! that cannot be merged at all is recorded as an [`AggregationIssue`] and
//! the remaining files are still merged.
//!
//! The run's coverage is written to `{output_dir}/manifest.json`, whether or
//! not anything completed.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, FailureReason, Result};
use crate::partition::PartitionId;
use crate::state::{FleetSnapshot, PartitionEntry};

/// Non-fatal warning: some partitions did not contribute to the output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "aggregated output is incomplete: {} of {total} partition(s) missing ({})",
    .missing.len(),
    .missing.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
)]
pub struct AggregationGapWarning {
    /// Partitions without a collected result
    pub missing: Vec<PartitionId>,
    /// Partitions in the run
    pub total: usize,
}

/// A file or dataset that could not be merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationIssue {
    /// Partition the file came from, if the issue concerns one file
    pub partition_id: Option<PartitionId>,
    /// File or directory involved
    pub path: Option<PathBuf>,
    /// What went wrong
    pub message: String,
}

/// Run-level facts recorded in the manifest.
#[derive(Debug, Clone)]
pub struct ManifestContext {
    /// Identifier of the run
    pub run_id: Uuid,
    /// Inclusive start of the requested range
    pub range_start: DateTime<Utc>,
    /// Exclusive end of the requested range
    pub range_end: DateTime<Utc>,
    /// Whether the run was cancelled
    pub cancelled: bool,
}

/// A partition whose output is part of the aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributedPartition {
    /// Partition id
    pub partition_id: PartitionId,
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
    /// Instances provisioned for the partition
    pub attempts: u32,
    /// Bytes collected
    pub byte_count: u64,
    /// Local directory of the collected output
    pub local_path: PathBuf,
}

/// A partition missing from the aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingPartition {
    /// Partition id
    pub partition_id: PartitionId,
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
    /// Instances provisioned for the partition
    pub attempts: u32,
    /// Why there is no result
    pub reason: FailureReason,
}

/// One merged output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    /// Dataset name
    pub name: String,
    /// Merged file
    pub path: PathBuf,
    /// Records written, header excluded
    pub records: u64,
    /// Boundary duplicates dropped
    pub duplicates_dropped: u64,
    /// Records with invalid UTF-8 replaced by U+FFFD
    #[serde(default)]
    pub lossy_records: u64,
    /// SHA-256 of the merged file, hex encoded
    pub sha256: String,
}

/// Coverage report of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Identifier of the run
    pub run_id: Uuid,
    /// When the manifest was produced
    pub generated_at: DateTime<Utc>,
    /// Inclusive start of the requested range
    pub range_start: DateTime<Utc>,
    /// Exclusive end of the requested range
    pub range_end: DateTime<Utc>,
    /// Partitions in the run
    pub partition_count: usize,
    /// Every partition contributed and every file merged
    pub complete: bool,
    /// The run was cancelled
    pub cancelled: bool,
    /// Contributing partitions in start order
    pub contributed: Vec<ContributedPartition>,
    /// Missing partitions in start order
    pub missing: Vec<MissingPartition>,
    /// Merged datasets by name
    pub datasets: Vec<DatasetSummary>,
    /// Files or datasets left out of the merge
    #[serde(default)]
    pub issues: Vec<AggregationIssue>,
    /// Warning text when incomplete
    pub warning: Option<String>,
}

impl Manifest {
    /// File name used inside the output directory.
    pub const FILE_NAME: &'static str = "manifest.json";

    /// The gap warning, if any partition is missing.
    pub fn gap_warning(&self) -> Option<AggregationGapWarning> {
        if self.missing.is_empty() {
            return None;
        }
        Some(AggregationGapWarning {
            missing: self.missing.iter().map(|m| m.partition_id).collect(),
            total: self.partition_count,
        })
    }

    fn warning_text(&self) -> Option<String> {
        let gap = self.gap_warning().map(|w| w.to_string());
        let issues = (!self.issues.is_empty())
            .then(|| format!("{} file(s) or dataset(s) could not be merged", self.issues.len()));
        match (gap, issues) {
            (Some(gap), Some(issues)) => Some(format!("{}; {}", gap, issues)),
            (gap, issues) => gap.or(issues),
        }
    }

    /// Read a manifest written by a previous run.
    pub async fn read_from(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Dataset a collected file belongs to: its stem after the first `_`.
pub fn dataset_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let name = match stem.split_once('_') {
        Some((_, rest)) if !rest.is_empty() => rest,
        _ => stem,
    };
    Some(name.to_string())
}

/// Merges collected outputs and writes the manifest.
#[derive(Debug, Clone)]
pub struct Aggregator {
    output_dir: PathBuf,
    key_column: String,
}

impl Aggregator {
    /// Create an aggregator writing below `output_dir`, de-duplicating on
    /// `key_column`.
    pub fn new(output_dir: impl Into<PathBuf>, key_column: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            key_column: key_column.into(),
        }
    }

    /// Directory merged datasets are written to.
    pub fn aggregated_dir(&self) -> PathBuf {
        self.output_dir.join("aggregated")
    }

    /// Merge every collected partition of `snapshot` and write the manifest.
    ///
    /// CSV work runs on the blocking pool. Unreadable inputs end up in
    /// [`Manifest::issues`]; only a failure to write the manifest itself is
    /// returned as an error.
    pub async fn aggregate(
        &self,
        snapshot: &FleetSnapshot,
        context: ManifestContext,
    ) -> Result<Manifest> {
        let this = self.clone();
        let snapshot = snapshot.clone();
        let manifest = tokio::task::spawn_blocking(move || this.aggregate_blocking(&snapshot, context))
            .await
            .map_err(|e| Error::Other(format!("aggregation task failed: {}", e)))??;

        if let Some(warning) = manifest.gap_warning() {
            warn!(missing = warning.missing.len(), total = warning.total, "{}", warning);
        }
        info!(
            contributed = manifest.contributed.len(),
            datasets = manifest.datasets.len(),
            issues = manifest.issues.len(),
            complete = manifest.complete,
            "Aggregation finished"
        );
        Ok(manifest)
    }

    fn aggregate_blocking(&self, snapshot: &FleetSnapshot, context: ManifestContext) -> Result<Manifest> {
        let mut entries: Vec<&PartitionEntry> = snapshot.partitions.iter().collect();
        entries.sort_by_key(|e| e.partition.start);

        let mut contributed = Vec::new();
        let mut missing = Vec::new();
        for entry in &entries {
            match (&entry.result, entry.is_collected()) {
                (Some(result), true) => contributed.push(ContributedPartition {
                    partition_id: entry.partition.id,
                    start: entry.partition.start,
                    end: entry.partition.end,
                    attempts: entry.attempts,
                    byte_count: result.byte_count,
                    local_path: result.local_path.clone(),
                }),
                _ => missing.push(MissingPartition {
                    partition_id: entry.partition.id,
                    start: entry.partition.start,
                    end: entry.partition.end,
                    attempts: entry.attempts,
                    reason: entry.failure.clone().unwrap_or(if context.cancelled {
                        FailureReason::Cancelled
                    } else {
                        FailureReason::Internal {
                            message: "partition finished without a result".to_string(),
                        }
                    }),
                }),
            }
        }

        let mut issues = Vec::new();
        let aggregated_dir = self.aggregated_dir();
        let mergeable: Vec<&&PartitionEntry> = match reset_dir(&aggregated_dir) {
            Ok(()) => entries.iter().filter(|e| e.is_collected()).collect(),
            Err(e) => {
                record_issue(&mut issues, None, Some(aggregated_dir.as_path()), &e);
                Vec::new()
            }
        };

        let mut datasets: BTreeMap<String, DatasetWriter> = BTreeMap::new();
        for entry in mergeable {
            let Some(result) = &entry.result else { continue };

            let mut files: Vec<&PathBuf> = result
                .files
                .iter()
                .filter(|f| {
                    f.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
                })
                .collect();
            files.sort();

            for file in files {
                let Some(name) = dataset_name(file) else {
                    warn!(path = %file.display(), "Skipping file with unusable name");
                    continue;
                };
                if !datasets.contains_key(&name) {
                    let path = aggregated_dir.join(format!("{}.csv", name));
                    match DatasetWriter::open(&name, path, file, &self.key_column) {
                        Ok(Some(writer)) => {
                            datasets.insert(name.clone(), writer);
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            record_issue(
                                &mut issues,
                                Some(entry.partition.id),
                                Some(file.as_path()),
                                &e,
                            );
                            continue;
                        }
                    }
                }
                if let Some(writer) = datasets.get_mut(&name) {
                    if let Err(e) = writer.append(entry.partition.id, file) {
                        record_issue(
                            &mut issues,
                            Some(entry.partition.id),
                            Some(file.as_path()),
                            &e,
                        );
                    }
                }
            }
        }

        let mut summaries = Vec::with_capacity(datasets.len());
        for (_, writer) in datasets {
            let path = writer.path.clone();
            match writer.finish() {
                Ok(summary) => summaries.push(summary),
                Err(e) => record_issue(&mut issues, None, Some(path.as_path()), &e),
            }
        }

        let complete = missing.is_empty() && issues.is_empty();
        let mut manifest = Manifest {
            run_id: context.run_id,
            generated_at: Utc::now(),
            range_start: context.range_start,
            range_end: context.range_end,
            partition_count: snapshot.partitions.len(),
            complete,
            cancelled: context.cancelled,
            contributed,
            missing,
            datasets: summaries,
            issues,
            warning: None,
        };
        manifest.warning = manifest.warning_text();

        let json = serde_json::to_vec_pretty(&manifest)?;
        std::fs::write(self.output_dir.join(Manifest::FILE_NAME), json)?;
        Ok(manifest)
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

fn record_issue(
    issues: &mut Vec<AggregationIssue>,
    partition_id: Option<PartitionId>,
    path: Option<&Path>,
    error: &Error,
) {
    warn!(
        partition_id = ?partition_id,
        path = ?path,
        error = %error,
        "Left out of the merge"
    );
    issues.push(AggregationIssue {
        partition_id,
        path: path.map(Path::to_path_buf),
        message: error.to_string(),
    });
}

fn decode(field: &[u8]) -> String {
    String::from_utf8_lossy(field).into_owned()
}

/// Merged output of one dataset in progress.
struct DatasetWriter {
    name: String,
    path: PathBuf,
    header: Vec<String>,
    key_index: Option<usize>,
    writer: csv::Writer<File>,
    records: u64,
    duplicates_dropped: u64,
    lossy_records: u64,
    current_partition: Option<PartitionId>,
    current_keys: HashSet<String>,
    previous_keys: HashSet<String>,
}

impl DatasetWriter {
    /// Start a dataset using `first_file`'s header. Returns `None` if that
    /// file has no header.
    fn open(name: &str, path: PathBuf, first_file: &Path, key_column: &str) -> Result<Option<Self>> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(first_file)?;
        let header: Vec<String> = reader.byte_headers()?.iter().map(decode).collect();
        if header.iter().all(|h| h.is_empty()) {
            warn!(path = %first_file.display(), "Skipping CSV without header");
            return Ok(None);
        }

        let key_index = header.iter().position(|h| h == key_column);
        if key_index.is_none() {
            warn!(
                dataset = %name,
                key_column = %key_column,
                "Key column missing, de-duplicating on whole records"
            );
        }

        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(&header)?;

        Ok(Some(Self {
            name: name.to_string(),
            path,
            header,
            key_index,
            writer,
            records: 0,
            duplicates_dropped: 0,
            lossy_records: 0,
            current_partition: None,
            current_keys: HashSet::new(),
            previous_keys: HashSet::new(),
        }))
    }

    /// Append the records of one file from `partition_id`.
    fn append(&mut self, partition_id: PartitionId, file: &Path) -> Result<()> {
        if self.current_partition != Some(partition_id) {
            self.previous_keys = std::mem::take(&mut self.current_keys);
            self.current_partition = Some(partition_id);
        }

        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(file)?;
        let file_header: Vec<String> = reader.byte_headers()?.iter().map(decode).collect();

        // Dataset column -> column of this file. Extra fields are dropped,
        // missing ones become empty.
        let columns: Vec<Option<usize>> = if file_header == self.header {
            (0..self.header.len()).map(Some).collect()
        } else {
            warn!(
                dataset = %self.name,
                path = %file.display(),
                "Header differs from dataset header, mapping columns by name"
            );
            self.header
                .iter()
                .map(|h| file_header.iter().position(|f| f == h))
                .collect()
        };

        let mut row: Vec<String> = Vec::with_capacity(self.header.len());
        let mut lossy = 0u64;
        for record in reader.byte_records() {
            let record = record?;
            let mut replaced = false;
            row.clear();
            row.extend(columns.iter().map(|c| {
                match String::from_utf8_lossy(c.and_then(|i| record.get(i)).unwrap_or(b"")) {
                    Cow::Borrowed(text) => text.to_string(),
                    Cow::Owned(text) => {
                        replaced = true;
                        text
                    }
                }
            }));
            if replaced {
                lossy += 1;
            }

            let key = match self.key_index {
                Some(i) => row[i].clone(),
                None => row.join("\u{1f}"),
            };
            if self.previous_keys.contains(&key) {
                self.duplicates_dropped += 1;
                continue;
            }

            self.writer.write_record(&row)?;
            self.current_keys.insert(key);
            self.records += 1;
        }

        if lossy > 0 {
            warn!(
                dataset = %self.name,
                path = %file.display(),
                records = lossy,
                "Replaced invalid UTF-8"
            );
            self.lossy_records += lossy;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<DatasetSummary> {
        self.writer.flush()?;
        drop(self.writer);

        let mut hasher = Sha256::new();
        let mut file = File::open(&self.path)?;
        std::io::copy(&mut file, &mut hasher)?;
        let sha256 = format!("{:x}", hasher.finalize());

        info!(
            dataset = %self.name,
            records = self.records,
            duplicates_dropped = self.duplicates_dropped,
            path = %self.path.display(),
            "Dataset written"
        );

        Ok(DatasetSummary {
            name: self.name,
            path: self.path,
            records: self.records,
            duplicates_dropped: self.duplicates_dropped,
            lossy_records: self.lossy_records,
            sha256,
        })
    }
}
