// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Aggregator tests: ordering, boundary de-duplication, header handling and
//! the manifest.

mod common;

use std::path::{Path, PathBuf};

use common::{fleet_state, instance, jan};
use fleetscan::aggregator::{Aggregator, Manifest, ManifestContext};
use fleetscan::collector::partition_dir;
use fleetscan::error::FailureReason;
use fleetscan::partition::PartitionId;
use fleetscan::state::{ExtractionResult, FleetState};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Write `files` as partition `id`'s collected output and record the result.
async fn collected<B: AsRef<[u8]>>(state: &FleetState, root: &Path, id: u32, files: &[(&str, B)]) {
    let dir = partition_dir(root, PartitionId(id));
    std::fs::create_dir_all(&dir).unwrap();
    let mut paths: Vec<PathBuf> = Vec::new();
    let mut bytes = 0u64;
    for (name, body) in files {
        let path = dir.join(name);
        std::fs::write(&path, body.as_ref()).unwrap();
        bytes += body.as_ref().len() as u64;
        paths.push(path);
    }
    paths.sort();

    let entry = state.entry(PartitionId(id)).unwrap();
    let mut entry = entry.lock().await;
    entry.attach_instance(instance(&format!("fleetscan-p{:03}-r0", id), id));
    entry.record_result(ExtractionResult {
        partition_id: PartitionId(id),
        local_path: dir,
        byte_count: bytes,
        files: paths,
    });
}

async fn failed(state: &FleetState, id: u32, reason: FailureReason) {
    let entry = state.entry(PartitionId(id)).unwrap();
    let mut entry = entry.lock().await;
    entry.attach_instance(instance(&format!("fleetscan-p{:03}-r0", id), id));
    entry.fail(reason);
}

fn context(first_day: u32, last_day: u32) -> ManifestContext {
    ManifestContext {
        run_id: Uuid::new_v4(),
        range_start: jan(first_day),
        range_end: jan(last_day),
        cancelled: false,
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Merge
// ============================================================================

#[tokio::test]
async fn test_records_are_merged_in_time_order() {
    let dir = tempfile::tempdir().unwrap();
    let state = fleet_state(1, 4, 3);
    collected(&state, dir.path(), 0, &[("20240101-0000_transactions.csv", "hash,value\na,1\n")]).await;
    collected(&state, dir.path(), 1, &[("20240102-0000_transactions.csv", "hash,value\nb,2\n")]).await;
    collected(&state, dir.path(), 2, &[("20240103-0000_transactions.csv", "hash,value\nc,3\n")]).await;

    // Entry order in the snapshot must not matter.
    let mut snapshot = state.snapshot().await;
    snapshot.partitions.reverse();

    let aggregator = Aggregator::new(dir.path(), "hash");
    let manifest = aggregator.aggregate(&snapshot, context(1, 4)).await.unwrap();

    assert!(manifest.complete);
    assert!(manifest.warning.is_none());
    assert_eq!(manifest.datasets.len(), 1);
    assert_eq!(manifest.datasets[0].name, "transactions");
    assert_eq!(manifest.datasets[0].records, 3);

    let ids: Vec<PartitionId> = manifest.contributed.iter().map(|c| c.partition_id).collect();
    assert_eq!(ids, vec![PartitionId(0), PartitionId(1), PartitionId(2)]);

    let lines = read_lines(&aggregator.aggregated_dir().join("transactions.csv"));
    assert_eq!(lines, vec!["hash,value", "a,1", "b,2", "c,3"]);
}

#[tokio::test]
async fn test_boundary_duplicates_are_dropped_from_later_partition() {
    let dir = tempfile::tempdir().unwrap();
    let state = fleet_state(1, 3, 2);
    collected(&state, dir.path(), 0, &[("p0_transactions.csv", "hash,value\na,1\nb,2\n")]).await;
    collected(&state, dir.path(), 1, &[("p1_transactions.csv", "hash,value\nb,2\nc,3\n")]).await;

    let aggregator = Aggregator::new(dir.path(), "hash");
    let manifest = aggregator
        .aggregate(&state.snapshot().await, context(1, 3))
        .await
        .unwrap();

    assert_eq!(manifest.datasets[0].records, 3);
    assert_eq!(manifest.datasets[0].duplicates_dropped, 1);
    let lines = read_lines(&aggregator.aggregated_dir().join("transactions.csv"));
    assert_eq!(lines, vec!["hash,value", "a,1", "b,2", "c,3"]);
}

#[tokio::test]
async fn test_duplicates_within_a_partition_are_kept() {
    let dir = tempfile::tempdir().unwrap();
    let state = fleet_state(1, 2, 1);
    collected(&state, dir.path(), 0, &[("p0_transfers.csv", "hash,value\na,1\na,2\n")]).await;

    let aggregator = Aggregator::new(dir.path(), "hash");
    let manifest = aggregator
        .aggregate(&state.snapshot().await, context(1, 2))
        .await
        .unwrap();

    assert_eq!(manifest.datasets[0].records, 2);
    assert_eq!(manifest.datasets[0].duplicates_dropped, 0);
}

#[tokio::test]
async fn test_whole_record_dedup_without_key_column() {
    let dir = tempfile::tempdir().unwrap();
    let state = fleet_state(1, 3, 2);
    collected(&state, dir.path(), 0, &[("p0_blocks.csv", "number,miner\n1,x\n2,y\n")]).await;
    collected(&state, dir.path(), 1, &[("p1_blocks.csv", "number,miner\n2,y\n2,z\n3,z\n")]).await;

    let aggregator = Aggregator::new(dir.path(), "hash");
    let manifest = aggregator
        .aggregate(&state.snapshot().await, context(1, 3))
        .await
        .unwrap();

    let lines = read_lines(&aggregator.aggregated_dir().join("blocks.csv"));
    assert_eq!(lines, vec!["number,miner", "1,x", "2,y", "2,z", "3,z"]);
    assert_eq!(manifest.datasets[0].duplicates_dropped, 1);
}

#[tokio::test]
async fn test_mismatched_headers_are_mapped_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let state = fleet_state(1, 4, 3);
    collected(&state, dir.path(), 0, &[("p0_transactions.csv", "hash,block_time,value\na,t0,1\n")]).await;
    collected(&state, dir.path(), 1, &[("p1_transactions.csv", "value,hash,extra\n2,b,x\n")]).await;
    collected(&state, dir.path(), 2, &[("p2_transactions.csv", "hash\nc\n")]).await;

    let aggregator = Aggregator::new(dir.path(), "hash");
    aggregator
        .aggregate(&state.snapshot().await, context(1, 4))
        .await
        .unwrap();

    let lines = read_lines(&aggregator.aggregated_dir().join("transactions.csv"));
    assert_eq!(
        lines,
        vec!["hash,block_time,value", "a,t0,1", "b,,2", "c,,"]
    );
}

#[tokio::test]
async fn test_datasets_are_kept_separate() {
    let dir = tempfile::tempdir().unwrap();
    let state = fleet_state(1, 2, 1);
    collected(
        &state,
        dir.path(),
        0,
        &[
            ("20240101-0000_transactions.csv", "hash\na\n"),
            ("20240101-0000_blocks.csv", "number\n1\n"),
            ("worker.log", "not a dataset"),
        ],
    )
    .await;

    let aggregator = Aggregator::new(dir.path(), "hash");
    let manifest = aggregator
        .aggregate(&state.snapshot().await, context(1, 2))
        .await
        .unwrap();

    let names: Vec<&str> = manifest.datasets.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["blocks", "transactions"]);
}

// ============================================================================
// Manifest
// ============================================================================

#[tokio::test]
async fn test_missing_partitions_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let state = fleet_state(1, 4, 3);
    collected(&state, dir.path(), 0, &[("p0_transactions.csv", "hash\na\n")]).await;
    failed(&state, 1, FailureReason::WorkerFailed).await;
    collected(&state, dir.path(), 2, &[("p2_transactions.csv", "hash\nc\n")]).await;

    let aggregator = Aggregator::new(dir.path(), "hash");
    let manifest = aggregator
        .aggregate(&state.snapshot().await, context(1, 4))
        .await
        .unwrap();

    assert!(!manifest.complete);
    assert_eq!(manifest.partition_count, 3);
    assert_eq!(manifest.contributed.len(), 2);
    assert_eq!(manifest.missing.len(), 1);
    assert_eq!(manifest.missing[0].partition_id, PartitionId(1));
    assert_eq!(manifest.missing[0].reason, FailureReason::WorkerFailed);
    assert_eq!(manifest.missing[0].start, jan(2));
    assert_eq!(manifest.missing[0].end, jan(3));

    let warning = manifest.warning.as_deref().unwrap();
    assert!(warning.contains("1 of 3"));
    assert!(warning.contains("p001"));

    let lines = read_lines(&aggregator.aggregated_dir().join("transactions.csv"));
    assert_eq!(lines, vec!["hash", "a", "c"]);
}

#[tokio::test]
async fn test_manifest_written_when_nothing_completed() {
    let dir = tempfile::tempdir().unwrap();
    let state = fleet_state(1, 3, 2);
    failed(&state, 0, FailureReason::WorkerFailed).await;
    failed(
        &state,
        1,
        FailureReason::ProvisionFailed {
            attempts: 3,
            message: "quota exceeded".to_string(),
        },
    )
    .await;

    let ctx = context(1, 3);
    let run_id = ctx.run_id;
    let manifest = Aggregator::new(dir.path(), "hash")
        .aggregate(&state.snapshot().await, ctx)
        .await
        .unwrap();

    assert!(manifest.datasets.is_empty());
    assert!(manifest.contributed.is_empty());
    assert_eq!(manifest.missing.len(), 2);

    let on_disk = Manifest::read_from(&dir.path().join(Manifest::FILE_NAME))
        .await
        .unwrap();
    assert_eq!(on_disk.run_id, run_id);
    assert_eq!(on_disk.missing.len(), 2);
    assert!(on_disk.warning.is_some());
}

#[tokio::test]
async fn test_unfinished_partitions_of_cancelled_run_are_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let state = fleet_state(1, 2, 1);

    let mut ctx = context(1, 2);
    ctx.cancelled = true;
    let manifest = Aggregator::new(dir.path(), "hash")
        .aggregate(&state.snapshot().await, ctx)
        .await
        .unwrap();

    assert!(manifest.cancelled);
    assert_eq!(manifest.missing[0].reason, FailureReason::Cancelled);
}

#[tokio::test]
async fn test_dataset_checksum_matches_file() {
    let dir = tempfile::tempdir().unwrap();
    let state = fleet_state(1, 2, 1);
    collected(&state, dir.path(), 0, &[("p0_transactions.csv", "hash,value\na,1\nb,2\n")]).await;

    let manifest = Aggregator::new(dir.path(), "hash")
        .aggregate(&state.snapshot().await, context(1, 2))
        .await
        .unwrap();

    let dataset = &manifest.datasets[0];
    let bytes = std::fs::read(&dataset.path).unwrap();
    assert_eq!(dataset.sha256, format!("{:x}", Sha256::digest(&bytes)));
}

#[tokio::test]
async fn test_previous_aggregate_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = Aggregator::new(dir.path(), "hash");
    std::fs::create_dir_all(aggregator.aggregated_dir()).unwrap();
    std::fs::write(aggregator.aggregated_dir().join("old.csv"), "hash\nz\n").unwrap();

    let state = fleet_state(1, 2, 1);
    collected(&state, dir.path(), 0, &[("p0_transactions.csv", "hash\na\n")]).await;
    aggregator
        .aggregate(&state.snapshot().await, context(1, 2))
        .await
        .unwrap();

    assert!(!aggregator.aggregated_dir().join("old.csv").exists());
    assert!(aggregator.aggregated_dir().join("transactions.csv").exists());
}

// ============================================================================
// Unreadable input
// ============================================================================

#[tokio::test]
async fn test_invalid_utf8_is_decoded_lossily() {
    let dir = tempfile::tempdir().unwrap();
    let state = fleet_state(1, 3, 2);
    collected(&state, dir.path(), 0, &[("20240101-0000_transactions.csv", "hash,value\na,1\n")]).await;
    collected(
        &state,
        dir.path(),
        1,
        &[("20240102-0000_transactions.csv", b"hash,value\nab\xff\xfe,1\n".as_slice())],
    )
    .await;

    let aggregator = Aggregator::new(dir.path(), "hash");
    let manifest = aggregator
        .aggregate(&state.snapshot().await, context(1, 3))
        .await
        .unwrap();

    assert!(manifest.complete);
    assert!(manifest.issues.is_empty());
    assert_eq!(manifest.datasets[0].records, 2);
    assert_eq!(manifest.datasets[0].lossy_records, 1);
    assert!(dir.path().join(Manifest::FILE_NAME).exists());

    let lines = read_lines(&aggregator.aggregated_dir().join("transactions.csv"));
    assert_eq!(lines, vec!["hash,value", "a,1", "ab\u{fffd}\u{fffd},1"]);
}

#[tokio::test]
async fn test_unreadable_file_is_reported_and_rest_merged() {
    let dir = tempfile::tempdir().unwrap();
    let state = fleet_state(1, 4, 3);
    collected(&state, dir.path(), 0, &[("20240101-0000_transactions.csv", "hash,value\na,1\n")]).await;
    collected(&state, dir.path(), 1, &[("20240102-0000_transactions.csv", "hash,value\nb,2\n")]).await;
    collected(&state, dir.path(), 2, &[("20240103-0000_transactions.csv", "hash,value\nc,3\n")]).await;
    let lost = partition_dir(dir.path(), PartitionId(1)).join("20240102-0000_transactions.csv");
    std::fs::remove_file(&lost).unwrap();

    let aggregator = Aggregator::new(dir.path(), "hash");
    let manifest = aggregator
        .aggregate(&state.snapshot().await, context(1, 4))
        .await
        .unwrap();

    assert!(!manifest.complete);
    assert!(manifest.missing.is_empty());
    assert_eq!(manifest.issues.len(), 1);
    assert_eq!(manifest.issues[0].partition_id, Some(PartitionId(1)));
    assert_eq!(manifest.issues[0].path.as_deref(), Some(lost.as_path()));
    assert!(manifest.warning.as_deref().unwrap().contains("could not be merged"));

    let lines = read_lines(&aggregator.aggregated_dir().join("transactions.csv"));
    assert_eq!(lines, vec!["hash,value", "a,1", "c,3"]);

    let on_disk = Manifest::read_from(&dir.path().join(Manifest::FILE_NAME))
        .await
        .unwrap();
    assert_eq!(on_disk.issues, manifest.issues);
}
