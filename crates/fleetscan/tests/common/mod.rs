// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for fleetscan integration tests.
//!
//! Provides configs with millisecond timings and helpers for staging
//! partitions and worker output against the mock provider.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use fleetscan::config::Config;
use fleetscan::partition::{PartitionId, WorkPartition, partition_range};
use fleetscan::provider::{MockProvider, WorkerScript};
use fleetscan::provisioner::{instance_name, run_tag};
use fleetscan::state::{FleetState, Instance, LifecycleState, PartitionEntry};

/// Fixed run id so instance names are predictable.
pub const RUN_ID: Uuid = Uuid::from_u128(0x5eed_0001_0000_4000_8000_0000_0000_0001);

/// Name of the `replacement`-th instance of `partition` in run [`RUN_ID`].
pub fn vm_name(partition: u32, replacement: u32) -> String {
    instance_name("fleetscan", &run_tag(RUN_ID), PartitionId(partition), replacement)
}

/// Midnight UTC of a day in January 2024.
pub fn jan(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
}

/// Config over `[jan(first_day), jan(last_day))` with `count` partitions and
/// timings short enough for real-time tests.
pub fn test_config(output_dir: &Path, first_day: u32, last_day: u32, count: usize) -> Config {
    let mut config = Config::new(
        "test-project",
        jan(first_day),
        jan(last_day),
        count,
        vec![
            "https://rpc-a.example".to_string(),
            "https://rpc-b.example".to_string(),
        ],
    )
    .with_output_dir(output_dir)
    .with_fleet_name("fleetscan");

    config.provisioner.max_attempts = 3;
    config.provisioner.initial_backoff = Duration::from_millis(1);
    config.provisioner.max_backoff = Duration::from_millis(5);
    config.provisioner.call_timeout = Duration::from_secs(5);

    config.monitor.poll_interval = Duration::from_millis(5);
    config.monitor.timeout_floor = Duration::from_secs(10);
    config.monitor.timeout_per_span_hour = Duration::ZERO;
    config.monitor.max_consecutive_poll_errors = 3;
    config.monitor.call_timeout = Duration::from_secs(5);

    config.collector.max_attempts = 3;
    config.collector.initial_backoff = Duration::from_millis(1);
    config.collector.max_backoff = Duration::from_millis(5);
    config.collector.call_timeout = Duration::from_secs(5);

    config
}

/// Fleet state for `[jan(first_day), jan(last_day))` split into `count`.
pub fn fleet_state(first_day: u32, last_day: u32, count: usize) -> FleetState {
    FleetState::new(partition_range(jan(first_day), jan(last_day), count).unwrap())
}

/// Standalone entry for partition 0 covering one day.
pub fn single_entry() -> Arc<Mutex<PartitionEntry>> {
    fleet_state(1, 2, 1).entry(PartitionId(0)).unwrap()
}

/// Instance record as the provisioner would attach it.
pub fn instance(name: &str, partition_id: u32) -> Instance {
    Instance {
        name: name.to_string(),
        partition_id: PartitionId(partition_id),
        zone: "us-central1-a".to_string(),
        machine_type: "e2-standard-2".to_string(),
        lifecycle_state: LifecycleState::Requested,
        created_at: Utc::now(),
    }
}

/// Register `name` with the mock and attach it to `entry`.
pub async fn attach_existing(
    provider: &MockProvider,
    entry: &Mutex<PartitionEntry>,
    name: &str,
    script: WorkerScript,
) {
    provider.insert_existing(name, "us-central1-a", script).await;
    let mut entry = entry.lock().await;
    let id = entry.partition.id.0;
    entry.attach_instance(instance(name, id));
}

/// Transactions CSV a worker would produce for `partition`, with `hashes`
/// as the key column.
pub fn transactions_csv(partition: &WorkPartition, hashes: &[&str]) -> (String, String) {
    let name = format!(
        "{}_transactions.csv",
        partition.start.format("%Y%m%d-%H%M")
    );
    let mut body = String::from("hash,block_time,value\n");
    for (i, hash) in hashes.iter().enumerate() {
        body.push_str(&format!(
            "{},{},{}\n",
            hash,
            partition.start.format("%Y-%m-%dT%H:%M:%S"),
            i
        ));
    }
    (name, body)
}

/// Worker script that succeeds after one RUNNING poll with `files`.
pub fn succeed_with(files: Vec<(String, String)>) -> WorkerScript {
    WorkerScript::Succeed {
        running_polls: 1,
        files: files
            .into_iter()
            .map(|(name, body)| (name, body.into_bytes()))
            .collect(),
    }
}
