// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock provider for testing.
//!
//! Simulates a fleet in memory. Each created instance runs a
//! [`WorkerScript`] that decides what its marker reports and which files it
//! produces, so tests can stage failures per partition without a cloud account.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::traits::*;
use crate::marker::MarkerStatus;
use crate::partition::PartitionId;

/// Scripted behaviour of the worker on one mock instance.
#[derive(Debug, Clone)]
pub enum WorkerScript {
    /// Report RUNNING for `running_polls` marker reads, then COMPLETED.
    /// `files` are `(file name, contents)` pairs produced as output.
    Succeed {
        /// Marker reads answered with RUNNING before completing
        running_polls: u32,
        /// Output files, written byte for byte
        files: Vec<(String, Vec<u8>)>,
    },
    /// Report RUNNING for `running_polls` marker reads, then FAILED.
    Fail {
        /// Marker reads answered with RUNNING before failing
        running_polls: u32,
    },
    /// Report RUNNING for `running_polls` marker reads, then power off.
    Crash {
        /// Marker reads answered with RUNNING before stopping
        running_polls: u32,
    },
    /// Report RUNNING forever.
    Hang,
}

impl Default for WorkerScript {
    fn default() -> Self {
        Self::Succeed {
            running_polls: 1,
            files: vec![("output_records.csv".to_string(), b"id\n1\n".to_vec())],
        }
    }
}

/// Mock instance state.
#[derive(Debug, Clone)]
struct MockInstance {
    zone: String,
    health: HealthState,
    script: WorkerScript,
    marker_reads: u32,
    describes: u32,
}

impl MockInstance {
    fn new(zone: &str, script: WorkerScript) -> Self {
        Self {
            zone: zone.to_string(),
            health: HealthState::Running,
            script,
            marker_reads: 0,
            describes: 0,
        }
    }
}

/// Mock provider for testing.
pub struct MockProvider {
    instances: Arc<Mutex<HashMap<String, MockInstance>>>,
    scripts: Mutex<HashMap<PartitionId, VecDeque<WorkerScript>>>,
    create_failures: Mutex<HashMap<String, u32>>,
    transfer_failures: Mutex<HashMap<String, u32>>,
    poll_failures: Mutex<HashMap<String, u32>>,
    describe_delays: Mutex<HashMap<String, Duration>>,
    deleted: Mutex<Vec<String>>,
    create_calls: AtomicU32,
    reject_credentials: AtomicBool,
    /// Marker reads answered with "no marker" before a script starts
    pub boot_polls: u32,
    /// Describe calls per instance answered with PROVISIONING before the
    /// instance reports RUNNING
    pub provisioning_polls: u32,
    /// Script for partitions without a queued script
    pub default_script: WorkerScript,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Create a mock provider whose workers succeed by default.
    pub fn new() -> Self {
        Self {
            instances: Arc::new(Mutex::new(HashMap::new())),
            scripts: Mutex::new(HashMap::new()),
            create_failures: Mutex::new(HashMap::new()),
            transfer_failures: Mutex::new(HashMap::new()),
            poll_failures: Mutex::new(HashMap::new()),
            describe_delays: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            create_calls: AtomicU32::new(0),
            reject_credentials: AtomicBool::new(false),
            boot_polls: 1,
            provisioning_polls: 0,
            default_script: WorkerScript::default(),
        }
    }

    /// Create a mock provider whose workers never finish on their own.
    /// Useful for testing timeout enforcement and cancellation.
    pub fn never_completing() -> Self {
        Self {
            default_script: WorkerScript::Hang,
            ..Self::new()
        }
    }

    /// Queue scripts for successive instances of a partition.
    ///
    /// The first instance created for the partition runs `scripts[0]`, its
    /// replacement `scripts[1]`, and so on; afterwards `default_script` applies.
    pub async fn script_partition(&self, partition_id: PartitionId, scripts: Vec<WorkerScript>) {
        self.scripts
            .lock()
            .await
            .insert(partition_id, scripts.into_iter().collect());
    }

    /// Make the next `count` create calls for `name` fail transiently.
    pub async fn fail_creates(&self, name: &str, count: u32) {
        self.create_failures
            .lock()
            .await
            .insert(name.to_string(), count);
    }

    /// Make the next `count` transfers from `name` fail transiently.
    pub async fn fail_transfers(&self, name: &str, count: u32) {
        self.transfer_failures
            .lock()
            .await
            .insert(name.to_string(), count);
    }

    /// Make the next `count` describe calls for `name` fail transiently.
    pub async fn fail_polls(&self, name: &str, count: u32) {
        self.poll_failures
            .lock()
            .await
            .insert(name.to_string(), count);
    }

    /// Delay every describe call for `name` by `delay` once the instance
    /// exists. Lookups of a name that does not exist yet answer at once.
    pub async fn delay_describes(&self, name: &str, delay: Duration) {
        self.describe_delays
            .lock()
            .await
            .insert(name.to_string(), delay);
    }

    /// Reject all subsequent calls with an authentication error.
    pub fn reject_credentials(&self) {
        self.reject_credentials.store(true, Ordering::SeqCst);
    }

    /// Register an instance that exists outside of any create call.
    pub async fn insert_existing(&self, name: &str, zone: &str, script: WorkerScript) {
        self.instances
            .lock()
            .await
            .insert(name.to_string(), MockInstance::new(zone, script));
    }

    /// Power off an instance as if it had crashed.
    pub async fn stop_instance(&self, name: &str) {
        if let Some(instance) = self.instances.lock().await.get_mut(name) {
            instance.health = HealthState::Stopped;
        }
    }

    /// Number of create calls that actually created an instance.
    pub fn create_count(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Names of instances that currently exist, sorted.
    pub async fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of deleted instances in deletion order.
    pub async fn deleted_instances(&self) -> Vec<String> {
        self.deleted.lock().await.clone()
    }

    fn check_credentials(&self) -> Result<()> {
        if self.reject_credentials.load(Ordering::SeqCst) {
            return Err(ProviderError::Authentication(
                "mock credentials rejected".to_string(),
            ));
        }
        Ok(())
    }

    async fn take_failure(map: &Mutex<HashMap<String, u32>>, name: &str) -> bool {
        let mut failures = map.lock().await;
        match failures.get_mut(name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn provider_type(&self) -> &'static str {
        "mock"
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceHandle> {
        self.check_credentials()?;

        if Self::take_failure(&self.create_failures, &spec.name).await {
            return Err(ProviderError::Transient(format!(
                "mock create failure for {}",
                spec.name
            )));
        }

        let mut instances = self.instances.lock().await;
        if instances.contains_key(&spec.name) {
            return Err(ProviderError::AlreadyExists(spec.name.clone()));
        }

        let script = self
            .scripts
            .lock()
            .await
            .get_mut(&spec.partition_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| self.default_script.clone());

        instances.insert(spec.name.clone(), MockInstance::new(&spec.zone, script));
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        Ok(InstanceHandle {
            name: spec.name.clone(),
            zone: spec.zone.clone(),
            created_at: Utc::now(),
            adopted: false,
        })
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        self.check_credentials()?;
        let removed = self.instances.lock().await.remove(name);
        match removed {
            Some(_) => {
                self.deleted.lock().await.push(name.to_string());
                Ok(())
            }
            None => Err(ProviderError::NotFound(name.to_string())),
        }
    }

    async fn describe_instance(&self, name: &str) -> Result<HealthState> {
        self.check_credentials()?;
        if Self::take_failure(&self.poll_failures, name).await {
            return Err(ProviderError::Transient(format!(
                "mock describe failure for {}",
                name
            )));
        }
        let health = {
            let mut instances = self.instances.lock().await;
            let instance = instances
                .get_mut(name)
                .ok_or_else(|| ProviderError::NotFound(name.to_string()))?;
            instance.describes += 1;
            if instance.health == HealthState::Running
                && instance.describes <= self.provisioning_polls
            {
                HealthState::Provisioning
            } else {
                instance.health.clone()
            }
        };

        let delay = self.describe_delays.lock().await.get(name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(health)
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceSummary>> {
        self.check_credentials()?;
        let instances = self.instances.lock().await;
        let mut out: Vec<InstanceSummary> = instances
            .iter()
            .filter(|(name, _)| filter.matches(name))
            .map(|(name, i)| InstanceSummary {
                name: name.clone(),
                zone: i.zone.clone(),
                health: i.health.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn read_marker(&self, name: &str) -> Result<Option<MarkerStatus>> {
        self.check_credentials()?;
        let mut instances = self.instances.lock().await;
        let instance = instances
            .get_mut(name)
            .ok_or_else(|| ProviderError::NotFound(name.to_string()))?;

        instance.marker_reads += 1;
        if instance.marker_reads <= self.boot_polls {
            return Ok(None);
        }
        let reads = instance.marker_reads - self.boot_polls;

        let status = match &instance.script {
            WorkerScript::Succeed { running_polls, .. } if reads > *running_polls => {
                MarkerStatus::Completed
            }
            WorkerScript::Fail { running_polls } if reads > *running_polls => MarkerStatus::Failed,
            WorkerScript::Crash { running_polls } if reads > *running_polls => {
                instance.health = HealthState::Stopped;
                MarkerStatus::Running
            }
            _ => MarkerStatus::Running,
        };
        Ok(Some(status))
    }

    async fn transfer_output(&self, name: &str, local_dir: &Path) -> Result<()> {
        self.check_credentials()?;

        if Self::take_failure(&self.transfer_failures, name).await {
            return Err(ProviderError::Transient(format!(
                "mock transfer failure for {}",
                name
            )));
        }

        let files = {
            let instances = self.instances.lock().await;
            let instance = instances
                .get(name)
                .ok_or_else(|| ProviderError::NotFound(name.to_string()))?;
            match &instance.script {
                WorkerScript::Succeed { files, .. } => files.clone(),
                _ => Vec::new(),
            }
        };

        // Plain std::fs keeps the mock free of blocking-pool hops.
        std::fs::create_dir_all(local_dir)?;
        for (file_name, contents) in files {
            std::fs::write(local_dir.join(file_name), contents)?;
        }
        Ok(())
    }
}
