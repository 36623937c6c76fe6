// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run coordinator.
//!
//! The [`Orchestrator`] partitions the range, spawns one task per partition
//! and joins them. Each task provisions an instance, watches it, collects its
//! output and replaces it on failure, independently of every other
//! partition. Once all tasks are joined the orchestrator aggregates, cleans
//! up and persists the fleet state.
//!
//! ```text
//! Partitioning -> Provisioning -> Monitoring -> Collecting -> Aggregating -> CleaningUp -> Done
//!                 \______ per-partition tasks, concurrent ______/
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fleetscan::config::Config;
//! use fleetscan::orchestrator::Orchestrator;
//! use fleetscan::provider::{GcloudConfig, GcloudProvider};
//!
//! let config = Config::from_env()?;
//! let provider = Arc::new(GcloudProvider::new(GcloudConfig::from_config(&config)));
//!
//! let report = Orchestrator::builder()
//!     .config(config)
//!     .provider(provider)
//!     .build()?
//!     .run()
//!     .await?;
//! println!("complete: {}", report.manifest.complete);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aggregator::{Aggregator, Manifest, ManifestContext};
use crate::bootstrap::check_worker_bounds;
use crate::cleaner::{Cleaner, CleanupReport};
use crate::collector::Collector;
use crate::config::Config;
use crate::error::{Error, FailureReason, Result};
use crate::monitor::{MonitorOutcome, PartitionMonitor};
use crate::partition::{PartitionId, partition_range};
use crate::provider::Provider;
use crate::provisioner::Provisioner;
use crate::state::{FleetSnapshot, FleetState, PartitionEntry};

/// Phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Splitting the range
    Partitioning,
    /// Creating the initial instances
    Provisioning,
    /// Waiting for workers (replacements included)
    Monitoring,
    /// No partition is being monitored, transfers outstanding
    Collecting,
    /// Merging outputs
    Aggregating,
    /// Deleting instances
    CleaningUp,
    /// Finished
    Done,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Partitioning => "partitioning",
            Self::Provisioning => "provisioning",
            Self::Monitoring => "monitoring",
            Self::Collecting => "collecting",
            Self::Aggregating => "aggregating",
            Self::CleaningUp => "cleaning_up",
            Self::Done => "done",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Identifier of the run
    pub run_id: Uuid,
    /// Coverage manifest
    pub manifest: Manifest,
    /// What the cleaner did
    pub cleanup: CleanupReport,
    /// Whether the run was cancelled
    pub cancelled: bool,
}

/// Builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Option<Config>,
    provider: Option<Arc<dyn Provider>>,
    cancellation: Option<CancellationToken>,
    run_id: Option<Uuid>,
}

impl OrchestratorBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the cloud provider (required).
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Use an externally owned cancellation token.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Use a fixed run id instead of a random one.
    pub fn run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Validate the configuration and build the orchestrator.
    ///
    /// The range itself is checked by [`Orchestrator::run`].
    pub fn build(self) -> anyhow::Result<Orchestrator> {
        let config = self.config.ok_or_else(|| anyhow!("config is required"))?;
        let provider = self
            .provider
            .ok_or_else(|| anyhow!("provider is required"))?;
        config.validate_settings()?;

        let (phase, _) = watch::channel(RunPhase::Partitioning);

        Ok(Orchestrator {
            config,
            provider,
            cancel: self.cancellation.unwrap_or_else(CancellationToken::new),
            run_id: self.run_id.unwrap_or_else(Uuid::new_v4),
            phase: Arc::new(phase),
        })
    }
}

/// Drives one fleet run from partitioning to teardown.
pub struct Orchestrator {
    config: Config,
    provider: Arc<dyn Provider>,
    cancel: CancellationToken,
    run_id: Uuid,
    phase: Arc<watch::Sender<RunPhase>>,
}

impl Orchestrator {
    /// Create a builder.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Identifier of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Observe phase changes.
    pub fn subscribe_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    /// Token that cancels the run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute the run.
    ///
    /// Per-partition failures never fail the run; they show up in the
    /// manifest. Errors are returned for an invalid range (before anything
    /// is created), for local I/O failures while aggregating, and for
    /// rejected provider credentials. The last two are returned only after
    /// cleanup has run and the fleet state is persisted.
    pub async fn run(&self) -> Result<RunReport> {
        let config = &self.config;
        let tracker = Arc::new(PhaseTracker::new(self.phase.clone()));

        tracker.set(RunPhase::Partitioning);
        let partitions = partition_range(config.start, config.end, config.instance_count)?;
        check_worker_bounds(&partitions)?;
        info!(
            run_id = %self.run_id,
            partitions = partitions.len(),
            start = %config.start,
            end = %config.end,
            fleet = %config.fleet.fleet_name,
            "Range partitioned"
        );
        let state = FleetState::with_run_id(self.run_id, partitions);
        tokio::fs::create_dir_all(&config.fleet.output_dir).await?;

        tracker.begin_partitions(state.len());
        tracker.set(RunPhase::Provisioning);

        let worker = Arc::new(PartitionWorker {
            provisioner: Provisioner::new(self.provider.clone(), config, self.run_id),
            monitor: PartitionMonitor::new(self.provider.clone(), config.monitor.clone()),
            collector: Collector::new(
                self.provider.clone(),
                config.collector.clone(),
                config.fleet.output_dir.clone(),
            ),
            semaphore: Semaphore::new(config.provisioner.max_concurrent),
            cancel: self.cancel.clone(),
            tracker: tracker.clone(),
            max_partition_retries: config.monitor.max_partition_retries,
        });

        let mut tasks = JoinSet::new();
        let mut task_partitions = HashMap::new();
        for (partition_id, entry) in state.iter() {
            let worker = worker.clone();
            let entry = entry.clone();
            let handle = tasks.spawn(async move { worker.run_partition(partition_id, entry).await });
            task_partitions.insert(handle.id(), partition_id);
        }

        let mut fatal: Option<String> = None;
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((task_id, Err(e))) => {
                    let partition_id = task_partitions.get(&task_id).copied();
                    if let Error::Authentication(message) = e {
                        error!(
                            partition_id = ?partition_id,
                            error = %message,
                            "Provider authentication failed, stopping the run"
                        );
                        fatal.get_or_insert(message);
                        self.cancel.cancel();
                    } else {
                        error!(partition_id = ?partition_id, error = %e, "Partition task failed");
                    }
                }
                Err(join_error) => {
                    let partition_id = task_partitions.get(&join_error.id()).copied();
                    error!(partition_id = ?partition_id, error = %join_error, "Partition task panicked");
                    if let Some(entry) = partition_id.and_then(|id| state.entry(id)) {
                        entry.lock().await.fail(FailureReason::Internal {
                            message: join_error.to_string(),
                        });
                    }
                }
            }
        }

        let cancelled = self.cancel.is_cancelled() && fatal.is_none();
        for (partition_id, entry) in state.iter() {
            let mut entry = entry.lock().await;
            if !entry.partition.status.is_terminal() {
                warn!(partition_id = %partition_id, status = ?entry.partition.status, "Partition left unfinished");
                entry.fail(if self.cancel.is_cancelled() {
                    FailureReason::Cancelled
                } else {
                    FailureReason::Internal {
                        message: "partition task ended before a terminal state".to_string(),
                    }
                });
            }
        }

        tracker.set(RunPhase::Aggregating);
        let snapshot = state.snapshot().await;
        let aggregated = Aggregator::new(&config.fleet.output_dir, &config.dedup_key_column)
            .aggregate(
                &snapshot,
                ManifestContext {
                    run_id: self.run_id,
                    range_start: config.start,
                    range_end: config.end,
                    cancelled,
                },
            )
            .await;
        if let Err(e) = &aggregated {
            error!(run_id = %self.run_id, error = %e, "Aggregation failed, cleaning up anyway");
        }

        tracker.set(RunPhase::CleaningUp);
        let cleanup = Cleaner::new(
            self.provider.clone(),
            config.force_cleanup,
            config.provisioner.call_timeout,
        )
        .clean(&state)
        .await;

        let state_path = config.fleet.output_dir.join(FleetSnapshot::FILE_NAME);
        if let Err(e) = state.snapshot().await.write_to(&state_path).await {
            warn!(path = %state_path.display(), error = %e, "Failed to persist fleet state");
        }

        tracker.set(RunPhase::Done);

        if let Some(message) = fatal {
            return Err(Error::Authentication(message));
        }
        let manifest = aggregated?;

        info!(
            run_id = %self.run_id,
            complete = manifest.complete,
            contributed = manifest.contributed.len(),
            missing = manifest.missing.len(),
            cancelled,
            "Run finished"
        );

        Ok(RunReport {
            run_id: self.run_id,
            manifest,
            cleanup,
            cancelled,
        })
    }
}

/// Publishes the run phase as partition tasks make progress.
struct PhaseTracker {
    phase: Arc<watch::Sender<RunPhase>>,
    provisioning: AtomicUsize,
    monitoring: AtomicUsize,
}

impl PhaseTracker {
    fn new(phase: Arc<watch::Sender<RunPhase>>) -> Self {
        Self {
            phase,
            provisioning: AtomicUsize::new(0),
            monitoring: AtomicUsize::new(0),
        }
    }

    fn begin_partitions(&self, count: usize) {
        self.provisioning.store(count, Ordering::SeqCst);
        self.monitoring.store(count, Ordering::SeqCst);
    }

    fn set(&self, phase: RunPhase) {
        if self.phase.send_replace(phase) != phase {
            info!(phase = %phase, "Run phase changed");
        }
    }

    /// Move to `to` only while the current phase is one of `from`.
    fn advance(&self, from: &[RunPhase], to: RunPhase) {
        let changed = self.phase.send_if_modified(|current| {
            if from.contains(current) {
                *current = to;
                true
            } else {
                false
            }
        });
        if changed {
            info!(phase = %to, "Run phase changed");
        }
    }

    fn partition_provisioned(&self) {
        if self.provisioning.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.advance(&[RunPhase::Provisioning], RunPhase::Monitoring);
        }
    }

    fn partition_monitored(&self) {
        if self.monitoring.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.advance(
                &[RunPhase::Provisioning, RunPhase::Monitoring],
                RunPhase::Collecting,
            );
        }
    }
}

/// Which phase counters a partition task has already released.
#[derive(Default)]
struct Progress {
    provisioned: bool,
    monitored: bool,
}

impl Progress {
    fn provisioned(&mut self, tracker: &PhaseTracker) {
        if !self.provisioned {
            self.provisioned = true;
            tracker.partition_provisioned();
        }
    }

    fn monitored(&mut self, tracker: &PhaseTracker) {
        self.provisioned(tracker);
        if !self.monitored {
            self.monitored = true;
            tracker.partition_monitored();
        }
    }
}

/// Shared components used by every partition task.
struct PartitionWorker {
    provisioner: Provisioner,
    monitor: PartitionMonitor,
    collector: Collector,
    semaphore: Semaphore,
    cancel: CancellationToken,
    tracker: Arc<PhaseTracker>,
    max_partition_retries: u32,
}

impl PartitionWorker {
    async fn run_partition(
        &self,
        partition_id: PartitionId,
        entry: Arc<Mutex<PartitionEntry>>,
    ) -> Result<()> {
        let mut progress = Progress::default();
        let result = self.drive(partition_id, &entry, &mut progress).await;
        progress.monitored(&self.tracker);
        result
    }

    /// Provision, watch, replace on failure, collect.
    async fn drive(
        &self,
        partition_id: PartitionId,
        entry: &Mutex<PartitionEntry>,
        progress: &mut Progress,
    ) -> Result<()> {
        {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = self.semaphore.acquire() => permit.ok(),
            };
            if permit.is_none() {
                entry.lock().await.fail(FailureReason::Cancelled);
                return Ok(());
            }
            if !self.provision(entry).await? {
                return Ok(());
            }
        }
        progress.provisioned(&self.tracker);

        loop {
            match self.monitor.watch(entry, &self.cancel).await? {
                MonitorOutcome::Completed => {
                    progress.monitored(&self.tracker);
                    return match self.collector.collect(entry, &self.cancel).await {
                        Ok(_) => Ok(()),
                        Err(Error::Cancelled) => {
                            entry.lock().await.fail(FailureReason::Cancelled);
                            Ok(())
                        }
                        Err(Error::Authentication(message)) => Err(Error::Authentication(message)),
                        // Recorded as a missing result by the collector.
                        Err(_) => Ok(()),
                    };
                }
                MonitorOutcome::Cancelled => {
                    entry.lock().await.fail(FailureReason::Cancelled);
                    return Ok(());
                }
                MonitorOutcome::Failed(reason) => {
                    let attempts = {
                        let mut entry = entry.lock().await;
                        entry.fail(reason.clone());
                        entry.attempts
                    };
                    if attempts > self.max_partition_retries {
                        error!(
                            partition_id = %partition_id,
                            attempts,
                            reason = %reason,
                            "Partition failed permanently"
                        );
                        return Ok(());
                    }
                    warn!(
                        partition_id = %partition_id,
                        attempt = attempts + 1,
                        reason = %reason,
                        "Replacing failed instance"
                    );
                    if !self.provision(entry).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns whether the partition has an active instance afterwards.
    async fn provision(&self, entry: &Mutex<PartitionEntry>) -> Result<bool> {
        match self.provisioner.provision(entry, &self.cancel).await {
            Ok(_) => Ok(true),
            Err(Error::Authentication(message)) => Err(Error::Authentication(message)),
            Err(Error::Cancelled) => {
                entry.lock().await.fail(FailureReason::Cancelled);
                Ok(false)
            }
            // Recorded as a provisioning failure by the provisioner.
            Err(_) => Ok(false),
        }
    }
}
