// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet teardown.
//!
//! An instance is deleted only when its partition's result has been
//! collected, when the run was cancelled before the partition finished, or
//! when force cleanup is requested. Everything else stays up for
//! inspection.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::FailureReason;
use crate::provider::{InstanceFilter, Provider, ProviderError};
use crate::state::{FleetState, LifecycleState, PartitionEntry};

/// A deletion that did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    /// Instance name
    pub instance: String,
    /// Provider error
    pub message: String,
}

/// What the cleaner did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Instances deleted (or already gone)
    pub deleted: Vec<String>,
    /// Instances deliberately left running
    pub retained: Vec<String>,
    /// Deletions that failed
    pub errors: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// Whether every attempted deletion succeeded.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Why the instances of a partition may be deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Collected,
    Cancelled,
    Forced,
    Retain,
}

fn verdict(entry: &PartitionEntry, force: bool) -> Verdict {
    if entry.is_collected() {
        Verdict::Collected
    } else if entry.failure == Some(FailureReason::Cancelled) {
        Verdict::Cancelled
    } else if force {
        Verdict::Forced
    } else {
        Verdict::Retain
    }
}

/// Deletes fleet instances.
pub struct Cleaner {
    provider: Arc<dyn Provider>,
    force: bool,
    call_timeout: Duration,
}

impl Cleaner {
    /// Create a cleaner. With `force`, instances of failed partitions are
    /// deleted too.
    pub fn new(provider: Arc<dyn Provider>, force: bool, call_timeout: Duration) -> Self {
        Self {
            provider,
            force,
            call_timeout,
        }
    }

    /// Delete or retain every instance recorded in `state`.
    pub async fn clean(&self, state: &FleetState) -> CleanupReport {
        let mut report = CleanupReport::default();

        for (partition_id, entry) in state.iter() {
            let (verdict, names) = {
                let entry = entry.lock().await;
                let names: Vec<String> = entry
                    .instances()
                    .filter(|i| i.lifecycle_state != LifecycleState::Terminated)
                    .map(|i| i.name.clone())
                    .collect();
                (verdict(&entry, self.force), names)
            };
            if names.is_empty() {
                continue;
            }

            if verdict == Verdict::Retain {
                for name in names {
                    warn!(
                        partition_id = %partition_id,
                        instance = %name,
                        "Leaving instance of failed partition running for inspection"
                    );
                    report.retained.push(name);
                }
                continue;
            }

            let mut deleted = Vec::new();
            for name in names {
                if verdict == Verdict::Forced {
                    error!(
                        partition_id = %partition_id,
                        instance = %name,
                        "Deleting instance of failed partition"
                    );
                }
                if self.delete(&name, &mut report).await {
                    deleted.push(name);
                }
            }

            let mut entry = entry.lock().await;
            for instance in entry.instances_mut() {
                if deleted.contains(&instance.name) {
                    instance.lifecycle_state = LifecycleState::Terminated;
                }
            }
        }

        info!(
            deleted = report.deleted.len(),
            retained = report.retained.len(),
            errors = report.errors.len(),
            "Cleanup finished"
        );
        report
    }

    /// Delete every instance matching `filter`, regardless of run state.
    pub async fn teardown(&self, filter: &InstanceFilter) -> Result<CleanupReport, ProviderError> {
        let mut report = CleanupReport::default();
        let instances = tokio::time::timeout(self.call_timeout, self.provider.list_instances(filter))
            .await
            .unwrap_or(Err(ProviderError::Timeout(self.call_timeout)))?;

        for instance in instances {
            info!(instance = %instance.name, health = %instance.health, "Tearing down instance");
            self.delete(&instance.name, &mut report).await;
        }
        Ok(report)
    }

    /// Delete one instance; a missing instance counts as deleted.
    async fn delete(&self, name: &str, report: &mut CleanupReport) -> bool {
        let result = tokio::time::timeout(self.call_timeout, self.provider.delete_instance(name))
            .await
            .unwrap_or(Err(ProviderError::Timeout(self.call_timeout)));

        match result {
            Ok(()) => {
                info!(instance = %name, "Instance deleted");
            }
            Err(ProviderError::NotFound(_)) => {
                info!(instance = %name, "Instance already gone");
            }
            Err(e) => {
                error!(instance = %name, error = %e, "Failed to delete instance");
                report.errors.push(CleanupFailure {
                    instance: name.to_string(),
                    message: e.to_string(),
                });
                return false;
            }
        }
        report.deleted.push(name.to_string());
        true
    }
}
