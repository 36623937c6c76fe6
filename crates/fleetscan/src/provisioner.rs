// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance provisioning.
//!
//! Instance names are derived from the run id, the partition id and a
//! replacement counter, so retrying a create never produces a second
//! instance: before creating, the provisioner looks the name up and adopts
//! an existing instance instead. Instances left behind by earlier runs carry
//! a different run tag and are never adopted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bootstrap::{BootConfig, ExtractionParams};
use crate::config::Config;
use crate::error::{Error, FailureReason, Result};
use crate::partition::PartitionId;
use crate::provider::{InstanceHandle, InstanceSpec, Provider, ProviderError};
use crate::retry::{RetryBackoff, RetryDisposition, RetryError, retry_with_backoff};
use crate::state::{Instance, LifecycleState, PartitionEntry};

/// Provisioning retry and concurrency settings.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Create attempts per instance before the partition fails
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
    /// Time budget of each provider call
    pub call_timeout: Duration,
    /// Instances created concurrently during initial provisioning
    pub max_concurrent: usize,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            call_timeout: Duration::from_secs(120),
            max_concurrent: 10,
        }
    }
}

/// Short tag identifying a run in instance names.
pub fn run_tag(run_id: Uuid) -> String {
    run_id.simple().to_string()[..8].to_string()
}

/// Deterministic name of the `replacement`-th instance of a partition.
pub fn instance_name(
    fleet_name: &str,
    run_tag: &str,
    partition_id: PartitionId,
    replacement: u32,
) -> String {
    format!(
        "{}-{}-p{:03}-r{}",
        fleet_name, run_tag, partition_id.0, replacement
    )
}

/// Creates instances for partitions.
pub struct Provisioner {
    provider: Arc<dyn Provider>,
    config: ProvisionerConfig,
    fleet_name: String,
    run_id: Uuid,
    run_tag: String,
    zone: String,
    machine_type: String,
    data_source_urls: Vec<String>,
    extraction: ExtractionParams,
}

impl Provisioner {
    /// Create a provisioner for run `run_id` of the fleet described by
    /// `config`.
    pub fn new(provider: Arc<dyn Provider>, config: &Config, run_id: Uuid) -> Self {
        Self {
            provider,
            config: config.provisioner.clone(),
            fleet_name: config.fleet.fleet_name.clone(),
            run_id,
            run_tag: run_tag(run_id),
            zone: config.fleet.zone.clone(),
            machine_type: config.machine_type.clone(),
            data_source_urls: config.data_source_urls.clone(),
            extraction: config.extraction.clone(),
        }
    }

    /// Ensure the partition has an active instance.
    ///
    /// Returns the existing active instance if there is one. Otherwise the
    /// next replacement is created (or adopted, if an instance with its name
    /// already exists) and attached to the entry.
    ///
    /// On exhausted retries the partition is marked failed and
    /// [`Error::Provision`] is returned. Authentication failures return
    /// [`Error::Authentication`] without touching the entry.
    pub async fn provision(
        &self,
        entry: &Mutex<PartitionEntry>,
        cancel: &CancellationToken,
    ) -> Result<Instance> {
        let (spec, replacement) = {
            let entry = entry.lock().await;
            if let Some(instance) = entry.active_instance() {
                info!(
                    partition_id = %entry.partition.id,
                    instance = %instance.name,
                    "Partition already has an active instance"
                );
                return Ok(instance.clone());
            }

            let replacement = entry.attempts;
            let partition = &entry.partition;
            let spec = InstanceSpec {
                name: instance_name(&self.fleet_name, &self.run_tag, partition.id, replacement),
                partition_id: partition.id,
                zone: self.zone.clone(),
                machine_type: self.machine_type.clone(),
                boot: BootConfig::for_partition(partition, &self.data_source_urls, &self.extraction),
                labels: BTreeMap::from([
                    ("fleet".to_string(), self.fleet_name.clone()),
                    ("run".to_string(), self.run_id.simple().to_string()),
                    ("partition".to_string(), partition.id.0.to_string()),
                ]),
            };
            (spec, replacement)
        };
        let partition_id = spec.partition_id;

        let backoff = RetryBackoff::new(
            self.config.initial_backoff,
            self.config.max_backoff,
            self.config.max_attempts,
        )
        .with_cancellation(cancel);

        let outcome = retry_with_backoff(
            backoff,
            |_| self.create_or_adopt(&spec),
            |attempt, delay, err, will_retry| {
                warn!(
                    partition_id = %partition_id,
                    instance = %spec.name,
                    attempt,
                    error = %err,
                    will_retry,
                    retry_in_ms = delay.as_millis() as u64,
                    "Create instance failed"
                );
            },
            |_, err| match err {
                ProviderError::Authentication(_) => RetryDisposition::Abort,
                e if e.is_transient() => RetryDisposition::Retry,
                _ => RetryDisposition::Abort,
            },
        )
        .await;

        match outcome {
            Ok(handle) => {
                let instance = Instance {
                    name: handle.name.clone(),
                    partition_id,
                    zone: handle.zone,
                    machine_type: spec.machine_type.clone(),
                    lifecycle_state: LifecycleState::Requested,
                    created_at: handle.created_at,
                };
                // Record even when cancelled so the cleaner can delete it.
                entry.lock().await.attach_instance(instance.clone());

                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                info!(
                    partition_id = %partition_id,
                    instance = %instance.name,
                    replacement,
                    adopted = handle.adopted,
                    "Instance provisioned"
                );
                Ok(instance)
            }
            Err(RetryError::Aborted {
                error: ProviderError::Authentication(message),
                ..
            }) => {
                error!(partition_id = %partition_id, error = %message, "Provider rejected credentials");
                Err(Error::Authentication(message))
            }
            Err(RetryError::Aborted { attempts, error })
            | Err(RetryError::Exhausted {
                attempts,
                last: error,
            }) => {
                error!(
                    partition_id = %partition_id,
                    instance = %spec.name,
                    attempts,
                    error = %error,
                    "Provisioning failed permanently"
                );
                entry.lock().await.fail(FailureReason::ProvisionFailed {
                    attempts,
                    message: error.to_string(),
                });
                Err(Error::Provision {
                    partition_id,
                    attempts,
                    source: error,
                })
            }
            Err(RetryError::Cancelled) => Err(Error::Cancelled),
        }
    }

    /// One create attempt: adopt the instance if the name is taken already.
    async fn create_or_adopt(&self, spec: &InstanceSpec) -> std::result::Result<InstanceHandle, ProviderError> {
        let adopted = InstanceHandle {
            name: spec.name.clone(),
            zone: spec.zone.clone(),
            created_at: chrono::Utc::now(),
            adopted: true,
        };

        match self.call(self.provider.describe_instance(&spec.name)).await {
            Ok(health) => {
                info!(instance = %spec.name, health = %health, "Adopting existing instance");
                return Ok(adopted);
            }
            Err(ProviderError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        match self.call(self.provider.create_instance(spec)).await {
            Ok(handle) => Ok(handle),
            Err(ProviderError::AlreadyExists(_)) => {
                info!(instance = %spec.name, "Instance appeared concurrently, adopting");
                Ok(adopted)
            }
            Err(e) => Err(e),
        }
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = std::result::Result<T, ProviderError>>,
    ) -> std::result::Result<T, ProviderError> {
        tokio::time::timeout(self.config.call_timeout, fut)
            .await
            .unwrap_or(Err(ProviderError::Timeout(self.config.call_timeout)))
    }
}
