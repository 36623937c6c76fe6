// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-partition progress monitor.
//!
//! One [`PartitionMonitor::watch`] call runs per active instance. Each poll
//! asks the provider for the instance's health and, once it is up, reads the
//! completion marker. The loop ends when the worker reports a terminal
//! status, the instance dies, the partition's timeout elapses, or the run is
//! cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, FailureReason, Result};
use crate::marker::MarkerStatus;
use crate::partition::{PartitionStatus, WorkPartition};
use crate::provider::{HealthState, Provider, ProviderError};
use crate::state::{LifecycleState, PartitionEntry};

/// Configuration for the partition monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between polls of one instance.
    pub poll_interval: Duration,
    /// Minimum time a partition is given to finish.
    pub timeout_floor: Duration,
    /// Time allowed per hour of the partition's span.
    pub timeout_per_span_hour: Duration,
    /// Replacement instances allowed per partition after the first one fails.
    pub max_partition_retries: u32,
    /// Failed polls in a row before the instance counts as unreachable.
    pub max_consecutive_poll_errors: u32,
    /// Time budget of each provider call.
    pub call_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            timeout_floor: Duration::from_secs(3600),
            timeout_per_span_hour: Duration::from_secs(600), // 4h for a one-day partition
            max_partition_retries: 2,
            max_consecutive_poll_errors: 5,
            call_timeout: Duration::from_secs(120),
        }
    }
}

impl MonitorConfig {
    /// Time a partition's instance gets to write a terminal marker.
    pub fn timeout_for(&self, partition: &WorkPartition) -> Duration {
        let scaled = self
            .timeout_per_span_hour
            .mul_f64(partition.span_hours().max(0.0));
        scaled.max(self.timeout_floor)
    }
}

/// How watching an instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// The worker wrote a COMPLETED marker.
    Completed,
    /// The instance failed; the partition may be re-provisioned.
    Failed(FailureReason),
    /// The run was cancelled while watching.
    Cancelled,
}

/// Result of one successful poll.
struct Observation {
    health: HealthState,
    marker: Option<MarkerStatus>,
}

/// Polls one partition's instance until it reaches a terminal state.
pub struct PartitionMonitor {
    provider: Arc<dyn Provider>,
    config: MonitorConfig,
}

impl PartitionMonitor {
    /// Create a new monitor.
    pub fn new(provider: Arc<dyn Provider>, config: MonitorConfig) -> Self {
        Self { provider, config }
    }

    /// Configuration in use.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Watch the entry's current instance.
    ///
    /// Updates the instance lifecycle (`Booting`, `Running`) and the
    /// partition status (`Running`) as polls come in, but leaves terminal
    /// bookkeeping to the caller. Only an authentication failure is
    /// returned as an error.
    pub async fn watch(
        &self,
        entry: &Mutex<PartitionEntry>,
        cancel: &CancellationToken,
    ) -> Result<MonitorOutcome> {
        let (name, partition) = {
            let entry = entry.lock().await;
            match entry.active_instance() {
                Some(instance) => (instance.name.clone(), entry.partition.clone()),
                None => {
                    return Ok(MonitorOutcome::Failed(FailureReason::Internal {
                        message: "no active instance to monitor".to_string(),
                    }));
                }
            }
        };

        let timeout = self.config.timeout_for(&partition);
        let deadline = Instant::now() + timeout;
        let mut consecutive_errors = 0u32;

        info!(
            partition_id = %partition.id,
            instance = %name,
            timeout_secs = timeout.as_secs(),
            "Monitoring instance"
        );

        loop {
            if cancel.is_cancelled() {
                return Ok(MonitorOutcome::Cancelled);
            }
            if Instant::now() >= deadline {
                let err = Error::MonitorTimeout {
                    partition_id: partition.id,
                    timeout_secs: timeout.as_secs(),
                };
                warn!(partition_id = %partition.id, instance = %name, error = %err, "Monitor timeout");
                return Ok(MonitorOutcome::Failed(FailureReason::MonitorTimeout {
                    timeout_secs: timeout.as_secs(),
                }));
            }

            let polled = self.poll(&name).await;
            // A poll that raced with cancellation is discarded.
            if cancel.is_cancelled() {
                return Ok(MonitorOutcome::Cancelled);
            }

            match polled {
                Ok(observation) => {
                    consecutive_errors = 0;
                    debug!(
                        partition_id = %partition.id,
                        instance = %name,
                        health = %observation.health,
                        marker = ?observation.marker,
                        "Polled instance"
                    );
                    if let Some(outcome) = self.apply(entry, &name, observation).await {
                        return Ok(outcome);
                    }
                }
                Err(ProviderError::NotFound(_)) => {
                    warn!(partition_id = %partition.id, instance = %name, "Instance disappeared");
                    return Ok(MonitorOutcome::Failed(FailureReason::InstanceStopped {
                        state: "NOT_FOUND".to_string(),
                    }));
                }
                Err(ProviderError::Authentication(message)) => {
                    return Err(Error::Authentication(message));
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        partition_id = %partition.id,
                        instance = %name,
                        consecutive_errors,
                        error = %e,
                        "Poll failed"
                    );
                    if consecutive_errors >= self.config.max_consecutive_poll_errors {
                        return Ok(MonitorOutcome::Failed(FailureReason::Unreachable {
                            consecutive_errors,
                            message: e.to_string(),
                        }));
                    }
                }
            }

            let wake_at = (Instant::now() + self.config.poll_interval).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(MonitorOutcome::Cancelled),
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Query health, then the marker once the instance is up.
    async fn poll(&self, name: &str) -> std::result::Result<Observation, ProviderError> {
        let health = self.call(self.provider.describe_instance(name)).await?;
        let marker = if health == HealthState::Running {
            self.call(self.provider.read_marker(name)).await?
        } else {
            None
        };
        Ok(Observation { health, marker })
    }

    /// Fold one observation into the entry. Returns an outcome when watching
    /// should stop.
    async fn apply(
        &self,
        entry: &Mutex<PartitionEntry>,
        name: &str,
        observation: Observation,
    ) -> Option<MonitorOutcome> {
        let mut entry = entry.lock().await;
        let partition_id = entry.partition.id;

        match &observation.health {
            HealthState::Provisioning => {
                entry.set_instance_state(LifecycleState::Booting);
            }
            HealthState::Running => {
                if entry.partition.status != PartitionStatus::Running {
                    info!(partition_id = %partition_id, instance = %name, "Instance running");
                }
                entry.set_instance_state(LifecycleState::Running);
                entry.partition.status = PartitionStatus::Running;
            }
            HealthState::Stopping | HealthState::Stopped => {
                warn!(
                    partition_id = %partition_id,
                    instance = %name,
                    health = %observation.health,
                    "Instance stopped unexpectedly"
                );
                return Some(MonitorOutcome::Failed(FailureReason::InstanceStopped {
                    state: observation.health.to_string(),
                }));
            }
            HealthState::Unknown(state) => {
                debug!(partition_id = %partition_id, instance = %name, state = %state, "Unknown instance state");
            }
        }

        match observation.marker {
            Some(MarkerStatus::Completed) => {
                info!(partition_id = %partition_id, instance = %name, "Worker completed");
                Some(MonitorOutcome::Completed)
            }
            Some(MarkerStatus::Failed) => {
                warn!(partition_id = %partition_id, instance = %name, "Worker reported failure");
                Some(MonitorOutcome::Failed(FailureReason::WorkerFailed))
            }
            Some(MarkerStatus::Running) | None => None,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionId;
    use chrono::{TimeZone, Utc};

    fn partition(hours: i64) -> WorkPartition {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        WorkPartition {
            id: PartitionId(0),
            start,
            end: start + chrono::Duration::hours(hours),
            status: PartitionStatus::Pending,
        }
    }

    #[test]
    fn test_timeout_scales_with_span() {
        let config = MonitorConfig::default();
        assert_eq!(config.timeout_for(&partition(24)), Duration::from_secs(4 * 3600));
    }

    #[test]
    fn test_timeout_has_floor() {
        let config = MonitorConfig::default();
        assert_eq!(config.timeout_for(&partition(1)), Duration::from_secs(3600));
    }
}
