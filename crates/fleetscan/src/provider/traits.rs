// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider trait definitions.
//!
//! Defines the abstract interface the orchestrator uses to manage cloud instances.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bootstrap::BootConfig;
use crate::marker::MarkerStatus;
use crate::partition::PartitionId;

/// Errors from provider operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// Instance does not exist.
    #[error("Instance not found: {0}")]
    NotFound(String),

    /// An instance with this name already exists.
    #[error("Instance already exists: {0}")]
    AlreadyExists(String),

    /// Credentials were rejected or are missing.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The call did not finish within its time budget.
    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    /// Temporary failure (quota, rate limit, network), safe to retry.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// The provider command exited unsuccessfully.
    #[error("Command failed (exit code {exit_code:?}): {stderr}")]
    CommandFailed {
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Standard error output.
        stderr: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

impl ProviderError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Transient(_) | Self::CommandFailed { .. } | Self::Io(_)
        )
    }
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Power/health state of an instance as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Being created or booted
    Provisioning,
    /// Powered on
    Running,
    /// Shutting down
    Stopping,
    /// Stopped, suspended or terminated
    Stopped,
    /// State string the provider returned that we do not know
    Unknown(String),
}

impl HealthState {
    /// Map a provider status string (e.g. GCE `RUNNING`, `STAGING`) to a state.
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "PROVISIONING" | "STAGING" | "REPAIRING" => Self::Provisioning,
            "RUNNING" => Self::Running,
            "STOPPING" | "SUSPENDING" => Self::Stopping,
            "STOPPED" | "SUSPENDED" | "TERMINATED" => Self::Stopped,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Whether the instance is booting or running.
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Provisioning | Self::Running)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "PROVISIONING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Unknown(s) => write!(f, "{}", s),
        }
    }
}

/// Everything needed to create one instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// Deterministic instance name
    pub name: String,
    /// Partition the instance works on
    pub partition_id: PartitionId,
    /// Zone to create the instance in
    pub zone: String,
    /// Machine type
    pub machine_type: String,
    /// Boot payload for the worker
    pub boot: BootConfig,
    /// Labels attached to the instance
    pub labels: BTreeMap<String, String>,
}

/// Handle for a created (or adopted) instance.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    /// Instance name
    pub name: String,
    /// Zone the instance lives in
    pub zone: String,
    /// When we observed the instance being created
    pub created_at: DateTime<Utc>,
    /// True if the instance already existed and was not created by this call
    pub adopted: bool,
}

/// Filter for listing instances.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    /// Only instances whose name starts with this prefix
    pub name_prefix: Option<String>,
}

impl InstanceFilter {
    /// Filter by name prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: Some(prefix.into()),
        }
    }

    /// Whether `name` passes the filter.
    pub fn matches(&self, name: &str) -> bool {
        self.name_prefix
            .as_deref()
            .map(|p| name.starts_with(p))
            .unwrap_or(true)
    }
}

/// One row of [`Provider::list_instances`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    /// Instance name
    pub name: String,
    /// Zone
    pub zone: String,
    /// Current health state
    pub health: HealthState,
}

/// Trait for cloud providers.
///
/// Providers are PURE infrastructure adapters - they do NOT touch fleet state.
/// Status bookkeeping is handled by the caller. Every method may block on
/// network I/O; callers bound them with timeouts.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider type identifier (e.g., "gcloud", "mock")
    fn provider_type(&self) -> &'static str;

    /// Create an instance. Fails with [`ProviderError::AlreadyExists`] if the
    /// name is taken.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceHandle>;

    /// Delete an instance. Fails with [`ProviderError::NotFound`] if it is gone.
    async fn delete_instance(&self, name: &str) -> Result<()>;

    /// Query power/health state. Fails with [`ProviderError::NotFound`] if the
    /// instance does not exist.
    async fn describe_instance(&self, name: &str) -> Result<HealthState>;

    /// List instances matching `filter`.
    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceSummary>>;

    /// Read the completion marker. `Ok(None)` means no marker yet.
    async fn read_marker(&self, name: &str) -> Result<Option<MarkerStatus>>;

    /// Copy the instance's output directory into `local_dir`.
    async fn transfer_output(&self, name: &str, local_dir: &Path) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_parse() {
        assert_eq!(HealthState::parse("RUNNING\n"), HealthState::Running);
        assert_eq!(HealthState::parse("staging"), HealthState::Provisioning);
        assert_eq!(HealthState::parse("TERMINATED"), HealthState::Stopped);
        assert_eq!(
            HealthState::parse("WEIRD"),
            HealthState::Unknown("WEIRD".to_string())
        );
        assert!(!HealthState::Stopping.is_alive());
    }

    #[test]
    fn test_filter_matches_prefix() {
        let filter = InstanceFilter::with_prefix("eth-");
        assert!(filter.matches("eth-p000-r0"));
        assert!(!filter.matches("ethereum-p000-r0"));
        assert!(InstanceFilter::default().matches("anything"));
    }

    #[test]
    fn test_transient_errors() {
        assert!(ProviderError::Timeout(std::time::Duration::from_secs(1)).is_transient());
        assert!(!ProviderError::NotFound("x".to_string()).is_transient());
        assert!(!ProviderError::Authentication("x".to_string()).is_transient());
    }
}
