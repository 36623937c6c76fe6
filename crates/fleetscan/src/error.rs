// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fleetscan.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::partition::PartitionId;
use crate::provider::ProviderError;

/// Fleet orchestration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The requested time range cannot be partitioned. Fatal before any provisioning.
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Provisioning an instance failed after exhausting retries.
    #[error("Provision error for partition {partition_id} after {attempts} attempt(s): {source}")]
    Provision {
        /// Partition that could not be provisioned.
        partition_id: PartitionId,
        /// Number of create attempts made.
        attempts: u32,
        /// Last provider error.
        #[source]
        source: ProviderError,
    },

    /// A partition exceeded its allotted monitoring duration.
    #[error("Partition {partition_id} exceeded its monitoring timeout of {timeout_secs}s")]
    MonitorTimeout {
        /// Partition that timed out.
        partition_id: PartitionId,
        /// The timeout that elapsed, in seconds.
        timeout_secs: u64,
    },

    /// Transferring results from an instance failed after exhausting retries.
    #[error("Transfer error for partition {partition_id} after {attempts} attempt(s): {message}")]
    Transfer {
        /// Partition whose results are missing.
        partition_id: PartitionId,
        /// Number of transfer attempts made.
        attempts: u32,
        /// Description of the last failure.
        message: String,
    },

    /// The provider rejected our credentials. Fatal to the whole run.
    #[error("Provider authentication failed: {0}")]
    Authentication(String),

    /// Provider call failed.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV reading or writing failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The run was cancelled before the operation finished.
    #[error("Operation cancelled")]
    Cancelled,

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using fleetscan Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a partition ended up without a collected result.
///
/// Stored in the fleet state and copied into the manifest so operators can
/// see what went wrong with each missing partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Instance creation kept failing.
    ProvisionFailed {
        /// Number of create attempts made.
        attempts: u32,
        /// Last provider error.
        message: String,
    },
    /// The worker wrote a FAILED marker.
    WorkerFailed,
    /// The instance stopped or disappeared while the worker was running.
    InstanceStopped {
        /// Last observed provider state.
        state: String,
    },
    /// Provider calls for the instance failed repeatedly.
    Unreachable {
        /// Consecutive failed polls.
        consecutive_errors: u32,
        /// Last provider error.
        message: String,
    },
    /// No completion marker within the partition's timeout.
    MonitorTimeout {
        /// The timeout that elapsed, in seconds.
        timeout_secs: u64,
    },
    /// Extraction finished but its output could not be collected.
    MissingResult {
        /// Number of transfer attempts made.
        attempts: u32,
        /// Last transfer failure.
        message: String,
    },
    /// The run was cancelled before the partition finished.
    Cancelled,
    /// The partition task ended unexpectedly.
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProvisionFailed { attempts, message } => {
                write!(f, "provisioning failed after {} attempt(s): {}", attempts, message)
            }
            Self::WorkerFailed => write!(f, "worker reported FAILED"),
            Self::InstanceStopped { state } => write!(f, "instance stopped unexpectedly ({})", state),
            Self::Unreachable {
                consecutive_errors,
                message,
            } => write!(
                f,
                "instance unreachable after {} consecutive poll errors: {}",
                consecutive_errors, message
            ),
            Self::MonitorTimeout { timeout_secs } => {
                write!(f, "no completion marker within {}s", timeout_secs)
            }
            Self::MissingResult { attempts, message } => write!(
                f,
                "result transfer failed after {} attempt(s): {}",
                attempts, message
            ),
            Self::Cancelled => write!(f, "run cancelled"),
            Self::Internal { message } => write!(f, "internal error: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_serializes_with_kind_tag() {
        let reason = FailureReason::MonitorTimeout { timeout_secs: 3600 };
        let json = serde_json::to_string(&reason).unwrap();
        assert!(json.contains("\"kind\":\"monitor_timeout\""));
        assert!(json.contains("\"timeout_secs\":3600"));
    }

    #[test]
    fn test_failure_reason_display() {
        let reason = FailureReason::MissingResult {
            attempts: 4,
            message: "no artifacts".to_string(),
        };
        let msg = reason.to_string();
        assert!(msg.contains("4 attempt(s)"));
        assert!(msg.contains("no artifacts"));
    }

    #[test]
    fn test_provision_error_display() {
        let err = Error::Provision {
            partition_id: PartitionId(3),
            attempts: 5,
            source: ProviderError::Transient("quota exceeded".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("p003"));
        assert!(msg.contains("5 attempt(s)"));
        assert!(msg.contains("quota exceeded"));
    }
}
