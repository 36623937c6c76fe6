// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Result collection.
//!
//! Copies a completed instance's output into
//! `{output_dir}/partitions/pNNN` and verifies that something non-empty
//! arrived before recording the [`ExtractionResult`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, FailureReason, Result};
use crate::partition::PartitionId;
use crate::provider::{Provider, ProviderError};
use crate::retry::{RetryBackoff, RetryDisposition, RetryError, retry_with_backoff};
use crate::state::{ExtractionResult, PartitionEntry};

/// Transfer retry settings.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Transfer attempts before the partition is flagged missing-result
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
    /// Time budget of one transfer
    pub call_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            call_timeout: Duration::from_secs(600),
        }
    }
}

/// Local directory holding one partition's collected output.
pub fn partition_dir(output_dir: &Path, partition_id: PartitionId) -> PathBuf {
    output_dir.join("partitions").join(partition_id.to_string())
}

/// Why a single transfer attempt did not produce a result.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("local I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer produced no data")]
    Empty,
}

/// Transfers results from completed instances.
pub struct Collector {
    provider: Arc<dyn Provider>,
    config: CollectorConfig,
    output_dir: PathBuf,
}

impl Collector {
    /// Create a collector writing below `output_dir`.
    pub fn new(provider: Arc<dyn Provider>, config: CollectorConfig, output_dir: PathBuf) -> Self {
        Self {
            provider,
            config,
            output_dir,
        }
    }

    /// Collect the output of the entry's current instance.
    ///
    /// On success the result is recorded and the partition is `Completed`.
    /// After exhausting retries the partition is marked failed with
    /// [`FailureReason::MissingResult`] and [`Error::Transfer`] is returned.
    pub async fn collect(
        &self,
        entry: &Mutex<PartitionEntry>,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult> {
        let (partition_id, name) = {
            let entry = entry.lock().await;
            let name = entry
                .instance
                .as_ref()
                .map(|i| i.name.clone())
                .ok_or_else(|| Error::Other(format!("partition {} has no instance", entry.partition.id)))?;
            (entry.partition.id, name)
        };
        let local_dir = partition_dir(&self.output_dir, partition_id);

        let backoff = RetryBackoff::new(
            self.config.initial_backoff,
            self.config.max_backoff,
            self.config.max_attempts,
        )
        .with_cancellation(cancel);

        let outcome = retry_with_backoff(
            backoff,
            |_| self.attempt(partition_id, &name, &local_dir),
            |attempt, delay, err, will_retry| {
                warn!(
                    partition_id = %partition_id,
                    instance = %name,
                    attempt,
                    error = %err,
                    will_retry,
                    retry_in_ms = delay.as_millis() as u64,
                    "Result transfer failed"
                );
            },
            |_, err| match err {
                AttemptError::Provider(ProviderError::Authentication(_))
                | AttemptError::Provider(ProviderError::NotFound(_)) => RetryDisposition::Abort,
                _ => RetryDisposition::Retry,
            },
        )
        .await;

        // A transfer that finished after cancellation is not recorded.
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match outcome {
            Ok(result) => {
                info!(
                    partition_id = %partition_id,
                    instance = %name,
                    bytes = result.byte_count,
                    files = result.files.len(),
                    path = %result.local_path.display(),
                    "Results collected"
                );
                entry.lock().await.record_result(result.clone());
                Ok(result)
            }
            Err(RetryError::Aborted {
                error: AttemptError::Provider(ProviderError::Authentication(message)),
                ..
            }) => Err(Error::Authentication(message)),
            Err(RetryError::Aborted { attempts, error })
            | Err(RetryError::Exhausted {
                attempts,
                last: error,
            }) => {
                error!(
                    partition_id = %partition_id,
                    instance = %name,
                    attempts,
                    error = %error,
                    "Results could not be collected"
                );
                let message = error.to_string();
                entry.lock().await.fail(FailureReason::MissingResult {
                    attempts,
                    message: message.clone(),
                });
                Err(Error::Transfer {
                    partition_id,
                    attempts,
                    message,
                })
            }
            Err(RetryError::Cancelled) => Err(Error::Cancelled),
        }
    }

    /// One transfer into a freshly cleared directory.
    async fn attempt(
        &self,
        partition_id: PartitionId,
        name: &str,
        local_dir: &Path,
    ) -> std::result::Result<ExtractionResult, AttemptError> {
        if tokio::fs::try_exists(local_dir).await? {
            tokio::fs::remove_dir_all(local_dir).await?;
        }
        tokio::fs::create_dir_all(local_dir).await?;

        tokio::time::timeout(
            self.config.call_timeout,
            self.provider.transfer_output(name, local_dir),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout(self.config.call_timeout)))?;

        let (files, byte_count) = inspect_dir(local_dir).await?;
        if byte_count == 0 {
            return Err(AttemptError::Empty);
        }

        Ok(ExtractionResult {
            partition_id,
            local_path: local_dir.to_path_buf(),
            byte_count,
            files,
        })
    }
}

/// List regular files below `dir` (recursively) and sum their sizes.
async fn inspect_dir(dir: &Path) -> std::io::Result<(Vec<PathBuf>, u64)> {
    let mut files = Vec::new();
    let mut total = 0u64;
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata().await?.len();
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok((files, total))
}
