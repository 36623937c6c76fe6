// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Google Compute Engine provider backed by the `gcloud` CLI.
//!
//! Every operation shells out to `gcloud compute ...`. Markers are read over
//! `gcloud compute ssh` and results copied with `gcloud compute scp`.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::bootstrap::startup_script;
use crate::config::Config;
use crate::marker::{MARKER_PATH, MarkerStatus, REMOTE_OUTPUT_DIR};
use crate::provider::{
    HealthState, InstanceFilter, InstanceHandle, InstanceSpec, InstanceSummary, Provider,
    ProviderError, Result,
};

/// gcloud provider configuration
#[derive(Debug, Clone)]
pub struct GcloudConfig {
    /// Path or name of the gcloud binary
    pub gcloud_bin: PathBuf,
    /// GCP project id
    pub project_id: String,
    /// Zone used for describe/delete/ssh calls
    pub zone: String,
    /// Boot disk size (e.g. "20GB")
    pub boot_disk_size: String,
    /// Image family for new instances
    pub image_family: String,
    /// Project hosting the image family
    pub image_project: String,
    /// Git repository of the worker cloned by the startup script.
    /// Only needed for creating instances.
    pub worker_repo: Option<String>,
    /// Directory for temporary startup-script files
    pub scratch_dir: PathBuf,
}

impl GcloudConfig {
    /// Configuration for `project_id`/`zone` with default image and disk.
    pub fn new(project_id: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            gcloud_bin: PathBuf::from("gcloud"),
            project_id: project_id.into(),
            zone: zone.into(),
            boot_disk_size: "20GB".to_string(),
            image_family: "ubuntu-2204-lts".to_string(),
            image_project: "ubuntu-os-cloud".to_string(),
            worker_repo: None,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Derive the provider configuration from the run configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            boot_disk_size: config.boot_disk_size.clone(),
            worker_repo: config.worker_repo.clone(),
            ..Self::new(&config.fleet.project_id, &config.fleet.zone)
        }
    }

    /// Use a specific gcloud binary.
    pub fn with_gcloud_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.gcloud_bin = bin.into();
        self
    }
}

/// Provider that drives Compute Engine through the gcloud CLI.
pub struct GcloudProvider {
    config: GcloudConfig,
}

impl GcloudProvider {
    /// Create a new gcloud provider.
    pub fn new(config: GcloudConfig) -> Self {
        Self { config }
    }

    /// Build a `gcloud compute` command with project and quiet flags applied.
    fn compute(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.config.gcloud_bin);
        cmd.arg("compute")
            .args(args)
            .args(["--project", &self.config.project_id, "--quiet"])
            .kill_on_drop(true);
        cmd
    }

    async fn output(&self, mut cmd: Command, name: &str) -> Result<Output> {
        debug!(instance = %name, command = ?cmd.as_std(), "Running gcloud");
        let output = cmd.output().await?;
        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            Err(classify_failure(name, output.status.code(), &stderr))
        }
    }
}

/// Map a failed gcloud invocation onto a [`ProviderError`].
pub fn classify_failure(name: &str, exit_code: Option<i32>, stderr: &str) -> ProviderError {
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("already exists") {
        ProviderError::AlreadyExists(name.to_string())
    } else if lower.contains("was not found") || lower.contains("notfound") {
        ProviderError::NotFound(name.to_string())
    } else if lower.contains("reauthentication")
        || lower.contains("not currently have an active account")
        || lower.contains("invalid_grant")
        || lower.contains("unauthenticated")
        || lower.contains("permission_denied")
        || lower.contains("required 'compute.")
    {
        ProviderError::Authentication(stderr.trim().to_string())
    } else if lower.contains("quota")
        || lower.contains("rate limit")
        || lower.contains("resource_exhausted")
        || lower.contains("unavailable")
        || lower.contains("try again")
    {
        ProviderError::Transient(stderr.trim().to_string())
    } else {
        ProviderError::CommandFailed {
            exit_code,
            stderr: stderr.trim().to_string(),
        }
    }
}

/// Render instance labels as a gcloud `--labels` value.
fn labels_arg(spec: &InstanceSpec) -> String {
    spec.labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl Provider for GcloudProvider {
    fn provider_type(&self) -> &'static str {
        "gcloud"
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceHandle> {
        let worker_repo = self.config.worker_repo.as_deref().ok_or_else(|| {
            ProviderError::Other("worker repository is not configured".to_string())
        })?;
        let script_path = self
            .config
            .scratch_dir
            .join(format!("fleetscan-startup-{}.sh", spec.name));
        tokio::fs::write(
            &script_path,
            startup_script(&spec.boot, worker_repo),
        )
        .await?;

        let script_arg = format!("startup-script={}", script_path.display());
        let metadata = spec.boot.to_metadata_arg();
        let labels = labels_arg(spec);
        let mut args = vec![
            "instances",
            "create",
            spec.name.as_str(),
            "--zone",
            spec.zone.as_str(),
            "--machine-type",
            spec.machine_type.as_str(),
            "--image-family",
            self.config.image_family.as_str(),
            "--image-project",
            self.config.image_project.as_str(),
            "--boot-disk-size",
            self.config.boot_disk_size.as_str(),
            "--metadata-from-file",
            script_arg.as_str(),
            "--metadata",
            metadata.as_str(),
        ];
        if !labels.is_empty() {
            args.extend(["--labels", labels.as_str()]);
        }

        let result = self.output(self.compute(&args), &spec.name).await;

        if let Err(e) = tokio::fs::remove_file(&script_path).await {
            warn!(path = %script_path.display(), error = %e, "Failed to remove startup script");
        }

        result.map(|_| InstanceHandle {
            name: spec.name.clone(),
            zone: spec.zone.clone(),
            created_at: Utc::now(),
            adopted: false,
        })
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        let cmd = self.compute(&["instances", "delete", name, "--zone", &self.config.zone]);
        self.output(cmd, name).await.map(|_| ())
    }

    async fn describe_instance(&self, name: &str) -> Result<HealthState> {
        let cmd = self.compute(&[
            "instances",
            "describe",
            name,
            "--zone",
            &self.config.zone,
            "--format",
            "value(status)",
        ]);
        let output = self.output(cmd, name).await?;
        Ok(HealthState::parse(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceSummary>> {
        let mut args = vec![
            "instances",
            "list",
            "--format",
            "value(name,zone.basename(),status)",
        ];
        let name_filter;
        if let Some(prefix) = &filter.name_prefix {
            name_filter = format!("name ~ ^{}", prefix);
            args.extend(["--filter", name_filter.as_str()]);
        }

        let output = self.output(self.compute(&args), "*").await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let mut cols = line.split_whitespace();
                let name = cols.next()?.to_string();
                let zone = cols.next().unwrap_or_default().to_string();
                let health = HealthState::parse(cols.next().unwrap_or_default());
                Some(InstanceSummary { name, zone, health })
            })
            .filter(|s| filter.matches(&s.name))
            .collect())
    }

    async fn read_marker(&self, name: &str) -> Result<Option<MarkerStatus>> {
        let remote = format!("cat {} 2>/dev/null || true", MARKER_PATH);
        let cmd = self.compute(&[
            "ssh",
            name,
            "--zone",
            &self.config.zone,
            "--command",
            &remote,
        ]);
        let output = self.output(cmd, name).await?;
        Ok(MarkerStatus::parse(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn transfer_output(&self, name: &str, local_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(local_dir).await?;
        let source = format!("{}:{}/*", name, REMOTE_OUTPUT_DIR);
        let dest = local_dir.display().to_string();
        let cmd = self.compute(&[
            "scp",
            "--recurse",
            "--zone",
            &self.config.zone,
            &source,
            &dest,
        ]);
        self.output(cmd, name).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_already_exists() {
        let err = classify_failure(
            "fleet-p000-r0",
            Some(1),
            "ERROR: (gcloud.compute.instances.create) Could not fetch resource:\n - The resource 'projects/x/zones/z/instances/fleet-p000-r0' already exists",
        );
        assert!(matches!(err, ProviderError::AlreadyExists(_)));
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify_failure(
            "fleet-p000-r0",
            Some(1),
            "ERROR: The resource 'projects/x/zones/z/instances/fleet-p000-r0' was not found",
        );
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[test]
    fn test_classify_auth() {
        let err = classify_failure(
            "i",
            Some(1),
            "ERROR: (gcloud.compute.instances.list) You do not currently have an active account selected.",
        );
        assert!(matches!(err, ProviderError::Authentication(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_classify_quota_is_transient() {
        let err = classify_failure("i", Some(1), "Quota 'CPUS' exceeded. Limit: 24.0");
        assert!(matches!(err, ProviderError::Transient(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_unknown_is_command_failed() {
        let err = classify_failure("i", Some(255), "ssh: connect to host port 22: Connection refused");
        assert!(matches!(
            err,
            ProviderError::CommandFailed {
                exit_code: Some(255),
                ..
            }
        ));
        assert!(err.is_transient());
    }
}
