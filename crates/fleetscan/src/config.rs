// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for fleetscan.
//!
//! Everything is read once from `FLEETSCAN_*` environment variables (the
//! binary loads `.env` first) and is immutable for the rest of the run.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::bootstrap::{ExtractionParams, IntervalSpanType, TIMESTAMP_FORMAT};
use crate::collector::CollectorConfig;
use crate::monitor::MonitorConfig;
use crate::provisioner::ProvisionerConfig;

/// Where the fleet lives and where its local files go.
///
/// This is all that `status` and `teardown` need, so it loads without the
/// run-specific variables.
#[derive(Debug, Clone)]
pub struct FleetIdentity {
    /// GCP project id
    pub project_id: String,
    /// Prefix of every instance name in the fleet
    pub fleet_name: String,
    /// Zone instances are created in
    pub zone: String,
    /// Local directory for collected and aggregated data
    pub output_dir: PathBuf,
}

impl FleetIdentity {
    /// Load the fleet identity from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the fleet identity from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let identity = Self {
            project_id: required(&lookup, "FLEETSCAN_PROJECT_ID")?,
            fleet_name: lookup("FLEETSCAN_FLEET_NAME").unwrap_or_else(|| "fleetscan".to_string()),
            zone: lookup("FLEETSCAN_ZONE").unwrap_or_else(|| "us-central1-a".to_string()),
            output_dir: PathBuf::from(
                lookup("FLEETSCAN_OUTPUT_DIR").unwrap_or_else(|| "collected_data".to_string()),
            ),
        };
        identity.validate()?;
        Ok(identity)
    }

    /// Name prefix shared by all instances of this fleet.
    pub fn instance_prefix(&self) -> String {
        format!("{}-", self.fleet_name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // GCE names: lowercase letters, digits and hyphens, starting with a letter.
        let valid = self
            .fleet_name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase())
            && self
                .fleet_name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && self.fleet_name.len() <= 40;
        if !valid {
            return Err(ConfigError::InvalidValue {
                var: "FLEETSCAN_FLEET_NAME",
                message: format!(
                    "'{}' must be 1-40 lowercase letters, digits or hyphens starting with a letter",
                    self.fleet_name
                ),
            });
        }
        Ok(())
    }
}

/// Run configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Project, fleet name, zone and output directory
    pub fleet: FleetIdentity,
    /// Machine type of every instance
    pub machine_type: String,
    /// Boot disk size of every instance
    pub boot_disk_size: String,
    /// Git repository of the worker (required by the gcloud provider)
    pub worker_repo: Option<String>,
    /// Inclusive start of the extraction range
    pub start: DateTime<Utc>,
    /// Exclusive end of the extraction range
    pub end: DateTime<Utc>,
    /// Number of partitions (and initial instances)
    pub instance_count: usize,
    /// Data-source endpoints handed to the workers
    pub data_source_urls: Vec<String>,
    /// Worker sampling parameters
    pub extraction: ExtractionParams,
    /// Delete instances of permanently failed partitions too
    pub force_cleanup: bool,
    /// Column used to de-duplicate records across partition boundaries
    pub dedup_key_column: String,
    /// Provisioning retries and concurrency
    pub provisioner: ProvisionerConfig,
    /// Polling interval, timeouts and replacement budget
    pub monitor: MonitorConfig,
    /// Result transfer retries
    pub collector: CollectorConfig,
}

impl Config {
    /// Configuration with defaults for everything but the required settings.
    pub fn new(
        project_id: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        instance_count: usize,
        data_source_urls: Vec<String>,
    ) -> Self {
        Self {
            fleet: FleetIdentity {
                project_id: project_id.into(),
                fleet_name: "fleetscan".to_string(),
                zone: "us-central1-a".to_string(),
                output_dir: PathBuf::from("collected_data"),
            },
            machine_type: "e2-standard-2".to_string(),
            boot_disk_size: "20GB".to_string(),
            worker_repo: None,
            start,
            end,
            instance_count,
            data_source_urls,
            extraction: ExtractionParams::default(),
            force_cleanup: false,
            dedup_key_column: "hash".to_string(),
            provisioner: ProvisionerConfig::default(),
            monitor: MonitorConfig::default(),
            collector: CollectorConfig::default(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let fleet = FleetIdentity::from_lookup(&lookup)?;
        let start = timestamp(&lookup, "FLEETSCAN_START")?;
        let end = timestamp(&lookup, "FLEETSCAN_END")?;
        let instance_count: usize = parse(&lookup, "FLEETSCAN_INSTANCE_COUNT")?
            .ok_or(ConfigError::MissingEnvVar("FLEETSCAN_INSTANCE_COUNT"))?;
        let data_source_urls: Vec<String> = required(&lookup, "FLEETSCAN_DATA_SOURCE_URLS")?
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(String::from)
            .collect();

        let mut config = Self::new(
            fleet.project_id.clone(),
            start,
            end,
            instance_count,
            data_source_urls,
        );
        config.fleet = fleet;

        if let Some(v) = lookup("FLEETSCAN_MACHINE_TYPE") {
            config.machine_type = v;
        }
        if let Some(v) = lookup("FLEETSCAN_BOOT_DISK_SIZE") {
            config.boot_disk_size = v;
        }
        config.worker_repo = lookup("FLEETSCAN_WORKER_REPO").filter(|v| !v.trim().is_empty());
        if let Some(v) = lookup("FLEETSCAN_DEDUP_KEY_COLUMN") {
            config.dedup_key_column = v;
        }
        if let Some(v) = lookup("FLEETSCAN_FORCE_CLEANUP") {
            config.force_cleanup = parse_bool(&v);
        }

        let extraction = &mut config.extraction;
        if let Some(v) = parse(&lookup, "FLEETSCAN_OBSERVATIONS_PER_INTERVAL")? {
            extraction.observations_per_interval = v;
        }
        if let Some(v) = lookup("FLEETSCAN_INTERVAL_SPAN_TYPE") {
            extraction.interval_span_type =
                v.parse::<IntervalSpanType>()
                    .map_err(|message| ConfigError::InvalidValue {
                        var: "FLEETSCAN_INTERVAL_SPAN_TYPE",
                        message,
                    })?;
        }
        if let Some(v) = parse(&lookup, "FLEETSCAN_INTERVAL_SPAN_LENGTH")? {
            extraction.interval_span_length = v;
        }
        if let Some(v) = parse(&lookup, "FLEETSCAN_FETCH_DELAY_SECONDS")? {
            extraction.fetch_delay_seconds = v;
        }

        if let Some(v) = parse(&lookup, "FLEETSCAN_PROVISION_MAX_ATTEMPTS")? {
            config.provisioner.max_attempts = v;
        }
        if let Some(v) = parse(&lookup, "FLEETSCAN_MAX_CONCURRENT_PROVISIONS")? {
            config.provisioner.max_concurrent = v;
        }
        if let Some(v) = parse(&lookup, "FLEETSCAN_MAX_PARTITION_RETRIES")? {
            config.monitor.max_partition_retries = v;
        }
        if let Some(v) = parse(&lookup, "FLEETSCAN_MAX_POLL_ERRORS")? {
            config.monitor.max_consecutive_poll_errors = v;
        }
        if let Some(v) = seconds(&lookup, "FLEETSCAN_POLL_INTERVAL_SECS")? {
            config.monitor.poll_interval = v;
        }
        if let Some(v) = seconds(&lookup, "FLEETSCAN_MONITOR_TIMEOUT_FLOOR_SECS")? {
            config.monitor.timeout_floor = v;
        }
        if let Some(v) = seconds(&lookup, "FLEETSCAN_MONITOR_SECS_PER_SPAN_HOUR")? {
            config.monitor.timeout_per_span_hour = v;
        }
        if let Some(v) = parse(&lookup, "FLEETSCAN_TRANSFER_MAX_ATTEMPTS")? {
            config.collector.max_attempts = v;
        }
        if let Some(v) = seconds(&lookup, "FLEETSCAN_TRANSFER_TIMEOUT_SECS")? {
            config.collector.call_timeout = v;
        }
        if let Some(v) = seconds(&lookup, "FLEETSCAN_PROVIDER_CALL_TIMEOUT_SECS")? {
            config.provisioner.call_timeout = v;
            config.monitor.call_timeout = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the local output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fleet.output_dir = dir.into();
        self
    }

    /// Set the fleet name used as instance name prefix.
    pub fn with_fleet_name(mut self, name: impl Into<String>) -> Self {
        self.fleet.fleet_name = name.into();
        self
    }

    /// Check cross-field constraints, including the range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start >= self.end {
            return Err(ConfigError::Invalid(format!(
                "start {} must be before end {}",
                self.start.format(TIMESTAMP_FORMAT),
                self.end.format(TIMESTAMP_FORMAT)
            )));
        }
        if self.instance_count < 1 {
            return Err(ConfigError::InvalidValue {
                var: "FLEETSCAN_INSTANCE_COUNT",
                message: "must be at least 1".to_string(),
            });
        }
        self.validate_settings()
    }

    /// Check everything except the range and instance count.
    ///
    /// Programmatic callers get range problems from the run itself as
    /// [`crate::error::Error::InvalidRange`].
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        self.fleet.validate()?;

        if self.data_source_urls.is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "FLEETSCAN_DATA_SOURCE_URLS",
                message: "at least one URL is required".to_string(),
            });
        }
        if !(self.extraction.interval_span_length > 0.0) {
            return Err(ConfigError::InvalidValue {
                var: "FLEETSCAN_INTERVAL_SPAN_LENGTH",
                message: "must be positive".to_string(),
            });
        }
        if !(self.extraction.fetch_delay_seconds >= 0.0) {
            return Err(ConfigError::InvalidValue {
                var: "FLEETSCAN_FETCH_DELAY_SECONDS",
                message: "must not be negative".to_string(),
            });
        }
        if self.monitor.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                var: "FLEETSCAN_POLL_INTERVAL_SECS",
                message: "must be positive".to_string(),
            });
        }
        if self.provisioner.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                var: "FLEETSCAN_MAX_CONCURRENT_PROVISIONS",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Parse a range boundary.
///
/// Accepts the worker format `%Y-%m-%d-%H:%M`, `%Y-%m-%dT%H:%M:%S`,
/// RFC 3339 and bare dates (midnight UTC).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in [TIMESTAMP_FORMAT, "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn required<F>(lookup: &F, var: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingEnvVar(var))
}

fn parse<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue {
                    var,
                    message: format!("'{}': {}", raw, e),
                })
        })
        .transpose()
}

fn seconds<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse::<F, u64>(lookup, var)?.map(Duration::from_secs))
}

fn timestamp<F>(lookup: &F, var: &'static str) -> Result<DateTime<Utc>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = required(lookup, var)?;
    parse_timestamp(&raw).ok_or_else(|| ConfigError::InvalidValue {
        var,
        message: format!("'{}' is not a timestamp (expected {})", raw, TIMESTAMP_FORMAT),
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable could not be parsed or is out of range.
    #[error("Invalid value for {var}: {message}")]
    InvalidValue {
        /// Variable name
        var: &'static str,
        /// What is wrong with it
        message: String,
    },
    /// Settings are inconsistent with each other.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
