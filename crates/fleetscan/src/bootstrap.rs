// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Boot configuration injected into each instance at creation.
//!
//! The worker reads its partition bounds and sampling parameters from this
//! payload. Providers decide how to deliver it; the gcloud provider passes it
//! as instance metadata and as an env file inside the startup script.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::marker::{MARKER_PATH, REMOTE_OUTPUT_DIR, REMOTE_ROOT};
use crate::partition::WorkPartition;

/// Timestamp format understood by the worker.
///
/// Seconds are dropped: a partition bound of `12:00:45` reaches the worker
/// as `12:00`. Adjacent partitions share their bounds, so the truncated
/// ranges still tile the run range without gaps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H:%M";

/// Reject partitions whose range is empty once bounds are truncated to
/// [`TIMESTAMP_FORMAT`] precision.
pub fn check_worker_bounds(partitions: &[WorkPartition]) -> crate::error::Result<()> {
    for partition in partitions {
        let start = to_worker_minute(partition.start);
        let end = to_worker_minute(partition.end);
        if start >= end {
            return Err(Error::InvalidRange(format!(
                "partition {} ({} .. {}) is shorter than the worker's one-minute resolution",
                partition.id, partition.start, partition.end
            )));
        }
    }
    Ok(())
}

fn to_worker_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(ChronoDuration::minutes(1)).unwrap_or(at)
}

/// Unit of the worker's sampling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalSpanType {
    /// Sample per hour
    Hour,
    /// Sample per day
    Day,
    /// Sample per week
    Week,
}

impl IntervalSpanType {
    /// Wire name of the span type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
        }
    }
}

impl std::str::FromStr for IntervalSpanType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" | "hours" => Ok(Self::Hour),
            "day" | "days" => Ok(Self::Day),
            "week" | "weeks" => Ok(Self::Week),
            other => Err(format!("unknown interval span type: {}", other)),
        }
    }
}

/// Sampling parameters shared by every worker in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionParams {
    /// Observations the worker samples per interval
    pub observations_per_interval: u32,
    /// Unit of the sampling interval
    pub interval_span_type: IntervalSpanType,
    /// Length of the sampling interval in `interval_span_type` units
    pub interval_span_length: f64,
    /// Delay between requests to a data source, in seconds
    pub fetch_delay_seconds: f64,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        Self {
            observations_per_interval: 100,
            interval_span_type: IntervalSpanType::Day,
            interval_span_length: 1.0,
            fetch_delay_seconds: 0.05,
        }
    }
}

/// Per-instance boot payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootConfig {
    /// Inclusive start of the partition
    pub partition_start: DateTime<Utc>,
    /// Exclusive end of the partition
    pub partition_end: DateTime<Utc>,
    /// Data-source endpoints, preferred endpoint first
    pub data_source_urls: Vec<String>,
    /// Sampling parameters
    pub extraction: ExtractionParams,
}

impl BootConfig {
    /// Build the payload for a partition.
    ///
    /// Endpoints are rotated so partition `i` prefers `urls[i % len]`, which
    /// spreads the fleet's load across data sources.
    pub fn for_partition(
        partition: &WorkPartition,
        urls: &[String],
        extraction: &ExtractionParams,
    ) -> Self {
        let mut data_source_urls = urls.to_vec();
        if !data_source_urls.is_empty() {
            let shift = partition.id.0 as usize % data_source_urls.len();
            data_source_urls.rotate_left(shift);
        }
        Self {
            partition_start: partition.start,
            partition_end: partition.end,
            data_source_urls,
            extraction: extraction.clone(),
        }
    }

    /// The enumerated boot fields in a stable order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (
                "partition_start",
                self.partition_start.format(TIMESTAMP_FORMAT).to_string(),
            ),
            (
                "partition_end",
                self.partition_end.format(TIMESTAMP_FORMAT).to_string(),
            ),
            ("data_source_urls", self.data_source_urls.join(",")),
            (
                "observations_per_interval",
                self.extraction.observations_per_interval.to_string(),
            ),
            (
                "interval_span_type",
                self.extraction.interval_span_type.as_str().to_string(),
            ),
            (
                "interval_span_length",
                self.extraction.interval_span_length.to_string(),
            ),
            (
                "fetch_delay_seconds",
                self.extraction.fetch_delay_seconds.to_string(),
            ),
        ]
    }

    /// Render the fields as a `KEY=value` env file.
    pub fn to_env_file(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.fields() {
            out.push_str(&key.to_ascii_uppercase());
            out.push('=');
            out.push_str(&value);
            out.push('\n');
        }
        out.push_str(&format!("DATA_DIRECTORY={}\n", REMOTE_OUTPUT_DIR));
        out
    }

    /// Render the fields as a gcloud `--metadata` value.
    ///
    /// Uses `;` as the delimiter because `data_source_urls` contains commas.
    pub fn to_metadata_arg(&self) -> String {
        let pairs: Vec<String> = self
            .fields()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("^;^{}", pairs.join(";"))
    }
}

/// Render the startup script that installs and launches the worker.
///
/// The script owns the marker: RUNNING before the worker starts, then
/// COMPLETED or FAILED from the worker's exit status.
pub fn startup_script(boot: &BootConfig, worker_repo: &str) -> String {
    format!(
        r#"#!/bin/bash
set -e
exec > /var/log/fleetscan-startup.log 2>&1

mkdir -p {root} {output}
apt-get update -qq
apt-get install -y git python3-pip python3-venv

cd {root}
if [ ! -d worker ]; then
    git clone {repo} worker
fi
cd worker
python3 -m venv venv
. venv/bin/activate
pip install -q --upgrade pip
pip install -q -r requirements.txt

cat > .env << 'FLEETSCAN_EOF'
{env}FLEETSCAN_EOF

echo RUNNING > {marker}
set +e
python main.py
status=$?
set -e
if [ "$status" -eq 0 ]; then
    echo COMPLETED > {marker}
else
    echo FAILED > {marker}
fi
"#,
        root = REMOTE_ROOT,
        output = REMOTE_OUTPUT_DIR,
        repo = worker_repo,
        env = boot.to_env_file(),
        marker = MARKER_PATH,
    )
}
