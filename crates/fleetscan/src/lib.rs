// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fleetscan - Fleet Orchestration for Time-Partitioned Extraction
//!
//! fleetscan spreads one large, time-bounded extraction job over a fleet of
//! short-lived cloud instances. Each instance runs a worker over one
//! contiguous slice of the range; fleetscan creates the instances, watches
//! them, copies their output back and merges it into one ordered dataset.
//!
//! The worker itself is a black box: it is cloned and started by a startup
//! script, reports progress through a marker file and leaves CSV files in a
//! well-known output directory.
//!
//! # Architecture
//!
//! ```text
//!                         ┌──────────────┐
//!                         │ Orchestrator │
//!                         └──────┬───────┘
//!                                │ partition_range()
//!           ┌────────────────────┼────────────────────┐
//!           ▼                    ▼                    ▼
//!    ┌─────────────┐      ┌─────────────┐      ┌─────────────┐
//!    │ task p000   │      │ task p001   │ ...  │ task pNNN   │
//!    │ provision   │      │ provision   │      │ provision   │
//!    │ watch ◄──┐  │      │ watch ◄──┐  │      │ watch ◄──┐  │
//!    │ collect  │  │      │ collect  │  │      │ collect  │  │
//!    │ replace ─┘  │      │ replace ─┘  │      │ replace ─┘  │
//!    └──────┬──────┘      └──────┬──────┘      └──────┬──────┘
//!           │         FleetState (one lock per partition)
//!           └────────────────────┼────────────────────┘
//!                                ▼
//!                    Aggregator ─► manifest.json
//!                                ▼
//!                             Cleaner
//! ```
//!
//! All cloud access goes through the [`provider::Provider`] trait. The
//! [`provider::GcloudProvider`] shells out to the `gcloud` CLI;
//! [`provider::MockProvider`] simulates a fleet in memory for tests.
//!
//! # Partition Status State Machine
//!
//! ```text
//!   PENDING ──provision──► PROVISIONED ──healthy poll──► RUNNING
//!                               ▲                           │
//!                               │ replace                   │ marker / stop / timeout
//!                               │ (attempts <= retries)     ▼
//!                             FAILED ◄──────────────── COMPLETED (result collected)
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FLEETSCAN_PROJECT_ID` | Yes | - | GCP project |
//! | `FLEETSCAN_START` | Yes | - | Range start (`%Y-%m-%d-%H:%M` or `%Y-%m-%d`) |
//! | `FLEETSCAN_END` | Yes | - | Range end, exclusive |
//! | `FLEETSCAN_INSTANCE_COUNT` | Yes | - | Number of partitions |
//! | `FLEETSCAN_DATA_SOURCE_URLS` | Yes | - | Comma-separated endpoints |
//! | `FLEETSCAN_WORKER_REPO` | For `run` | - | Git repository of the worker |
//! | `FLEETSCAN_FLEET_NAME` | No | `fleetscan` | Instance name prefix |
//! | `FLEETSCAN_ZONE` | No | `us-central1-a` | Zone |
//! | `FLEETSCAN_MACHINE_TYPE` | No | `e2-standard-2` | Machine type |
//! | `FLEETSCAN_BOOT_DISK_SIZE` | No | `20GB` | Boot disk size |
//! | `FLEETSCAN_OUTPUT_DIR` | No | `collected_data` | Local output directory |
//! | `FLEETSCAN_POLL_INTERVAL_SECS` | No | `300` | Poll interval |
//! | `FLEETSCAN_OBSERVATIONS_PER_INTERVAL` | No | `100` | Worker sampling |
//! | `FLEETSCAN_INTERVAL_SPAN_TYPE` | No | `day` | `hour`, `day` or `week` |
//! | `FLEETSCAN_INTERVAL_SPAN_LENGTH` | No | `1.0` | Span length |
//! | `FLEETSCAN_FETCH_DELAY_SECONDS` | No | `0.05` | Delay between requests |
//! | `FLEETSCAN_PROVISION_MAX_ATTEMPTS` | No | `5` | Create attempts |
//! | `FLEETSCAN_MAX_CONCURRENT_PROVISIONS` | No | `10` | Parallel creates |
//! | `FLEETSCAN_MAX_PARTITION_RETRIES` | No | `2` | Replacements per partition |
//! | `FLEETSCAN_MAX_POLL_ERRORS` | No | `5` | Failed polls before unreachable |
//! | `FLEETSCAN_MONITOR_TIMEOUT_FLOOR_SECS` | No | `3600` | Minimum partition timeout |
//! | `FLEETSCAN_MONITOR_SECS_PER_SPAN_HOUR` | No | `600` | Timeout per hour of span |
//! | `FLEETSCAN_TRANSFER_MAX_ATTEMPTS` | No | `4` | Transfer attempts |
//! | `FLEETSCAN_TRANSFER_TIMEOUT_SECS` | No | `600` | Timeout of one transfer |
//! | `FLEETSCAN_PROVIDER_CALL_TIMEOUT_SECS` | No | `120` | Timeout of other provider calls |
//! | `FLEETSCAN_FORCE_CLEANUP` | No | `false` | Delete failed partitions' instances |
//! | `FLEETSCAN_DEDUP_KEY_COLUMN` | No | `hash` | Boundary de-duplication key |
//!
//! # Modules
//!
//! - [`config`]: Run configuration from environment variables
//! - [`error`]: Error types and per-partition failure reasons
//! - [`partition`]: Splitting the range into partitions
//! - [`bootstrap`]: Boot payload and startup script for workers
//! - [`marker`]: Completion marker protocol
//! - [`provider`]: Cloud provider trait, gcloud and mock implementations
//! - [`retry`]: Bounded exponential backoff
//! - [`state`]: Shared fleet state and its persisted snapshot
//! - [`provisioner`]: Idempotent instance creation
//! - [`monitor`]: Per-partition polling
//! - [`collector`]: Result transfer and verification
//! - [`aggregator`]: Dataset merge and manifest
//! - [`cleaner`]: Instance deletion
//! - [`orchestrator`]: The run state machine

#![deny(missing_docs)]

pub mod aggregator;
pub mod bootstrap;
pub mod cleaner;
pub mod collector;
pub mod config;
pub mod error;
pub mod marker;
pub mod monitor;
pub mod orchestrator;
pub mod partition;
pub mod provider;
pub mod provisioner;
pub mod retry;
pub mod state;

pub use config::Config;
pub use error::{Error, FailureReason, Result};
pub use orchestrator::{Orchestrator, RunPhase, RunReport};
pub use partition::{PartitionId, PartitionStatus, WorkPartition, partition_range};
