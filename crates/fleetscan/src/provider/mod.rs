// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud provider abstraction.
//!
//! Providers create, inspect and delete the instances of a fleet, read the
//! worker's completion marker and copy results back. The orchestrator only
//! talks to the [`Provider`] trait.

pub mod gcloud;
pub mod mock;
mod traits;

pub use gcloud::{GcloudConfig, GcloudProvider};
pub use mock::{MockProvider, WorkerScript};
pub use traits::*;
