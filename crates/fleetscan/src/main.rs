// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fleetscan - operator CLI
//!
//! - `run`: partition, provision, monitor, collect, aggregate, clean up
//! - `status`: summarize the last run's manifest and the live fleet
//! - `teardown`: delete every instance of the fleet

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use fleetscan::aggregator::Manifest;
use fleetscan::cleaner::Cleaner;
use fleetscan::config::{Config, FleetIdentity};
use fleetscan::orchestrator::Orchestrator;
use fleetscan::provider::{GcloudConfig, GcloudProvider, InstanceFilter, Provider};
use fleetscan::state::FleetSnapshot;

/// Distribute a time-bounded extraction job over a fleet of cloud instances.
#[derive(Debug, Parser)]
#[command(name = "fleetscan", version, about)]
struct Cli {
    /// Load environment variables from this file instead of `.env`.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// gcloud binary to invoke.
    #[arg(long, global = true, env = "FLEETSCAN_GCLOUD_BIN", default_value = "gcloud")]
    gcloud_bin: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the extraction across a new fleet.
    Run {
        /// Also delete instances of permanently failed partitions.
        #[arg(long)]
        force_cleanup: bool,
    },
    /// Show the last run's coverage and the fleet's live instances.
    Status,
    /// Delete every instance whose name starts with the fleet name.
    Teardown {
        /// Actually delete; without it the instances are only listed.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetscan=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Load .env file if present
    let loaded = match &cli.env_file {
        Some(path) => dotenvy::from_path(path),
        None => dotenvy::dotenv().map(|_| ()),
    };
    if let Err(e) = loaded {
        warn!("No .env file loaded: {}", e);
    }

    match cli.command {
        Command::Run { force_cleanup } => run(&cli.gcloud_bin, force_cleanup).await,
        Command::Status => status(&cli.gcloud_bin).await,
        Command::Teardown { yes } => teardown(&cli.gcloud_bin, yes).await,
    }
}

async fn run(gcloud_bin: &Path, force_cleanup: bool) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    config.force_cleanup |= force_cleanup;
    if config.worker_repo.is_none() {
        anyhow::bail!("FLEETSCAN_WORKER_REPO is required to create instances");
    }

    let provider = Arc::new(GcloudProvider::new(
        GcloudConfig::from_config(&config).with_gcloud_bin(gcloud_bin),
    ));
    info!(
        provider = provider.provider_type(),
        project = %config.fleet.project_id,
        fleet = %config.fleet.fleet_name,
        partitions = config.instance_count,
        "Starting fleetscan run"
    );

    let orchestrator = Orchestrator::builder()
        .config(config)
        .provider(provider)
        .build()?;

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, cancelling run");
            cancel.cancel();
        }
    });

    let report = orchestrator.run().await?;
    let manifest = &report.manifest;

    println!(
        "Run {}: {}/{} partitions collected{}",
        report.run_id,
        manifest.contributed.len(),
        manifest.partition_count,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    for dataset in &manifest.datasets {
        println!(
            "  {}: {} records -> {}",
            dataset.name,
            dataset.records,
            dataset.path.display()
        );
    }
    for missing in &manifest.missing {
        println!("  missing {}: {}", missing.partition_id, missing.reason);
    }
    for issue in &manifest.issues {
        let path = issue.path.as_ref().map(|p| p.display().to_string());
        println!(
            "  not merged {}: {}",
            path.as_deref().unwrap_or("-"),
            issue.message
        );
    }
    if !report.cleanup.retained.is_empty() {
        println!(
            "  left running for inspection: {}",
            report.cleanup.retained.join(", ")
        );
    }
    for failure in &report.cleanup.errors {
        error!(instance = %failure.instance, error = %failure.message, "Instance not deleted");
    }

    Ok(())
}

async fn status(gcloud_bin: &Path) -> anyhow::Result<()> {
    let identity = FleetIdentity::from_env()?;

    let manifest_path = identity.output_dir.join(Manifest::FILE_NAME);
    match Manifest::read_from(&manifest_path).await {
        Ok(manifest) => {
            println!(
                "Last run {} ({} .. {}): {}/{} partitions collected{}",
                manifest.run_id,
                manifest.range_start,
                manifest.range_end,
                manifest.contributed.len(),
                manifest.partition_count,
                if manifest.cancelled { ", cancelled" } else { "" }
            );
            for missing in &manifest.missing {
                println!("  missing {}: {}", missing.partition_id, missing.reason);
            }
        }
        Err(e) => println!("No manifest at {}: {}", manifest_path.display(), e),
    }

    let state_path = identity.output_dir.join(FleetSnapshot::FILE_NAME);
    if let Ok(snapshot) = FleetSnapshot::read_from(&state_path).await {
        for entry in &snapshot.partitions {
            println!(
                "  {} {:?} attempts={} instance={}",
                entry.partition.id,
                entry.partition.status,
                entry.attempts,
                entry
                    .instance
                    .as_ref()
                    .map(|i| i.name.as_str())
                    .unwrap_or("-")
            );
        }
    }

    let provider = GcloudProvider::new(
        GcloudConfig::new(&identity.project_id, &identity.zone).with_gcloud_bin(gcloud_bin),
    );
    let instances = provider
        .list_instances(&InstanceFilter::with_prefix(identity.instance_prefix()))
        .await
        .context("listing fleet instances")?;
    println!("Live instances: {}", instances.len());
    for instance in instances {
        println!("  {} {} {}", instance.name, instance.zone, instance.health);
    }
    Ok(())
}

async fn teardown(gcloud_bin: &Path, yes: bool) -> anyhow::Result<()> {
    let identity = FleetIdentity::from_env()?;
    let filter = InstanceFilter::with_prefix(identity.instance_prefix());
    let provider: Arc<dyn Provider> = Arc::new(GcloudProvider::new(
        GcloudConfig::new(&identity.project_id, &identity.zone).with_gcloud_bin(gcloud_bin),
    ));

    if !yes {
        let instances = provider
            .list_instances(&filter)
            .await
            .context("listing fleet instances")?;
        println!("Would delete {} instance(s):", instances.len());
        for instance in instances {
            println!("  {} {}", instance.name, instance.health);
        }
        println!("Re-run with --yes to delete them.");
        return Ok(());
    }

    let cleaner = Cleaner::new(provider, true, std::time::Duration::from_secs(120));
    let report = cleaner
        .teardown(&filter)
        .await
        .context("tearing down fleet")?;
    println!(
        "Deleted {} instance(s), {} error(s)",
        report.deleted.len(),
        report.errors.len()
    );
    if !report.is_clean() {
        anyhow::bail!("some instances could not be deleted");
    }
    Ok(())
}
