// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Monitor tests. Time is paused so timeouts elapse instantly.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{attach_existing, instance, single_entry};
use fleetscan::error::{Error, FailureReason};
use fleetscan::monitor::{MonitorConfig, MonitorOutcome, PartitionMonitor};
use fleetscan::partition::PartitionStatus;
use fleetscan::provider::{MockProvider, WorkerScript};
use fleetscan::state::LifecycleState;
use tokio_util::sync::CancellationToken;

const NAME: &str = "fleetscan-p000-r0";

fn monitor(provider: &Arc<MockProvider>) -> PartitionMonitor {
    PartitionMonitor::new(
        provider.clone(),
        MonitorConfig {
            poll_interval: Duration::from_secs(60),
            timeout_floor: Duration::from_secs(3600),
            timeout_per_span_hour: Duration::ZERO,
            max_partition_retries: 2,
            max_consecutive_poll_errors: 3,
            call_timeout: Duration::from_secs(30),
        },
    )
}

// ============================================================================
// Terminal markers
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_completed_marker() {
    let provider = Arc::new(MockProvider::new());
    let entry = single_entry();
    attach_existing(&provider, &entry, NAME, WorkerScript::default()).await;

    let outcome = monitor(&provider)
        .watch(&entry, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, MonitorOutcome::Completed);
    let entry = entry.lock().await;
    assert_eq!(entry.partition.status, PartitionStatus::Running);
    assert_eq!(
        entry.instance.as_ref().unwrap().lifecycle_state,
        LifecycleState::Running
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_marker() {
    let provider = Arc::new(MockProvider::new());
    let entry = single_entry();
    attach_existing(&provider, &entry, NAME, WorkerScript::Fail { running_polls: 2 }).await;

    let outcome = monitor(&provider)
        .watch(&entry, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, MonitorOutcome::Failed(FailureReason::WorkerFailed));
}

// ============================================================================
// Instance failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_crashed_instance_is_reported_stopped() {
    let provider = Arc::new(MockProvider::new());
    let entry = single_entry();
    attach_existing(&provider, &entry, NAME, WorkerScript::Crash { running_polls: 1 }).await;

    let outcome = monitor(&provider)
        .watch(&entry, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        MonitorOutcome::Failed(FailureReason::InstanceStopped {
            state: "STOPPED".to_string()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_deleted_instance_is_reported_not_found() {
    let provider = Arc::new(MockProvider::new());
    let entry = single_entry();
    entry.lock().await.attach_instance(instance(NAME, 0));

    let outcome = monitor(&provider)
        .watch(&entry, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        MonitorOutcome::Failed(FailureReason::InstanceStopped {
            state: "NOT_FOUND".to_string()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_poll_errors_mark_unreachable() {
    let provider = Arc::new(MockProvider::new());
    let entry = single_entry();
    attach_existing(&provider, &entry, NAME, WorkerScript::Hang).await;
    provider.fail_polls(NAME, 3).await;

    let outcome = monitor(&provider)
        .watch(&entry, &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        MonitorOutcome::Failed(FailureReason::Unreachable {
            consecutive_errors: 3,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_intermittent_poll_errors_are_tolerated() {
    let provider = Arc::new(MockProvider::new());
    let entry = single_entry();
    attach_existing(&provider, &entry, NAME, WorkerScript::default()).await;
    provider.fail_polls(NAME, 2).await;

    let outcome = monitor(&provider)
        .watch(&entry, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, MonitorOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials_are_an_error() {
    let provider = Arc::new(MockProvider::new());
    let entry = single_entry();
    attach_existing(&provider, &entry, NAME, WorkerScript::Hang).await;
    provider.reject_credentials();

    let err = monitor(&provider)
        .watch(&entry, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Authentication(_)));
}

// ============================================================================
// Timeout and cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_hung_worker_times_out() {
    let provider = Arc::new(MockProvider::never_completing());
    let entry = single_entry();
    attach_existing(&provider, &entry, NAME, WorkerScript::Hang).await;

    let started = tokio::time::Instant::now();
    let outcome = monitor(&provider)
        .watch(&entry, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome,
        MonitorOutcome::Failed(FailureReason::MonitorTimeout { timeout_secs: 3600 })
    );
    assert!(started.elapsed() >= Duration::from_secs(3600));
}

#[tokio::test(start_paused = true)]
async fn test_booting_instance_moves_to_running() {
    let mut provider = MockProvider::new();
    provider.provisioning_polls = 2;
    let provider = Arc::new(provider);
    let entry = single_entry();
    attach_existing(&provider, &entry, NAME, WorkerScript::Hang).await;
    let cancel = CancellationToken::new();

    let watcher = {
        let monitor = monitor(&provider);
        let entry = entry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { monitor.watch(&entry, &cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    {
        let entry = entry.lock().await;
        assert_eq!(
            entry.instance.as_ref().unwrap().lifecycle_state,
            LifecycleState::Booting
        );
        assert_eq!(entry.partition.status, PartitionStatus::Provisioned);
    }

    // Third describe at t=120s reports RUNNING.
    tokio::time::sleep(Duration::from_secs(150)).await;
    {
        let entry = entry.lock().await;
        assert_eq!(
            entry.instance.as_ref().unwrap().lifecycle_state,
            LifecycleState::Running
        );
        assert_eq!(entry.partition.status, PartitionStatus::Running);
    }

    cancel.cancel();
    let outcome = watcher.await.unwrap().unwrap();
    assert_eq!(outcome, MonitorOutcome::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_hung_describe_calls_mark_unreachable() {
    let provider = Arc::new(MockProvider::new());
    let entry = single_entry();
    attach_existing(&provider, &entry, NAME, WorkerScript::default()).await;
    provider.delay_describes(NAME, Duration::from_secs(3600)).await;

    let outcome = monitor(&provider)
        .watch(&entry, &CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        MonitorOutcome::Failed(FailureReason::Unreachable {
            consecutive_errors,
            message,
        }) => {
            assert_eq!(consecutive_errors, 3);
            assert!(message.contains("timed out"), "{}", message);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_watching() {
    let provider = Arc::new(MockProvider::never_completing());
    let entry = single_entry();
    attach_existing(&provider, &entry, NAME, WorkerScript::Hang).await;
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(150)).await;
            cancel.cancel();
        })
    };

    let outcome = monitor(&provider).watch(&entry, &cancel).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(outcome, MonitorOutcome::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_watch_without_instance_fails() {
    let provider = Arc::new(MockProvider::new());
    let entry = single_entry();

    let outcome = monitor(&provider)
        .watch(&entry, &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        MonitorOutcome::Failed(FailureReason::Internal { .. })
    ));
}
