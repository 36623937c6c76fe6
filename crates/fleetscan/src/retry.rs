// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded exponential backoff shared by the provisioner and collector.

use std::future::Future;
use std::time::Duration;

use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Backoff parameters for one retried operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff<'a> {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay
    pub max_delay: Duration,
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Aborts waiting and further attempts when cancelled
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a> RetryBackoff<'a> {
    /// Create a backoff allowing `max_attempts` attempts.
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: max_attempts.max(1),
            cancellation: None,
        }
    }

    /// Stop retrying once `token` is cancelled.
    pub fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Try again after backing off
    Retry,
    /// Give up immediately
    Abort,
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the last attempt
        last: E,
    },
    /// An attempt failed with an error classified as [`RetryDisposition::Abort`].
    Aborted {
        /// Attempts made
        attempts: u32,
        /// The aborting error
        error: E,
    },
    /// Cancellation was requested between attempts.
    Cancelled,
}

/// Run `operation` until it succeeds, is aborted, or runs out of attempts.
///
/// `on_retry` is called after every retryable failure with the attempt
/// number, the delay before the next attempt, the error, and whether another
/// attempt will follow.
pub async fn retry_with_backoff<T, E, F, Fut, L, C>(
    config: RetryBackoff<'_>,
    mut operation: F,
    mut on_retry: L,
    mut classify_error: C,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    L: FnMut(u32, Duration, &E, bool),
    C: FnMut(u32, &E) -> RetryDisposition,
{
    let mut attempt = 0;
    let mut backoff = config.initial_delay;

    loop {
        attempt += 1;

        if let Some(token) = config.cancellation
            && token.is_cancelled()
        {
            return Err(RetryError::Cancelled);
        }

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => match classify_error(attempt, &err) {
                RetryDisposition::Abort => {
                    return Err(RetryError::Aborted {
                        attempts: attempt,
                        error: err,
                    });
                }
                RetryDisposition::Retry => {
                    let exhausted = attempt >= config.max_attempts;
                    on_retry(attempt, backoff, &err, !exhausted);

                    if exhausted {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }

                    if !sleep_with_cancellation(backoff, config.cancellation).await {
                        return Err(RetryError::Cancelled);
                    }
                    backoff = next_backoff(backoff, config.max_delay);
                }
            },
        }
    }
}

/// Sleep for `delay`; returns false if cancelled first.
async fn sleep_with_cancellation(delay: Duration, cancellation: Option<&CancellationToken>) -> bool {
    if delay.is_zero() {
        yield_now().await;
        return true;
    }

    match cancellation {
        Some(token) => tokio::select! {
            _ = token.cancelled() => false,
            _ = sleep(delay) => true,
        },
        None => {
            sleep(delay).await;
            true
        }
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }
    current.saturating_mul(2).min(max_backoff)
}
