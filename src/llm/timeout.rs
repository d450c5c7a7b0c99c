// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! Deadline and cancellation races around async operations

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{ParleyError, Result};

fn timeout_error(duration: Duration) -> ParleyError {
    ParleyError::Timeout {
        timeout_ms: duration.as_millis() as u64,
    }
}

/// Race `operation` against a timer.
///
/// The losing side is dropped, so no timer outlives the call.
pub async fn with_timeout<Fut, T>(operation: Fut, duration: Duration) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, operation).await {
        Ok(result) => result,
        Err(_) => Err(timeout_error(duration)),
    }
}

/// Race `operation` against a timer and a cancellation token.
///
/// Cancellation wins ties with the deadline.
pub async fn with_timeout_cancellable<Fut, T>(
    operation: Fut,
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(ParleyError::Cancelled);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ParleyError::Cancelled),
        result = tokio::time::timeout(duration, operation) => match result {
            Ok(result) => result,
            Err(_) => Err(timeout_error(duration)),
        },
    }
}
