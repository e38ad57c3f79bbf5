// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Polling with a deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready { elapsed: Duration },
    TimedOut { elapsed: Duration },
}

impl WaitOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready { .. })
    }
}

/// Evaluates `predicate` every `interval` until it holds or `timeout` has
/// elapsed. The predicate is always evaluated at least once, and once more at
/// the deadline. A timeout is an outcome, not an error.
pub async fn wait_until<F, Fut>(mut predicate: F, interval: Duration, timeout: Duration) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    loop {
        if predicate().await {
            return WaitOutcome::Ready {
                elapsed: start.elapsed(),
            };
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut {
                elapsed: start.elapsed(),
            };
        }
        tokio::time::sleep_until(std::cmp::min(now + interval, deadline)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn returns_once_predicate_holds() {
        let calls = Cell::new(0);
        let outcome = wait_until(
            || {
                calls.set(calls.get() + 1);
                let ready = calls.get() == 3;
                async move { ready }
            },
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
        .await;
        assert_eq!(
            outcome,
            WaitOutcome::Ready {
                elapsed: Duration::from_secs(10)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_deadline() {
        let calls = Cell::new(0);
        let outcome = wait_until(
            || {
                calls.set(calls.get() + 1);
                async { false }
            },
            Duration::from_secs(4),
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(
            outcome,
            WaitOutcome::TimedOut {
                elapsed: Duration::from_secs(10)
            }
        );
        // At 0, 4, 8 and the deadline.
        assert_eq!(calls.get(), 4);
    }
}
