// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded polling at a fixed interval.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result of a single check made by [`wait_for_condition`].
#[derive(Debug)]
pub enum CondCheckError<E> {
    /// The condition does not hold yet; check again after the interval.
    NotYet,
    /// Checking failed; stop polling.
    Failed(E),
}

impl<E> From<E> for CondCheckError<E> {
    fn from(error: E) -> Self {
        CondCheckError::Failed(error)
    }
}

#[derive(Debug)]
pub enum PollError<E> {
    /// The condition never held within the attempt budget.
    TimedOut { attempts: u32 },
    Cancelled,
    PermanentError(E),
}

/// How many times to check, and how long to wait between checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollBudget {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl PollBudget {
    /// A budget of checks spaced `interval` apart covering `timeout`, with at
    /// least one check.
    pub fn covering(timeout: Duration, interval: Duration) -> PollBudget {
        let interval = interval.max(Duration::from_millis(1));
        let attempts = timeout.as_millis().div_ceil(interval.as_millis());
        PollBudget {
            max_attempts: u32::try_from(attempts).unwrap_or(u32::MAX).max(1),
            interval,
        }
    }
}

/// Check `cond` up to `budget.max_attempts` times, sleeping
/// `budget.interval` between checks.
///
/// The first check happens immediately. Cancellation is observed while
/// sleeping, never in the middle of a check.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    budget: &PollBudget,
    cancel: &CancellationToken,
) -> Result<O, PollError<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        attempt += 1;
        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(error)) => {
                return Err(PollError::PermanentError(error));
            }
            Err(CondCheckError::NotYet) => {}
        }
        if attempt >= budget.max_attempts {
            return Err(PollError::TimedOut { attempts: attempt });
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep(budget.interval) => {}
        }
    }
}
