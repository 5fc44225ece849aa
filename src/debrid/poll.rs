//! Bounded poll loop for remote torrents that have not settled yet.

use std::future::Future;
use std::time::Duration;

use tracing::trace;

/// What one check of the remote state observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The awaited state was reached.
    Ready(T),
    /// Not there yet; check again after the interval.
    StillWaiting,
    /// The remote state can no longer reach the awaited state.
    GaveUp,
}

/// Interval and attempt cap for a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Delay between checks.
    pub interval: Duration,
    /// Maximum number of checks.
    pub max_attempts: u32,
}

impl PollSchedule {
    /// Creates a schedule.
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

/// Checks until `check` reports `Ready` or `GaveUp`, or attempts run out.
///
/// Exhausting attempts yields `GaveUp`. Errors from `check` end the loop.
///
/// # Errors
///
/// Returns the first error raised by `check`.
pub async fn poll_until<T, E, F, Fut>(schedule: PollSchedule, mut check: F) -> Result<PollOutcome<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollOutcome<T>, E>>,
{
    for attempt in 1..=schedule.max_attempts {
        match check(attempt).await? {
            PollOutcome::StillWaiting => {
                trace!(attempt, max = schedule.max_attempts, "remote state not settled");
                if attempt < schedule.max_attempts {
                    tokio::time::sleep(schedule.interval).await;
                }
            }
            settled => return Ok(settled),
        }
    }
    Ok(PollOutcome::GaveUp)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    const FAST: PollSchedule = PollSchedule::new(Duration::from_millis(1), 3);

    #[tokio::test]
    async fn test_poll_returns_ready_on_later_attempt() {
        let result: Result<_, ()> = poll_until(FAST, |attempt| async move {
            Ok(if attempt == 2 {
                PollOutcome::Ready("done")
            } else {
                PollOutcome::StillWaiting
            })
        })
        .await;
        assert_eq!(result.unwrap(), PollOutcome::Ready("done"));
    }

    #[tokio::test]
    async fn test_poll_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<PollOutcome<()>, ()> = poll_until(FAST, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(PollOutcome::StillWaiting) }
        })
        .await;
        assert_eq!(result.unwrap(), PollOutcome::GaveUp);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_propagates_errors() {
        let result: Result<PollOutcome<()>, &str> =
            poll_until(FAST, |_| async { Err("boom") }).await;
        assert_eq!(result.unwrap_err(), "boom");
    }
}
