//! Poll-with-timeout and sleep primitives that honour a cancellation token.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

impl WaitOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready)
    }
}

/// Sleep for `duration`; returns false if cancelled first
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Call `check` every `interval` until it returns true, `timeout` elapses or
/// `cancel` fires. `check` always runs at least once.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        if check().await {
            return WaitOutcome::Ready;
        }

        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        let pause = interval.min(deadline - now);
        if !sleep_or_cancel(pause, cancel).await {
            return WaitOutcome::Cancelled;
        }
    }
}
