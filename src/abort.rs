//! Cooperative cancellation and abort-aware polling.
//
// Blocking waits of the orchestration (injection volume poll, autofocus wait, z-stack
// trigger wait, needle/stage motion) go through `poll_until`, so the abort latency is
// bounded by one poll interval.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Process-wide abort request. Level-triggered: once set it stays set for the run.
#[derive(Clone, Debug, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    /// Create a cleared flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the run stops at the next poll boundary.
    pub fn request(&self) {
        if !self.0.swap(true, Ordering::SeqCst) {
            tracing::warn!("abort requested");
        }
    }

    /// Whether an abort has been requested.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How long a poll loop may run before giving up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deadline {
    /// Only the abort flag ends the wait.
    None,
    /// Wall-clock bound measured on the tokio clock.
    After(Duration),
    /// Bounded retry counter (the camera trigger wait counts polls, not seconds).
    Attempts(u32),
}

/// Result of an abort-aware wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condition became true.
    Ready,
    /// The abort flag was observed first.
    Aborted,
    /// The deadline elapsed first.
    TimedOut,
}

impl WaitOutcome {
    /// `true` only for [`WaitOutcome::Ready`].
    pub fn is_ready(self) -> bool {
        matches!(self, WaitOutcome::Ready)
    }
}

/// Poll `check` every `interval` until it returns `true`, the abort flag is set, or the
/// deadline passes. Abort is checked before every evaluation of `check`.
///
/// Errors from `check` are returned unchanged; callers decide whether an error is a
/// degraded continuation or an abort.
pub async fn poll_until<F, Fut>(
    abort: &AbortFlag,
    interval: Duration,
    deadline: Deadline,
    mut check: F,
) -> anyhow::Result<WaitOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        if abort.is_set() {
            return Ok(WaitOutcome::Aborted);
        }
        if check().await? {
            return Ok(WaitOutcome::Ready);
        }
        attempts = attempts.saturating_add(1);
        match deadline {
            Deadline::None => {}
            Deadline::After(limit) => {
                if started.elapsed() >= limit {
                    return Ok(WaitOutcome::TimedOut);
                }
            }
            Deadline::Attempts(limit) => {
                if attempts >= limit {
                    return Ok(WaitOutcome::TimedOut);
                }
            }
        }
        sleep(interval).await;
    }
}
