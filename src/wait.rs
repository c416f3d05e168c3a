//! Bounded waiting for external readiness.
//!
//! Every place the orchestrator waits on something outside its control
//! (a bridge server writing its "listening" line, an emulator printing its
//! boot marker, a session probe, a test attempt) goes through [`Waiter`], so
//! the timeout, poll interval, cancellation and console feedback policy live
//! in one place.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use conductor::wait::{WaitOutcome, Waiter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let waiter = Waiter::new(Duration::from_millis(200)).with_interval(Duration::from_millis(10));
//! let mut polls = 0;
//! let outcome = waiter
//!     .until(|| {
//!         polls += 1;
//!         let ready = polls >= 3;
//!         async move { ready.then_some("up") }
//!     })
//!     .await;
//! assert!(matches!(outcome, WaitOutcome::Ready("up")));
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Poll interval used when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// The predicate produced a value before the deadline.
    Ready(T),
    /// The deadline passed first.
    TimedOut,
    /// The cancellation token fired first.
    Cancelled,
}

impl<T> WaitOutcome<T> {
    /// Returns the value if the wait succeeded.
    pub fn ready(self) -> Option<T> {
        match self {
            WaitOutcome::Ready(value) => Some(value),
            WaitOutcome::TimedOut | WaitOutcome::Cancelled => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready(_))
    }
}

/// Timeout, interval and cancellation policy for one wait.
#[derive(Debug, Clone)]
pub struct Waiter {
    timeout: Duration,
    interval: Duration,
    cancel: Option<CancellationToken>,
    progress: Option<String>,
}

impl Waiter {
    /// Creates a waiter that gives up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: DEFAULT_POLL_INTERVAL,
            cancel: None,
            progress: None,
        }
    }

    /// Sets the delay between predicate polls.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Stops waiting early when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Shows a spinner with `message` on the terminal while waiting.
    pub fn with_progress(mut self, message: impl Into<String>) -> Self {
        self.progress = Some(message.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Polls `check` until it yields a value, the timeout elapses, or the
    /// wait is cancelled.
    ///
    /// `check` always runs at least once, and once more at the deadline.
    pub async fn until<T, F, Fut>(&self, mut check: F) -> WaitOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let spinner = self.spinner();
        let deadline = Instant::now() + self.timeout;

        let outcome = loop {
            if let Some(value) = check().await {
                break WaitOutcome::Ready(value);
            }

            let now = Instant::now();
            if now >= deadline {
                break WaitOutcome::TimedOut;
            }

            let nap = self.interval.min(deadline - now);
            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => break WaitOutcome::Cancelled,
                        _ = sleep(nap) => {}
                    }
                }
                None => sleep(nap).await,
            }
        };

        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }
        outcome
    }

    /// Bounds a single future by the timeout and cancellation policy.
    pub async fn within<F: Future>(&self, future: F) -> WaitOutcome<F::Output> {
        let spinner = self.spinner();
        let bounded = tokio::time::timeout(self.timeout, future);

        let outcome = match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => WaitOutcome::Cancelled,
                    result = bounded => match result {
                        Ok(value) => WaitOutcome::Ready(value),
                        Err(_) => WaitOutcome::TimedOut,
                    },
                }
            }
            None => match bounded.await {
                Ok(value) => WaitOutcome::Ready(value),
                Err(_) => WaitOutcome::TimedOut,
            },
        };

        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }
        outcome
    }

    fn spinner(&self) -> Option<ProgressBar> {
        let message = self.progress.as_ref()?;
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(message.clone());
        spinner.enable_steady_tick(Duration::from_millis(120));
        Some(spinner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(timeout_ms: u64) -> Waiter {
        Waiter::new(Duration::from_millis(timeout_ms)).with_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_until_ready_immediately() {
        let outcome = fast(50).until(|| async { Some(7) }).await;
        assert_eq!(outcome, WaitOutcome::Ready(7));
    }

    #[tokio::test]
    async fn test_until_times_out() {
        let mut polls = 0usize;
        let outcome: WaitOutcome<()> = fast(40)
            .until(|| {
                polls += 1;
                async { None }
            })
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(polls >= 2, "expected repeated polling, got {polls}");
    }

    #[tokio::test]
    async fn test_until_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let outcome: WaitOutcome<()> = Waiter::new(Duration::from_secs(30))
            .with_cancellation(token)
            .until(|| async { None })
            .await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_within_bounds_slow_future() {
        let outcome = fast(20)
            .within(async {
                sleep(Duration::from_secs(5)).await;
                1
            })
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_within_returns_value() {
        let outcome = fast(500).within(async { "done" }).await;
        assert_eq!(outcome.ready(), Some("done"));
    }
}
