//! Bounded readiness polling
//!
//! One primitive backs every wait in the environment: a probe is invoked
//! repeatedly at a fixed interval until it succeeds or the bound is
//! exhausted. The bound is either a wall-clock deadline or a fixed attempt
//! count; exhaustion reports the last error the probe observed. The probe
//! always runs at least once, and the interval is enforced between
//! consecutive attempts in both flavors.

use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// How long a poll may keep trying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bound {
    /// Give up once this much wall-clock time has elapsed.
    Deadline(Duration),
    /// Give up after exactly this many probe invocations.
    Attempts(u32),
}

/// Error returned when a poll exhausts its bound.
#[derive(Debug, Error)]
#[error("{description} not ready after {attempts} attempt(s): {last_error}")]
pub struct PollError {
    /// What was being waited for.
    pub description: String,
    /// Probe invocations made before giving up.
    pub attempts: u32,
    /// Last error the probe reported.
    pub last_error: String,
}

/// A bounded, fixed-interval readiness check.
#[derive(Clone, Debug)]
pub struct Poller {
    description: String,
    interval: Duration,
    bound: Bound,
}

impl Poller {
    /// Poll until `timeout` of wall-clock time has elapsed.
    pub fn deadline(
        description: impl Into<String>,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            description: description.into(),
            interval,
            bound: Bound::Deadline(timeout),
        }
    }

    /// Poll for at most `attempts` probe invocations.
    pub fn attempts(description: impl Into<String>, attempts: u32, interval: Duration) -> Self {
        Self {
            description: description.into(),
            interval,
            bound: Bound::Attempts(attempts),
        }
    }

    /// Invoke `probe` until it succeeds or the bound is exhausted.
    ///
    /// Returns the probe's value on success, or a [`PollError`] carrying the
    /// last observed probe error on exhaustion.
    pub async fn run<T, F, Fut>(&self, mut probe: F) -> Result<T, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match probe().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let exhausted = match self.bound {
                        Bound::Attempts(max) => attempts >= max,
                        Bound::Deadline(timeout) => start.elapsed() >= timeout,
                    };
                    if exhausted {
                        warn!(
                            check = %self.description,
                            attempts,
                            error = %e,
                            "readiness bound exhausted"
                        );
                        return Err(PollError {
                            description: self.description.clone(),
                            attempts,
                            last_error: e,
                        });
                    }
                    debug!(
                        check = %self.description,
                        attempt = attempts,
                        error = %e,
                        "not ready yet"
                    );
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const FAST: Duration = Duration::from_millis(1);

    #[tokio::test]
    async fn test_succeeds_on_kth_invocation_after_exactly_k_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let poller = Poller::attempts("k-th success", 10, FAST);
        let result: Result<u32, _> = poller
            .run(|| {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 4 {
                        Err(format!("attempt {} failed", n))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.expect("probe should eventually succeed"), 4);
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_exhausts_attempt_bound_exactly() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let poller = Poller::attempts("never ready", 3, FAST);
        let result: Result<(), _> = poller
            .run(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("still down".to_string())
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error, "still down");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadline_bound_reports_last_error() {
        let poller = Poller::deadline("webhook", Duration::from_millis(10), FAST);
        let result: Result<(), _> = poller
            .run(|| async { Err("connection refused".to_string()) })
            .await;

        let err = result.unwrap_err();
        assert!(err.attempts >= 1);
        assert_eq!(err.last_error, "connection refused");
        assert!(err.to_string().contains("webhook"));
    }

    #[tokio::test]
    async fn test_probe_runs_at_least_once_on_zero_deadline() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let poller = Poller::deadline("instant", Duration::ZERO, FAST);
        let result: Result<(), _> = poller
            .run(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("nope".to_string())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_immediate_success_makes_one_attempt() {
        let poller = Poller::attempts("ready", 5, FAST);
        let result: Result<&str, _> = poller.run(|| async { Ok("up") }).await;
        assert_eq!(result.expect("immediate success"), "up");
    }
}
