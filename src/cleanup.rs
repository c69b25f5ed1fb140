//! Ordered, error-tolerant teardown sequencing
//!
//! Teardown never aborts early: every step runs, failures are logged as they
//! happen, and all of them are folded into one combined error at the end.
//! Fatality decisions are left to the caller.

use tracing::warn;

use crate::{Error, Result};

/// Collects step failures during teardown.
#[derive(Debug, Default)]
pub struct CleanupSequencer {
    failures: Vec<String>,
}

impl CleanupSequencer {
    /// An empty sequencer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step result. A failure is logged and retained; it does not
    /// stop subsequent steps.
    pub fn record(&mut self, step: &str, result: Result<()>) {
        if let Err(e) = result {
            warn!(step, error = %e, "teardown step failed, continuing");
            self.failures.push(format!("{}: {}", step, e));
        }
    }

    /// Record a bare failure message for a step without a `Result`.
    pub fn record_failure(&mut self, step: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(step, error = %message, "teardown step failed, continuing");
        self.failures.push(format!("{}: {}", step, message));
    }

    /// Whether every recorded step succeeded so far.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fold all recorded failures into one combined result.
    pub fn finish(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(self.failures))
        }
    }
}
