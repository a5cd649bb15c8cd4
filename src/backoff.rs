//! Fixed retry schedule shared by process termination and set destruction.
//!
//! Polling starts sub-second and coarsens to whole seconds. The schedule is
//! bounded: once every step has been waited the caller gives up (escalates
//! to SIGKILL, or reports the set as stuck).

use std::thread;
use std::time::Duration;

/// A finite sequence of waits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    steps: Vec<Duration>,
}

impl Backoff {
    /// 10 x 100ms, 4 x 500ms, 3 x 1s (about 6 seconds in total)
    #[must_use]
    pub fn deadline_pattern() -> Self {
        let mut steps = vec![Duration::from_millis(100); 10];
        steps.extend([Duration::from_millis(500); 4]);
        steps.extend([Duration::from_secs(1); 3]);
        Self { steps }
    }

    /// `attempts` retries with no waiting in between
    #[must_use]
    pub fn immediate(attempts: usize) -> Self {
        Self {
            steps: vec![Duration::ZERO; attempts],
        }
    }

    /// Custom schedule
    #[must_use]
    pub fn from_steps(steps: Vec<Duration>) -> Self {
        Self { steps }
    }

    /// Number of retries after the first attempt
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.steps.len()
    }

    /// Total time spent waiting if every step is used
    #[must_use]
    pub fn total(&self) -> Duration {
        self.steps.iter().sum()
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// the schedule is exhausted (the last error is returned).
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt.
    pub fn retry<T, E>(
        &self,
        mut op: impl FnMut() -> Result<T, E>,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E> {
        let mut result = op();
        for step in &self.steps {
            match &result {
                Err(e) if retryable(e) => {
                    thread::sleep(*step);
                    result = op();
                }
                _ => break,
            }
        }
        result
    }

    /// Poll `done` until it returns true; false if the schedule ran out.
    pub fn wait_until(&self, mut done: impl FnMut() -> bool) -> bool {
        if done() {
            return true;
        }
        for step in &self.steps {
            thread::sleep(*step);
            if done() {
                return true;
            }
        }
        false
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::deadline_pattern()
    }
}
