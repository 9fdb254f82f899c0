//! Bounded fixed-delay retry for transient collaborator failures.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between attempts, in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 2000,
        }
    }
}

impl RetryPolicy {
    /// No retries and no delay.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> Result<T, Error>
    where
        F: FnMut() -> Result<T, Error>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(operation, attempt, attempts, "transient failure, retrying: {}", e);
                    if self.delay_ms > 0 {
                        thread::sleep(Duration::from_millis(self.delay_ms));
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
