use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::MigrationError;

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    Pending(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max_interval: Duration,
    deadline: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max_interval: Duration, deadline: Duration) -> Self {
        Self {
            initial,
            max_interval: max_interval.max(initial),
            deadline,
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Interval to sleep before probe number `attempt` (0-based), doubling each time.
    pub fn interval(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max_interval, |d| d.min(self.max_interval))
    }
}

/// Sleep-then-probe until the probe reports ready or the deadline passes.
///
/// The first probe happens after the initial interval, since every caller has
/// just issued the request whose effect it is waiting for.
pub fn poll_until<T, F>(backoff: &Backoff, what: &str, mut probe: F) -> Result<T, MigrationError>
where
    F: FnMut() -> Result<Poll<T>, MigrationError>,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        let elapsed = started.elapsed();
        if elapsed >= backoff.deadline {
            return Err(MigrationError::Timeout {
                what: what.to_string(),
                elapsed,
            });
        }

        let remaining = backoff.deadline - elapsed;
        thread::sleep(backoff.interval(attempt).min(remaining));

        match probe()? {
            Poll::Ready(value) => {
                debug!(what, attempt, elapsed = ?started.elapsed(), "wait complete");
                return Ok(value);
            }
            Poll::Pending(status) => {
                debug!(what, attempt, %status, "still waiting");
                println!("  Waiting for {}: {}", what, status);
            }
        }
        attempt = attempt.saturating_add(1);
    }
}
