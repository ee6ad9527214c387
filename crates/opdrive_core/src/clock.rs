//! Clocks used for hybrid time assignment and commit wait.

use crate::error::{DriverError, DriverResult};
use crate::types::HybridTime;
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Microseconds on a process-wide monotonic clock.
///
/// Used for diagnostics and order verification, never to order operations.
pub fn monotonic_micros() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    duration_micros(epoch.elapsed())
}

/// Whole microseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn duration_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Source of hybrid timestamps.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> HybridTime;

    /// Returns the maximum error of [`Clock::now`].
    fn max_error(&self) -> Duration;

    /// Blocks until the earliest possible current time is past `time`, or
    /// `deadline` passes.
    ///
    /// # Errors
    ///
    /// Returns `TimedOut` if the deadline passes first.
    fn wait_until_after(&self, time: HybridTime, deadline: Instant) -> DriverResult<()> {
        let error = duration_micros(self.max_error());
        loop {
            let earliest = self.now().as_micros().saturating_sub(error);
            if earliest > time.as_micros() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::timed_out(format!(
                    "clock did not pass {time} before the commit wait deadline"
                )));
            }
            let behind = Duration::from_micros(time.as_micros() - earliest + 1);
            thread::sleep(behind.min(deadline - now));
        }
    }
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    max_error: Duration,
}

impl SystemClock {
    /// Creates a clock with the given maximum error.
    #[must_use]
    pub const fn new(max_error: Duration) -> Self {
        Self { max_error }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

impl Clock for SystemClock {
    fn now(&self) -> HybridTime {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        HybridTime::from_micros(micros)
    }

    fn max_error(&self) -> Duration {
        self.max_error
    }
}
