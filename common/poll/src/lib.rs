// Licensed under the Apache-2.0 license

//! Bounded polling for conditions that can only be observed by reading a
//! register, with no interrupt-based notification.

use std::time::{Duration, Instant};

const SPIN_ATTEMPTS: u64 = 64;
const YIELD_ATTEMPTS: u64 = 256;
const SHORT_SLEEP_ATTEMPTS: u64 = 256;
const SHORT_SLEEP_DURATION: Duration = Duration::from_micros(10);

/// Yields the current thread with increasing patience, for the lifetime of
/// one spin loop.
///
/// The first attempts only spin, then the thread yields, then it sleeps for
/// a short fixed time, and finally for `max_sleep` per attempt.
pub struct Backoff {
    n: u64,
    max_sleep: Duration,
}

impl Backoff {
    pub fn new(max_sleep: Duration) -> Self {
        Self { n: 0, max_sleep }
    }

    /// Number of times `back_off` has been called.
    pub fn attempts(&self) -> u64 {
        self.n
    }

    /// True once the loop has moved past spinning and yielding.
    pub fn is_sleeping(&self) -> bool {
        self.n >= SPIN_ATTEMPTS + YIELD_ATTEMPTS
    }

    pub fn back_off(&mut self) {
        if self.n < SPIN_ATTEMPTS {
            std::hint::spin_loop();
        } else if self.n < SPIN_ATTEMPTS + YIELD_ATTEMPTS {
            std::thread::yield_now();
        } else if self.n < SPIN_ATTEMPTS + YIELD_ATTEMPTS + SHORT_SLEEP_ATTEMPTS {
            std::thread::sleep(SHORT_SLEEP_DURATION.min(self.max_sleep));
        } else {
            std::thread::sleep(self.max_sleep);
        }
        self.n += 1;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollError<E> {
    /// The condition did not hold before the deadline.
    Timeout { waited: Duration, attempts: u64 },
    Failed(E),
}

/// Calls `f` until it returns `Some`, backing off between calls.
///
/// `f` is always called at least once, and once more after the deadline has
/// passed, so a condition that became true while the thread slept is not
/// reported as a timeout.
pub fn poll_with_backoff<T, E>(
    timeout: Duration,
    max_sleep: Duration,
    mut f: impl FnMut(&Backoff) -> Result<Option<T>, E>,
) -> Result<T, PollError<E>> {
    let start = Instant::now();
    let mut backoff = Backoff::new(max_sleep);
    loop {
        let expired = start.elapsed() >= timeout;
        if let Some(v) = f(&backoff).map_err(PollError::Failed)? {
            return Ok(v);
        }
        if expired {
            return Err(PollError::Timeout {
                waited: start.elapsed(),
                attempts: backoff.attempts(),
            });
        }
        backoff.back_off();
    }
}

/// Polls `f` every `interval` until it returns `Ok(true)`, fails, or
/// `timeout` passes.
pub fn poll_until(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> anyhow::Result<bool>,
) -> anyhow::Result<()> {
    let start = Instant::now();
    loop {
        if f()? {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            anyhow::bail!("timed out after {:?}", start.elapsed());
        }
        std::thread::sleep(interval);
    }
}
