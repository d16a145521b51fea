// Licensed under the Apache-2.0 license

//! Waiting for an SGDMA engine to drain.

use crate::engine::Engine;
use crate::error::{Error, Result};
use log::{debug, error};
use poll_common::{poll_with_backoff, PollError};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub trait Completion: Send + Sync {
    /// Returns once `engine` has no queued or executing descriptors, or
    /// fails with [`Error::DeviceTimeout`] after `timeout`.
    fn wait_idle(&self, engine: &Engine<'_>, timeout: Duration) -> Result<()>;
}

fn timed_out(engine: &Engine<'_>, waited: Duration) -> Error {
    let status = engine.status().map(|s| s.get()).unwrap_or(u32::MAX);
    error!(
        "SGDMA engine did not go idle after {:?} (status {:#x})",
        waited, status
    );
    Error::DeviceTimeout { status, waited }
}

/// Re-reads the status register until the engine is idle.
pub struct PollingCompletion {
    interval: Duration,
}

impl PollingCompletion {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Completion for PollingCompletion {
    fn wait_idle(&self, engine: &Engine<'_>, timeout: Duration) -> Result<()> {
        let result = poll_with_backoff(timeout, self.interval, |_| {
            Ok::<_, Error>(engine.is_idle()?.then_some(()))
        });
        match result {
            Ok(()) => Ok(()),
            Err(PollError::Failed(e)) => Err(e),
            Err(PollError::Timeout { waited, attempts }) => {
                debug!("Completion poll gave up after {} reads", attempts);
                Err(timed_out(engine, waited))
            }
        }
    }
}

/// Raised by whatever learns that an engine went idle: an interrupt handler,
/// or a simulated device.
#[derive(Default)]
pub struct CompletionSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        self.cond.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the generation moves past `seen` or `timeout` passes.
    /// Returns the current generation.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> u64 {
        let guard = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |generation| *generation == seen)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Sleeps on a [`CompletionSignal`] between status checks. The status
/// register stays authoritative; a missed or spurious signal only costs one
/// `recheck` interval.
pub struct SignaledCompletion {
    signal: std::sync::Arc<CompletionSignal>,
    recheck: Duration,
}

impl SignaledCompletion {
    pub fn new(signal: std::sync::Arc<CompletionSignal>, recheck: Duration) -> Self {
        Self { signal, recheck }
    }
}

impl Completion for SignaledCompletion {
    fn wait_idle(&self, engine: &Engine<'_>, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let mut seen = self.signal.generation();
        loop {
            if engine.is_idle()? {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(timed_out(engine, waited));
            }
            seen = self
                .signal
                .wait_past(seen, self.recheck.min(timeout - waited));
        }
    }
}
