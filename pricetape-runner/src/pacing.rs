//! Request pacing and rate-limit backoff.
//!
//! `RequestPacer` is shared by every fetch worker. Each request start takes
//! the next free slot; slots are at least `min_spacing` plus a random jitter
//! apart. A rate-limit signal pushes the next free slot out by a backoff
//! delay, which stalls every worker and is the only backpressure applied to
//! the source.

use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Longest single sleep while waiting for a slot; bounds stop-flag latency.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Exponential backoff with a cap and additive jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: Duration::from_millis(500),
        }
    }
}

impl BackoffPolicy {
    /// Deterministic part of the delay for `attempt` (1-based):
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// `base_delay(attempt)` plus uniform jitter in `[0, jitter]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + random_up_to(self.jitter)
    }
}

fn random_up_to(bound: Duration) -> Duration {
    let ms = bound.as_millis() as u64;
    if ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
}

/// Shared spacing gate for request starts.
#[derive(Debug)]
pub struct RequestPacer {
    min_spacing: Duration,
    jitter: Duration,
    next_slot: Mutex<Instant>,
    consecutive_rate_limits: AtomicU32,
}

impl RequestPacer {
    pub fn new(min_spacing: Duration, jitter: Duration) -> Self {
        Self {
            min_spacing,
            jitter,
            next_slot: Mutex::new(Instant::now()),
            consecutive_rate_limits: AtomicU32::new(0),
        }
    }

    /// No spacing at all. For tests and local sources.
    pub fn unpaced() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Reserve the next request slot and sleep until it arrives.
    ///
    /// Returns false without waiting out the slot if `stop` is raised.
    pub fn wait(&self, stop: Option<&AtomicBool>) -> bool {
        let slot = {
            let mut next = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = (*next).max(Instant::now());
            *next = slot + self.min_spacing + random_up_to(self.jitter);
            slot
        };
        sleep_until(slot, stop)
    }

    /// Push the next free slot at least `delay` into the future.
    pub fn penalize(&self, delay: Duration) {
        let mut next = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let until = Instant::now() + delay;
        if until > *next {
            *next = until;
        }
    }

    /// Count a rate-limit signal; returns the new consecutive count, which
    /// doubles as the backoff attempt number.
    pub fn record_rate_limit(&self) -> u32 {
        self.consecutive_rate_limits.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_success(&self) {
        self.consecutive_rate_limits.store(0, Ordering::Relaxed);
    }

    pub fn consecutive_rate_limits(&self) -> u32 {
        self.consecutive_rate_limits.load(Ordering::Relaxed)
    }
}

/// Sleep until `deadline` in short slices. Returns false if `stop` was raised.
pub(crate) fn sleep_until(deadline: Instant, stop: Option<&AtomicBool>) -> bool {
    loop {
        if stop.is_some_and(|f| f.load(Ordering::Relaxed)) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
