//! Monotonic tick time base
//!
//! The hardware timer interrupt increments a free-running 32-bit counter and
//! does nothing else. Deadlines are compared with signed wraparound
//! subtraction, which leaves half the tick space (about 248 days at 100 Hz)
//! as unambiguous look-ahead.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

/// One timer interrupt period
pub type Tick = u32;

/// Timer interrupt rate
pub const TICKS_PER_SEC: Tick = 100;

/// Convert milliseconds to ticks, rounding up so a non-zero delay never becomes zero
pub const fn ms_to_ticks(ms: u32) -> Tick {
    (ms * TICKS_PER_SEC).div_ceil(1000)
}

/// Convert seconds to ticks
pub const fn secs_to_ticks(secs: u32) -> Tick {
    secs.saturating_mul(TICKS_PER_SEC)
}

/// Source of the current tick count
pub trait Clock {
    fn now(&self) -> Tick;
}

/// Free-running tick counter fed by the timer interrupt
///
/// `tick()` is the only thing the interrupt handler calls. The stack reads
/// the counter through the [`Clock`] impls for `&'static TickCounter` or
/// `Arc<TickCounter>`.
#[derive(Debug, Default)]
pub struct TickCounter {
    ticks: AtomicU32,
}

impl TickCounter {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU32::new(0),
        }
    }

    /// Start the counter at an arbitrary value (used to exercise wraparound)
    pub const fn starting_at(start: Tick) -> Self {
        Self {
            ticks: AtomicU32::new(start),
        }
    }

    /// Advance by one tick; called from the timer interrupt
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Advance by `n` ticks at once
    pub fn advance(&self, n: Tick) {
        self.ticks.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> Tick {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Clock for &'static TickCounter {
    fn now(&self) -> Tick {
        self.get()
    }
}

impl Clock for Arc<TickCounter> {
    fn now(&self) -> Tick {
        self.get()
    }
}

/// Longest delay a deadline can express
///
/// Deadlines are compared by signed wraparound difference, so anything
/// further out than half the tick space would already read as expired.
pub const MAX_DELAY: Tick = i32::MAX as Tick;

/// Deadline `ticks` from `now`, clamped to [`MAX_DELAY`]
pub fn set_timer(now: Tick, ticks: Tick) -> Tick {
    now.wrapping_add(ticks.min(MAX_DELAY))
}

/// Has `deadline` been reached at `now`?
pub fn is_expired(now: Tick, deadline: Tick) -> bool {
    (now.wrapping_sub(deadline) as i32) >= 0
}

/// One-shot timer owned by a sink
///
/// Cleared by the dispatcher immediately before its callback runs, so the
/// callback must re-arm it explicitly.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    deadline: Option<Tick>,
}

impl Timer {
    pub const fn new() -> Self {
        Self { deadline: None }
    }

    pub fn arm(&mut self, now: Tick, ticks: Tick) {
        self.deadline = Some(set_timer(now, ticks));
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Tick> {
        self.deadline
    }

    /// Armed and past its deadline
    pub fn is_due(&self, now: Tick) -> bool {
        self.deadline.is_some_and(|d| is_expired(now, d))
    }
}
