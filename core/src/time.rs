//! Monotonic kernel time, derived from the boot core's timer tick.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::TIMER_PERIOD_US;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Advance the clock by one timer period. Called from the boot core's timer
/// interrupt only.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Microseconds since boot, at timer granularity.
pub fn monotonic_us() -> u64 {
    ticks() * TIMER_PERIOD_US
}
