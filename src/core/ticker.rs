//! Monotonic time sources.
//!
//! Every expiry, refresh, and scheduling decision in the crate reads time
//! through the [`Ticker`] trait so tests can drive the clock by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonic nanosecond clock.
pub trait Ticker: Send + Sync {
    /// Returns the number of nanoseconds elapsed from an arbitrary fixed origin.
    fn now_nanos(&self) -> u64;
}

/// The default ticker, anchored to process start.
#[derive(Debug)]
pub struct SystemTicker {
    origin: Instant,
}

impl SystemTicker {
    /// Creates a ticker anchored at the moment of construction.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for SystemTicker {
    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// A ticker advanced explicitly, for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualTicker {
    nanos: AtomicU64,
}

impl ManualTicker {
    /// Creates a manual ticker starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock by `nanos` nanoseconds.
    pub fn advance_nanos(&self, nanos: u64) {
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Advances the clock by `millis` milliseconds.
    pub fn advance_millis(&self, millis: u64) {
        self.advance_nanos(millis * 1_000_000);
    }
}

impl Ticker for ManualTicker {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// Converts a non-negative millisecond interval to nanoseconds.
pub(crate) fn millis_to_nanos(millis: i64) -> u64 {
    u64::try_from(millis).unwrap_or(0) * 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_ticker_advances() {
        let ticker = ManualTicker::new();
        assert_eq!(ticker.now_nanos(), 0);
        ticker.advance_millis(5);
        assert_eq!(ticker.now_nanos(), 5_000_000);
        ticker.advance_nanos(1);
        assert_eq!(ticker.now_nanos(), 5_000_001);
    }

    #[test]
    fn test_system_ticker_is_monotonic() {
        let ticker = SystemTicker::new();
        let a = ticker.now_nanos();
        let b = ticker.now_nanos();
        assert!(b >= a);
    }

    #[test]
    fn test_millis_to_nanos_clamps_negative() {
        assert_eq!(millis_to_nanos(-1), 0);
        assert_eq!(millis_to_nanos(3), 3_000_000);
    }
}
