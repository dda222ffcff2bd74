//! The three request aggregators.
//!
//! Each aggregator is pure cached state behind a single lock; none of them
//! performs upstream I/O. The client facade owns the transport and drains
//! them on its schedule.

pub mod check;
pub mod quota;
pub mod report;

pub use check::CheckAggregator;
pub use quota::QuotaAggregator;
pub use report::ReportAggregator;

use crate::signing::Fingerprint;
use std::collections::VecDeque;

/// Interval sentinel returned when an aggregator is configured non-caching.
pub const NON_CACHING: i64 = -1;

/// Access-ordered index over fingerprints, used for capacity eviction.
///
/// Each touch appends a freshly stamped entry; stale stamps left behind by
/// later touches are skipped lazily when the front is popped.
#[derive(Debug, Default)]
pub(crate) struct AccessOrder {
    queue: VecDeque<(u64, Fingerprint)>,
    next_stamp: u64,
}

impl AccessOrder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Marks `key` as most recently used and returns the stamp the owning
    /// entry must store for [`Self::pop_lru`] to recognise it as current.
    pub(crate) fn touch(&mut self, key: Fingerprint) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.queue.push_back((stamp, key));
        stamp
    }

    /// Pops the least recently used key whose stored stamp is still current.
    ///
    /// `stamp_of` reports the owning map's stamp for a key, or `None` when
    /// the key is gone.
    pub(crate) fn pop_lru<F>(&mut self, stamp_of: F) -> Option<Fingerprint>
    where
        F: Fn(&Fingerprint) -> Option<u64>,
    {
        while let Some((stamp, key)) = self.queue.pop_front() {
            if stamp_of(&key) == Some(stamp) {
                return Some(key);
            }
        }
        None
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.next_stamp = 0;
    }
}
