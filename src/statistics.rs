//! Client performance counters.
//!
//! One [`Statistics`] instance is shared by the facade and the scheduler.
//! Counters are monotonic atomics updated from any thread; readers take a
//! point-in-time snapshot only when the summary is rendered.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing the performance of a client instance.
#[derive(Debug, Default)]
pub struct Statistics {
    /// Check calls received.
    pub total_checks: AtomicU64,
    /// Check calls answered from the cache.
    pub check_hits: AtomicU64,
    /// Check responses refreshed proactively. No refresh path exists yet,
    /// so this stays at zero; kept for summary-format stability.
    pub recached_checks: AtomicU64,
    /// Quota calls received.
    pub total_quotas: AtomicU64,
    /// Quota calls answered from the cache.
    pub quota_hits: AtomicU64,
    /// Quota responses re-cached by the background refresh.
    pub recached_quotas: AtomicU64,
    /// Report calls received.
    pub total_reports: AtomicU64,
    /// Report calls sent upstream without aggregation.
    pub direct_reports: AtomicU64,
    /// Batched requests produced by report flushes.
    pub flushed_reports: AtomicU64,
    /// Operations received across all report calls.
    pub reported_operations: AtomicU64,
    /// Operations sent upstream by report flushes.
    pub flushed_operations: AtomicU64,
    /// Events the scheduler has run.
    pub total_scheduler_runs: AtomicU64,
    /// Times the scheduler found its head event not yet due.
    pub total_scheduler_skips: AtomicU64,

    /// Cumulative check cache lookup time.
    pub total_check_cache_lookup_millis: AtomicU64,
    /// Cumulative check cache update time.
    pub total_check_cache_update_millis: AtomicU64,
    /// Cumulative check transport time.
    pub total_check_transport_millis: AtomicU64,
    /// Cumulative quota cache lookup time.
    pub total_quota_cache_lookup_millis: AtomicU64,
    /// Cumulative quota cache update time.
    pub total_quota_cache_update_millis: AtomicU64,
    /// Cumulative quota transport time.
    pub total_quota_transport_millis: AtomicU64,
    /// Cumulative report cache update time.
    pub total_report_cache_update_millis: AtomicU64,
    /// Cumulative report transport time, direct and flushed.
    pub total_transported_report_millis: AtomicU64,
    /// Cumulative time spent running scheduler events.
    pub total_scheduler_run_millis: AtomicU64,
    /// Cumulative time the scheduler found until not-yet-due events.
    pub total_scheduler_skip_millis: AtomicU64,
}

fn divide(dividend: u64, divisor: u64) -> f64 {
    if divisor == 0 {
        return 0.0;
    }
    dividend as f64 / divisor as f64
}

impl Statistics {
    /// Creates a zeroed counter bag.
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Percentage of check calls answered from the cache.
    pub fn check_hits_percent(&self) -> f64 {
        100.0 * divide(self.get(&self.check_hits), self.get(&self.total_checks))
    }

    /// Percentage of quota calls answered from the cache.
    pub fn quota_hits_percent(&self) -> f64 {
        100.0 * divide(self.get(&self.quota_hits), self.get(&self.total_quotas))
    }

    /// Check calls that had to go upstream.
    pub fn direct_checks(&self) -> u64 {
        self.get(&self.total_checks) - self.get(&self.check_hits)
    }

    /// Check requests transported upstream, direct plus recached.
    pub fn total_checks_transported(&self) -> u64 {
        self.direct_checks() + self.get(&self.recached_checks)
    }

    /// Report requests transported upstream, direct plus flushed.
    pub fn total_reports_transported(&self) -> u64 {
        self.get(&self.direct_reports) + self.get(&self.flushed_reports)
    }

    /// Mean upstream latency per transported check.
    pub fn mean_check_transport_millis(&self) -> f64 {
        divide(
            self.get(&self.total_check_transport_millis),
            self.total_checks_transported(),
        )
    }

    /// Mean cache-lookup latency per check call.
    pub fn mean_check_cache_lookup_millis(&self) -> f64 {
        divide(
            self.get(&self.total_check_cache_lookup_millis),
            self.get(&self.total_checks),
        )
    }

    /// Mean upstream latency per transported report.
    pub fn mean_transported_report_millis(&self) -> f64 {
        divide(
            self.get(&self.total_transported_report_millis),
            self.total_reports_transported(),
        )
    }

    /// Mean cache-update latency per aggregated report call.
    pub fn mean_report_cache_update_millis(&self) -> f64 {
        let aggregated = self.get(&self.total_reports) - self.get(&self.direct_reports);
        divide(self.get(&self.total_report_cache_update_millis), aggregated)
    }

    /// Mean time spent per scheduler event run.
    pub fn mean_scheduler_run_millis(&self) -> f64 {
        divide(
            self.get(&self.total_scheduler_run_millis),
            self.get(&self.total_scheduler_runs),
        )
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A consistent two-space indent keeps the output valid YAML.
        writeln!(f, "statistics:")?;
        writeln!(f, "  total_checks: {}", self.get(&self.total_checks))?;
        writeln!(f, "  check_hits: {}", self.get(&self.check_hits))?;
        writeln!(f, "  check_hits_percent: {}", self.check_hits_percent())?;
        writeln!(f, "  recached_checks: {}", self.get(&self.recached_checks))?;
        writeln!(f, "  direct_checks: {}", self.direct_checks())?;
        writeln!(f, "  total_checks_transported: {}", self.total_checks_transported())?;
        writeln!(
            f,
            "  total_check_transport_millis: {}",
            self.get(&self.total_check_transport_millis)
        )?;
        writeln!(f, "  mean_check_transport_millis: {}", self.mean_check_transport_millis())?;
        writeln!(
            f,
            "  total_check_cache_lookup_millis: {}",
            self.get(&self.total_check_cache_lookup_millis)
        )?;
        writeln!(
            f,
            "  mean_check_cache_lookup_millis: {}",
            self.mean_check_cache_lookup_millis()
        )?;
        writeln!(f, "  total_quotas: {}", self.get(&self.total_quotas))?;
        writeln!(f, "  quota_hits: {}", self.get(&self.quota_hits))?;
        writeln!(f, "  quota_hits_percent: {}", self.quota_hits_percent())?;
        writeln!(f, "  recached_quotas: {}", self.get(&self.recached_quotas))?;
        writeln!(
            f,
            "  total_quota_transport_millis: {}",
            self.get(&self.total_quota_transport_millis)
        )?;
        writeln!(f, "  total_reports: {}", self.get(&self.total_reports))?;
        writeln!(f, "  direct_reports: {}", self.get(&self.direct_reports))?;
        writeln!(f, "  flushed_reports: {}", self.get(&self.flushed_reports))?;
        writeln!(f, "  total_reports_transported: {}", self.total_reports_transported())?;
        writeln!(
            f,
            "  total_transported_report_millis: {}",
            self.get(&self.total_transported_report_millis)
        )?;
        writeln!(
            f,
            "  mean_transported_report_millis: {}",
            self.mean_transported_report_millis()
        )?;
        writeln!(f, "  reported_operations: {}", self.get(&self.reported_operations))?;
        writeln!(f, "  flushed_operations: {}", self.get(&self.flushed_operations))?;
        writeln!(f, "  total_scheduler_runs: {}", self.get(&self.total_scheduler_runs))?;
        writeln!(
            f,
            "  total_scheduler_run_millis: {}",
            self.get(&self.total_scheduler_run_millis)
        )?;
        writeln!(f, "  mean_scheduler_run_millis: {}", self.mean_scheduler_run_millis())?;
        writeln!(f, "  total_scheduler_skips: {}", self.get(&self.total_scheduler_skips))?;
        write!(
            f,
            "  total_scheduler_skip_millis: {}",
            self.get(&self.total_scheduler_skip_millis)
        )
    }
}
