//! TTL cache of quota-allocation responses with amount deduction.

use crate::aggregator::{AccessOrder, NON_CACHING};
use crate::core::config::QuotaAggregationConfig;
use crate::core::error::{Result, TollgateError};
use crate::core::ticker::{millis_to_nanos, Ticker};
use crate::core::types::{
    int64_amounts, AllocateQuotaRequest, AllocateQuotaResponse, MetricValue, MetricValueSet,
};
use crate::signing::{sign_quota, Fingerprint};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug)]
struct CacheEntry {
    response: AllocateQuotaResponse,
    /// Allowance left from the last upstream grant, per metric.
    remaining: BTreeMap<String, i64>,
    /// Amounts deducted since the last refresh, per metric.
    consumed: BTreeMap<String, i64>,
    /// Request skeleton reused to build refresh requests.
    request: AllocateQuotaRequest,
    last_refresh_nanos: u64,
    last_access_nanos: u64,
    /// Advisory hint that a refresh for this entry is already under way.
    is_refreshing: bool,
    stamp: u64,
}

#[derive(Debug, Default)]
struct Interior {
    entries: HashMap<Fingerprint, CacheEntry>,
    order: AccessOrder,
}

/// Caches allocation responses keyed by request fingerprint.
///
/// A cache hit deducts the request's amounts from the entry's remaining
/// allowance; when an amount would go negative the entry is flagged for
/// refresh and the caller is told to go upstream. [`Self::flush`] emits
/// refresh requests carrying the consumption accumulated since the last
/// grant, so the upstream observes real usage.
pub struct QuotaAggregator {
    service_name: String,
    config: QuotaAggregationConfig,
    ticker: Arc<dyn Ticker>,
    /// `None` when the configuration disables caching.
    interior: Option<Mutex<Interior>>,
}

impl QuotaAggregator {
    /// Creates an aggregator for `service_name`.
    pub fn new(
        service_name: &str,
        config: QuotaAggregationConfig,
        ticker: Arc<dyn Ticker>,
    ) -> Result<Self> {
        if service_name.is_empty() {
            return Err(TollgateError::config("service name cannot be empty"));
        }
        config.validate()?;
        let interior = config.is_caching().then(|| Mutex::new(Interior::default()));
        Ok(Self {
            service_name: service_name.to_owned(),
            config,
            ticker,
            interior,
        })
    }

    /// The service whose requests this aggregator caches.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The refresh cadence, or [`NON_CACHING`] when caching is disabled.
    pub fn flush_interval_millis(&self) -> i64 {
        if self.interior.is_none() {
            return NON_CACHING;
        }
        self.config.refresh_millis
    }

    /// Attempts to satisfy `req` from the cache.
    ///
    /// Returns `None` when the caller must perform the upstream call: no
    /// entry, an expired entry, or insufficient remaining allowance (the
    /// entry is then flagged for refresh). A cached failed allocation is
    /// returned as-is without deduction.
    pub fn allocate_quota(&self, req: &AllocateQuotaRequest) -> Result<Option<AllocateQuotaResponse>> {
        let Some(interior) = &self.interior else {
            return Ok(None);
        };
        if req.service_name != self.service_name {
            return Err(TollgateError::invalid_request(format!(
                "service name mismatch: aggregator '{}', request '{}'",
                self.service_name, req.service_name
            )));
        }
        let signature = sign_quota(req)?;
        let now = self.ticker.now_nanos();

        let mut guard = interior.lock();
        let expired = match guard.entries.get(&signature) {
            None => return Ok(None),
            Some(entry) => {
                self.config.expiration_millis >= 0
                    && now.saturating_sub(entry.last_refresh_nanos)
                        >= millis_to_nanos(self.config.expiration_millis)
            },
        };
        if expired {
            guard.entries.remove(&signature);
            return Ok(None);
        }
        let requested = int64_amounts(&req.operation()?.metric_value_sets);
        let Some(entry) = guard.entries.get_mut(&signature) else {
            return Ok(None);
        };
        entry.last_access_nanos = now;
        if !entry.response.is_ok() {
            // Keep failing fast on the cached denial until a refresh lands.
            return Ok(Some(entry.response.clone()));
        }
        if entry.remaining.is_empty() {
            // A grant with no metrics is the fail-open default cached after
            // an upstream failure; serve it unmetered so a broken upstream
            // is not hammered, until the interval refresh replaces it.
            return Ok(Some(entry.response.clone()));
        }

        let depleted = requested
            .iter()
            .any(|(metric, amount)| entry.remaining.get(metric).copied().unwrap_or(0) < *amount);
        if depleted {
            entry.is_refreshing = true;
            return Ok(None);
        }
        for (metric, amount) in &requested {
            *entry.remaining.entry(metric.clone()).or_insert(0) -= *amount;
            *entry.consumed.entry(metric.clone()).or_insert(0) += *amount;
        }
        let response = entry.response.clone();
        let stamp = guard.order.touch(signature);
        if let Some(entry) = guard.entries.get_mut(&signature) {
            entry.stamp = stamp;
        }
        Ok(Some(response))
    }

    /// Populates or refreshes the entry for `req` from an upstream response.
    pub fn cache_response(
        &self,
        req: &AllocateQuotaRequest,
        resp: &AllocateQuotaResponse,
    ) -> Result<()> {
        let Some(interior) = &self.interior else {
            return Ok(());
        };
        let signature = sign_quota(req)?;
        let now = self.ticker.now_nanos();

        let mut guard = interior.lock();
        let stamp = guard.order.touch(signature);
        guard.entries.insert(
            signature,
            CacheEntry {
                response: resp.clone(),
                remaining: resp.granted_amounts(),
                consumed: BTreeMap::new(),
                request: req.clone(),
                last_refresh_nanos: now,
                last_access_nanos: now,
                is_refreshing: false,
                stamp,
            },
        );
        self.evict_over_capacity(&mut guard);
        Ok(())
    }

    /// Emits refresh requests for entries due by interval or flagged by a
    /// depleted allocation, and ages out entries idle past the TTL.
    ///
    /// Each emitted request carries the consumption accumulated since the
    /// last refresh as its int64 metric values.
    pub fn flush(&self) -> Vec<AllocateQuotaRequest> {
        let Some(interior) = &self.interior else {
            return Vec::new();
        };
        let now = self.ticker.now_nanos();
        let refresh_after = millis_to_nanos(self.config.refresh_millis.max(0));

        let mut guard = interior.lock();
        if self.config.expiration_millis >= 0 {
            let idle_limit = millis_to_nanos(self.config.expiration_millis);
            guard
                .entries
                .retain(|_, entry| now.saturating_sub(entry.last_access_nanos) < idle_limit);
        }

        let mut refreshes = Vec::new();
        for entry in guard.entries.values_mut() {
            let due = now.saturating_sub(entry.last_refresh_nanos) >= refresh_after;
            if !due && !entry.is_refreshing {
                continue;
            }
            let mut request = entry.request.clone();
            if let Some(op) = request.operation.as_mut() {
                op.metric_value_sets = entry
                    .consumed
                    .iter()
                    .map(|(metric, amount)| {
                        MetricValueSet::single(metric.clone(), MetricValue::int64(*amount))
                    })
                    .collect();
            }
            entry.consumed.clear();
            entry.is_refreshing = true;
            refreshes.push(request);
        }
        refreshes
    }

    /// Drops all cached entries.
    pub fn clear(&self) {
        if let Some(interior) = &self.interior {
            let mut guard = interior.lock();
            guard.entries.clear();
            guard.order.clear();
        }
    }

    fn evict_over_capacity(&self, guard: &mut Interior) {
        let capacity = self.config.num_entries as usize;
        while guard.entries.len() > capacity {
            let Interior { entries, order } = guard;
            match order.pop_lru(|key| entries.get(key).map(|e| e.stamp)) {
                Some(stale) => {
                    entries.remove(&stale);
                },
                None => break,
            }
        }
    }
}
