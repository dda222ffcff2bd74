//! TTL cache of access-check responses.

use crate::aggregator::{AccessOrder, NON_CACHING};
use crate::core::config::CheckAggregationConfig;
use crate::core::error::{Result, TollgateError};
use crate::core::ticker::{millis_to_nanos, Ticker};
use crate::core::types::{CheckRequest, CheckResponse, Importance};
use crate::signing::{sign_check, Fingerprint};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
struct CacheEntry {
    response: CheckResponse,
    last_refresh_nanos: u64,
    /// Advisory hint that a refresh for this entry is already under way.
    /// Cleared on every write; nothing sets it until a proactive refresh
    /// path exists.
    #[allow(dead_code)]
    is_flushing: bool,
    stamp: u64,
}

#[derive(Debug, Default)]
struct Interior {
    entries: HashMap<Fingerprint, CacheEntry>,
    order: AccessOrder,
}

/// Caches check responses keyed by request fingerprint.
///
/// A cached response is served to LOW-importance requests until it expires;
/// a cached response that carries check errors is served just the same, on
/// the assumption that the request would fail again, until the first
/// post-expiry request refreshes it. HIGH-importance requests always bypass
/// the cache.
pub struct CheckAggregator {
    service_name: String,
    config: CheckAggregationConfig,
    ticker: Arc<dyn Ticker>,
    /// `None` when the configuration disables caching.
    interior: Option<Mutex<Interior>>,
}

impl CheckAggregator {
    /// Creates an aggregator for `service_name`.
    pub fn new(
        service_name: &str,
        config: CheckAggregationConfig,
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

    /// The configured TTL, or [`NON_CACHING`] when caching is disabled.
    pub fn expiration_millis(&self) -> i64 {
        if self.interior.is_none() {
            return NON_CACHING;
        }
        self.config.expiration_millis
    }

    /// Looks up a cached response for `req`.
    ///
    /// Returns `None` when the caller should perform the upstream call: the
    /// cache is disabled, the request is HIGH importance, there is no entry,
    /// or the entry has expired.
    pub fn check(&self, req: &CheckRequest) -> Result<Option<CheckResponse>> {
        let Some(interior) = &self.interior else {
            return Ok(None);
        };
        if req.service_name != self.service_name {
            return Err(TollgateError::invalid_request(format!(
                "service name mismatch: aggregator '{}', request '{}'",
                self.service_name, req.service_name
            )));
        }
        let signature = sign_check(req)?;
        if req.operation()?.importance != Importance::Low {
            return Ok(None);
        }

        let mut guard = interior.lock();
        let expired = match guard.entries.get(&signature) {
            None => return Ok(None),
            Some(entry) => {
                self.config.expiration_millis >= 0
                    && self.ticker.now_nanos().saturating_sub(entry.last_refresh_nanos)
                        >= millis_to_nanos(self.config.expiration_millis)
            },
        };
        if expired {
            guard.entries.remove(&signature);
            return Ok(None);
        }
        let stamp = guard.order.touch(signature);
        let Some(entry) = guard.entries.get_mut(&signature) else {
            return Ok(None);
        };
        entry.stamp = stamp;
        Ok(Some(entry.response.clone()))
    }

    /// Caches `resp` as the answer for `req`, resetting the entry's age.
    pub fn add_response(&self, req: &CheckRequest, resp: &CheckResponse) -> Result<()> {
        let Some(interior) = &self.interior else {
            return Ok(());
        };
        let signature = sign_check(req)?;
        let now = self.ticker.now_nanos();

        let mut guard = interior.lock();
        let stamp = guard.order.touch(signature);
        guard.entries.insert(
            signature,
            CacheEntry {
                response: resp.clone(),
                last_refresh_nanos: now,
                is_flushing: false,
                stamp,
            },
        );
        self.evict_over_capacity(&mut guard);
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ticker::ManualTicker;
    use crate::core::types::Operation;

    const SERVICE: &str = "library.example.com";

    fn request(consumer: &str, importance: Importance) -> CheckRequest {
        CheckRequest {
            service_name: SERVICE.into(),
            operation: Some(
                Operation::builder()
                    .consumer_id(consumer)
                    .operation_name("Library.List")
                    .importance(importance)
                    .build()
                    .unwrap(),
            ),
        }
    }

    fn response(id: &str) -> CheckResponse {
        CheckResponse {
            operation_id: id.into(),
            check_errors: Vec::new(),
        }
    }

    fn aggregator(
        config: CheckAggregationConfig,
        ticker: Arc<ManualTicker>,
    ) -> CheckAggregator {
        CheckAggregator::new(SERVICE, config, ticker).unwrap()
    }

    #[test]
    fn test_hit_then_expiry() {
        let ticker = Arc::new(ManualTicker::new());
        let agg = aggregator(CheckAggregationConfig::default(), ticker.clone());
        let req = request("project:demo", Importance::Low);

        assert!(agg.check(&req).unwrap().is_none());
        agg.add_response(&req, &response("OpX")).unwrap();
        assert_eq!(agg.check(&req).unwrap().unwrap().operation_id, "OpX");

        ticker.advance_millis(4001);
        assert!(agg.check(&req).unwrap().is_none());
    }

    #[test]
    fn test_high_importance_bypasses_cache() {
        let ticker = Arc::new(ManualTicker::new());
        let agg = aggregator(CheckAggregationConfig::default(), ticker);
        let req = request("project:demo", Importance::High);

        agg.add_response(&req, &response("OpX")).unwrap();
        assert!(agg.check(&req).unwrap().is_none());
    }

    #[test]
    fn test_service_name_mismatch_rejected() {
        let ticker = Arc::new(ManualTicker::new());
        let agg = aggregator(CheckAggregationConfig::default(), ticker);
        let mut req = request("project:demo", Importance::Low);
        req.service_name = "other.example.com".into();
        assert!(agg.check(&req).is_err());
    }

    #[test]
    fn test_disabled_cache_always_misses() {
        let ticker = Arc::new(ManualTicker::new());
        let agg = aggregator(
            CheckAggregationConfig {
                num_entries: 0,
                expiration_millis: 4000,
            },
            ticker,
        );
        let req = request("project:demo", Importance::Low);
        agg.add_response(&req, &response("OpX")).unwrap();
        assert!(agg.check(&req).unwrap().is_none());
        assert_eq!(agg.expiration_millis(), NON_CACHING);
    }

    #[test]
    fn test_negative_expiration_never_expires_by_time() {
        let ticker = Arc::new(ManualTicker::new());
        let agg = aggregator(
            CheckAggregationConfig {
                num_entries: 10,
                expiration_millis: -1,
            },
            ticker.clone(),
        );
        let req = request("project:demo", Importance::Low);
        agg.add_response(&req, &response("OpX")).unwrap();
        ticker.advance_millis(u64::MAX / 2_000_000);
        assert!(agg.check(&req).unwrap().is_some());
    }

    #[test]
    fn test_capacity_eviction_drops_least_recently_used() {
        let ticker = Arc::new(ManualTicker::new());
        let agg = aggregator(
            CheckAggregationConfig {
                num_entries: 2,
                expiration_millis: -1,
            },
            ticker,
        );
        let first = request("project:a", Importance::Low);
        let second = request("project:b", Importance::Low);
        let third = request("project:c", Importance::Low);

        agg.add_response(&first, &response("a")).unwrap();
        agg.add_response(&second, &response("b")).unwrap();
        // Touch `first` so `second` becomes the eviction candidate.
        assert!(agg.check(&first).unwrap().is_some());
        agg.add_response(&third, &response("c")).unwrap();

        assert!(agg.check(&first).unwrap().is_some());
        assert!(agg.check(&second).unwrap().is_none());
        assert!(agg.check(&third).unwrap().is_some());
    }

    #[test]
    fn test_cached_failure_is_served() {
        let ticker = Arc::new(ManualTicker::new());
        let agg = aggregator(CheckAggregationConfig::default(), ticker);
        let req = request("project:demo", Importance::Low);
        let failed = CheckResponse {
            operation_id: "OpX".into(),
            check_errors: vec![crate::core::types::CheckError {
                code: "PERMISSION_DENIED".into(),
                detail: String::new(),
            }],
        };
        agg.add_response(&req, &failed).unwrap();
        let cached = agg.check(&req).unwrap().unwrap();
        assert!(!cached.is_ok());
    }

    #[test]
    fn test_clear_empties_the_cache() {
        let ticker = Arc::new(ManualTicker::new());
        let agg = aggregator(CheckAggregationConfig::default(), ticker);
        let req = request("project:demo", Importance::Low);
        agg.add_response(&req, &response("OpX")).unwrap();
        agg.clear();
        assert!(agg.check(&req).unwrap().is_none());
    }
}
