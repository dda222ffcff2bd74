//! Bounded LRU of in-flight report operations.

use crate::aggregator::{AccessOrder, NON_CACHING};
use crate::core::config::ReportAggregationConfig;
use crate::core::error::{Result, TollgateError};
use crate::core::types::{Importance, Operation, ReportRequest};
use crate::merge::merge_operations;
use crate::signing::{sign_report_slot, Fingerprint};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
struct Slot {
    operation: Operation,
    stamp: u64,
}

#[derive(Debug, Default)]
struct Interior {
    slots: HashMap<Fingerprint, Slot>,
    order: AccessOrder,
    /// Operations displaced by capacity eviction, queued for the next flush.
    evicted: Vec<Operation>,
}

/// Merges report operations into fingerprint-addressed slots until flushed.
///
/// A request is admitted all-or-nothing: either every operation merges into
/// its slot and the caller is done, or the whole request is declined and the
/// caller sends it upstream directly. Capacity eviction moves the displaced
/// slot into an out-queue, so no operation is ever dropped.
pub struct ReportAggregator {
    service_name: String,
    config: ReportAggregationConfig,
    /// `None` when the configuration disables aggregation.
    interior: Option<Mutex<Interior>>,
}

impl ReportAggregator {
    /// Creates an aggregator for `service_name`.
    pub fn new(service_name: &str, config: ReportAggregationConfig) -> Result<Self> {
        if service_name.is_empty() {
            return Err(TollgateError::config("service name cannot be empty"));
        }
        config.validate()?;
        let interior = config.is_caching().then(|| Mutex::new(Interior::default()));
        Ok(Self {
            service_name: service_name.to_owned(),
            config,
            interior,
        })
    }

    /// The service whose requests this aggregator batches.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The flush cadence, or [`NON_CACHING`] when aggregation is disabled.
    pub fn flush_interval_millis(&self) -> i64 {
        if self.interior.is_none() {
            return NON_CACHING;
        }
        self.config.flush_interval_millis
    }

    /// Attempts to absorb `req` into the pending slots.
    ///
    /// Returns `true` when every operation merged. Returns `false` — and
    /// leaves no trace of the request — when aggregation is disabled, any
    /// operation is HIGH importance, or any operation conflicts with its
    /// target slot; the caller then sends the request directly.
    pub fn report(&self, req: &ReportRequest) -> Result<bool> {
        let Some(interior) = &self.interior else {
            return Ok(false);
        };
        if req.service_name != self.service_name {
            return Err(TollgateError::invalid_request(format!(
                "service name mismatch: aggregator '{}', request '{}'",
                self.service_name, req.service_name
            )));
        }
        if req
            .operations
            .iter()
            .any(|op| op.importance == Importance::High)
        {
            return Ok(false);
        }
        let mut signatures = Vec::with_capacity(req.operations.len());
        for op in &req.operations {
            signatures.push(sign_report_slot(op)?);
        }

        let mut guard = interior.lock();
        // Dry-run the merges on scratch copies so a conflict midway through
        // the request leaves the live slots untouched.
        let mut scratch: HashMap<Fingerprint, Operation> = HashMap::new();
        for (signature, op) in signatures.iter().zip(&req.operations) {
            match scratch.get_mut(signature) {
                Some(candidate) => {
                    if merge_operations(candidate, op).is_err() {
                        return Ok(false);
                    }
                },
                None => match guard.slots.get(signature) {
                    Some(slot) => {
                        let mut candidate = slot.operation.clone();
                        if merge_operations(&mut candidate, op).is_err() {
                            return Ok(false);
                        }
                        scratch.insert(*signature, candidate);
                    },
                    None => {
                        scratch.insert(*signature, op.clone());
                    },
                },
            }
        }
        for (signature, operation) in scratch {
            let stamp = guard.order.touch(signature);
            guard.slots.insert(signature, Slot { operation, stamp });
        }
        self.evict_over_capacity(&mut guard);
        Ok(true)
    }

    /// Removes all pending operations and packages them into requests of at
    /// most `max_operations_per_batch` operations each.
    pub fn flush(&self) -> Vec<ReportRequest> {
        let Some(interior) = &self.interior else {
            return Vec::new();
        };
        let mut guard = interior.lock();
        let mut operations = std::mem::take(&mut guard.evicted);
        operations.extend(guard.slots.drain().map(|(_, slot)| slot.operation));
        guard.order.clear();
        drop(guard);

        let batch_size = self.config.max_operations_per_batch.max(1) as usize;
        operations
            .chunks(batch_size)
            .map(|chunk| ReportRequest {
                service_name: self.service_name.clone(),
                operations: chunk.to_vec(),
            })
            .collect()
    }

    /// Like [`Self::flush`], invoked at shutdown; the aggregator holds no
    /// timers of its own, so clearing is flushing.
    pub fn clear(&self) -> Vec<ReportRequest> {
        self.flush()
    }

    fn evict_over_capacity(&self, guard: &mut Interior) {
        let capacity = self.config.num_entries as usize;
        while guard.slots.len() > capacity {
            let Interior { slots, order, evicted } = guard;
            match order.pop_lru(|key| slots.get(key).map(|s| s.stamp)) {
                Some(stale) => {
                    if let Some(slot) = slots.remove(&stale) {
                        evicted.push(slot.operation);
                    }
                },
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MetricKind, MetricValue, MetricValueSet, Timestamp};

    const SERVICE: &str = "library.example.com";

    fn operation(consumer: &str, amount: i64) -> Operation {
        Operation::builder()
            .consumer_id(consumer)
            .operation_name("Library.Borrow")
            .label("env", "prod")
            .start_time(Timestamp::new(10, 0))
            .end_time(Timestamp::new(20, 0))
            .metric_value_set(MetricValueSet::single(
                "m.requests",
                MetricValue::int64(amount),
            ))
            .build()
            .unwrap()
    }

    fn request(operations: Vec<Operation>) -> ReportRequest {
        ReportRequest {
            service_name: SERVICE.into(),
            operations,
        }
    }

    fn aggregator(config: ReportAggregationConfig) -> ReportAggregator {
        ReportAggregator::new(SERVICE, config).unwrap()
    }

    fn total_operations(batches: &[ReportRequest]) -> usize {
        batches.iter().map(|b| b.operations.len()).sum()
    }

    #[test]
    fn test_same_slot_operations_merge() {
        let agg = aggregator(ReportAggregationConfig::default());
        let mut early = operation("project:demo", 3);
        early.start_time = Timestamp::new(5, 0);
        let late = operation("project:demo", 5);

        assert!(agg.report(&request(vec![early])).unwrap());
        assert!(agg.report(&request(vec![late])).unwrap());

        let batches = agg.flush();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].operations.len(), 1);
        let merged = &batches[0].operations[0];
        assert_eq!(merged.start_time, Timestamp::new(5, 0));
        assert_eq!(merged.end_time, Timestamp::new(20, 0));
        assert_eq!(
            merged.metric_value_sets[0].metric_values[0].value,
            Some(MetricKind::Int64(8))
        );
    }

    #[test]
    fn test_high_importance_declines_whole_request() {
        let agg = aggregator(ReportAggregationConfig::default());
        let mut urgent = operation("project:a", 1);
        urgent.importance = Importance::High;
        let req = request(vec![operation("project:b", 1), urgent]);

        assert!(!agg.report(&req).unwrap());
        assert!(agg.flush().is_empty());
    }

    #[test]
    fn test_label_conflict_declines_without_partial_merge() {
        let agg = aggregator(ReportAggregationConfig::default());
        assert!(agg.report(&request(vec![operation("project:a", 1)])).unwrap());

        // Same slot shape, but a value that cannot merge with the slot's.
        let mut clashing = operation("project:a", 0);
        clashing.metric_value_sets[0].metric_values[0].value =
            Some(MetricKind::Str("oops".into()));
        let req = request(vec![clashing, operation("project:b", 1)]);
        assert!(!agg.report(&req).unwrap());

        // Neither the clashing operation nor its innocent companion landed.
        let batches = agg.flush();
        assert_eq!(total_operations(&batches), 1);
        assert_eq!(batches[0].operations[0].consumer_id, "project:a");
    }

    #[test]
    fn test_eviction_preserves_operations() {
        let agg = aggregator(ReportAggregationConfig {
            num_entries: 2,
            flush_interval_millis: 1000,
            max_operations_per_batch: 1000,
        });
        for i in 0..5 {
            let ok = agg
                .report(&request(vec![operation(&format!("project:{}", i), 1)]))
                .unwrap();
            assert!(ok);
        }
        let batches = agg.flush();
        assert_eq!(total_operations(&batches), 5);
    }

    #[test]
    fn test_flush_splits_into_batches() {
        let agg = aggregator(ReportAggregationConfig {
            num_entries: 10,
            flush_interval_millis: 1000,
            max_operations_per_batch: 2,
        });
        for i in 0..5 {
            agg.report(&request(vec![operation(&format!("project:{}", i), 1)]))
                .unwrap();
        }
        let batches = agg.flush();
        let mut sizes: Vec<usize> = batches.iter().map(|b| b.operations.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 2]);
    }

    #[test]
    fn test_disabled_aggregator_declines() {
        let agg = aggregator(ReportAggregationConfig {
            num_entries: 0,
            flush_interval_millis: 1000,
            max_operations_per_batch: 1000,
        });
        assert!(!agg.report(&request(vec![operation("project:a", 1)])).unwrap());
        assert_eq!(agg.flush_interval_millis(), NON_CACHING);
    }

    #[test]
    fn test_negative_flush_interval_disables() {
        let agg = aggregator(ReportAggregationConfig {
            num_entries: 10,
            flush_interval_millis: -1,
            max_operations_per_batch: 1000,
        });
        assert!(!agg.report(&request(vec![operation("project:a", 1)])).unwrap());
    }

    #[test]
    fn test_clear_drains_everything() {
        let agg = aggregator(ReportAggregationConfig::default());
        agg.report(&request(vec![operation("project:a", 1)])).unwrap();
        agg.report(&request(vec![operation("project:b", 1)])).unwrap();
        let drained = agg.clear();
        assert_eq!(total_operations(&drained), 2);
        assert!(agg.flush().is_empty());
    }

    #[test]
    fn test_service_name_mismatch_rejected() {
        let agg = aggregator(ReportAggregationConfig::default());
        let mut req = request(vec![operation("project:a", 1)]);
        req.service_name = "other.example.com".into();
        assert!(agg.report(&req).is_err());
    }
}
