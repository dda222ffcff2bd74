//! Domain model for the service-control aggregation layer.
//!
//! These types mirror the shape of the upstream control plane's payloads
//! without committing to any wire encoding: an [`Operation`] carries labels
//! and metric samples, requests wrap operations, responses carry whatever
//! the upstream granted or rejected.

use crate::core::error::{Result, TollgateError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label map attached to operations and metric values.
///
/// Kept ordered so canonical serialisation is free of sorting passes.
pub type Labels = BTreeMap<String, String>;

/// A point in time as (seconds, nanos) since the epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Whole seconds.
    pub seconds: i64,
    /// Nanosecond remainder, in `0..1_000_000_000`.
    pub nanos: i32,
}

impl Timestamp {
    /// Creates a timestamp from seconds and nanos.
    pub fn new(seconds: i64, nanos: i32) -> Self {
        Self { seconds, nanos }
    }

    /// Creates a timestamp from whole milliseconds.
    pub fn from_millis(millis: i64) -> Self {
        Self {
            seconds: millis.div_euclid(1000),
            nanos: (millis.rem_euclid(1000) * 1_000_000) as i32,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.seconds, self.nanos)
    }
}

/// Per-operation dispatch importance.
///
/// `High` forces immediate upstream dispatch and bypasses every cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    /// Cacheable and mergeable.
    #[default]
    Low,
    /// Must reach the upstream unaggregated.
    High,
}

/// A histogram with running moments over pre-declared bucket boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    /// Explicit upper bounds; `bucket_counts` has one more element for the
    /// overflow bucket.
    pub bucket_bounds: Vec<f64>,
    /// Sample count per bucket.
    pub bucket_counts: Vec<i64>,
    /// Total sample count.
    pub count: i64,
    /// Running mean of all samples.
    pub mean: f64,
    /// Running sum of squared deviations from the mean.
    pub sum_of_squared_deviation: f64,
    /// Smallest sample observed.
    pub minimum: f64,
    /// Largest sample observed.
    pub maximum: f64,
}

impl Distribution {
    /// Creates an empty distribution over the given ascending bucket bounds.
    pub fn new(bucket_bounds: Vec<f64>) -> Result<Self> {
        if bucket_bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TollgateError::invalid_request(
                "distribution bucket bounds must be strictly ascending",
            ));
        }
        let buckets = bucket_bounds.len() + 1;
        Ok(Self {
            bucket_bounds,
            bucket_counts: vec![0; buckets],
            count: 0,
            mean: 0.0,
            sum_of_squared_deviation: 0.0,
            minimum: f64::INFINITY,
            maximum: f64::NEG_INFINITY,
        })
    }

    /// Adds one sample, updating buckets and running moments.
    pub fn add_sample(&mut self, value: f64) {
        let bucket = self
            .bucket_bounds
            .iter()
            .position(|bound| value < *bound)
            .unwrap_or(self.bucket_bounds.len());
        self.bucket_counts[bucket] += 1;
        self.count += 1;
        // Welford's online update.
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.sum_of_squared_deviation += delta * (value - self.mean);
        self.minimum = self.minimum.min(value);
        self.maximum = self.maximum.max(value);
    }
}

/// The payload of a single metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Boolean sample; merges by logical OR.
    Bool(bool),
    /// Signed integer sample; merges by sum.
    Int64(i64),
    /// Floating-point sample; merges by sum.
    Double(f64),
    /// Text sample; later value wins on merge.
    Str(String),
    /// Histogram sample; merges bucketwise.
    Distribution(Distribution),
}

impl MetricKind {
    /// Single-byte tag used in the canonical form.
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Self::Bool(_) => b'B',
            Self::Int64(_) => b'I',
            Self::Double(_) => b'D',
            Self::Str(_) => b'S',
            Self::Distribution(_) => b'X',
        }
    }
}

/// A labelled metric sample over a timing window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    /// Labels distinguishing this sample within its set.
    pub labels: Labels,
    /// Window start.
    pub start_time: Timestamp,
    /// Window end.
    pub end_time: Timestamp,
    /// The sample payload, if any was recorded.
    pub value: Option<MetricKind>,
}

impl MetricValue {
    /// Creates an unlabelled value with the given payload.
    pub fn new(value: MetricKind) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }

    /// Creates an int64 value, the common case for quota amounts.
    pub fn int64(amount: i64) -> Self {
        Self::new(MetricKind::Int64(amount))
    }
}

/// A metric name plus its samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValueSet {
    /// The metric this set reports on.
    pub metric_name: String,
    /// Samples, in insertion order.
    pub metric_values: Vec<MetricValue>,
}

impl MetricValueSet {
    /// Creates a set holding a single value.
    pub fn single<S: Into<String>>(metric_name: S, value: MetricValue) -> Self {
        Self {
            metric_name: metric_name.into(),
            metric_values: vec![value],
        }
    }
}

/// Sums the int64 samples of each set, keyed by metric name.
///
/// Non-integer samples contribute nothing; quota requests and responses carry
/// their amounts exclusively as int64 values.
pub fn int64_amounts(sets: &[MetricValueSet]) -> BTreeMap<String, i64> {
    let mut amounts = BTreeMap::new();
    for set in sets {
        let sum: i64 = set
            .metric_values
            .iter()
            .filter_map(|v| match v.value {
                Some(MetricKind::Int64(n)) => Some(n),
                _ => None,
            })
            .sum();
        *amounts.entry(set.metric_name.clone()).or_insert(0) += sum;
    }
    amounts
}

/// The atomic unit of work the aggregation layer manipulates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Opaque identifier assigned by the caller.
    pub operation_id: String,
    /// Name of the operation being checked/metered/reported.
    pub operation_name: String,
    /// The consumer on whose behalf the operation runs.
    pub consumer_id: String,
    /// Window start.
    pub start_time: Timestamp,
    /// Window end.
    pub end_time: Timestamp,
    /// Operation-level labels.
    pub labels: Labels,
    /// Metric samples, in insertion order.
    pub metric_value_sets: Vec<MetricValueSet>,
    /// Dispatch importance.
    pub importance: Importance,
}

impl Operation {
    /// Starts building an operation.
    pub fn builder() -> OperationBuilder {
        OperationBuilder::default()
    }

    /// Validates the fields every request family requires.
    pub fn validate(&self) -> Result<()> {
        if self.consumer_id.is_empty() {
            return Err(TollgateError::invalid_request("operation has no consumer id"));
        }
        if self.operation_name.is_empty() {
            return Err(TollgateError::invalid_request("operation has no name"));
        }
        Ok(())
    }
}

/// Builder for [`Operation`] instances.
#[derive(Debug, Default)]
pub struct OperationBuilder {
    operation: Operation,
}

impl OperationBuilder {
    /// Sets the operation id.
    pub fn operation_id<S: Into<String>>(mut self, id: S) -> Self {
        self.operation.operation_id = id.into();
        self
    }

    /// Sets the operation name.
    pub fn operation_name<S: Into<String>>(mut self, name: S) -> Self {
        self.operation.operation_name = name.into();
        self
    }

    /// Sets the consumer id.
    pub fn consumer_id<S: Into<String>>(mut self, id: S) -> Self {
        self.operation.consumer_id = id.into();
        self
    }

    /// Sets the window start.
    pub fn start_time(mut self, t: Timestamp) -> Self {
        self.operation.start_time = t;
        self
    }

    /// Sets the window end.
    pub fn end_time(mut self, t: Timestamp) -> Self {
        self.operation.end_time = t;
        self
    }

    /// Adds one label.
    pub fn label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.operation.labels.insert(key.into(), value.into());
        self
    }

    /// Adds a metric value set.
    pub fn metric_value_set(mut self, set: MetricValueSet) -> Self {
        self.operation.metric_value_sets.push(set);
        self
    }

    /// Sets the importance.
    pub fn importance(mut self, importance: Importance) -> Self {
        self.operation.importance = importance;
        self
    }

    /// Finishes the build, validating required fields.
    pub fn build(self) -> Result<Operation> {
        self.operation.validate()?;
        Ok(self.operation)
    }
}

/// An access-check request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    /// The service the check is addressed to.
    pub service_name: String,
    /// The operation being checked.
    pub operation: Option<Operation>,
}

impl CheckRequest {
    /// Returns the operation, or an invalid-request error when absent.
    pub fn operation(&self) -> Result<&Operation> {
        self.operation
            .as_ref()
            .ok_or_else(|| TollgateError::invalid_request("check request has no operation"))
    }
}

/// One reason a check did not pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckError {
    /// Machine-readable error code.
    pub code: String,
    /// Free-form detail.
    pub detail: String,
}

/// The upstream's answer to a [`CheckRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    /// Echo of the request's operation id.
    pub operation_id: String,
    /// Empty when the check passed.
    pub check_errors: Vec<CheckError>,
}

impl CheckResponse {
    /// Returns true when the check passed.
    pub fn is_ok(&self) -> bool {
        self.check_errors.is_empty()
    }
}

/// A quota-allocation request; amounts ride as int64 metric values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocateQuotaRequest {
    /// The service the allocation is addressed to.
    pub service_name: String,
    /// The operation requesting quota.
    pub operation: Option<Operation>,
}

impl AllocateQuotaRequest {
    /// Returns the operation, or an invalid-request error when absent.
    pub fn operation(&self) -> Result<&Operation> {
        self.operation
            .as_ref()
            .ok_or_else(|| TollgateError::invalid_request("quota request has no operation"))
    }
}

/// One reason an allocation was denied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaError {
    /// Machine-readable error code.
    pub code: String,
    /// Free-form detail.
    pub detail: String,
}

/// The upstream's answer to an [`AllocateQuotaRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocateQuotaResponse {
    /// Echo of the request's operation id.
    pub operation_id: String,
    /// Empty when the allocation succeeded.
    pub allocate_errors: Vec<QuotaError>,
    /// Granted amounts per metric, as int64 values.
    pub quota_metrics: Vec<MetricValueSet>,
}

impl AllocateQuotaResponse {
    /// Returns true when the allocation succeeded.
    pub fn is_ok(&self) -> bool {
        self.allocate_errors.is_empty()
    }

    /// Granted amounts keyed by metric name.
    pub fn granted_amounts(&self) -> BTreeMap<String, i64> {
        int64_amounts(&self.quota_metrics)
    }
}

/// A batch of operations reported to the upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportRequest {
    /// The service the report is addressed to.
    pub service_name: String,
    /// The operations being reported.
    pub operations: Vec<Operation>,
}
