//! Canonical fingerprinting of requests.
//!
//! Every cache in the crate is keyed by a digest of the semantic content of
//! a request. The canonical byte form is deterministic: NUL-terminated
//! strings, labels in ascending key order, fixed-width little-endian
//! numerics, and a one-byte tag per metric payload kind. Each request family
//! excludes the fields that must not affect its cache key.

use crate::core::error::Result;
use crate::core::types::{
    AllocateQuotaRequest, CheckRequest, Distribution, Labels, MetricKind, MetricValue, Operation,
    Timestamp,
};
use std::fmt;

/// An opaque digest of a request's canonical form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight bytes of hex is plenty for log correlation.
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Incremental writer for the canonical byte stream.
struct CanonicalWriter {
    hasher: blake3::Hasher,
}

impl CanonicalWriter {
    fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    fn put_str_nul(&mut self, s: &str) {
        self.hasher.update(s.as_bytes());
        self.hasher.update(&[0]);
    }

    fn put_labels(&mut self, labels: &Labels) {
        // BTreeMap iteration is already in ascending key order.
        for (name, value) in labels {
            self.put_str_nul(name);
            self.put_str_nul(value);
        }
    }

    fn put_i64(&mut self, v: i64) {
        self.hasher.update(&v.to_le_bytes());
    }

    fn put_timestamp(&mut self, t: &Timestamp) {
        self.hasher.update(&t.seconds.to_le_bytes());
        self.hasher.update(&t.nanos.to_le_bytes());
    }

    fn put_distribution(&mut self, d: &Distribution) {
        for bound in &d.bucket_bounds {
            self.hasher.update(&bound.to_le_bytes());
        }
        for count in &d.bucket_counts {
            self.put_i64(*count);
        }
    }

    fn put_metric_value(&mut self, value: &MetricValue) {
        self.put_timestamp(&value.start_time);
        self.put_timestamp(&value.end_time);
        self.put_labels(&value.labels);
        let Some(kind) = &value.value else {
            return;
        };
        self.hasher.update(&[kind.tag()]);
        match kind {
            MetricKind::Bool(b) => {
                self.hasher.update(&[u8::from(*b)]);
            },
            MetricKind::Int64(n) => self.put_i64(*n),
            MetricKind::Double(d) => {
                self.hasher.update(&d.to_le_bytes());
            },
            MetricKind::Str(s) => self.put_str_nul(s),
            MetricKind::Distribution(d) => self.put_distribution(d),
        }
    }

    fn put_operation_header(&mut self, op: &Operation) {
        self.put_str_nul(&op.consumer_id);
        self.put_str_nul(&op.operation_name);
        self.put_labels(&op.labels);
    }

    fn finish(self) -> Fingerprint {
        Fingerprint(*self.hasher.finalize().as_bytes())
    }
}

/// Fingerprints a check request over its full semantic content.
pub fn sign_check(req: &CheckRequest) -> Result<Fingerprint> {
    let op = req.operation()?;
    op.validate()?;
    let mut w = CanonicalWriter::new();
    w.put_operation_header(op);
    for set in &op.metric_value_sets {
        w.put_str_nul(&set.metric_name);
        for value in &set.metric_values {
            w.put_metric_value(value);
        }
    }
    Ok(w.finish())
}

/// Fingerprints a quota request.
///
/// Covers the consumer, operation name, top-level labels, and the names of
/// the metrics being requested. Amounts, timestamps and per-value labels
/// are excluded so repeated allocations for the same consumer land on one
/// cache entry regardless of how much each call asks for; the entry's
/// remaining-allowance bookkeeping is what tracks the amounts.
pub fn sign_quota(req: &AllocateQuotaRequest) -> Result<Fingerprint> {
    let op = req.operation()?;
    op.validate()?;
    let mut w = CanonicalWriter::new();
    w.put_operation_header(op);
    for set in &op.metric_value_sets {
        w.put_str_nul(&set.metric_name);
    }
    Ok(w.finish())
}

/// Fingerprints a report operation down to its merge slot.
///
/// Covers the consumer, operation name, top-level labels, and the label
/// structure of each metric value set. Operation ids, timestamps and sample
/// payloads are excluded: operations differing only in those merge into one
/// slot.
pub fn sign_report_slot(op: &Operation) -> Result<Fingerprint> {
    op.validate()?;
    let mut w = CanonicalWriter::new();
    w.put_operation_header(op);
    for set in &op.metric_value_sets {
        w.put_str_nul(&set.metric_name);
        for value in &set.metric_values {
            w.put_labels(&value.labels);
            // Separator so adjacent label maps cannot run together.
            w.hasher.update(&[0]);
        }
    }
    Ok(w.finish())
}
