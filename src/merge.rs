//! Merge arithmetic for metric samples and report operations.
//!
//! Merging is what lets many application calls collapse into one report
//! slot: windows widen, numeric samples sum, booleans OR, distributions
//! combine bucketwise with their running moments recomputed.

use crate::core::error::{Result, TollgateError};
use crate::core::types::{Distribution, MetricKind, MetricValue, Operation};

/// Whether two optional payloads can merge without loss.
fn kinds_compatible(a: &Option<MetricKind>, b: &Option<MetricKind>) -> bool {
    match (a, b) {
        (None, _) | (_, None) => true,
        (Some(MetricKind::Bool(_)), Some(MetricKind::Bool(_)))
        | (Some(MetricKind::Int64(_)), Some(MetricKind::Int64(_)))
        | (Some(MetricKind::Double(_)), Some(MetricKind::Double(_)))
        | (Some(MetricKind::Str(_)), Some(MetricKind::Str(_))) => true,
        (Some(MetricKind::Distribution(x)), Some(MetricKind::Distribution(y))) => {
            x.bucket_bounds == y.bucket_bounds && x.bucket_counts.len() == y.bucket_counts.len()
        },
        _ => false,
    }
}

/// Combines two distributions over identical bucket boundaries.
///
/// Bucket counts add; the running count/mean/sum-of-squared-deviations are
/// recombined with the parallel form of Welford's update; min and max fold.
fn merge_distributions(into: &mut Distribution, from: &Distribution) -> Result<()> {
    if into.bucket_bounds != from.bucket_bounds
        || into.bucket_counts.len() != from.bucket_counts.len()
    {
        return Err(TollgateError::invalid_request(
            "cannot merge distributions with different bucket boundaries",
        ));
    }
    if from.count == 0 {
        return Ok(());
    }
    for (a, b) in into.bucket_counts.iter_mut().zip(&from.bucket_counts) {
        *a += *b;
    }
    if into.count == 0 {
        into.count = from.count;
        into.mean = from.mean;
        into.sum_of_squared_deviation = from.sum_of_squared_deviation;
        into.minimum = from.minimum;
        into.maximum = from.maximum;
        return Ok(());
    }
    let n1 = into.count as f64;
    let n2 = from.count as f64;
    let delta = from.mean - into.mean;
    let combined = n1 + n2;
    into.sum_of_squared_deviation +=
        from.sum_of_squared_deviation + delta * delta * n1 * n2 / combined;
    into.mean += delta * n2 / combined;
    into.count += from.count;
    into.minimum = into.minimum.min(from.minimum);
    into.maximum = into.maximum.max(from.maximum);
    Ok(())
}

/// Merges one metric value into another with matching labels.
///
/// The timing window widens to cover both samples; the payload merges by
/// kind.
pub fn merge_values(into: &mut MetricValue, from: &MetricValue) -> Result<()> {
    into.start_time = into.start_time.min(from.start_time);
    into.end_time = into.end_time.max(from.end_time);
    match (&mut into.value, &from.value) {
        (_, None) => {},
        (slot @ None, Some(_)) => *slot = from.value.clone(),
        (Some(MetricKind::Bool(a)), Some(MetricKind::Bool(b))) => *a = *a || *b,
        (Some(MetricKind::Int64(a)), Some(MetricKind::Int64(b))) => *a += *b,
        (Some(MetricKind::Double(a)), Some(MetricKind::Double(b))) => *a += *b,
        (Some(MetricKind::Str(a)), Some(MetricKind::Str(b))) => a.clone_from(b),
        (Some(MetricKind::Distribution(a)), Some(MetricKind::Distribution(b))) => {
            merge_distributions(a, b)?;
        },
        _ => {
            return Err(TollgateError::invalid_request(
                "cannot merge metric values of different kinds",
            ));
        },
    }
    Ok(())
}

/// Whether `incoming` can merge into `existing` without rejection.
///
/// Rejection reasons: a label present on both with different values, or a
/// label-matched metric value whose payload kind differs.
pub fn can_merge(existing: &Operation, incoming: &Operation) -> bool {
    for (key, value) in &incoming.labels {
        if existing.labels.get(key).is_some_and(|v| v != value) {
            return false;
        }
    }
    for set in &incoming.metric_value_sets {
        let Some(target) = existing
            .metric_value_sets
            .iter()
            .find(|s| s.metric_name == set.metric_name)
        else {
            continue;
        };
        for value in &set.metric_values {
            if let Some(matched) = target.metric_values.iter().find(|v| v.labels == value.labels) {
                if !kinds_compatible(&matched.value, &value.value) {
                    return false;
                }
            }
        }
    }
    true
}

/// Merges `from` into `into`.
///
/// Start takes the earlier time, end the later; labels union; metric value
/// sets merge by name, with label-matched values merged by kind and
/// unmatched values appended in arrival order.
pub fn merge_operations(into: &mut Operation, from: &Operation) -> Result<()> {
    into.start_time = into.start_time.min(from.start_time);
    into.end_time = into.end_time.max(from.end_time);
    for (key, value) in &from.labels {
        match into.labels.get(key) {
            Some(existing) if existing != value => {
                return Err(TollgateError::invalid_request(format!(
                    "conflicting values for label '{}'",
                    key
                )));
            },
            Some(_) => {},
            None => {
                into.labels.insert(key.clone(), value.clone());
            },
        }
    }
    for set in &from.metric_value_sets {
        let target = match into
            .metric_value_sets
            .iter_mut()
            .find(|s| s.metric_name == set.metric_name)
        {
            Some(target) => target,
            None => {
                into.metric_value_sets.push(set.clone());
                continue;
            },
        };
        for value in &set.metric_values {
            match target
                .metric_values
                .iter_mut()
                .find(|v| v.labels == value.labels)
            {
                Some(matched) => merge_values(matched, value)?,
                None => target.metric_values.push(value.clone()),
            }
        }
    }
    Ok(())
}
