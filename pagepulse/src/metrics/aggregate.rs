//! Per-name statistical aggregation.
//!
//! Percentiles use the nearest-rank method on the ascending sample: the value
//! at index `floor(n * p)`. The index is clamped to the last element so that
//! `p = 1.0` is defined. No interpolation is applied.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::{MetricEvent, MetricKind};

/// Statistical summary of every event recorded under one name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMetric {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
    pub std_dev: f64,
    pub last_updated: DateTime<Utc>,
}

/// Value at the nearest-rank position for `fraction` (0.0..=1.0).
///
/// `sorted` must be ascending. Returns `None` for an empty sample or a
/// non-finite `fraction`.
pub fn nearest_rank(sorted: &[f64], fraction: f64) -> Option<f64> {
    if sorted.is_empty() || !fraction.is_finite() {
        return None;
    }
    let fraction = fraction.clamp(0.0, 1.0);
    let idx = (sorted.len() as f64 * fraction).floor() as usize;
    Some(sorted[idx.min(sorted.len() - 1)])
}

/// Summarize one group of values.
///
/// The group's kind is taken from its first event.
fn summarize(name: &str, kind: MetricKind, mut values: Vec<f64>, last_updated: DateTime<Utc>) -> AggregatedMetric {
    // Summing in sorted order keeps mean and variance bit-identical across
    // insertion orders.
    values.sort_by(f64::total_cmp);

    let count = values.len();
    let n = count as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    AggregatedMetric {
        name: name.to_string(),
        kind,
        count,
        min: values[0],
        max: values[count - 1],
        mean,
        median: values[count / 2],
        p95: nearest_rank(&values, 0.95).unwrap_or(values[count - 1]),
        p99: nearest_rank(&values, 0.99).unwrap_or(values[count - 1]),
        std_dev: variance.sqrt(),
        last_updated,
    }
}

/// Group `events` by name and summarize each group.
pub fn aggregate<'a, I>(events: I) -> BTreeMap<String, AggregatedMetric>
where
    I: IntoIterator<Item = &'a MetricEvent>,
{
    struct Group {
        kind: MetricKind,
        values: Vec<f64>,
        last_updated: DateTime<Utc>,
    }

    let mut groups: BTreeMap<&str, Group> = BTreeMap::new();
    for event in events {
        groups
            .entry(event.name.as_str())
            .and_modify(|g| {
                g.values.push(event.value);
                g.last_updated = g.last_updated.max(event.timestamp);
            })
            .or_insert_with(|| Group {
                kind: event.kind,
                values: vec![event.value],
                last_updated: event.timestamp,
            });
    }

    groups
        .into_iter()
        .map(|(name, g)| (name.to_string(), summarize(name, g.kind, g.values, g.last_updated)))
        .collect()
}
