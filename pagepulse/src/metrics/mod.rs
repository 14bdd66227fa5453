//! Timed-event collection and aggregation.
//!
//! # Features
//!
//! - Bounded event log with FIFO eviction
//! - Per-name statistics (count, min, max, mean, median, p95, p99, stddev)
//! - Point queries (percentile, average by name or pattern)
//! - JSON report export and Prometheus text export
//!
//! # Example
//!
//! ```ignore
//! use pagepulse::metrics::MetricsCollector;
//!
//! let collector = MetricsCollector::new(5000)?;
//! collector.record_api_call("/users", 182.0, 200);
//! let p95 = collector.get_percentile("api:/users", 95.0);
//! ```

mod aggregate;
mod collector;
mod event;
mod prometheus;

pub use aggregate::{AggregatedMetric, aggregate, nearest_rank};
pub use collector::{
    DEFAULT_METRICS_CAPACITY, MetricFrequency, MetricTimer, MetricsCollector, MetricsReport, ReportPeriod,
    ReportSummary,
};
pub use event::{MetricEvent, MetricFilter, MetricKind, Tags};
pub use prometheus::PrometheusExporter;
