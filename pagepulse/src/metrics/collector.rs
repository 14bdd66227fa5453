//! Metrics collector implementation.
//!
//! Records named, typed, timestamped values into a bounded log and serves
//! aggregated statistics from a dirty-flag cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::aggregate::{AggregatedMetric, aggregate, nearest_rank};
use super::event::{MetricEvent, MetricFilter, MetricKind, Tags};
use crate::buffer::BoundedBuffer;
use crate::clock::{SharedClock, SystemClock};
use crate::listeners::{ListenerId, Listeners};
use crate::transport::{PayloadKind, Transport};
use crate::Result;

/// Default number of events retained.
pub const DEFAULT_METRICS_CAPACITY: usize = 5000;

/// Number of entries in the report's top lists.
const REPORT_TOP_N: usize = 5;

/// Mutable state, all behind one lock.
struct CollectorState {
    events: BoundedBuffer<MetricEvent>,
    aggregated: Arc<BTreeMap<String, AggregatedMetric>>,
    /// Set on every content-changing write, cleared on recomputation.
    dirty: bool,
    period_start: DateTime<Utc>,
}

/// Timed-event log with cached aggregation.
pub struct MetricsCollector {
    state: Mutex<CollectorState>,
    listeners: Listeners<MetricEvent>,
    clock: SharedClock,
    transport: Transport,
}

/// Start and end of the window a report covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total_events: usize,
    pub unique_metrics: usize,
}

/// How often a metric name occurs in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricFrequency {
    pub name: String,
    pub count: usize,
}

/// Derived view over the current log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub timestamp: DateTime<Utc>,
    pub period: ReportPeriod,
    pub summary: ReportSummary,
    pub aggregated: Vec<AggregatedMetric>,
    /// Highest-value raw events, largest first.
    pub top_slowest: Vec<MetricEvent>,
    /// Most frequently recorded names, most frequent first.
    pub most_frequent: Vec<MetricFrequency>,
}

#[derive(Serialize)]
struct MetricsExport<'a> {
    report: &'a MetricsReport,
    events: Vec<MetricEvent>,
}

impl MetricsCollector {
    /// Create a collector retaining at most `capacity` events.
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self::from_buffer(BoundedBuffer::new(capacity)?))
    }

    fn from_buffer(events: BoundedBuffer<MetricEvent>) -> Self {
        let clock = SystemClock::shared();
        Self {
            state: Mutex::new(CollectorState {
                events,
                aggregated: Arc::new(BTreeMap::new()),
                dirty: false,
                period_start: clock.now(),
            }),
            listeners: Listeners::new("metrics"),
            clock,
            transport: Transport::disabled(),
        }
    }

    /// Use `clock` for timestamps and timers. Restarts the report period.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.state.get_mut().period_start = clock.now();
        self.clock = clock;
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    // ========== Recording ==========

    /// Append an event and notify listeners.
    ///
    /// Returns the generated id, or `None` if the value was not finite.
    pub fn record_metric(
        &self,
        name: impl Into<String>,
        value: f64,
        kind: MetricKind,
        tags: Tags,
        metadata: Option<Value>,
    ) -> Option<String> {
        let name = name.into();
        if !value.is_finite() {
            warn!(metric = %name, value, "Ignoring non-finite metric value");
            return None;
        }

        let event = MetricEvent {
            id: Uuid::new_v4().to_string(),
            name,
            kind,
            value,
            timestamp: self.clock.now(),
            tags,
            metadata,
        };

        {
            let mut state = self.state.lock();
            if let Some(evicted) = state.events.push(event.clone()) {
                debug!(metric = %evicted.name, "Evicted oldest metric event");
            }
            state.dirty = true;
        }

        // Lock released: listeners may record further metrics.
        self.listeners.notify(&event);
        Some(event.id)
    }

    /// Record a component render duration as `component:<name>`.
    pub fn record_component_render(&self, component: &str, render_ms: f64) -> Option<String> {
        let tags = Tags::from([("component".to_string(), component.to_string())]);
        self.record_metric(
            format!("component:{}", component),
            render_ms,
            MetricKind::CustomTimer,
            tags,
            None,
        )
    }

    /// Record an API call latency as `api:<endpoint>`, tagging the status.
    pub fn record_api_call(&self, endpoint: &str, duration_ms: f64, status_code: u16) -> Option<String> {
        let tags = Tags::from([
            ("endpoint".to_string(), endpoint.to_string()),
            ("status".to_string(), status_code.to_string()),
            ("success".to_string(), (status_code < 400).to_string()),
        ]);
        self.record_metric(
            format!("api:{}", endpoint),
            duration_ms,
            MetricKind::ApiLatency,
            tags,
            None,
        )
    }

    /// Record a user interaction duration as `interaction:<action>`.
    pub fn record_interaction(&self, action: &str, duration_ms: f64) -> Option<String> {
        let tags = Tags::from([("action".to_string(), action.to_string())]);
        self.record_metric(
            format!("interaction:{}", action),
            duration_ms,
            MetricKind::Interaction,
            tags,
            None,
        )
    }

    /// Record a page vital under its own name.
    pub fn record_vital(&self, name: &str, value: f64) -> Option<String> {
        self.record_metric(name, value, MetricKind::Vital, Tags::new(), None)
    }

    /// Start a timer that records a `custom-timer` event when finished or dropped.
    pub fn start_timer(&self, name: impl Into<String>) -> MetricTimer<'_> {
        MetricTimer {
            collector: self,
            name: name.into(),
            tags: Tags::new(),
            started: self.clock.elapsed(),
            finished: false,
        }
    }

    /// Run `f` and record how long it took.
    pub fn time<T>(&self, name: impl Into<String>, f: impl FnOnce() -> T) -> T {
        let timer = self.start_timer(name);
        let out = f();
        timer.finish();
        out
    }

    // ========== Listeners ==========

    /// Register a listener invoked synchronously for every recorded event.
    pub fn on_metric<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MetricEvent) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    // ========== Queries ==========

    /// Per-name statistics, recomputed only if the log changed.
    pub fn get_aggregated_metrics(&self) -> Arc<BTreeMap<String, AggregatedMetric>> {
        let mut state = self.state.lock();
        if state.dirty {
            state.aggregated = Arc::new(aggregate(state.events.iter()));
            state.dirty = false;
        }
        Arc::clone(&state.aggregated)
    }

    /// Value at percentile `p` (0..=100) for `name`, `None` when there is no
    /// data or `p` is not a finite number.
    pub fn get_percentile(&self, name: &str, p: f64) -> Option<f64> {
        if !p.is_finite() {
            return None;
        }
        let mut values: Vec<f64> = {
            let state = self.state.lock();
            state
                .events
                .iter()
                .filter(|e| e.name == name)
                .map(|e| e.value)
                .collect()
        };
        values.sort_by(f64::total_cmp);
        nearest_rank(&values, p / 100.0)
    }

    /// Arithmetic mean over matching events, `None` when nothing matches.
    pub fn get_average(&self, filter: impl Into<MetricFilter>) -> Option<f64> {
        let filter = filter.into();
        let state = self.state.lock();
        let (sum, count) = state
            .events
            .iter()
            .filter(|e| filter.matches(&e.name))
            .fold((0.0, 0usize), |(sum, count), e| (sum + e.value, count + 1));
        (count > 0).then(|| sum / count as f64)
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.state.lock().events.to_vec()
    }

    pub fn events_by_name(&self, name: &str) -> Vec<MetricEvent> {
        self.filtered(|e| e.name == name)
    }

    pub fn events_by_kind(&self, kind: MetricKind) -> Vec<MetricEvent> {
        self.filtered(|e| e.kind == kind)
    }

    /// Events recorded within the last `window`.
    pub fn events_since(&self, window: Duration) -> Vec<MetricEvent> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let cutoff = self.clock.now().checked_sub_signed(window);
        self.filtered(|e| cutoff.is_none_or(|cutoff| e.timestamp >= cutoff))
    }

    fn filtered(&self, keep: impl Fn(&MetricEvent) -> bool) -> Vec<MetricEvent> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| keep(e))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().events.capacity()
    }

    /// Aggregates plus the top events and most frequent names.
    pub fn get_report(&self) -> MetricsReport {
        let aggregated = self.get_aggregated_metrics();
        let now = self.clock.now();

        let (period_start, total_events, top_slowest) = {
            let state = self.state.lock();
            let mut by_value: Vec<&MetricEvent> = state.events.iter().collect();
            // Stable sort: equal values keep insertion order.
            by_value.sort_by(|a, b| b.value.total_cmp(&a.value));
            let top = by_value.into_iter().take(REPORT_TOP_N).cloned().collect();
            (state.period_start, state.events.len(), top)
        };

        let mut most_frequent: Vec<MetricFrequency> = aggregated
            .values()
            .map(|m| MetricFrequency {
                name: m.name.clone(),
                count: m.count,
            })
            .collect();
        most_frequent.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        most_frequent.truncate(REPORT_TOP_N);

        MetricsReport {
            timestamp: now,
            period: ReportPeriod {
                start: period_start,
                end: now,
                duration_ms: (now - period_start).num_milliseconds(),
            },
            summary: ReportSummary {
                total_events,
                unique_metrics: aggregated.len(),
            },
            aggregated: aggregated.values().cloned().collect(),
            top_slowest,
            most_frequent,
        }
    }

    // ========== Export ==========

    /// Report plus the raw event list as pretty JSON.
    pub fn export(&self) -> Result<String> {
        let report = self.get_report();
        let export = MetricsExport {
            report: &report,
            events: self.events(),
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Send the current report to `endpoint` without waiting.
    pub fn send_report(&self, endpoint: &str) {
        match serde_json::to_value(self.get_report()) {
            Ok(body) => self.transport.send(PayloadKind::Metrics, endpoint, body),
            Err(e) => warn!(%endpoint, error = %e, "Failed to serialize metrics report"),
        }
    }

    /// Drop every event, invalidate the cache and restart the report period.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.events.clear();
        state.dirty = true;
        state.period_start = self.clock.now();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::from_buffer(
            BoundedBuffer::new(DEFAULT_METRICS_CAPACITY)
                .unwrap_or_else(|_| unreachable!("default capacity is non-zero")),
        )
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MetricsCollector")
            .field("events", &state.events.len())
            .field("capacity", &state.events.capacity())
            .field("dirty", &state.dirty)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Running timer created by [`MetricsCollector::start_timer`].
#[must_use = "dropping the timer immediately records a zero-length measurement"]
pub struct MetricTimer<'a> {
    collector: &'a MetricsCollector,
    name: String,
    tags: Tags,
    started: Duration,
    finished: bool,
}

impl MetricTimer<'_> {
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Stop the timer and record it. Returns the measured milliseconds.
    pub fn finish(mut self) -> f64 {
        self.record()
    }

    fn record(&mut self) -> f64 {
        self.finished = true;
        let elapsed = self.collector.clock.elapsed().saturating_sub(self.started);
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.collector.record_metric(
            std::mem::take(&mut self.name),
            ms,
            MetricKind::CustomTimer,
            std::mem::take(&mut self.tags),
            None,
        );
        ms
    }
}

impl Drop for MetricTimer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.record();
        }
    }
}
