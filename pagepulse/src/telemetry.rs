//! The assembled monitor.
//!
//! [`Telemetry`] owns one instance of each collector, shares the clock,
//! session, breadcrumb trail and transport between them, and wires them
//! together:
//!
//! - vitals updates are mirrored into the metrics collector and offered to
//!   the per-vital alert rules;
//! - every captured error re-evaluates the error-rate rule over the
//!   configured window;
//! - fired alerts are posted to `transport.alerts_endpoint` when set.
//!
//! Each collector can still be built on its own; this type only composes them.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{
    Alert, AlertData, AlertManager, ERROR_RATE_RULE, install_default_alerts, rule_for_vital,
};
use crate::clock::{SharedClock, SystemClock};
use crate::config::MonitorConfig;
use crate::environment::{EnvironmentProbe, ProcessEnvironment};
use crate::metrics::{MetricsCollector, MetricsReport};
use crate::session::SessionId;
use crate::tracker::{BreadcrumbTrail, ErrorSummary, ErrorTracker};
use crate::transport::{HttpSink, NullSink, PayloadKind, ReportSink, Transport};
use crate::vitals::{NoopPlatform, PlatformObserver, VitalsObserver, VitalsReport};
use crate::{Result, panic_hook};

/// Everything the monitor knows at one instant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub vitals: VitalsReport,
    pub metrics: MetricsReport,
    pub errors: ErrorSummary,
    pub alerts: Vec<Alert>,
}

struct TelemetryInner {
    config: MonitorConfig,
    session_id: SessionId,
    clock: SharedClock,
    breadcrumbs: BreadcrumbTrail,
    transport: Transport,
    vitals: VitalsObserver,
    metrics: Arc<MetricsCollector>,
    errors: Arc<ErrorTracker>,
    alerts: Arc<AlertManager>,
    /// Stops every reporter when cancelled.
    cancel: CancellationToken,
}

impl Drop for TelemetryInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Composed monitor. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<TelemetryInner>,
}

pub struct TelemetryBuilder {
    config: MonitorConfig,
    clock: Option<SharedClock>,
    platform: Option<Arc<dyn PlatformObserver>>,
    environment: Option<Arc<dyn EnvironmentProbe>>,
    sink: Option<Arc<dyn ReportSink>>,
}

impl TelemetryBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Source of performance entries. Defaults to [`NoopPlatform`].
    pub fn platform(mut self, platform: Arc<dyn PlatformObserver>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Defaults to [`ProcessEnvironment`] with the configured page URL.
    pub fn environment(mut self, environment: Arc<dyn EnvironmentProbe>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Defaults to an [`HttpSink`] when any endpoint is configured, else [`NullSink`].
    pub fn sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Telemetry> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let session_id = config
            .session_id
            .clone()
            .map(SessionId::from)
            .unwrap_or_else(SessionId::generate);
        let environment = self
            .environment
            .unwrap_or_else(|| Arc::new(ProcessEnvironment::new(config.page_url.clone())));
        let sink: Arc<dyn ReportSink> = match self.sink {
            Some(sink) => sink,
            None if config.transport.has_endpoints() => {
                Arc::new(HttpSink::new(config.transport.sink_config())?)
            }
            None => Arc::new(NullSink),
        };
        let transport = Transport::new(sink).with_fallback_timeout(config.transport.fallback_timeout());

        let breadcrumbs = BreadcrumbTrail::new(config.breadcrumb_capacity)?.with_clock(clock.clone());

        let metrics = Arc::new(
            MetricsCollector::new(config.metrics_capacity)?
                .with_clock(clock.clone())
                .with_transport(transport.clone()),
        );

        let errors = Arc::new(
            ErrorTracker::builder()
                .capacity(config.error_capacity)
                .recent_limit(config.recent_errors)
                .breadcrumbs(breadcrumbs.clone())
                .session_id(session_id.clone())
                .user_id(config.user_id.clone())
                .environment(environment.clone())
                .clock(clock.clone())
                .transport(transport.clone())
                .build()?,
        );

        let alerts = Arc::new(AlertManager::new(config.alert_history_capacity)?.with_clock(clock.clone()));
        if config.install_default_alerts {
            install_default_alerts(&alerts)?;
        }

        let vitals = VitalsObserver::builder()
            .platform(self.platform.unwrap_or_else(|| Arc::new(NoopPlatform)))
            .clock(clock.clone())
            .session_id(session_id.clone())
            .environment(environment)
            .transport(transport.clone())
            .build();

        let telemetry = Telemetry {
            inner: Arc::new(TelemetryInner {
                config,
                session_id,
                clock,
                breadcrumbs,
                transport,
                vitals,
                metrics,
                errors,
                alerts,
                cancel: CancellationToken::new(),
            }),
        };
        telemetry.wire();

        info!(
            session_id = %telemetry.inner.session_id,
            sink = telemetry.inner.transport.sink_type(),
            rules = telemetry.inner.alerts.rule_ids().len(),
            "Telemetry started"
        );
        Ok(telemetry)
    }
}

impl Telemetry {
    pub fn builder(config: MonitorConfig) -> TelemetryBuilder {
        TelemetryBuilder {
            config,
            clock: None,
            platform: None,
            environment: None,
            sink: None,
        }
    }

    /// Connect the collectors. Listeners hold weak references so the
    /// components never keep each other alive.
    fn wire(&self) {
        let inner = &self.inner;

        let metrics = Arc::downgrade(&inner.metrics);
        let alerts = Arc::downgrade(&inner.alerts);
        inner.vitals.on_update(move |update| {
            if let Some(metrics) = metrics.upgrade() {
                metrics.record_vital(&update.name, update.value);
            }
            let rule = update.vital.and_then(rule_for_vital);
            if let (Some(rule), Some(alerts)) = (rule, alerts.upgrade()) {
                alerts.check_and_alert(rule, &AlertData::new(update.name.as_str(), update.value));
            }
        });

        let errors: Weak<ErrorTracker> = Arc::downgrade(&inner.errors);
        let alerts = Arc::downgrade(&inner.alerts);
        let window = inner.config.error_rate_window();
        inner.errors.on_error(move |record| {
            let (Some(errors), Some(alerts)) = (errors.upgrade(), alerts.upgrade()) else {
                return;
            };
            let count = errors.errors_since(window).len();
            let data = AlertData::new("errors", count as f64)
                .with_attribute("window_secs", window.as_secs())
                .with_attribute("last_error_id", record.id.as_str());
            alerts.check_and_alert(ERROR_RATE_RULE, &data);
        });

        if let Some(endpoint) = inner.config.transport.alerts_endpoint.clone() {
            let transport = inner.transport.clone();
            inner.alerts.on_alert(move |alert| match serde_json::to_value(alert) {
                Ok(body) => transport.send(PayloadKind::Alert, &endpoint, body),
                Err(e) => warn!(alert_id = %alert.id, error = %e, "Failed to serialize alert"),
            });
        }
    }

    // ========== Components ==========

    pub fn vitals(&self) -> &VitalsObserver {
        &self.inner.vitals
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }

    pub fn errors(&self) -> &Arc<ErrorTracker> {
        &self.inner.errors
    }

    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.inner.alerts
    }

    /// The trail shared with the error tracker.
    pub fn breadcrumbs(&self) -> &BreadcrumbTrail {
        &self.inner.breadcrumbs
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            session_id: self.inner.session_id.clone(),
            timestamp: self.inner.clock.now(),
            vitals: self.inner.vitals.report(),
            metrics: self.inner.metrics.get_report(),
            errors: self.inner.errors.get_summary(),
            alerts: self.inner.alerts.get_alerts(),
        }
    }

    // ========== Reporting ==========

    /// Send every payload that has an endpoint. Returns how many were queued.
    pub fn flush(&self) -> usize {
        let inner = &self.inner;
        let endpoints = &inner.config.transport;
        let mut sent = 0;

        if let Some(endpoint) = &endpoints.vitals_endpoint {
            inner.vitals.send_metrics(endpoint);
            sent += 1;
        }
        if let Some(endpoint) = &endpoints.metrics_endpoint {
            inner.metrics.send_report(endpoint);
            sent += 1;
        }
        if let Some(endpoint) = &endpoints.errors_endpoint {
            inner.errors.send_errors(endpoint);
            sent += 1;
        }

        debug!(payloads = sent, "Telemetry flushed");
        sent
    }

    /// Flush every `report_interval_secs` until `cancel` fires or the
    /// monitor shuts down.
    ///
    /// Returns `None` when the interval is disabled or no runtime is running.
    pub fn spawn_reporter(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let Some(period) = self.inner.config.report_interval() else {
            debug!("Periodic reporting disabled");
            return None;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime; periodic reporting not started");
            return None;
        };

        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.cancel.clone();
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        Telemetry { inner }.flush();
                    }
                }
            }
            debug!("Reporter stopped");
        });

        info!(?period, "Periodic reporter started");
        Some(handle)
    }

    /// Stop reporters, flush once and wait up to `grace` for deliveries.
    ///
    /// Returns true if every in-flight delivery finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.cancel.cancel();
        self.inner.vitals.disconnect();
        let flushed = self.flush();
        let drained = self.inner.transport.drain(grace).await;
        info!(flushed, drained, "Telemetry shut down");
        drained
    }

    /// Record panics as fatal errors on this monitor's tracker.
    pub fn install_panic_hook(&self) {
        panic_hook::install(&self.inner.errors);
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("session_id", &self.inner.session_id)
            .field("transport", &self.inner.transport)
            .field("rules", &self.inner.alerts.rule_ids())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{CLS_RULE, LCP_RULE};
    use crate::clock::ManualClock;
    use crate::environment::StaticEnvironment;
    use crate::metrics::MetricKind;
    use crate::tracker::{ErrorKind, Severity};
    use crate::transport::testing::RecordingSink;
    use crate::vitals::{ManualPlatform, PerformanceEntry, Vital};

    struct Harness {
        telemetry: Telemetry,
        platform: ManualPlatform,
        clock: Arc<ManualClock>,
        sink: Arc<RecordingSink>,
    }

    fn harness(config: MonitorConfig) -> Harness {
        let platform = ManualPlatform::new();
        let clock = ManualClock::starting_now();
        let sink = Arc::new(RecordingSink::default());
        let telemetry = Telemetry::builder(config)
            .platform(Arc::new(platform.clone()))
            .clock(clock.clone())
            .environment(Arc::new(StaticEnvironment::default()))
            .sink(sink.clone())
            .build()
            .unwrap();
        Harness {
            telemetry,
            platform,
            clock,
            sink,
        }
    }

    fn with_endpoints() -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.transport.vitals_endpoint = Some("http://collector.test/vitals".to_string());
        config.transport.metrics_endpoint = Some("http://collector.test/metrics".to_string());
        config.transport.errors_endpoint = Some("http://collector.test/errors".to_string());
        config
    }

    #[test]
    fn test_vital_updates_feed_metrics_and_alerts() {
        let h = harness(MonitorConfig::default());

        h.platform.emit(&[PerformanceEntry::largest_contentful_paint(4500.0)]);
        h.platform.emit(&[
            PerformanceEntry::layout_shift(0.2, false),
            PerformanceEntry::layout_shift(0.1, false),
        ]);

        let vitals = h.telemetry.metrics().events_by_kind(MetricKind::Vital);
        assert_eq!(vitals.len(), 2);
        assert_eq!(vitals[0].name, "LCP");
        assert_eq!(vitals[0].value, 4500.0);

        let fired: Vec<String> = h.telemetry.alerts().get_alerts().into_iter().map(|a| a.rule_id).collect();
        assert_eq!(fired, vec![LCP_RULE.to_string(), CLS_RULE.to_string()]);
        assert_eq!(h.telemetry.vitals().get_vitals().get(Vital::Lcp), Some(4500.0));
    }

    #[test]
    fn test_good_vitals_do_not_alert() {
        let h = harness(MonitorConfig::default());
        h.platform.emit(&[PerformanceEntry::largest_contentful_paint(1200.0)]);
        h.telemetry.vitals().record_metric("TTFB", 2000.0);
        h.telemetry.vitals().record_metric("hydration", 80.0);

        assert!(h.telemetry.alerts().get_alerts().is_empty());
        assert_eq!(h.telemetry.metrics().len(), 3);
    }

    #[test]
    fn test_error_rate_rule_counts_window() {
        let h = harness(MonitorConfig::default());
        let errors = h.telemetry.errors();

        for i in 0..5 {
            errors.capture_error(format!("boom {}", i), ErrorKind::Error, Severity::Low, None);
        }
        assert!(h.telemetry.alerts().get_alerts().is_empty());

        errors.capture_error("boom 5", ErrorKind::Error, Severity::Low, None);
        let alerts = h.telemetry.alerts().get_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, ERROR_RATE_RULE);
        assert_eq!(alerts[0].data.value, 6.0);

        // Older errors fall out of the window.
        h.clock.advance(Duration::from_secs(120));
        errors.capture_error("late", ErrorKind::Error, Severity::Low, None);
        assert_eq!(h.telemetry.alerts().get_alerts().len(), 1);
    }

    #[test]
    fn test_breadcrumbs_are_shared() {
        let h = harness(MonitorConfig::default());
        h.telemetry
            .breadcrumbs()
            .add("open settings", crate::tracker::BreadcrumbKind::Click, None);

        h.telemetry
            .errors()
            .capture_error("save failed", ErrorKind::Error, Severity::Medium, None);
        let errors = h.telemetry.errors().get_errors();
        assert_eq!(errors[0].context.breadcrumbs.len(), 1);
        assert_eq!(errors[0].session_id, *h.telemetry.session_id());
    }

    #[test]
    fn test_default_alerts_can_be_skipped() {
        let h = harness(MonitorConfig {
            install_default_alerts: false,
            ..Default::default()
        });
        assert!(h.telemetry.alerts().rule_ids().is_empty());

        h.platform.emit(&[PerformanceEntry::largest_contentful_paint(9000.0)]);
        assert!(h.telemetry.alerts().get_alerts().is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Telemetry::builder(MonitorConfig {
            metrics_capacity: 0,
            ..Default::default()
        })
        .build();
        assert!(matches!(result, Err(crate::Error::Configuration(_))));
    }

    #[test]
    fn test_configured_session_id() {
        let h = harness(MonitorConfig {
            session_id: Some("session-fixed".to_string()),
            ..Default::default()
        });
        assert_eq!(h.telemetry.session_id().as_str(), "session-fixed");
        assert_eq!(h.telemetry.vitals().session_id().as_str(), "session-fixed");
        assert_eq!(h.telemetry.snapshot().session_id.as_str(), "session-fixed");
    }

    #[test]
    fn test_flush_without_endpoints_sends_nothing() {
        let h = harness(MonitorConfig::default());
        assert_eq!(h.telemetry.flush(), 0);
        assert!(h.sink.delivered.lock().is_empty());
    }

    #[tokio::test]
    async fn test_flush_sends_each_payload() {
        let h = harness(with_endpoints());
        h.telemetry.metrics().record_interaction("checkout", 120.0);

        assert_eq!(h.telemetry.flush(), 3);
        assert!(h.telemetry.transport().drain(Duration::from_secs(1)).await);

        let mut kinds = h.sink.kinds();
        kinds.sort_by_key(|k| k.to_string());
        assert_eq!(kinds, vec![PayloadKind::Errors, PayloadKind::Metrics, PayloadKind::Vitals]);
    }

    #[tokio::test]
    async fn test_alerts_are_posted_when_endpoint_set() {
        let mut config = MonitorConfig::default();
        config.transport.alerts_endpoint = Some("http://collector.test/alerts".to_string());
        let h = harness(config);

        h.telemetry.vitals().record_metric("FID", 450.0);
        assert!(h.telemetry.transport().drain(Duration::from_secs(1)).await);

        let delivered = h.sink.delivered.lock();
        assert_eq!(delivered.len(), 1);
        let (endpoint, kind, body) = &delivered[0];
        assert_eq!(endpoint, "http://collector.test/alerts");
        assert_eq!(*kind, PayloadKind::Alert);
        assert_eq!(body["ruleId"], "fid");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_flushes_until_cancelled() {
        let mut config = with_endpoints();
        config.report_interval_secs = 10;
        let h = harness(config);

        let cancel = CancellationToken::new();
        let reporter = h.telemetry.spawn_reporter(cancel.clone()).unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(h.telemetry.transport().drain(Duration::from_secs(1)).await);
        assert_eq!(h.sink.delivered.lock().len(), 6);

        cancel.cancel();
        reporter.await.unwrap();
    }

    #[tokio::test]
    async fn test_reporter_disabled_by_default() {
        let h = harness(MonitorConfig::default());
        assert!(h.telemetry.spawn_reporter(CancellationToken::new()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_reporter_and_flushes() {
        let mut config = with_endpoints();
        config.report_interval_secs = 10;
        let h = harness(config);
        let reporter = h.telemetry.spawn_reporter(CancellationToken::new()).unwrap();

        assert!(h.telemetry.shutdown(Duration::from_secs(1)).await);
        reporter.await.unwrap();
        assert_eq!(h.sink.delivered.lock().len(), 3);
        assert_eq!(h.telemetry.vitals().connected(), 0);
        assert_eq!(h.platform.subscriber_count(), 0);
    }
}
