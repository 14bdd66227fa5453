//! End-to-end wiring of the assembled monitor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pagepulse::alerts::{AlertConfig, AlertData, AlertKind, AlertLevel};
use pagepulse::environment::{StaticEnvironment, Viewport};
use pagepulse::metrics::MetricKind;
use pagepulse::tracker::{BreadcrumbKind, ErrorKind, Severity};
use pagepulse::transport::{PayloadKind, ReportSink};
use pagepulse::vitals::{ManualPlatform, PerformanceEntry, Vital, VitalRating};
use pagepulse::{ManualClock, MonitorConfig, Telemetry};
use parking_lot::Mutex;
use serde_json::Value;

#[derive(Default)]
struct CollectingSink {
    payloads: Mutex<Vec<(String, PayloadKind, Value)>>,
}

impl CollectingSink {
    fn by_kind(&self, kind: PayloadKind) -> Vec<Value> {
        self.payloads
            .lock()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl ReportSink for CollectingSink {
    fn sink_type(&self) -> &'static str {
        "collecting"
    }

    async fn deliver(&self, endpoint: &str, kind: PayloadKind, body: &Value) -> pagepulse::Result<()> {
        self.payloads.lock().push((endpoint.to_string(), kind, body.clone()));
        Ok(())
    }
}

fn config() -> MonitorConfig {
    MonitorConfig::from_toml_str(
        r#"
        session_id = "session-it"
        user_id = "user-42"

        [transport]
        vitals_endpoint = "http://collector.test/vitals"
        metrics_endpoint = "http://collector.test/metrics"
        errors_endpoint = "http://collector.test/errors"
        alerts_endpoint = "http://collector.test/alerts"
        "#,
    )
    .unwrap()
}

struct Page {
    telemetry: Telemetry,
    platform: ManualPlatform,
    clock: Arc<ManualClock>,
    sink: Arc<CollectingSink>,
}

fn page(config: MonitorConfig) -> Page {
    let platform = ManualPlatform::new();
    let clock = ManualClock::starting_now();
    let sink = Arc::new(CollectingSink::default());
    let environment = StaticEnvironment {
        url: Some("https://shop.example/checkout".to_string()),
        user_agent: Some("pagepulse-it/1.0".to_string()),
        viewport: Some(Viewport {
            width: 1280,
            height: 720,
        }),
        memory: None,
    };

    let telemetry = Telemetry::builder(config)
        .platform(Arc::new(platform.clone()))
        .clock(clock.clone())
        .environment(Arc::new(environment))
        .sink(sink.clone())
        .build()
        .unwrap();

    Page {
        telemetry,
        platform,
        clock,
        sink,
    }
}

#[tokio::test]
async fn page_session_reports_every_payload() {
    let p = page(config());
    let t = &p.telemetry;

    p.platform.emit(&[PerformanceEntry::navigation(10.0, 190.0)]);
    p.platform.emit(&[PerformanceEntry::paint("first-contentful-paint", 900.0)]);
    p.platform.emit(&[PerformanceEntry::largest_contentful_paint(2100.0)]);
    p.platform.emit(&[PerformanceEntry::first_input(3000.0, 3040.0)]);
    p.platform.emit(&[PerformanceEntry::layout_shift(0.05, false)]);
    p.platform.emit(&[PerformanceEntry::layout_shift(0.4, true)]);

    t.metrics().record_api_call("/api/cart", 180.0, 200);
    t.metrics().record_api_call("/api/cart", 420.0, 503);
    t.metrics().record_component_render("CartList", 12.5);

    t.breadcrumbs().add("clicked pay", BreadcrumbKind::Click, None);
    p.clock.advance_ms(250);
    t.errors()
        .capture_error("payment declined", ErrorKind::Error, Severity::High, None);

    let vitals = t.vitals().get_vitals();
    assert_eq!(vitals.get(Vital::Ttfb), Some(180.0));
    assert_eq!(vitals.get(Vital::Fcp), Some(900.0));
    assert_eq!(vitals.get(Vital::Fid), Some(40.0));
    assert_eq!(vitals.get(Vital::Cls), Some(0.05));
    assert_eq!(t.vitals().get_vital_rating(Vital::Lcp, None), VitalRating::Good);

    assert_eq!(t.metrics().events_by_kind(MetricKind::Vital).len(), 5);
    assert_eq!(t.metrics().get_average("api:/api/cart"), Some(300.0));
    assert!(t.alerts().get_alerts().is_empty());

    let snapshot = t.snapshot();
    assert_eq!(snapshot.session_id.as_str(), "session-it");
    assert_eq!(snapshot.errors.total, 1);
    assert_eq!(snapshot.metrics.summary.total_events, 8);

    assert_eq!(t.flush(), 3);
    assert!(t.transport().drain(Duration::from_secs(1)).await);

    let vitals = p.sink.by_kind(PayloadKind::Vitals);
    assert_eq!(vitals.len(), 1);
    assert_eq!(vitals[0]["sessionId"], "session-it");
    assert_eq!(vitals[0]["vitals"]["LCP"], 2100.0);
    assert_eq!(vitals[0]["deviceInfo"]["userAgent"], "pagepulse-it/1.0");

    let errors = p.sink.by_kind(PayloadKind::Errors);
    assert_eq!(errors[0]["errors"][0]["userId"], "user-42");
    assert_eq!(errors[0]["errors"][0]["context"]["url"], "https://shop.example/checkout");
    assert_eq!(errors[0]["errors"][0]["context"]["breadcrumbs"][0]["message"], "clicked pay");

    let metrics = p.sink.by_kind(PayloadKind::Metrics);
    assert_eq!(metrics[0]["summary"]["totalEvents"], 8);
}

#[tokio::test]
async fn poor_vitals_and_error_bursts_raise_alerts() {
    let p = page(config());
    let t = &p.telemetry;

    p.platform.emit(&[PerformanceEntry::largest_contentful_paint(5200.0)]);
    // Second poor value inside the cooldown is suppressed.
    t.vitals().record_metric("lcp", 6100.0);

    for i in 0..6 {
        t.errors()
            .capture_error(format!("timeout {}", i), ErrorKind::Error, Severity::Medium, None);
    }

    let alerts = t.alerts().get_alerts();
    let rules: Vec<&str> = alerts.iter().map(|a| a.rule_id.as_str()).collect();
    assert_eq!(rules, vec!["lcp", "error-rate"]);
    assert_eq!(alerts[1].level, AlertLevel::Critical);

    // After the vital cooldown the rule fires again.
    p.clock.advance(Duration::from_secs(31));
    t.vitals().record_metric("LCP", 6100.0);
    assert_eq!(t.alerts().rule("lcp").unwrap().fire_count, 2);

    assert!(t.shutdown(Duration::from_secs(1)).await);
    let posted = p.sink.by_kind(PayloadKind::Alert);
    assert_eq!(posted.len(), 3);
    assert_eq!(posted[1]["ruleId"], "error-rate");
}

#[test]
fn custom_rules_can_watch_api_latency() {
    let p = page(MonitorConfig {
        install_default_alerts: false,
        ..Default::default()
    });
    let t = &p.telemetry;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    t.alerts()
        .register_alert(AlertConfig::above("slow-api", "Slow API", AlertKind::Performance, 1000.0).action(
            move |alert| {
                sink.lock().push(alert.data.value);
                Ok(())
            },
        ))
        .unwrap();

    let alerts = t.alerts().clone();
    t.metrics().on_metric(move |event| {
        if event.kind == MetricKind::ApiLatency {
            alerts.check_and_alert("slow-api", &AlertData::new(event.name.as_str(), event.value));
        }
    });

    t.metrics().record_api_call("/api/search", 400.0, 200);
    t.metrics().record_api_call("/api/search", 1500.0, 200);

    assert_eq!(*seen.lock(), vec![1500.0]);
}

#[test]
fn sends_without_runtime_fall_back_to_blocking() {
    let p = page(config());
    p.telemetry.metrics().record_interaction("open-menu", 35.0);

    assert_eq!(p.telemetry.flush(), 3);
    assert_eq!(p.sink.payloads.lock().len(), 3);
}
