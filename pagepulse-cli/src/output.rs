use std::fmt::Write;

use pagepulse::TelemetrySnapshot;
use pagepulse::vitals::{Thresholds, Vital};

use crate::cli::OutputFormat;
use crate::error::Result;

pub fn render_snapshot(snapshot: &TelemetrySnapshot, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(snapshot).map_err(pagepulse::Error::from)?),
        OutputFormat::Pretty => Ok(pretty_snapshot(snapshot)),
    }
}

fn pretty_snapshot(snapshot: &TelemetrySnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Session {}", snapshot.session_id);

    let _ = writeln!(out, "\nVitals:");
    let mut any_vital = false;
    for (vital, value) in snapshot.vitals.vitals.iter() {
        any_vital = true;
        let _ = writeln!(
            out,
            "  {:<5} {:>10} {:<3} {}",
            vital.as_ref(),
            format_value(vital, value),
            vital.unit(),
            vital.rate(value)
        );
    }
    if !any_vital {
        let _ = writeln!(out, "  (none observed)");
    }
    for (name, value) in &snapshot.vitals.custom_metrics {
        let _ = writeln!(out, "  {:<5} {:>10}", name, value);
    }

    let metrics = &snapshot.metrics;
    let _ = writeln!(
        out,
        "\nMetrics: {} events, {} unique",
        metrics.summary.total_events, metrics.summary.unique_metrics
    );
    if !metrics.aggregated.is_empty() {
        let _ = writeln!(
            out,
            "  {:<32} {:>6} {:>10} {:>10} {:>10}",
            "name", "count", "mean", "p95", "max"
        );
        for metric in &metrics.aggregated {
            let _ = writeln!(
                out,
                "  {:<32} {:>6} {:>10.2} {:>10.2} {:>10.2}",
                metric.name, metric.count, metric.mean, metric.p95, metric.max
            );
        }
    }

    let errors = &snapshot.errors;
    let _ = writeln!(out, "\nErrors: {}", errors.total);
    for (severity, count) in &errors.by_severity {
        let _ = writeln!(out, "  {:<10} {}", severity, count);
    }
    for record in &errors.recent_errors {
        let _ = writeln!(out, "  - [{}] {}", record.severity, record.message);
    }

    let _ = writeln!(out, "\nAlerts: {}", snapshot.alerts.len());
    for alert in &snapshot.alerts {
        let _ = writeln!(out, "  - [{}] {}", alert.level, alert.message);
    }

    out
}

fn format_value(vital: Vital, value: f64) -> String {
    match vital {
        Vital::Cls => format!("{:.3}", value),
        _ => format!("{:.0}", value),
    }
}

pub fn render_thresholds(table: &[(Vital, Thresholds)], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => {
            let map: serde_json::Map<String, serde_json::Value> = table
                .iter()
                .map(|(vital, t)| {
                    (
                        vital.to_string(),
                        serde_json::json!({ "good": t.good, "poor": t.poor, "unit": vital.unit() }),
                    )
                })
                .collect();
            Ok(serde_json::to_string_pretty(&map).map_err(pagepulse::Error::from)?)
        }
        OutputFormat::Pretty => {
            let mut out = String::new();
            let _ = writeln!(out, "{:<5} {:>8} {:>8} unit", "vital", "good", "poor");
            for (vital, t) in table {
                let _ = writeln!(out, "{:<5} {:>8} {:>8} {}", vital.as_ref(), t.good, t.poor, vital.unit());
            }
            Ok(out)
        }
    }
}
