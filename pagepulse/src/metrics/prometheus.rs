//! Prometheus metrics exporter.
//!
//! Renders the collector's aggregates in Prometheus text format. Each metric
//! name becomes a set of labelled samples on one summary family.

use std::fmt::Write as _;
use std::sync::Arc;

use super::aggregate::AggregatedMetric;
use super::collector::MetricsCollector;

/// Prometheus metrics exporter.
pub struct PrometheusExporter {
    collector: Arc<MetricsCollector>,
    namespace: String,
}

impl PrometheusExporter {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self::with_namespace(collector, "pagepulse")
    }

    pub fn with_namespace(collector: Arc<MetricsCollector>, namespace: impl Into<String>) -> Self {
        Self {
            collector,
            namespace: namespace.into(),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let aggregated = self.collector.get_aggregated_metrics();
        let mut output = String::new();

        self.write_gauge(
            &mut output,
            "events_buffered",
            "Number of metric events currently retained",
            self.collector.len() as f64,
        );

        self.write_gauge(
            &mut output,
            "events_capacity",
            "Maximum number of metric events retained",
            self.collector.capacity() as f64,
        );

        if aggregated.is_empty() {
            return output;
        }

        let family = format!("{}_metric", self.namespace);
        let _ = writeln!(output, "# HELP {} Recorded metric values by name", family);
        let _ = writeln!(output, "# TYPE {} summary", family);

        for metric in aggregated.values() {
            let kind = metric.kind.as_ref();
            for (quantile, value) in [("0.5", metric.median), ("0.95", metric.p95), ("0.99", metric.p99)] {
                self.write_sample(
                    &mut output,
                    &family,
                    value,
                    &[("name", metric.name.as_str()), ("type", kind), ("quantile", quantile)],
                );
            }
            self.write_sample(
                &mut output,
                &format!("{}_sum", family),
                metric.mean * metric.count as f64,
                &[("name", metric.name.as_str()), ("type", kind)],
            );
            self.write_sample(
                &mut output,
                &format!("{}_count", family),
                metric.count as f64,
                &[("name", metric.name.as_str()), ("type", kind)],
            );
        }

        let gauges: [(&str, &str, fn(&AggregatedMetric) -> f64); 3] = [
            ("metric_min", "Smallest recorded value by name", |m| m.min),
            ("metric_max", "Largest recorded value by name", |m| m.max),
            ("metric_stddev", "Population standard deviation by name", |m| m.std_dev),
        ];
        for (suffix, help, pick) in gauges {
            let full_name = format!("{}_{}", self.namespace, suffix);
            let _ = writeln!(output, "# HELP {} {}", full_name, help);
            let _ = writeln!(output, "# TYPE {} gauge", full_name);
            for metric in aggregated.values() {
                self.write_sample(&mut output, &full_name, pick(metric), &[("name", metric.name.as_str())]);
            }
        }

        output
    }

    fn write_gauge(&self, output: &mut String, name: &str, help: &str, value: f64) {
        let full_name = format!("{}_{}", self.namespace, name);
        let _ = writeln!(output, "# HELP {} {}", full_name, help);
        let _ = writeln!(output, "# TYPE {} gauge", full_name);
        let _ = writeln!(output, "{} {}", full_name, value);
    }

    fn write_sample(&self, output: &mut String, full_name: &str, value: f64, labels: &[(&str, &str)]) {
        let labels_str = labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
            .collect::<Vec<_>>()
            .join(",");

        let _ = writeln!(output, "{}{{{}}} {}", full_name, labels_str, value);
    }
}

/// Escape a label value per the text exposition format.
fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::new(100).unwrap())
    }

    #[test]
    fn test_prometheus_export_empty() {
        let exporter = PrometheusExporter::new(collector());
        let output = exporter.export();

        assert!(output.contains("# TYPE pagepulse_events_buffered gauge"));
        assert!(output.contains("pagepulse_events_buffered 0"));
        assert!(output.contains("pagepulse_events_capacity 100"));
        assert!(!output.contains("pagepulse_metric{"));
    }

    #[test]
    fn test_prometheus_export_with_data() {
        let collector = collector();
        collector.record_api_call("/users", 100.0, 200);
        collector.record_api_call("/users", 300.0, 200);

        let output = PrometheusExporter::new(collector).export();

        assert!(output.contains("# TYPE pagepulse_metric summary"));
        assert!(output.contains(
            "pagepulse_metric{name=\"api:/users\",type=\"api-latency\",quantile=\"0.5\"} 300"
        ));
        assert!(output.contains("pagepulse_metric_sum{name=\"api:/users\",type=\"api-latency\"} 400"));
        assert!(output.contains("pagepulse_metric_count{name=\"api:/users\",type=\"api-latency\"} 2"));
        assert!(output.contains("pagepulse_metric_min{name=\"api:/users\"} 100"));
        assert!(output.contains("pagepulse_metric_stddev{name=\"api:/users\"} 100"));
    }

    #[test]
    fn test_label_values_are_escaped() {
        let collector = collector();
        collector.record_interaction("say \"hi\"", 1.0);

        let output = PrometheusExporter::new(collector).export();
        assert!(output.contains("name=\"interaction:say \\\"hi\\\"\""));
    }

    #[test]
    fn test_prometheus_custom_namespace() {
        let exporter = PrometheusExporter::with_namespace(collector(), "custom");
        let output = exporter.export();

        assert!(output.contains("custom_events_buffered"));
        assert!(!output.contains("pagepulse_"));
    }
}
