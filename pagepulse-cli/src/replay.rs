//! JSON-lines instrumentation replay.
//!
//! Each non-empty line that does not start with `#` is one [`Record`]. Time
//! only moves on `advance` records, so a replay is deterministic.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use pagepulse::metrics::{MetricKind, Tags};
use pagepulse::tracker::{BreadcrumbKind, ErrorKind, Severity};
use pagepulse::vitals::{ManualPlatform, PerformanceEntry};
use pagepulse::{ManualClock, MonitorConfig, Telemetry};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{CliError, Result};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Metric {
        name: String,
        value: f64,
        #[serde(default = "default_metric_kind")]
        kind: MetricKind,
        #[serde(default)]
        tags: Tags,
    },
    Api {
        endpoint: String,
        duration_ms: f64,
        status: u16,
    },
    Render {
        component: String,
        duration_ms: f64,
    },
    Interaction {
        action: String,
        duration_ms: f64,
    },
    /// A vital or custom value set by hand.
    Vital { name: String, value: f64 },
    LayoutShift {
        value: f64,
        #[serde(default)]
        had_recent_input: bool,
    },
    /// Any raw performance entry.
    Entry { entry: PerformanceEntry },
    Breadcrumb {
        message: String,
        #[serde(default = "default_breadcrumb_kind")]
        category: BreadcrumbKind,
        #[serde(default)]
        data: Option<Value>,
    },
    Error {
        message: String,
        #[serde(default = "default_error_kind")]
        kind: ErrorKind,
        #[serde(default = "default_severity")]
        severity: Severity,
        #[serde(default)]
        stack: Option<String>,
    },
    Advance { ms: u64 },
}

fn default_metric_kind() -> MetricKind {
    MetricKind::CustomTimer
}

fn default_breadcrumb_kind() -> BreadcrumbKind {
    BreadcrumbKind::Custom
}

fn default_error_kind() -> ErrorKind {
    ErrorKind::Error
}

fn default_severity() -> Severity {
    Severity::Medium
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub records: usize,
    pub skipped_lines: usize,
}

/// A monitor driven by a manual platform and clock.
pub struct Replay {
    telemetry: Telemetry,
    platform: ManualPlatform,
    clock: Arc<ManualClock>,
}

impl Replay {
    pub fn new(config: MonitorConfig) -> Result<Self> {
        let platform = ManualPlatform::new();
        let clock = ManualClock::starting_now();
        let telemetry = Telemetry::builder(config)
            .platform(Arc::new(platform.clone()))
            .clock(clock.clone())
            .build()?;
        Ok(Self {
            telemetry,
            platform,
            clock,
        })
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Apply every record in `reader`. Stops at the first malformed line.
    pub fn run(&self, reader: impl BufRead) -> Result<ReplayStats> {
        let mut stats = ReplayStats::default();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                stats.skipped_lines += 1;
                continue;
            }

            let record: Record = serde_json::from_str(trimmed).map_err(|source| CliError::Parse {
                line: index + 1,
                source,
            })?;
            self.apply(record);
            stats.records += 1;
        }
        debug!(records = stats.records, skipped = stats.skipped_lines, "Replay finished");
        Ok(stats)
    }

    /// Replay the JSON-lines file at `path`.
    pub fn run_file(&self, path: &Path) -> Result<ReplayStats> {
        let file = File::open(path)?;
        self.run(BufReader::new(file))
    }

    pub fn apply(&self, record: Record) {
        let t = &self.telemetry;
        match record {
            Record::Metric {
                name,
                value,
                kind,
                tags,
            } => {
                t.metrics().record_metric(name, value, kind, tags, None);
            }
            Record::Api {
                endpoint,
                duration_ms,
                status,
            } => {
                t.metrics().record_api_call(&endpoint, duration_ms, status);
            }
            Record::Render {
                component,
                duration_ms,
            } => {
                t.metrics().record_component_render(&component, duration_ms);
            }
            Record::Interaction { action, duration_ms } => {
                t.metrics().record_interaction(&action, duration_ms);
            }
            Record::Vital { name, value } => t.vitals().record_metric(&name, value),
            Record::LayoutShift {
                value,
                had_recent_input,
            } => self
                .platform
                .emit(&[PerformanceEntry::layout_shift(value, had_recent_input)]),
            Record::Entry { entry } => self.platform.emit(&[entry]),
            Record::Breadcrumb {
                message,
                category,
                data,
            } => t.breadcrumbs().add(message, category, data),
            Record::Error {
                message,
                kind,
                severity,
                stack,
            } => {
                t.errors().capture_error(message, kind, severity, stack);
            }
            Record::Advance { ms } => self.clock.advance_ms(ms),
        }
    }
}
