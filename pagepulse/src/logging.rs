//! Subscriber setup with a reloadable filter.
//!
//! Hosts that already install their own `tracing` subscriber can skip this
//! module entirely; the library only emits events.

use std::path::PathBuf;

use chrono::Local;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::Writer, time::FormatTime, writer::BoxMakeWriter},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "pagepulse=info,reqwest=warn";

/// File name prefix of the rolling log.
const LOG_FILE_PREFIX: &str = "pagepulse.log";

/// Timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, Registry>;

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Filter directive. `RUST_LOG` wins when unset.
    pub filter: Option<String>,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Also write a daily rolling file here.
    pub log_dir: Option<PathBuf>,
    pub ansi: bool,
    /// Console output goes to stderr instead of stdout.
    pub stderr: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            filter: None,
            json: false,
            log_dir: None,
            ansi: true,
            stderr: false,
        }
    }
}

impl LoggingOptions {
    fn initial_filter(&self) -> Result<EnvFilter> {
        match &self.filter {
            Some(directive) => EnvFilter::try_new(directive)
                .map_err(|e| Error::config(format!("Invalid filter directive: {}", e))),
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))),
        }
    }

    fn console_writer(&self) -> BoxMakeWriter {
        if self.stderr {
            BoxMakeWriter::new(std::io::stderr)
        } else {
            BoxMakeWriter::new(std::io::stdout)
        }
    }
}

/// Handle for changing the filter at runtime.
#[derive(Clone)]
pub struct LoggingHandle {
    handle: FilterHandle,
}

impl LoggingHandle {
    /// Current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter. Invalid directives leave the current one in place.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("Invalid filter directive: {}", e)))?;

        self.handle
            .reload(new_filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }
}

impl std::fmt::Debug for LoggingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingHandle")
            .field("filter", &self.get_filter())
            .finish()
    }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for as long as file output is wanted; it is
/// `None` when no `log_dir` was given.
pub fn init_logging(options: &LoggingOptions) -> Result<(LoggingHandle, Option<WorkerGuard>)> {
    let (filter_layer, handle) = reload::Layer::new(options.initial_filter()?);

    let console = if options.json {
        fmt::layer()
            .json()
            .with_writer(options.console_writer())
            .with_timer(LocalTimer)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(options.console_writer())
            .with_ansi(options.ansi)
            .with_timer(LocalTimer)
            .boxed()
    };

    let (file, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok((LoggingHandle { handle }, guard))
}
