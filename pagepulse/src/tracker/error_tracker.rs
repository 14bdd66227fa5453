//! Error capture with causal context.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::breadcrumb::{BreadcrumbKind, BreadcrumbTrail, DEFAULT_BREADCRUMB_CAPACITY};
use super::record::{ErrorBatch, ErrorContext, ErrorKind, ErrorRecord, ErrorSummary, Severity};
use crate::buffer::BoundedBuffer;
use crate::clock::{SharedClock, SystemClock};
use crate::environment::{EnvironmentProbe, StaticEnvironment, read_field};
use crate::listeners::{ListenerId, Listeners};
use crate::session::SessionId;
use crate::transport::{PayloadKind, Transport};
use crate::Result;

/// Default number of error records retained.
pub const DEFAULT_ERROR_CAPACITY: usize = 1000;

/// Default number of records in a summary's recent list.
pub const DEFAULT_RECENT_ERRORS: usize = 10;

/// Captures failures and keeps the most recent ones.
pub struct ErrorTracker {
    errors: Mutex<BoundedBuffer<ErrorRecord>>,
    breadcrumbs: BreadcrumbTrail,
    user_id: RwLock<Option<String>>,
    session_id: SessionId,
    recent_limit: usize,
    environment: Arc<dyn EnvironmentProbe>,
    clock: SharedClock,
    transport: Transport,
    listeners: Listeners<ErrorRecord>,
}

pub struct ErrorTrackerBuilder {
    capacity: usize,
    recent_limit: usize,
    breadcrumbs: Option<BreadcrumbTrail>,
    session_id: Option<SessionId>,
    user_id: Option<String>,
    environment: Arc<dyn EnvironmentProbe>,
    clock: SharedClock,
    transport: Transport,
}

impl Default for ErrorTrackerBuilder {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_ERROR_CAPACITY,
            recent_limit: DEFAULT_RECENT_ERRORS,
            breadcrumbs: None,
            session_id: None,
            user_id: None,
            environment: Arc::new(StaticEnvironment::default()),
            clock: SystemClock::shared(),
            transport: Transport::disabled(),
        }
    }
}

impl ErrorTrackerBuilder {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn recent_limit(mut self, recent_limit: usize) -> Self {
        self.recent_limit = recent_limit;
        self
    }

    /// Share an existing trail instead of creating one.
    pub fn breadcrumbs(mut self, trail: BreadcrumbTrail) -> Self {
        self.breadcrumbs = Some(trail);
        self
    }

    pub fn session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn environment(mut self, environment: Arc<dyn EnvironmentProbe>) -> Self {
        self.environment = environment;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn build(self) -> Result<ErrorTracker> {
        let breadcrumbs = match self.breadcrumbs {
            Some(trail) => trail,
            None => BreadcrumbTrail::new(DEFAULT_BREADCRUMB_CAPACITY)?.with_clock(self.clock.clone()),
        };

        Ok(ErrorTracker {
            errors: Mutex::new(BoundedBuffer::new(self.capacity)?),
            breadcrumbs,
            user_id: RwLock::new(self.user_id),
            session_id: self.session_id.unwrap_or_else(SessionId::generate),
            recent_limit: self.recent_limit,
            environment: self.environment,
            clock: self.clock,
            transport: self.transport,
            listeners: Listeners::new("errors"),
        })
    }
}

#[derive(Serialize)]
struct ErrorExport<'a> {
    summary: &'a ErrorSummary,
    errors: &'a [ErrorRecord],
}

impl ErrorTracker {
    pub fn builder() -> ErrorTrackerBuilder {
        ErrorTrackerBuilder::default()
    }

    // ========== Capture ==========

    /// Append a breadcrumb to the shared trail.
    pub fn add_breadcrumb(&self, message: impl Into<String>, kind: BreadcrumbKind, data: Option<Value>) {
        self.breadcrumbs.add(message, kind, data);
    }

    /// Record an error and return its id.
    ///
    /// The record carries a copy of the current breadcrumb trail. Context
    /// fields that cannot be read are omitted.
    pub fn capture_error(
        &self,
        message: impl Into<String>,
        kind: ErrorKind,
        severity: Severity,
        stack: Option<String>,
    ) -> String {
        let record = ErrorRecord {
            id: Uuid::new_v4().to_string(),
            message: message.into(),
            stack,
            kind,
            severity,
            timestamp: self.clock.now(),
            context: self.collect_context(),
            user_id: self.user_id.read().clone(),
            session_id: self.session_id.clone(),
        };
        let id = record.id.clone();

        match severity {
            Severity::Critical | Severity::High => {
                warn!(error_id = %id, %kind, %severity, message = %record.message, "Error captured")
            }
            _ => debug!(error_id = %id, %kind, %severity, message = %record.message, "Error captured"),
        }

        {
            let mut errors = self.errors.lock();
            if let Some(evicted) = errors.push(record.clone()) {
                debug!(error_id = %evicted.id, "Evicted oldest error record");
            }
        }

        self.listeners.notify(&record);
        id
    }

    /// Capture a Rust error. The `source()` chain becomes the stack.
    pub fn capture(&self, error: &(dyn std::error::Error + 'static), severity: Severity) -> String {
        self.capture_error(error.to_string(), ErrorKind::Error, severity, source_chain(error))
    }

    fn collect_context(&self) -> ErrorContext {
        let env = self.environment.as_ref();
        ErrorContext {
            url: read_field("url", || env.url()),
            agent_string: read_field("user_agent", || env.user_agent()),
            viewport: read_field("viewport", || env.viewport()),
            memory_hint: read_field("memory", || env.memory()),
            breadcrumbs: self.breadcrumbs.snapshot(),
        }
    }

    // ========== Identity & listeners ==========

    pub fn set_user(&self, user_id: Option<String>) {
        *self.user_id.write() = user_id;
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id.read().clone()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Handle to the shared trail; clones append to the same buffer.
    pub fn breadcrumbs(&self) -> BreadcrumbTrail {
        self.breadcrumbs.clone()
    }

    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ErrorRecord) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    // ========== Queries ==========

    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.lock().to_vec()
    }

    pub fn get_errors_by_type(&self, kind: ErrorKind) -> Vec<ErrorRecord> {
        self.filtered(|e| e.kind == kind)
    }

    pub fn get_errors_by_severity(&self, severity: Severity) -> Vec<ErrorRecord> {
        self.filtered(|e| e.severity == severity)
    }

    /// Errors captured within the last `window`.
    pub fn errors_since(&self, window: Duration) -> Vec<ErrorRecord> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let cutoff = self.clock.now().checked_sub_signed(window);
        self.filtered(|e| cutoff.is_none_or(|cutoff| e.timestamp >= cutoff))
    }

    fn filtered(&self, keep: impl Fn(&ErrorRecord) -> bool) -> Vec<ErrorRecord> {
        self.errors.lock().iter().filter(|e| keep(e)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    pub fn get_summary(&self) -> ErrorSummary {
        let errors = self.errors.lock();
        let mut by_type = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        for e in errors.iter() {
            *by_type.entry(e.kind).or_insert(0) += 1;
            *by_severity.entry(e.severity).or_insert(0) += 1;
        }

        ErrorSummary {
            total: errors.len(),
            by_type,
            by_severity,
            recent_errors: errors.latest(self.recent_limit).cloned().collect(),
        }
    }

    /// Drop every record. The breadcrumb trail is left alone.
    pub fn clear(&self) {
        self.errors.lock().clear();
    }

    // ========== Export ==========

    /// Summary plus every record as pretty JSON.
    pub fn export(&self) -> Result<String> {
        let summary = self.get_summary();
        let errors = self.get_errors();
        Ok(serde_json::to_string_pretty(&ErrorExport {
            summary: &summary,
            errors: &errors,
        })?)
    }

    /// Send every retained record to `endpoint` without waiting.
    pub fn send_errors(&self, endpoint: &str) {
        let batch = ErrorBatch {
            session_id: self.session_id.clone(),
            timestamp: self.clock.now(),
            errors: self.get_errors(),
        };
        match serde_json::to_value(&batch) {
            Ok(body) => self.transport.send(PayloadKind::Errors, endpoint, body),
            Err(e) => warn!(%endpoint, error = %e, "Failed to serialize error batch"),
        }
    }
}

impl std::fmt::Debug for ErrorTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorTracker")
            .field("session_id", &self.session_id)
            .field("errors", &self.len())
            .field("breadcrumbs", &self.breadcrumbs)
            .finish()
    }
}

/// Render the `source()` chain, one cause per line.
fn source_chain(error: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut source = error.source();
    if source.is_none() {
        return None;
    }

    let mut out = String::new();
    while let Some(cause) = source {
        let _ = writeln!(out, "caused by: {}", cause);
        source = cause.source();
    }
    Some(out.trim_end().to_string())
}
