//! Page-vitals observer.
//!
//! Subscribes to the platform's performance entries for each of the five
//! vitals and keeps the latest value of each, together with the time it was
//! last updated. Every vital is wired independently: one unsupported or
//! failing primitive never stops the others.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::platform::{EntryType, NoopPlatform, PerformanceEntry, PlatformObserver, Subscription};
use super::rating::{Thresholds, Vital, VitalRating};
use crate::clock::{SharedClock, SystemClock};
use crate::environment::{DeviceInfo, EnvironmentProbe, StaticEnvironment};
use crate::listeners::{ListenerId, Listeners};
use crate::session::SessionId;
use crate::transport::{PayloadKind, Transport};
use crate::Result;

/// Paint entry that carries FCP.
const FIRST_CONTENTFUL_PAINT: &str = "first-contentful-paint";

/// Latest value of each vital. Unset fields have not been observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct VitalSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lcp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cls: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttfb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcp: Option<f64>,
}

impl VitalSnapshot {
    pub fn get(&self, vital: Vital) -> Option<f64> {
        match vital {
            Vital::Lcp => self.lcp,
            Vital::Fid => self.fid,
            Vital::Cls => self.cls,
            Vital::Ttfb => self.ttfb,
            Vital::Fcp => self.fcp,
        }
    }

    fn set(&mut self, vital: Vital, value: f64) {
        let slot = match vital {
            Vital::Lcp => &mut self.lcp,
            Vital::Fid => &mut self.fid,
            Vital::Cls => &mut self.cls,
            Vital::Ttfb => &mut self.ttfb,
            Vital::Fcp => &mut self.fcp,
        };
        *slot = Some(value);
    }

    /// Populated vitals in table order.
    pub fn iter(&self) -> impl Iterator<Item = (Vital, f64)> + '_ {
        Vital::ALL
            .into_iter()
            .filter_map(|v| self.get(v).map(|value| (v, value)))
    }
}

/// Full snapshot handed to listeners and exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalsReport {
    pub timestamp: DateTime<Utc>,
    pub vitals: VitalSnapshot,
    pub custom_metrics: BTreeMap<String, f64>,
    pub session_id: SessionId,
    pub device_info: DeviceInfo,
    /// When each vital or custom metric last changed.
    pub updated_at: BTreeMap<String, DateTime<Utc>>,
}

/// One value change, either a vital or a custom metric.
#[derive(Debug, Clone, PartialEq)]
pub struct VitalUpdate {
    pub name: String,
    pub vital: Option<Vital>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VitalSummaryEntry {
    pub value: f64,
    pub rating: VitalRating,
}

#[derive(Default)]
struct VitalsState {
    snapshot: VitalSnapshot,
    custom: BTreeMap<String, f64>,
    updated_at: BTreeMap<String, DateTime<Utc>>,
    /// Running CLS sum over shifts without recent input.
    cls_total: f64,
}

struct ObserverInner {
    state: Mutex<VitalsState>,
    report_listeners: Listeners<VitalsReport>,
    update_listeners: Listeners<VitalUpdate>,
    subscriptions: Mutex<Vec<Subscription>>,
    /// Vitals whose observation failure was already logged.
    failed: Mutex<HashSet<Vital>>,
    clock: SharedClock,
    session_id: SessionId,
    environment: Arc<dyn EnvironmentProbe>,
    transport: Transport,
}

/// Observer of the five page vitals.
///
/// Cheap to clone; clones share state and subscriptions.
#[derive(Clone)]
pub struct VitalsObserver {
    inner: Arc<ObserverInner>,
}

/// Builder for [`VitalsObserver`].
pub struct VitalsObserverBuilder {
    platform: Arc<dyn PlatformObserver>,
    clock: SharedClock,
    session_id: Option<SessionId>,
    environment: Arc<dyn EnvironmentProbe>,
    transport: Transport,
}

impl Default for VitalsObserverBuilder {
    fn default() -> Self {
        Self {
            platform: Arc::new(NoopPlatform),
            clock: SystemClock::shared(),
            session_id: None,
            environment: Arc::new(StaticEnvironment::default()),
            transport: Transport::disabled(),
        }
    }
}

impl VitalsObserverBuilder {
    pub fn platform(mut self, platform: Arc<dyn PlatformObserver>) -> Self {
        self.platform = platform;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn environment(mut self, environment: Arc<dyn EnvironmentProbe>) -> Self {
        self.environment = environment;
        self
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Build the observer and subscribe to every supported primitive.
    pub fn build(self) -> VitalsObserver {
        let observer = VitalsObserver {
            inner: Arc::new(ObserverInner {
                state: Mutex::new(VitalsState::default()),
                report_listeners: Listeners::new("vitals"),
                update_listeners: Listeners::new("vitals-updates"),
                subscriptions: Mutex::new(Vec::new()),
                failed: Mutex::new(HashSet::new()),
                clock: self.clock,
                session_id: self.session_id.unwrap_or_else(SessionId::generate),
                environment: self.environment,
                transport: self.transport,
            }),
        };
        observer.connect(self.platform.as_ref());
        observer
    }
}

/// Which entry type feeds which vital.
const SOURCES: [(Vital, EntryType); 5] = [
    (Vital::Lcp, EntryType::LargestContentfulPaint),
    (Vital::Fid, EntryType::FirstInput),
    (Vital::Cls, EntryType::LayoutShift),
    (Vital::Ttfb, EntryType::Navigation),
    (Vital::Fcp, EntryType::Paint),
];

impl VitalsObserver {
    pub fn builder() -> VitalsObserverBuilder {
        VitalsObserverBuilder::default()
    }

    /// Observer on `platform` with default clock, session and environment.
    pub fn new(platform: Arc<dyn PlatformObserver>) -> Self {
        Self::builder().platform(platform).build()
    }

    fn connect(&self, platform: &dyn PlatformObserver) {
        let mut connected = 0usize;
        for (vital, entry_type) in SOURCES {
            match self.observe(platform, vital, entry_type) {
                Ok(subscription) => {
                    self.inner.subscriptions.lock().push(subscription);
                    connected += 1;
                }
                Err(e) => self.inner.warn_once(vital, &e),
            }
        }
        info!(
            platform = platform.name(),
            session_id = %self.inner.session_id,
            connected,
            "Vitals observer started"
        );
    }

    fn observe(&self, platform: &dyn PlatformObserver, vital: Vital, entry_type: EntryType) -> Result<Subscription> {
        if !platform.supports(entry_type) {
            return Err(crate::Error::unsupported(format!("{} entries", entry_type)));
        }

        // Weak so a platform holding the callback does not keep the observer alive.
        let weak: Weak<ObserverInner> = Arc::downgrade(&self.inner);
        platform.observe(
            entry_type,
            Arc::new(move |entries: &[PerformanceEntry]| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_entries(vital, entries);
                }
            }),
        )
    }

    /// Drop every platform subscription. Values observed so far are kept.
    pub fn disconnect(&self) {
        let subscriptions: Vec<Subscription> = std::mem::take(&mut *self.inner.subscriptions.lock());
        let count = subscriptions.len();
        drop(subscriptions);
        debug!(count, "Vitals observer disconnected");
    }

    /// Number of live platform subscriptions.
    pub fn connected(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Set a value by hand, overwriting any observed value.
    ///
    /// Vital names are matched case-insensitively; anything else is stored as
    /// a custom metric.
    pub fn record_metric(&self, name: &str, value: f64) {
        if !value.is_finite() {
            warn!(metric = name, value, "Ignoring non-finite vital value");
            return;
        }
        let vital = Vital::from_str(name).ok();
        let now = self.inner.clock.now();
        {
            let mut state = self.inner.state.lock();
            match vital {
                Some(vital) => {
                    state.snapshot.set(vital, value);
                    if vital == Vital::Cls {
                        state.cls_total = value;
                    }
                    state.updated_at.insert(vital.to_string(), now);
                }
                None => {
                    state.custom.insert(name.to_string(), value);
                    state.updated_at.insert(name.to_string(), now);
                }
            }
        }

        let name = vital.map_or_else(|| name.to_string(), |v| v.to_string());
        self.inner.publish(VitalUpdate { name, vital, value });
    }

    /// Register a listener receiving the full report after every update.
    pub fn on_metrics<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&VitalsReport) + Send + Sync + 'static,
    {
        self.inner.report_listeners.add(listener)
    }

    /// Register a listener receiving only the value that changed.
    pub fn on_update<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&VitalUpdate) + Send + Sync + 'static,
    {
        self.inner.update_listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.report_listeners.remove(id) || self.inner.update_listeners.remove(id)
    }

    pub fn get_vitals(&self) -> VitalSnapshot {
        self.inner.state.lock().snapshot
    }

    pub fn custom_metrics(&self) -> BTreeMap<String, f64> {
        self.inner.state.lock().custom.clone()
    }

    /// Rate `value`, or the current value of `vital` when `value` is `None`.
    ///
    /// With neither available the rating is `needs-improvement`.
    pub fn get_vital_rating(&self, vital: Vital, value: Option<f64>) -> VitalRating {
        match value.or_else(|| self.get_vitals().get(vital)) {
            Some(value) => vital.rate(value),
            None => VitalRating::NeedsImprovement,
        }
    }

    /// Every populated vital with its rating.
    pub fn get_summary(&self) -> BTreeMap<Vital, VitalSummaryEntry> {
        self.get_vitals()
            .iter()
            .map(|(vital, value)| {
                (
                    vital,
                    VitalSummaryEntry {
                        value,
                        rating: vital.rate(value),
                    },
                )
            })
            .collect()
    }

    pub fn thresholds(&self) -> [(Vital, Thresholds); 5] {
        super::rating::thresholds()
    }

    pub fn report(&self) -> VitalsReport {
        self.inner.report()
    }

    /// Current report as pretty JSON.
    pub fn export_metrics(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.report())?)
    }

    /// Send the current report to `endpoint` without waiting.
    pub fn send_metrics(&self, endpoint: &str) {
        match serde_json::to_value(self.report()) {
            Ok(body) => self.inner.transport.send(PayloadKind::Vitals, endpoint, body),
            Err(e) => warn!(%endpoint, error = %e, "Failed to serialize vitals report"),
        }
    }
}

impl ObserverInner {
    fn warn_once(&self, vital: Vital, error: &crate::Error) {
        if self.failed.lock().insert(vital) {
            warn!(%vital, error = %error, "Vital observation unavailable; it will stay unset");
        }
    }

    fn handle_entries(&self, vital: Vital, entries: &[PerformanceEntry]) {
        let now = self.clock.now();
        let value = {
            let mut state = self.state.lock();
            let value = match vital {
                Vital::Lcp => entries
                    .last()
                    .map(|e| e.render_time.unwrap_or(e.start_time)),
                Vital::Fid => entries.first().and_then(|e| {
                    e.processing_start
                        .map(|processing_start| (processing_start - e.start_time).max(0.0))
                }),
                Vital::Cls => {
                    let shifts: Vec<f64> = entries
                        .iter()
                        .filter(|e| !e.had_recent_input)
                        .filter_map(|e| e.value)
                        .filter(|v| v.is_finite())
                        .collect();
                    if shifts.is_empty() {
                        None
                    } else {
                        state.cls_total += shifts.iter().sum::<f64>();
                        Some(state.cls_total)
                    }
                }
                Vital::Ttfb => entries.iter().rev().find_map(|e| match (e.request_start, e.response_start) {
                    (Some(request), Some(response)) => Some((response - request).max(0.0)),
                    _ => None,
                }),
                Vital::Fcp => entries
                    .iter()
                    .find(|e| e.name == FIRST_CONTENTFUL_PAINT)
                    .map(|e| e.start_time),
            };

            let value = value.filter(|v| v.is_finite());
            if let Some(value) = value {
                state.snapshot.set(vital, value);
                state.updated_at.insert(vital.to_string(), now);
            }
            value
        };

        if let Some(value) = value {
            debug!(%vital, value, "Vital observed");
            self.publish(VitalUpdate {
                name: vital.to_string(),
                vital: Some(vital),
                value,
            });
        }
    }

    fn publish(&self, update: VitalUpdate) {
        self.update_listeners.notify(&update);
        if !self.report_listeners.is_empty() {
            self.report_listeners.notify(&self.report());
        }
    }

    fn report(&self) -> VitalsReport {
        let (vitals, custom_metrics, updated_at) = {
            let state = self.state.lock();
            (state.snapshot, state.custom.clone(), state.updated_at.clone())
        };
        VitalsReport {
            timestamp: self.clock.now(),
            vitals,
            custom_metrics,
            session_id: self.session_id.clone(),
            device_info: self.environment.device_info(),
            updated_at,
        }
    }
}

impl fmt::Debug for VitalsObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VitalsObserver")
            .field("session_id", &self.inner.session_id)
            .field("vitals", &self.get_vitals())
            .field("connected", &self.connected())
            .finish()
    }
}
