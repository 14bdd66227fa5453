//! Host instrumentation primitives.
//!
//! [`PlatformObserver`] is the seam between the vitals observer and whatever
//! delivers performance entries. [`NoopPlatform`] supports nothing;
//! [`ManualPlatform`] is driven explicitly by tests and replay tools.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{Error, Result};

/// Kind of performance entry a platform can deliver.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EntryType {
    LargestContentfulPaint,
    FirstInput,
    LayoutShift,
    Navigation,
    Paint,
}

/// One entry delivered by the platform. Times are milliseconds relative to
/// the start of the page lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceEntry {
    pub entry_type: EntryType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_start: Option<f64>,
    /// Layout shift score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default)]
    pub had_recent_input: bool,
}

impl PerformanceEntry {
    fn empty(entry_type: EntryType) -> Self {
        Self {
            entry_type,
            name: String::new(),
            start_time: 0.0,
            render_time: None,
            processing_start: None,
            request_start: None,
            response_start: None,
            value: None,
            had_recent_input: false,
        }
    }

    pub fn largest_contentful_paint(start_time: f64) -> Self {
        Self {
            start_time,
            ..Self::empty(EntryType::LargestContentfulPaint)
        }
    }

    pub fn first_input(start_time: f64, processing_start: f64) -> Self {
        Self {
            start_time,
            processing_start: Some(processing_start),
            ..Self::empty(EntryType::FirstInput)
        }
    }

    pub fn layout_shift(value: f64, had_recent_input: bool) -> Self {
        Self {
            value: Some(value),
            had_recent_input,
            ..Self::empty(EntryType::LayoutShift)
        }
    }

    pub fn navigation(request_start: f64, response_start: f64) -> Self {
        Self {
            request_start: Some(request_start),
            response_start: Some(response_start),
            ..Self::empty(EntryType::Navigation)
        }
    }

    pub fn paint(name: impl Into<String>, start_time: f64) -> Self {
        Self {
            name: name.into(),
            start_time,
            ..Self::empty(EntryType::Paint)
        }
    }
}

/// Callback receiving a batch of entries of one type.
pub type EntryCallback = Arc<dyn Fn(&[PerformanceEntry]) + Send + Sync>;

/// Live registration with a platform. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to cancel.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Capability interface over the host's performance observation primitive.
pub trait PlatformObserver: Send + Sync {
    /// Platform name for logs.
    fn name(&self) -> &'static str;

    fn supports(&self, entry_type: EntryType) -> bool;

    /// Register `callback` for entries of `entry_type`.
    ///
    /// Returns `Error::Unsupported` when the primitive is unavailable.
    fn observe(&self, entry_type: EntryType, callback: EntryCallback) -> Result<Subscription>;
}

/// Platform with no observation primitives. Every vital stays unset unless
/// recorded manually.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPlatform;

impl PlatformObserver for NoopPlatform {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn supports(&self, _entry_type: EntryType) -> bool {
        false
    }

    fn observe(&self, entry_type: EntryType, _callback: EntryCallback) -> Result<Subscription> {
        Err(Error::unsupported(entry_type.to_string()))
    }
}

struct Registration {
    id: u64,
    entry_type: EntryType,
    callback: EntryCallback,
}

#[derive(Default)]
struct ManualInner {
    next_id: AtomicU64,
    registrations: Mutex<Vec<Registration>>,
    unsupported: HashSet<EntryType>,
    failing: HashSet<EntryType>,
}

/// Scriptable platform: entries are pushed in with [`ManualPlatform::emit`].
#[derive(Clone, Default)]
pub struct ManualPlatform {
    inner: Arc<ManualInner>,
}

impl ManualPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// A platform that reports `entry_types` as unsupported.
    pub fn without(entry_types: impl IntoIterator<Item = EntryType>) -> Self {
        Self {
            inner: Arc::new(ManualInner {
                unsupported: entry_types.into_iter().collect(),
                ..Default::default()
            }),
        }
    }

    /// A platform whose registration for `entry_types` fails after
    /// claiming support.
    pub fn failing(entry_types: impl IntoIterator<Item = EntryType>) -> Self {
        Self {
            inner: Arc::new(ManualInner {
                failing: entry_types.into_iter().collect(),
                ..Default::default()
            }),
        }
    }

    /// Deliver `entries` to the registered callbacks, one batch per type.
    pub fn emit(&self, entries: &[PerformanceEntry]) {
        let mut types: Vec<EntryType> = Vec::new();
        for entry in entries {
            if !types.contains(&entry.entry_type) {
                types.push(entry.entry_type);
            }
        }

        for entry_type in types {
            let batch: Vec<PerformanceEntry> = entries
                .iter()
                .filter(|e| e.entry_type == entry_type)
                .cloned()
                .collect();

            // Callbacks run outside the lock so they may subscribe or unsubscribe.
            let callbacks: Vec<EntryCallback> = self
                .inner
                .registrations
                .lock()
                .iter()
                .filter(|r| r.entry_type == entry_type)
                .map(|r| Arc::clone(&r.callback))
                .collect();

            trace!(%entry_type, entries = batch.len(), callbacks = callbacks.len(), "Emitting entries");
            for callback in callbacks {
                callback(&batch);
            }
        }
    }

    /// Number of live registrations.
    pub fn subscriber_count(&self) -> usize {
        self.inner.registrations.lock().len()
    }
}

impl PlatformObserver for ManualPlatform {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn supports(&self, entry_type: EntryType) -> bool {
        !self.inner.unsupported.contains(&entry_type)
    }

    fn observe(&self, entry_type: EntryType, callback: EntryCallback) -> Result<Subscription> {
        if !self.supports(entry_type) {
            return Err(Error::unsupported(entry_type.to_string()));
        }
        if self.inner.failing.contains(&entry_type) {
            return Err(Error::Other(format!("failed to observe {}", entry_type)));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.registrations.lock().push(Registration {
            id,
            entry_type,
            callback,
        });

        let weak: Weak<ManualInner> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.registrations.lock().retain(|r| r.id != id);
            }
        }))
    }
}

impl fmt::Debug for ManualPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualPlatform")
            .field("subscribers", &self.subscriber_count())
            .field("unsupported", &self.inner.unsupported)
            .finish()
    }
}
