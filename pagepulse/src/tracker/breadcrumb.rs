//! Breadcrumb trail.
//!
//! The trail is the one piece of state shared between call sites: any code
//! path holding a clone of [`BreadcrumbTrail`] may append to it. Error
//! records copy the trail at capture time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::buffer::BoundedBuffer;
use crate::clock::{SharedClock, SystemClock};
use crate::Result;

/// Default number of breadcrumbs retained.
pub const DEFAULT_BREADCRUMB_CAPACITY: usize = 50;

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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BreadcrumbKind {
    Navigation,
    Click,
    Http,
    Console,
    State,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: BreadcrumbKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Shared, bounded, append-only trail of breadcrumbs.
#[derive(Clone)]
pub struct BreadcrumbTrail {
    items: Arc<Mutex<BoundedBuffer<Breadcrumb>>>,
    clock: SharedClock,
}

impl BreadcrumbTrail {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            items: Arc::new(Mutex::new(BoundedBuffer::new(capacity)?)),
            clock: SystemClock::shared(),
        })
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn add(&self, message: impl Into<String>, kind: BreadcrumbKind, data: Option<Value>) {
        let crumb = Breadcrumb {
            message: message.into(),
            kind,
            timestamp: self.clock.now(),
            data,
        };
        self.items.lock().push(crumb);
    }

    /// Copy of the trail, oldest first.
    pub fn snapshot(&self) -> Vec<Breadcrumb> {
        self.items.lock().to_vec()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.lock().capacity()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

impl std::fmt::Debug for BreadcrumbTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let items = self.items.lock();
        f.debug_struct("BreadcrumbTrail")
            .field("len", &items.len())
            .field("capacity", &items.capacity())
            .finish()
    }
}
