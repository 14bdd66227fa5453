//! Listener registry shared by every collector.
//!
//! Listeners are snapshotted out of the lock before they run, so a listener
//! may call back into the component that notified it. Nested notifications on
//! one thread are capped at [`MAX_NOTIFY_DEPTH`]; deeper ones are dropped with
//! a warning instead of recursing forever.

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::warn;

/// Maximum nesting of notifications on a single thread.
pub const MAX_NOTIFY_DEPTH: usize = 8;

thread_local! {
    static NOTIFY_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Ids are unique across every registry in the process.
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Listeners<T: ?Sized> {
    name: &'static str,
    entries: RwLock<Vec<(ListenerId, Callback<T>)>>,
}

impl<T: ?Sized> Listeners<T> {
    /// `name` only shows up in log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, Arc::new(listener)));
        id
    }

    /// Returns true if the listener was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Invoke every listener with `value`.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = {
            let entries = self.entries.read();
            if entries.is_empty() {
                return;
            }
            entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        let name = self.name;
        guarded(name, || {
            for callback in snapshot {
                let outcome = catch_unwind(AssertUnwindSafe(|| callback(value)));
                if outcome.is_err() {
                    warn!(listeners = name, "Listener panicked; continuing");
                }
            }
        });
    }
}

/// True once [`MAX_NOTIFY_DEPTH`] notification levels are active on this
/// thread, so a further [`guarded`] call would not run.
pub(crate) fn at_max_depth() -> bool {
    NOTIFY_DEPTH.with(|d| d.get()) >= MAX_NOTIFY_DEPTH
}

/// Run `f` one notification level deeper.
///
/// Returns `None` without running `f` once [`MAX_NOTIFY_DEPTH`] levels are
/// already active on this thread.
pub(crate) fn guarded<R>(name: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    let depth = NOTIFY_DEPTH.with(|d| d.get());
    if depth >= MAX_NOTIFY_DEPTH {
        warn!(
            listeners = name,
            depth, "Dropping nested notification; re-entrancy too deep"
        );
        return None;
    }

    NOTIFY_DEPTH.with(|d| d.set(depth + 1));
    let out = catch_unwind(AssertUnwindSafe(f));
    NOTIFY_DEPTH.with(|d| d.set(depth));
    match out {
        Ok(out) => Some(out),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

impl<T: ?Sized> std::fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("name", &self.name)
            .field("count", &self.len())
            .finish()
    }
}
