//! Time sources.
//!
//! Every component reads time through a [`Clock`] so cooldown windows and
//! report periods can be driven deterministically in tests and replays.
//! Wall time stamps events; monotonic time drives every elapsed-time decision.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// A source of wall-clock and monotonic time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic time elapsed since the clock's origin.
    fn elapsed(&self) -> Duration;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Shared handle to a fresh system clock.
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to.
///
/// Used by tests and by the replay CLI, where recorded events carry their own
/// timing.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Debug, Clone, Copy)]
struct ManualState {
    wall: DateTime<Utc>,
    elapsed: Duration,
}

impl ManualClock {
    /// Create a clock starting at `start` with zero elapsed time.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                wall: start,
                elapsed: Duration::ZERO,
            }),
        }
    }

    /// Create a clock starting at the current wall time.
    pub fn starting_now() -> Arc<Self> {
        Arc::new(Self::new(Utc::now()))
    }

    /// Move both wall and monotonic time forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.elapsed += by;
        // Durations beyond chrono's range are clamped rather than panicking.
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        state.wall = state.wall.checked_add_signed(delta).unwrap_or(state.wall);
    }

    /// Convenience for [`advance`](Self::advance) in milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().wall
    }

    fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }
}
