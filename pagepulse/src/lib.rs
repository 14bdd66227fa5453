//! pagepulse library crate.
//!
//! Client-side observability core: page vitals, timed metrics, error capture
//! with breadcrumbs, and cooldown-gated alerts. Each collector works on its
//! own; [`Telemetry`] wires them together.

pub mod alerts;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod environment;
pub mod error;
pub mod listeners;
pub mod logging;
pub mod metrics;
pub mod panic_hook;
pub mod session;
pub mod telemetry;
pub mod tracker;
pub mod transport;
pub mod vitals;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::MonitorConfig;
pub use error::{Error, Result};
pub use session::SessionId;
pub use telemetry::{Telemetry, TelemetryBuilder, TelemetrySnapshot};
