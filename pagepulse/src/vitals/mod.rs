//! Page vitals: LCP, FID, CLS, TTFB and FCP.

mod observer;
mod platform;
mod rating;

pub use observer::{
    VitalSnapshot, VitalSummaryEntry, VitalUpdate, VitalsObserver, VitalsObserverBuilder, VitalsReport,
};
pub use platform::{
    EntryCallback, EntryType, ManualPlatform, NoopPlatform, PerformanceEntry, PlatformObserver, Subscription,
};
pub use rating::{Thresholds, Vital, VitalRating, thresholds};
