//! Error tracking with breadcrumbs.

mod breadcrumb;
mod error_tracker;
mod record;

pub use breadcrumb::{Breadcrumb, BreadcrumbKind, BreadcrumbTrail, DEFAULT_BREADCRUMB_CAPACITY};
pub use error_tracker::{DEFAULT_ERROR_CAPACITY, DEFAULT_RECENT_ERRORS, ErrorTracker, ErrorTrackerBuilder};
pub use record::{ErrorBatch, ErrorContext, ErrorKind, ErrorRecord, ErrorSummary, Severity};
