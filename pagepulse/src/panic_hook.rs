use std::{
    backtrace::Backtrace,
    panic::{PanicHookInfo, take_hook},
    sync::{Arc, Weak},
    thread,
};

use crate::tracker::{ErrorKind, ErrorTracker, Severity};

/// Installs a global panic hook that records each panic as a fatal error on
/// `tracker`, then runs the previously installed hook.
///
/// The hook holds the tracker weakly; once the tracker is dropped panics are
/// only passed on.
pub fn install(tracker: &Arc<ErrorTracker>) {
    let tracker: Weak<ErrorTracker> = Arc::downgrade(tracker);
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |panic_info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = PanicRecord::from_info(panic_info);
            tracing::error!(
                target: "pagepulse::panic",
                thread = %record.thread_name,
                location = %record.location,
                "{}",
                record.payload
            );

            if let Some(tracker) = tracker.upgrade() {
                tracker.capture_error(record.message(), ErrorKind::Fatal, Severity::Critical, Some(record.stack));
            }
        }));

        previous_hook(panic_info);
    }));
}

struct PanicRecord {
    payload: String,
    location: String,
    thread_name: String,
    stack: String,
}

impl PanicRecord {
    fn from_info(panic_info: &PanicHookInfo<'_>) -> Self {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "<unknown>".to_string());

        let thread_name = thread::current()
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| "<unnamed>".to_string());

        let stack = format!("at {}\n{}", location, Backtrace::force_capture());

        Self {
            payload: panic_payload_to_string(panic_info),
            location,
            thread_name,
            stack,
        }
    }

    fn message(&self) -> String {
        format!("panic in thread '{}': {}", self.thread_name, self.payload)
    }
}

fn panic_payload_to_string(panic_info: &PanicHookInfo<'_>) -> String {
    if let Some(s) = panic_info.payload().downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        return s.clone();
    }
    panic_info.to_string()
}
