//! Best-effort report delivery.
//!
//! Every outbound payload goes through a [`Transport`]. Sends never fail from
//! the caller's point of view: delivery runs in the background, failures are
//! logged as warnings, and nothing is retried.
//!
//! Inside a tokio runtime a send becomes a task on a [`TaskTracker`], which
//! lets the host wait for in-flight deliveries during teardown via
//! [`Transport::drain`]. Outside a runtime the payload is delivered
//! synchronously on a short-lived runtime, bounded by the fallback timeout.

mod http;

pub use http::{HttpSink, HttpSinkConfig};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::Result;

/// Default bound on a synchronous fallback send.
pub const DEFAULT_FALLBACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Which logical payload is being sent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PayloadKind {
    Vitals,
    Metrics,
    Errors,
    Alert,
}

/// Destination for report payloads.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Sink type name for logs.
    fn sink_type(&self) -> &'static str;

    /// Deliver one payload to `endpoint`.
    async fn deliver(&self, endpoint: &str, kind: PayloadKind, body: &Value) -> Result<()>;
}

/// Sink that drops everything. Default for standalone collectors.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl ReportSink for NullSink {
    fn sink_type(&self) -> &'static str {
        "null"
    }

    async fn deliver(&self, endpoint: &str, kind: PayloadKind, _body: &Value) -> Result<()> {
        debug!(%endpoint, %kind, "Null sink dropped payload");
        Ok(())
    }
}

/// Cloneable fire-and-forget sender.
#[derive(Clone)]
pub struct Transport {
    sink: Arc<dyn ReportSink>,
    tracker: TaskTracker,
    fallback_timeout: Duration,
}

impl Transport {
    pub fn new(sink: Arc<dyn ReportSink>) -> Self {
        Self {
            sink,
            tracker: TaskTracker::new(),
            fallback_timeout: DEFAULT_FALLBACK_TIMEOUT,
        }
    }

    /// Transport backed by [`NullSink`].
    pub fn disabled() -> Self {
        Self::new(Arc::new(NullSink))
    }

    pub fn with_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_timeout = timeout;
        self
    }

    pub fn sink_type(&self) -> &'static str {
        self.sink.sink_type()
    }

    /// Number of deliveries still running in the background.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Send `body` to `endpoint` without waiting for the outcome.
    pub fn send(&self, kind: PayloadKind, endpoint: &str, body: Value) {
        let sink = Arc::clone(&self.sink);
        let endpoint = endpoint.to_string();

        match Handle::try_current() {
            Ok(handle) => {
                self.tracker.spawn_on(
                    async move { deliver_logged(sink.as_ref(), &endpoint, kind, &body).await },
                    &handle,
                );
            }
            Err(_) => self.send_blocking(sink, endpoint, kind, body),
        }
    }

    /// No runtime available: deliver on a throwaway current-thread runtime.
    fn send_blocking(&self, sink: Arc<dyn ReportSink>, endpoint: String, kind: PayloadKind, body: Value) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!(%endpoint, %kind, error = %e, "Failed to build fallback runtime; dropping payload");
                return;
            }
        };

        let timeout = self.fallback_timeout;
        runtime.block_on(async move {
            let delivery = deliver_logged(sink.as_ref(), &endpoint, kind, &body);
            if tokio::time::timeout(timeout, delivery).await.is_err() {
                warn!(%endpoint, %kind, ?timeout, "Fallback send timed out");
            }
        });
    }

    /// Wait up to `timeout` for in-flight deliveries.
    ///
    /// Returns true if everything finished. The transport keeps accepting
    /// sends afterwards.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let finished = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        self.tracker.reopen();
        if !finished {
            warn!(pending = self.tracker.len(), "Transport drain timed out");
        }
        finished
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("sink", &self.sink.sink_type())
            .field("in_flight", &self.tracker.len())
            .field("fallback_timeout", &self.fallback_timeout)
            .finish()
    }
}

async fn deliver_logged(sink: &dyn ReportSink, endpoint: &str, kind: PayloadKind, body: &Value) {
    match sink.deliver(endpoint, kind, body).await {
        Ok(()) => debug!(%endpoint, %kind, sink = sink.sink_type(), "Report delivered"),
        Err(e) => warn!(%endpoint, %kind, sink = sink.sink_type(), error = %e, "Report delivery failed"),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FailingSink, RecordingSink};
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_inside_runtime_is_tracked_and_drained() {
        let sink = Arc::new(RecordingSink::default());
        let transport = Transport::new(sink.clone());

        transport.send(PayloadKind::Metrics, "http://sink/metrics", json!({"a": 1}));
        assert!(transport.drain(Duration::from_secs(1)).await);

        let delivered = sink.delivered.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "http://sink/metrics");
        assert_eq!(delivered[0].1, PayloadKind::Metrics);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_swallowed() {
        let transport = Transport::new(Arc::new(FailingSink));
        transport.send(PayloadKind::Errors, "http://sink/errors", json!([]));
        assert!(transport.drain(Duration::from_secs(1)).await);
        assert_eq!(transport.in_flight(), 0);
    }

    #[test]
    fn test_send_without_runtime_delivers_synchronously() {
        let sink = Arc::new(RecordingSink::default());
        let transport = Transport::new(sink.clone()).with_fallback_timeout(Duration::from_millis(500));

        transport.send(PayloadKind::Vitals, "http://sink/vitals", json!({}));

        assert_eq!(sink.kinds(), vec![PayloadKind::Vitals]);
    }

    #[test]
    fn test_payload_kind_display() {
        assert_eq!(PayloadKind::Vitals.to_string(), "vitals");
        assert_eq!(PayloadKind::Alert.as_ref(), "alert");
    }
}
