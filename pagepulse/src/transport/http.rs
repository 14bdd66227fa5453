//! HTTP POST sink.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{PayloadKind, ReportSink};
use crate::{Error, Result};

/// HTTP sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSinkConfig {
    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_timeout_ms() -> u64 {
    5000
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            headers: BTreeMap::new(),
        }
    }
}

pub(crate) fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate got there first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Posts report payloads as JSON.
pub struct HttpSink {
    client: Client,
    headers: HeaderMap,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self> {
        install_rustls_provider();

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::config(format!("Failed to build reqwest client: {}", e)))?;

        Ok(Self {
            client,
            headers: build_headers(&config.headers),
        })
    }
}

/// Invalid header names or values are skipped with a warning.
fn build_headers(configured: &BTreeMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in configured {
        match (
            name.parse::<reqwest::header::HeaderName>(),
            value.parse::<reqwest::header::HeaderValue>(),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid report header"),
        }
    }
    headers
}

#[async_trait]
impl ReportSink for HttpSink {
    fn sink_type(&self) -> &'static str {
        "http"
    }

    async fn deliver(&self, endpoint: &str, kind: PayloadKind, body: &Value) -> Result<()> {
        let response = self
            .client
            .post(endpoint)
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| Error::transport(format!("{} request failed: {}", kind, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::transport(format!(
                "{} endpoint returned {} - {}",
                kind, status, text
            )));
        }

        Ok(())
    }
}
