//! Metric events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Category of a recorded metric.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MetricKind {
    Vital,
    CustomTimer,
    ApiLatency,
    Interaction,
}

/// Tags attached to an event.
pub type Tags = BTreeMap<String, String>;

/// A single recorded observation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Which events a point query considers.
#[derive(Debug, Clone)]
pub enum MetricFilter {
    /// Exact metric name.
    Name(String),
    /// Names matching a regular expression.
    Pattern(regex::Regex),
}

impl MetricFilter {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    /// Compile `pattern` into a filter.
    pub fn pattern(pattern: &str) -> crate::Result<Self> {
        regex::Regex::new(pattern)
            .map(Self::Pattern)
            .map_err(|e| crate::Error::validation(format!("invalid metric pattern: {}", e)))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Name(expected) => expected == name,
            Self::Pattern(re) => re.is_match(name),
        }
    }
}

impl From<&str> for MetricFilter {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}
