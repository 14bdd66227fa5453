//! Captured error records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::breadcrumb::Breadcrumb;
use crate::environment::{MemoryHint, Viewport};
use crate::session::SessionId;

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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ErrorKind {
    Error,
    Warning,
    Fatal,
}

/// Ordered from least to most severe.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Where the error happened. Fields that could not be read are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_hint: Option<MemoryHint>,
    /// Trail as it was at capture time.
    #[serde(default)]
    pub breadcrumbs: Vec<Breadcrumb>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub context: ErrorContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    pub total: usize,
    pub by_type: BTreeMap<ErrorKind, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    /// Most recent errors, oldest first.
    pub recent_errors: Vec<ErrorRecord>,
}

/// Payload sent to the errors endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBatch {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub errors: Vec<ErrorRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::from_str("critical").unwrap(), Severity::Critical);
    }

    #[test]
    fn test_summary_map_keys_serialize_as_names() {
        let summary = ErrorSummary {
            total: 1,
            by_type: BTreeMap::from([(ErrorKind::Fatal, 1)]),
            by_severity: BTreeMap::from([(Severity::High, 1)]),
            recent_errors: Vec::new(),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["byType"]["fatal"], 1);
        assert_eq!(json["bySeverity"]["high"], 1);
        assert!(json["recentErrors"].as_array().unwrap().is_empty());
    }
}
