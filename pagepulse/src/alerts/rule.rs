//! Alert rules, data points and fired alerts.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{Error, Result};

/// What a rule watches.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AlertKind {
    Performance,
    Error,
    Custom,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
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
pub enum AlertLevel {
    Info,
    #[default]
    Warning,
    Critical,
}

/// A data point offered to a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertData {
    /// Where the value came from, e.g. `LCP` or `errors`.
    pub source: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl AlertData {
    pub fn new(source: impl Into<String>, value: f64) -> Self {
        Self {
            source: source.into(),
            value,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// One firing of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub message: String,
    pub data: AlertData,
    pub timestamp: DateTime<Utc>,
}

/// Pure predicate over a data point.
pub type AlertCondition = Arc<dyn Fn(&AlertData) -> bool + Send + Sync>;

/// Side effect run when a rule fires. May fail; failures are logged.
pub type AlertAction = Arc<dyn Fn(&Alert) -> Result<()> + Send + Sync>;

/// Registration for one rule.
#[derive(Clone)]
pub struct AlertConfig {
    pub id: String,
    pub name: String,
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub enabled: bool,
    pub cooldown: Duration,
    pub condition: AlertCondition,
    pub action: AlertAction,
}

impl AlertConfig {
    /// Enabled rule with no cooldown whose action logs the alert.
    pub fn new<C>(id: impl Into<String>, name: impl Into<String>, kind: AlertKind, condition: C) -> Self
    where
        C: Fn(&AlertData) -> bool + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            level: AlertLevel::default(),
            enabled: true,
            cooldown: Duration::ZERO,
            condition: Arc::new(condition),
            action: Arc::new(log_alert),
        }
    }

    /// Rule firing when the value is strictly above `threshold`.
    pub fn above(id: impl Into<String>, name: impl Into<String>, kind: AlertKind, threshold: f64) -> Self {
        Self::new(id, name, kind, move |data: &AlertData| data.value > threshold)
    }

    pub fn level(mut self, level: AlertLevel) -> Self {
        self.level = level;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn action<A>(mut self, action: A) -> Self
    where
        A: Fn(&Alert) -> Result<()> + Send + Sync + 'static,
    {
        self.action = Arc::new(action);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("alert rule id must not be empty"));
        }
        if self.id.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!(
                "alert rule id '{}' must not contain whitespace",
                self.id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(Error::validation(format!("alert rule '{}' needs a name", self.id)));
        }
        Ok(())
    }
}

impl fmt::Debug for AlertConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("level", &self.level)
            .field("enabled", &self.enabled)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

/// Default action.
fn log_alert(alert: &Alert) -> Result<()> {
    warn!(
        rule = %alert.rule_id,
        level = %alert.level,
        source = %alert.data.source,
        value = alert.data.value,
        "{}",
        alert.message
    );
    Ok(())
}

/// Inspection view of a registered rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRuleStatus {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub enabled: bool,
    pub cooldown_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    pub fire_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", "Name")]
    #[case("   ", "Name")]
    #[case("has space", "Name")]
    #[case("ok-id", "")]
    fn test_malformed_configs_are_rejected(#[case] id: &str, #[case] name: &str) {
        let config = AlertConfig::above(id, name, AlertKind::Custom, 1.0);
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_above_is_strict() {
        let config = AlertConfig::above("lcp", "Slow LCP", AlertKind::Performance, 4000.0);
        assert!(!(config.condition)(&AlertData::new("LCP", 4000.0)));
        assert!((config.condition)(&AlertData::new("LCP", 4000.5)));
    }

    #[test]
    fn test_alert_data_attributes() {
        let data = AlertData::new("errors", 7.0).with_attribute("window_secs", 60);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["attributes"]["window_secs"], 60);

        let bare = serde_json::to_value(AlertData::new("x", 1.0)).unwrap();
        assert!(bare.get("attributes").is_none());
    }
}
