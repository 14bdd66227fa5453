//! Stock alert rules.

use std::time::Duration;

use super::manager::AlertManager;
use super::rule::{AlertConfig, AlertKind, AlertLevel};
use crate::vitals::Vital;
use crate::Result;

pub const LCP_RULE: &str = "lcp";
pub const FID_RULE: &str = "fid";
pub const CLS_RULE: &str = "cls";
pub const ERROR_RATE_RULE: &str = "error-rate";

/// Errors per evaluation window above which the error-rate rule fires.
pub const ERROR_RATE_THRESHOLD: f64 = 5.0;

/// Rule id fed by `vital`, if a stock rule watches it.
pub fn rule_for_vital(vital: Vital) -> Option<&'static str> {
    match vital {
        Vital::Lcp => Some(LCP_RULE),
        Vital::Fid => Some(FID_RULE),
        Vital::Cls => Some(CLS_RULE),
        Vital::Ttfb | Vital::Fcp => None,
    }
}

/// Rules firing at each vital's poor floor plus the error-rate rule.
pub fn default_rules() -> Vec<AlertConfig> {
    vec![
        AlertConfig::above(
            LCP_RULE,
            "Slow largest contentful paint",
            AlertKind::Performance,
            Vital::Lcp.thresholds().poor,
        )
        .cooldown(Duration::from_secs(30)),
        AlertConfig::above(
            FID_RULE,
            "Slow first input",
            AlertKind::Performance,
            Vital::Fid.thresholds().poor,
        )
        .cooldown(Duration::from_secs(30)),
        AlertConfig::above(
            CLS_RULE,
            "Excessive layout shift",
            AlertKind::Performance,
            Vital::Cls.thresholds().poor,
        )
        .cooldown(Duration::from_secs(30)),
        AlertConfig::above(ERROR_RATE_RULE, "High error rate", AlertKind::Error, ERROR_RATE_THRESHOLD)
            .level(AlertLevel::Critical)
            .cooldown(Duration::from_secs(5)),
    ]
}

/// Register every stock rule on `manager`.
pub fn install_default_alerts(manager: &AlertManager) -> Result<()> {
    for rule in default_rules() {
        manager.register_alert(rule)?;
    }
    Ok(())
}
