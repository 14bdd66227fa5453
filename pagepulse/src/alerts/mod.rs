//! Cooldown-gated alert rules.

mod defaults;
mod manager;
mod rule;

pub use defaults::{
    CLS_RULE, ERROR_RATE_RULE, ERROR_RATE_THRESHOLD, FID_RULE, LCP_RULE, default_rules, install_default_alerts,
    rule_for_vital,
};
pub use manager::{AlertManager, DEFAULT_ALERT_HISTORY};
pub use rule::{
    Alert, AlertAction, AlertCondition, AlertConfig, AlertData, AlertKind, AlertLevel, AlertRuleStatus,
};
