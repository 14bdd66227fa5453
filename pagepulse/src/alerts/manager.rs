//! Rate-limited rule evaluation.
//!
//! Each rule moves through `ready → fired → cooling down → ready`. The
//! cooldown is a comparison against the monotonic clock at evaluation time;
//! nothing is scheduled. A disabled rule is skipped before its cooldown is
//! even looked at.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::rule::{Alert, AlertConfig, AlertData, AlertRuleStatus};
use crate::buffer::BoundedBuffer;
use crate::clock::{SharedClock, SystemClock};
use crate::listeners::{ListenerId, Listeners, at_max_depth, guarded};
use crate::Result;

/// Default number of fired alerts kept for inspection.
pub const DEFAULT_ALERT_HISTORY: usize = 100;

struct RuleState {
    config: AlertConfig,
    /// Monotonic time of the last action invocation.
    last_fired: Option<Duration>,
    last_fired_at: Option<DateTime<Utc>>,
    fire_count: u64,
}

impl RuleState {
    fn cooling_down(&self, now: Duration) -> bool {
        self.last_fired
            .is_some_and(|last| now.saturating_sub(last) < self.config.cooldown)
    }

    fn status(&self) -> AlertRuleStatus {
        AlertRuleStatus {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            kind: self.config.kind,
            level: self.config.level,
            enabled: self.config.enabled,
            cooldown_ms: self.config.cooldown.as_millis() as u64,
            last_fired_at: self.last_fired_at,
            fire_count: self.fire_count,
        }
    }
}

/// Registry of alert rules.
pub struct AlertManager {
    rules: Mutex<BTreeMap<String, RuleState>>,
    history: Mutex<BoundedBuffer<Alert>>,
    listeners: Listeners<Alert>,
    clock: SharedClock,
}

impl AlertManager {
    /// Create a manager keeping at most `history_capacity` fired alerts.
    pub fn new(history_capacity: usize) -> Result<Self> {
        Ok(Self {
            rules: Mutex::new(BTreeMap::new()),
            history: Mutex::new(BoundedBuffer::new(history_capacity)?),
            listeners: Listeners::new("alerts"),
            clock: SystemClock::shared(),
        })
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    // ========== Registry ==========

    /// Add a rule, replacing any rule with the same id. The new rule starts
    /// with no cooldown.
    pub fn register_alert(&self, config: AlertConfig) -> Result<()> {
        config.validate()?;

        let id = config.id.clone();
        let replaced = self
            .rules
            .lock()
            .insert(
                id.clone(),
                RuleState {
                    config,
                    last_fired: None,
                    last_fired_at: None,
                    fire_count: 0,
                },
            )
            .is_some();

        debug!(rule = %id, replaced, "Alert rule registered");
        Ok(())
    }

    pub fn remove_alert(&self, id: &str) -> bool {
        self.rules.lock().remove(id).is_some()
    }

    pub fn enable(&self, id: &str) -> bool {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: &str) -> bool {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.rules.lock().get_mut(id) {
            Some(rule) => {
                rule.config.enabled = enabled;
                debug!(rule = %id, enabled, "Alert rule toggled");
                true
            }
            None => false,
        }
    }

    pub fn rule_ids(&self) -> Vec<String> {
        self.rules.lock().keys().cloned().collect()
    }

    pub fn rule(&self, id: &str) -> Option<AlertRuleStatus> {
        self.rules.lock().get(id).map(RuleState::status)
    }

    pub fn rules(&self) -> Vec<AlertRuleStatus> {
        self.rules.lock().values().map(RuleState::status).collect()
    }

    // ========== Evaluation ==========

    /// Offer `data` to rule `id`. Returns true if the rule fired.
    ///
    /// Unknown and disabled rules and rules inside their cooldown are no-ops.
    /// The cooldown restarts whenever the action is invoked, whether or not
    /// the action succeeds.
    pub fn check_and_alert(&self, id: &str, data: &AlertData) -> bool {
        let condition = {
            let rules = self.rules.lock();
            let Some(rule) = rules.get(id) else {
                trace!(rule = %id, "Unknown alert rule");
                return false;
            };
            if !rule.config.enabled {
                return false;
            }
            if rule.cooling_down(self.clock.elapsed()) {
                trace!(rule = %id, "Alert rule cooling down");
                return false;
            }
            rule.config.condition.clone()
        };

        // Evaluated outside the lock; a panicking condition counts as false.
        let matched = catch_unwind(AssertUnwindSafe(|| condition(data))).unwrap_or_else(|_| {
            warn!(rule = %id, "Alert condition panicked; treating as not matched");
            false
        });
        if !matched {
            return false;
        }

        let (alert, action) = {
            let mut rules = self.rules.lock();
            let Some(rule) = rules.get_mut(id) else {
                return false;
            };
            let now = self.clock.elapsed();
            // Another caller may have fired or disabled the rule meanwhile.
            if !rule.config.enabled || rule.cooling_down(now) {
                return false;
            }
            // The action could not run this deep; leave the rule untouched.
            if at_max_depth() {
                warn!(rule = %id, "Alert action skipped; nested too deep");
                return false;
            }

            let timestamp = self.clock.now();
            rule.last_fired = Some(now);
            rule.last_fired_at = Some(timestamp);
            rule.fire_count += 1;

            let alert = Alert {
                id: Uuid::new_v4().to_string(),
                rule_id: rule.config.id.clone(),
                rule_name: rule.config.name.clone(),
                kind: rule.config.kind,
                level: rule.config.level,
                message: format!("{}: {} = {}", rule.config.name, data.source, data.value),
                data: data.clone(),
                timestamp,
            };
            (alert, rule.config.action.clone())
        };

        info!(rule = %id, level = %alert.level, value = data.value, "Alert fired");

        let outcome = guarded("alert-actions", || catch_unwind(AssertUnwindSafe(|| action(&alert))));
        match outcome {
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(e))) => warn!(rule = %id, error = %e, "Alert action failed"),
            Some(Err(_)) => warn!(rule = %id, "Alert action panicked"),
            None => warn!(rule = %id, "Alert action skipped; nested too deep"),
        }

        self.history.lock().push(alert.clone());
        self.listeners.notify(&alert);
        true
    }

    /// Subscribe to every firing of every rule.
    pub fn on_alert<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    // ========== History ==========

    /// Fired alerts, oldest first.
    pub fn get_alerts(&self) -> Vec<Alert> {
        self.history.lock().to_vec()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Clear every cooldown and fire count. Rules stay registered.
    pub fn reset(&self) {
        for rule in self.rules.lock().values_mut() {
            rule.last_fired = None;
            rule.last_fired_at = None;
            rule.fire_count = 0;
        }
    }
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("rules", &self.rule_ids())
            .field("history", &self.history.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::rule::{AlertKind, AlertLevel};
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> (Arc<ManualClock>, AlertManager) {
        let clock = ManualClock::starting_now();
        let manager = AlertManager::new(DEFAULT_ALERT_HISTORY)
            .unwrap()
            .with_clock(clock.clone());
        (clock, manager)
    }

    fn counting_rule(id: &str, cooldown: Duration, counter: &Arc<AtomicUsize>) -> AlertConfig {
        let counter = counter.clone();
        AlertConfig::above(id, "Test rule", AlertKind::Custom, 10.0)
            .cooldown(cooldown)
            .action(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
    }

    #[test]
    fn test_cooldown_enforcement() {
        let (clock, manager) = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        manager
            .register_alert(counting_rule("r", Duration::from_millis(1000), &fired))
            .unwrap();

        let hot = AlertData::new("x", 11.0);
        assert!(manager.check_and_alert("r", &hot));
        clock.advance_ms(999);
        assert!(!manager.check_and_alert("r", &hot));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        clock.advance_ms(1);
        assert!(manager.check_and_alert("r", &hot));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_non_matching_data_does_not_start_cooldown() {
        let (_clock, manager) = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        manager
            .register_alert(counting_rule("r", Duration::from_secs(60), &fired))
            .unwrap();

        assert!(!manager.check_and_alert("r", &AlertData::new("x", 5.0)));
        assert!(manager.rule("r").unwrap().last_fired_at.is_none());
        assert!(manager.check_and_alert("r", &AlertData::new("x", 50.0)));
    }

    #[test]
    fn test_failing_action_still_sets_cooldown() {
        let (clock, manager) = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        manager
            .register_alert(
                AlertConfig::above("r", "Failing", AlertKind::Custom, 0.0)
                    .cooldown(Duration::from_secs(5))
                    .action(move |_| {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err(crate::Error::transport("webhook down"))
                    }),
            )
            .unwrap();

        let data = AlertData::new("x", 1.0);
        assert!(manager.check_and_alert("r", &data));
        assert!(!manager.check_and_alert("r", &data));
        assert_eq!(manager.rule("r").unwrap().last_fired_at, Some(clock.now()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get_alerts().len(), 1);
    }

    #[test]
    fn test_panicking_action_is_contained() {
        let (_clock, manager) = manager();
        manager
            .register_alert(
                AlertConfig::above("r", "Panics", AlertKind::Custom, 0.0)
                    .action(|_| panic!("action exploded")),
            )
            .unwrap();

        assert!(manager.check_and_alert("r", &AlertData::new("x", 1.0)));
        assert_eq!(manager.rule("r").unwrap().fire_count, 1);
    }

    #[test]
    fn test_disabled_and_unknown_rules() {
        let (_clock, manager) = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        manager
            .register_alert(counting_rule("r", Duration::ZERO, &fired))
            .unwrap();

        let hot = AlertData::new("x", 100.0);
        assert!(manager.disable("r"));
        assert!(!manager.check_and_alert("r", &hot));
        assert!(!manager.check_and_alert("missing", &hot));
        assert!(!manager.disable("missing"));

        assert!(manager.enable("r"));
        assert!(manager.check_and_alert("r", &hot));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_replaces_and_resets_cooldown() {
        let (_clock, manager) = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        manager
            .register_alert(counting_rule("r", Duration::from_secs(60), &fired))
            .unwrap();

        let hot = AlertData::new("x", 100.0);
        assert!(manager.check_and_alert("r", &hot));
        assert!(!manager.check_and_alert("r", &hot));

        manager
            .register_alert(counting_rule("r", Duration::from_secs(60), &fired))
            .unwrap();
        assert!(manager.check_and_alert("r", &hot));
        assert_eq!(manager.rule_ids(), vec!["r".to_string()]);
    }

    #[test]
    fn test_malformed_registration_rejected() {
        let (_clock, manager) = manager();
        let err = manager
            .register_alert(AlertConfig::above("", "No id", AlertKind::Custom, 1.0))
            .unwrap_err();
        assert!(matches!(err, crate::Error::Validation(_)));
        assert!(manager.rule_ids().is_empty());
    }

    #[test]
    fn test_listeners_and_history() {
        let (_clock, manager) = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        manager.on_alert(move |alert| s.lock().push(alert.rule_id.clone()));

        manager
            .register_alert(AlertConfig::above("a", "A", AlertKind::Performance, 1.0).level(AlertLevel::Critical))
            .unwrap();
        manager
            .register_alert(AlertConfig::above("b", "B", AlertKind::Error, 1.0))
            .unwrap();

        manager.check_and_alert("a", &AlertData::new("LCP", 2.0));
        manager.check_and_alert("b", &AlertData::new("errors", 2.0));

        assert_eq!(*seen.lock(), vec!["a", "b"]);
        let alerts = manager.get_alerts();
        assert_eq!(alerts[0].level, AlertLevel::Critical);
        assert_eq!(alerts[0].message, "A: LCP = 2");

        manager.clear_history();
        assert!(manager.get_alerts().is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let manager = AlertManager::new(2).unwrap();
        manager
            .register_alert(AlertConfig::above("r", "R", AlertKind::Custom, 0.0))
            .unwrap();
        for v in 1..=3 {
            manager.check_and_alert("r", &AlertData::new("x", f64::from(v)));
        }
        let values: Vec<f64> = manager.get_alerts().iter().map(|a| a.data.value).collect();
        assert_eq!(values, vec![2.0, 3.0]);
    }

    #[test]
    fn test_reset_clears_cooldowns() {
        let (_clock, manager) = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        manager
            .register_alert(counting_rule("r", Duration::from_secs(3600), &fired))
            .unwrap();

        let hot = AlertData::new("x", 100.0);
        manager.check_and_alert("r", &hot);
        manager.reset();
        assert_eq!(manager.rule("r").unwrap().fire_count, 0);
        assert!(manager.check_and_alert("r", &hot));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_recursive_action_is_bounded() {
        let (_clock, manager) = manager();
        let manager = Arc::new(manager);
        let weak = Arc::downgrade(&manager);

        manager
            .register_alert(AlertConfig::above("loop", "Loop", AlertKind::Custom, 0.0).action(move |alert| {
                if let Some(m) = weak.upgrade() {
                    m.check_and_alert("loop", &alert.data);
                }
                Ok(())
            }))
            .unwrap();

        assert!(manager.check_and_alert("loop", &AlertData::new("x", 1.0)));
        let fired = manager.rule("loop").unwrap().fire_count;
        assert_eq!(fired, crate::listeners::MAX_NOTIFY_DEPTH as u64);
    }

    #[test]
    fn test_fire_count_matches_action_invocations_when_nested_too_deep() {
        let (_clock, manager) = manager();
        let manager = Arc::new(manager);
        let weak = Arc::downgrade(&manager);
        let invocations = Arc::new(AtomicUsize::new(0));
        let nested_results = Arc::new(Mutex::new(Vec::new()));

        let calls = invocations.clone();
        let results = nested_results.clone();
        manager
            .register_alert(AlertConfig::above("echo", "Echo", AlertKind::Custom, 0.0).action(move |alert| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(m) = weak.upgrade() {
                    let fired = m.check_and_alert("echo", &alert.data);
                    results.lock().push(fired);
                }
                Ok(())
            }))
            .unwrap();

        assert!(manager.check_and_alert("echo", &AlertData::new("x", 1.0)));

        let invoked = invocations.load(Ordering::SeqCst);
        let rule = manager.rule("echo").unwrap();
        assert_eq!(invoked, crate::listeners::MAX_NOTIFY_DEPTH);
        assert_eq!(rule.fire_count, invoked as u64);
        assert_eq!(manager.get_alerts().len(), invoked);
        // Only the innermost nested check was refused.
        let results = nested_results.lock();
        assert_eq!(results.iter().filter(|fired| !**fired).count(), 1);
        assert!(!results[0]);
    }

    #[test]
    fn test_action_may_reenter_manager() {
        let (_clock, manager) = manager();
        let manager = Arc::new(manager);
        let weak = Arc::downgrade(&manager);

        manager
            .register_alert(
                AlertConfig::above("chain", "Chain", AlertKind::Custom, 0.0)
                    .cooldown(Duration::from_secs(60))
                    .action(move |alert| {
                        if let Some(m) = weak.upgrade() {
                            // Still cooling down: must be a no-op, not a deadlock.
                            assert!(!m.check_and_alert("chain", &alert.data));
                            m.disable("chain");
                        }
                        Ok(())
                    }),
            )
            .unwrap();

        assert!(manager.check_and_alert("chain", &AlertData::new("x", 1.0)));
        assert!(!manager.rule("chain").unwrap().enabled);
        assert_eq!(manager.get_alerts().len(), 1);
    }
}
