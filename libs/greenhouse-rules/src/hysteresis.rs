//! Hysteresis Tracker
//!
//! Decides whether a matched rule may change its actuator state now.
//!
//! Two thresholds define the band. Their order defines the arm direction:
//! - `on < off` (heating style): on at or below `on`, off at or above `off`
//! - `on > off` (cooling style): on at or above `on`, off at or below `off`
//!
//! Values strictly inside the band keep the current state. Every permitted change
//! must also respect `min_state_change_interval` since the last change.
//!
//! State writes go through a compare-and-swap on `(rule_id, last_state_change_at)`,
//! and passes for one device are serialized by `DeviceLocks`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::Result;
use crate::repository::compare_and_set_state;
use crate::types::{ActuatorState, Hysteresis, Rule, SkipReason};

/// Which way the value has to move to switch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmDirection {
    /// `on_threshold < off_threshold`: switch on when the value falls to `on`
    Falling,
    /// `on_threshold > off_threshold`: switch on when the value rises to `on`
    Rising,
}

pub fn arm_direction(h: &Hysteresis) -> ArmDirection {
    if h.on_threshold < h.off_threshold {
        ArmDirection::Falling
    } else {
        ArmDirection::Rising
    }
}

/// State a value asks for, or `None` inside the band
pub fn desired_state(h: &Hysteresis, value: f64) -> Option<ActuatorState> {
    match arm_direction(h) {
        ArmDirection::Falling if value <= h.on_threshold => Some(ActuatorState::On),
        ArmDirection::Falling if value >= h.off_threshold => Some(ActuatorState::Off),
        ArmDirection::Rising if value >= h.on_threshold => Some(ActuatorState::On),
        ArmDirection::Rising if value <= h.off_threshold => Some(ActuatorState::Off),
        _ => None,
    }
}

/// Admission decision for one rule
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Change to `desired` is allowed
    Permit { desired: ActuatorState },
    /// No change; the rule is logged as skipped
    Deny { reason: SkipReason, detail: String },
}

impl Admission {
    pub fn is_permitted(&self) -> bool {
        matches!(self, Admission::Permit { .. })
    }
}

/// Per-device serialization of evaluation passes
///
/// Entries only live while a pass holds or waits for them.
#[derive(Default)]
pub struct DeviceLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a device's rule state
    pub async fn lock(&self, device_id: &str) -> DeviceGuard<'_> {
        let lock = self
            .locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        DeviceGuard {
            guard: Some(lock.lock_owned().await),
            device_id: device_id.to_string(),
            locks: self,
        }
    }

    /// Number of devices with a held or awaited lock
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one device; the map entry is dropped once nobody else wants it
pub struct DeviceGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    device_id: String,
    locks: &'a DeviceLocks,
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        // Release first so the map holds the last reference when idle
        drop(self.guard.take());
        self.locks
            .locks
            .remove_if(&self.device_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Hysteresis tracker
pub struct HysteresisTracker {
    pool: SqlitePool,
    locks: DeviceLocks,
}

impl HysteresisTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: DeviceLocks::new(),
        }
    }

    /// Serialize passes of one device
    pub async fn lock_device(&self, device_id: &str) -> DeviceGuard<'_> {
        self.locks.lock(device_id).await
    }

    /// Decide whether `rule` may change state at `now`
    ///
    /// `value` is the current value of the rule's primary sensor; only hysteresis
    /// rules look at it.
    pub fn admit(
        &self,
        rule: &Rule,
        condition_matched: bool,
        value: Option<f64>,
        now: DateTime<Utc>,
    ) -> Admission {
        if !condition_matched {
            return Admission::Deny {
                reason: SkipReason::ConditionsNotMet,
                detail: "conditions not met".to_string(),
            };
        }

        let desired = match &rule.hysteresis {
            None => ActuatorState::On,
            Some(h) => {
                let Some(value) = value else {
                    return Admission::Deny {
                        reason: SkipReason::MissingData,
                        detail: format!(
                            "no value for hysteresis sensor {}",
                            rule.primary_sensor().unwrap_or("-")
                        ),
                    };
                };
                match desired_state(h, value) {
                    Some(state) if state == rule.current_actuator_state => {
                        return Admission::Deny {
                            reason: SkipReason::NoStateChange,
                            detail: format!("actuator already {}", state),
                        };
                    },
                    Some(state) => state,
                    None => {
                        return Admission::Deny {
                            reason: SkipReason::NoStateChange,
                            detail: format!(
                                "value {} inside hysteresis band {}..{}, state stays {}",
                                value,
                                h.on_threshold.min(h.off_threshold),
                                h.on_threshold.max(h.off_threshold),
                                rule.current_actuator_state
                            ),
                        };
                    },
                }
            },
        };

        if let Some(last) = rule.last_state_change_at {
            let elapsed_ms = now.signed_duration_since(last).num_milliseconds();
            if elapsed_ms < rule.min_state_change_interval_ms as i64 {
                return Admission::Deny {
                    reason: SkipReason::Cooldown,
                    detail: format!(
                        "cooldown: last state change {}ms ago, interval {}ms",
                        elapsed_ms, rule.min_state_change_interval_ms
                    ),
                };
            }
        }

        Admission::Permit { desired }
    }

    /// Persist a permitted change; false if another writer changed the state first
    pub async fn commit(
        &self,
        rule: &Rule,
        desired: ActuatorState,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        compare_and_set_state(
            &self.pool,
            rule.id,
            rule.last_state_change_at,
            desired,
            Some(now),
        )
        .await
    }

    /// Undo a commit made at `now` (used when every command of the rule failed)
    pub async fn rollback(&self, rule: &Rule, now: DateTime<Utc>) -> Result<bool> {
        compare_and_set_state(
            &self.pool,
            rule.id,
            Some(now),
            rule.current_actuator_state,
            rule.last_state_change_at,
        )
        .await
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::types::{Action, Condition, ConditionGroup, Operator};
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn tracker() -> HysteresisTracker {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        HysteresisTracker::new(pool)
    }

    fn rule(hysteresis: Option<Hysteresis>) -> Rule {
        Rule {
            id: 7,
            owner_id: "u1".to_string(),
            device_id: "gh-1".to_string(),
            name: "Heater".to_string(),
            priority: 10,
            active: true,
            time_based: false,
            hysteresis,
            min_state_change_interval_ms: 60_000,
            current_actuator_state: ActuatorState::Unknown,
            last_state_change_at: None,
            trigger_count: 0,
            last_triggered_at: None,
            created_at: Utc::now(),
            groups: vec![ConditionGroup::new(
                0,
                vec![Condition::new("temperature", Operator::Gt, -50.0)],
            )],
            actions: vec![Action::on("heater_1")],
        }
    }

    fn heating() -> Option<Hysteresis> {
        Some(Hysteresis {
            on_threshold: 15.0,
            off_threshold: 18.0,
        })
    }

    #[test]
    fn test_desired_state_both_orientations() {
        let heat = Hysteresis {
            on_threshold: 15.0,
            off_threshold: 18.0,
        };
        assert_eq!(arm_direction(&heat), ArmDirection::Falling);
        assert_eq!(desired_state(&heat, 14.0), Some(ActuatorState::On));
        assert_eq!(desired_state(&heat, 15.0), Some(ActuatorState::On));
        assert_eq!(desired_state(&heat, 16.5), None);
        assert_eq!(desired_state(&heat, 18.0), Some(ActuatorState::Off));

        let cool = Hysteresis {
            on_threshold: 30.0,
            off_threshold: 25.0,
        };
        assert_eq!(arm_direction(&cool), ArmDirection::Rising);
        assert_eq!(desired_state(&cool, 31.0), Some(ActuatorState::On));
        assert_eq!(desired_state(&cool, 27.0), None);
        assert_eq!(desired_state(&cool, 25.0), Some(ActuatorState::Off));
    }

    #[tokio::test]
    async fn test_band_oscillation_keeps_state() {
        let tracker = tracker().await;
        let t0 = Utc::now();
        let mut r = rule(heating());

        let admission = tracker.admit(&r, true, Some(15.0), t0);
        assert_eq!(
            admission,
            Admission::Permit {
                desired: ActuatorState::On
            }
        );
        r.current_actuator_state = ActuatorState::On;
        r.last_state_change_at = Some(t0);

        // Well past the cooldown, values inside the band never re-trigger
        for (i, v) in [16.0, 17.0, 16.5, 17.5].into_iter().enumerate() {
            let at = t0 + Duration::minutes(10 * (i as i64 + 1));
            match tracker.admit(&r, true, Some(v), at) {
                Admission::Deny { reason, .. } => assert_eq!(reason, SkipReason::NoStateChange),
                other => panic!("unexpected {:?} at {}", other, v),
            }
        }

        let admission = tracker.admit(&r, true, Some(18.0), t0 + Duration::hours(1));
        assert_eq!(
            admission,
            Admission::Permit {
                desired: ActuatorState::Off
            }
        );
    }

    #[tokio::test]
    async fn test_already_in_state() {
        let tracker = tracker().await;
        let mut r = rule(heating());
        r.current_actuator_state = ActuatorState::On;
        let admission = tracker.admit(&r, true, Some(12.0), Utc::now());
        assert!(matches!(
            admission,
            Admission::Deny {
                reason: SkipReason::NoStateChange,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cooldown_applies_without_hysteresis() {
        let tracker = tracker().await;
        let t0 = Utc::now();
        let mut r = rule(None);
        assert!(tracker.admit(&r, true, None, t0).is_permitted());

        r.current_actuator_state = ActuatorState::On;
        r.last_state_change_at = Some(t0);
        let admission = tracker.admit(&r, true, None, t0 + Duration::seconds(10));
        assert!(matches!(
            admission,
            Admission::Deny {
                reason: SkipReason::Cooldown,
                ..
            }
        ));
        assert!(tracker
            .admit(&r, true, None, t0 + Duration::seconds(60))
            .is_permitted());
    }

    #[tokio::test]
    async fn test_out_of_order_reading_is_in_cooldown() {
        let tracker = tracker().await;
        let t0 = Utc::now();
        let mut r = rule(None);
        r.last_state_change_at = Some(t0);
        assert!(!tracker
            .admit(&r, true, None, t0 - Duration::hours(2))
            .is_permitted());
    }

    #[tokio::test]
    async fn test_unmatched_and_missing_value() {
        let tracker = tracker().await;
        let r = rule(heating());
        assert!(matches!(
            tracker.admit(&r, false, Some(10.0), Utc::now()),
            Admission::Deny {
                reason: SkipReason::ConditionsNotMet,
                ..
            }
        ));
        assert!(matches!(
            tracker.admit(&r, true, None, Utc::now()),
            Admission::Deny {
                reason: SkipReason::MissingData,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_device_lock_serializes() {
        let locks = Arc::new(DeviceLocks::new());
        let guard = locks.lock("gh-1").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("gh-1").await;
        });
        // A different device is not blocked
        let _g2 = locks.lock("gh-2").await;

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_device_locks_are_released() {
        let locks = Arc::new(DeviceLocks::new());
        for i in 0..50 {
            let _g = locks.lock(&format!("gh-{}", i)).await;
        }
        assert!(locks.is_empty());

        // Entry survives while another pass waits on it
        let guard = locks.lock("gh-1").await;
        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("gh-1").await;
        });
        while locks
            .locks
            .get("gh-1")
            .map_or(true, |l| Arc::strong_count(l.value()) < 3)
        {
            tokio::task::yield_now().await;
        }
        drop(guard);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
