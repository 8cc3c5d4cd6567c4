//! Condition Evaluator
//!
//! Evaluates a rule against a sensor snapshot:
//! 1. The triggering sensor uses the triggering value directly
//! 2. Every other sensor is read once per pass from the sensor value store
//! 3. AND inside a group, OR across groups, both short-circuit
//!
//! A missing value makes its condition false; it never aborts the evaluation.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::logger::format_group;
use crate::sensors::SensorValueStore;
use crate::types::{Condition, ConditionGroup, Rule};

/// Result of evaluating one rule
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// First fully satisfied group
    Matched {
        group_order: i64,
        /// Group rendered as text, e.g. "temperature>30 && humidity<80"
        expression: String,
    },
    /// No group satisfied, all needed values were known
    NotMatched,
    /// No group satisfied and these sensors had no value
    MissingData { sensors: Vec<String> },
}

impl Evaluation {
    pub fn is_match(&self) -> bool {
        matches!(self, Evaluation::Matched { .. })
    }
}

/// Values seen during one evaluation pass
///
/// Shared by every rule of the pass so each sensor is read at most once.
pub struct SensorSnapshot<'a, S: SensorValueStore + ?Sized> {
    store: &'a S,
    device_id: String,
    triggering: Option<(String, f64)>,
    cache: HashMap<String, Option<f64>>,
}

impl<'a, S: SensorValueStore + ?Sized> SensorSnapshot<'a, S> {
    /// Snapshot for a reading-triggered pass
    pub fn new(store: &'a S, device_id: &str, sensor_id: &str, value: f64) -> Self {
        Self {
            store,
            device_id: device_id.to_string(),
            triggering: Some((sensor_id.to_string(), value)),
            cache: HashMap::new(),
        }
    }

    /// Snapshot with no triggering value (scheduled ticks)
    pub fn without_trigger(store: &'a S, device_id: &str) -> Self {
        Self {
            store,
            device_id: device_id.to_string(),
            triggering: None,
            cache: HashMap::new(),
        }
    }

    /// Value of a sensor of the pass's device
    pub async fn value(&mut self, sensor_id: &str) -> Option<f64> {
        if let Some((id, value)) = &self.triggering {
            if id == sensor_id {
                return Some(*value);
            }
        }

        if let Some(cached) = self.cache.get(sensor_id) {
            return *cached;
        }

        let value = match self.store.latest_value(&self.device_id, sensor_id).await {
            Ok(v) => v,
            Err(e) => {
                warn!(device_id = %self.device_id, "Sensor {} read err: {}", sensor_id, e);
                None
            },
        };
        self.cache.insert(sensor_id.to_string(), value);
        value
    }
}

/// Condition evaluator bound to a sensor value store
pub struct ConditionEvaluator<S: SensorValueStore + ?Sized> {
    sensors: Arc<S>,
}

impl<S: SensorValueStore + ?Sized> ConditionEvaluator<S> {
    pub fn new(sensors: Arc<S>) -> Self {
        Self { sensors }
    }

    /// Start a snapshot for a reading-triggered pass
    pub fn snapshot(&self, device_id: &str, sensor_id: &str, value: f64) -> SensorSnapshot<'_, S> {
        SensorSnapshot::new(self.sensors.as_ref(), device_id, sensor_id, value)
    }

    /// Start a snapshot for a scheduled pass
    pub fn snapshot_without_trigger(&self, device_id: &str) -> SensorSnapshot<'_, S> {
        SensorSnapshot::without_trigger(self.sensors.as_ref(), device_id)
    }

    /// Evaluate a single rule for a triggering reading on the rule's device
    pub async fn evaluate(&self, rule: &Rule, sensor_id: &str, value: f64) -> Evaluation {
        let mut snapshot = self.snapshot(&rule.device_id, sensor_id, value);
        evaluate_rule(rule, &mut snapshot).await
    }
}

/// Evaluate a rule against a snapshot (OR across groups)
pub async fn evaluate_rule<S: SensorValueStore + ?Sized>(
    rule: &Rule,
    snapshot: &mut SensorSnapshot<'_, S>,
) -> Evaluation {
    let mut missing: Vec<String> = Vec::new();

    for group in &rule.groups {
        if evaluate_group(group, snapshot, &mut missing).await {
            return Evaluation::Matched {
                group_order: group.order,
                expression: format_group(group),
            };
        }
    }

    if missing.is_empty() {
        Evaluation::NotMatched
    } else {
        Evaluation::MissingData { sensors: missing }
    }
}

/// AND over a group; stops at the first false condition
async fn evaluate_group<S: SensorValueStore + ?Sized>(
    group: &ConditionGroup,
    snapshot: &mut SensorSnapshot<'_, S>,
    missing: &mut Vec<String>,
) -> bool {
    if group.conditions.is_empty() {
        return false;
    }

    for cond in &group.conditions {
        match snapshot.value(&cond.sensor_id).await {
            Some(value) => {
                if !evaluate_condition(cond, value) {
                    return false;
                }
            },
            None => {
                if !missing.contains(&cond.sensor_id) {
                    missing.push(cond.sensor_id.clone());
                }
                return false;
            },
        }
    }
    true
}

/// Evaluate a single condition against a known value
pub fn evaluate_condition(cond: &Condition, value: f64) -> bool {
    cond.operator.compare(value, cond.value, cond.value_max)
}
