//! Rule engine type definitions
//!
//! Core types shared by the engine components:
//! - Rule: a prioritized automation definition with condition groups and actions
//! - ConditionGroup / Condition: AND within a group, OR across groups
//! - Action: what to do with an actuator when the rule wins
//! - ExecutionLogEntry: one immutable outcome per rule considered in a pass

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::RuleError;

/// Rule identifier
pub type RuleId = i64;

/// Default minimum interval between two state changes of a rule (60s)
pub const DEFAULT_MIN_STATE_CHANGE_INTERVAL_MS: u64 = 60_000;

/// Priority bounds (lower number = higher priority)
pub const MIN_PRIORITY: i64 = 0;
pub const MAX_PRIORITY: i64 = 1000;

/// Bounds for `set_value` actions
pub const SET_VALUE_MIN: f64 = 0.0;
pub const SET_VALUE_MAX: f64 = 100.0;

// ============================================================================
// Conditions
// ============================================================================

/// Comparison operator of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Neq,
    /// Inclusive on both ends, requires `value_max`
    Between,
}

impl Operator {
    /// Symbol used in storage and in rendered expressions
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Gte => ">=",
            Operator::Lte => "<=",
            Operator::Eq => "=",
            Operator::Neq => "!=",
            Operator::Between => "between",
        }
    }

    /// Compare `value` against the condition thresholds
    pub fn compare(&self, value: f64, threshold: f64, threshold_max: Option<f64>) -> bool {
        match self {
            Operator::Gt => value > threshold,
            Operator::Lt => value < threshold,
            Operator::Gte => value >= threshold,
            Operator::Lte => value <= threshold,
            Operator::Eq => (value - threshold).abs() < f64::EPSILON,
            Operator::Neq => (value - threshold).abs() >= f64::EPSILON,
            Operator::Between => match threshold_max {
                Some(max) => value >= threshold && value <= max,
                None => false,
            },
        }
    }
}

impl FromStr for Operator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ">" | "gt" => Ok(Operator::Gt),
            "<" | "lt" => Ok(Operator::Lt),
            ">=" | "gte" => Ok(Operator::Gte),
            "<=" | "lte" => Ok(Operator::Lte),
            "=" | "==" | "eq" => Ok(Operator::Eq),
            "!=" | "≠" | "neq" => Ok(Operator::Neq),
            "between" => Ok(Operator::Between),
            other => Err(RuleError::InvalidFormat(format!(
                "unknown operator '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single comparison against one sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Position inside the group
    #[serde(default)]
    pub order: i64,

    /// Sensor the condition reads
    pub sensor_id: String,

    /// Comparison operator
    pub operator: Operator,

    /// Threshold (lower bound for `between`)
    pub value: f64,

    /// Upper bound, only for `between`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_max: Option<f64>,
}

impl Condition {
    pub fn new(sensor_id: impl Into<String>, operator: Operator, value: f64) -> Self {
        Self {
            order: 0,
            sensor_id: sensor_id.into(),
            operator,
            value,
            value_max: None,
        }
    }

    pub fn between(sensor_id: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            order: 0,
            sensor_id: sensor_id.into(),
            operator: Operator::Between,
            value: min,
            value_max: Some(max),
        }
    }
}

/// Conditions combined with AND; groups of a rule are combined with OR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    /// Position inside the rule
    #[serde(default)]
    pub order: i64,

    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    /// Build a group, numbering the conditions in the given order
    pub fn new(order: i64, conditions: Vec<Condition>) -> Self {
        let conditions = conditions
            .into_iter()
            .enumerate()
            .map(|(i, mut c)| {
                c.order = i as i64;
                c
            })
            .collect();
        Self { order, conditions }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// What an action does to its actuator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    On,
    Off,
    /// Requires a value in `SET_VALUE_MIN..=SET_VALUE_MAX`
    SetValue,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::On => "on",
            ActionKind::Off => "off",
            ActionKind::SetValue => "set_value",
        }
    }
}

impl FromStr for ActionKind {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(ActionKind::On),
            "off" => Ok(ActionKind::Off),
            "set_value" => Ok(ActionKind::SetValue),
            other => Err(RuleError::InvalidFormat(format!(
                "unknown action kind '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action applied to one actuator when the rule wins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub actuator_id: String,
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Action {
    pub fn on(actuator_id: impl Into<String>) -> Self {
        Self {
            actuator_id: actuator_id.into(),
            kind: ActionKind::On,
            value: None,
        }
    }

    pub fn off(actuator_id: impl Into<String>) -> Self {
        Self {
            actuator_id: actuator_id.into(),
            kind: ActionKind::Off,
            value: None,
        }
    }

    pub fn set_value(actuator_id: impl Into<String>, value: f64) -> Self {
        Self {
            actuator_id: actuator_id.into(),
            kind: ActionKind::SetValue,
            value: Some(value),
        }
    }
}

// ============================================================================
// Hysteresis state
// ============================================================================

/// Asymmetric set/reset points
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hysteresis {
    pub on_threshold: f64,
    pub off_threshold: f64,
}

/// Last known actuator state of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorState {
    On,
    Off,
    #[default]
    Unknown,
}

impl ActuatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActuatorState::On => "on",
            ActuatorState::Off => "off",
            ActuatorState::Unknown => "unknown",
        }
    }
}

impl FromStr for ActuatorState {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(ActuatorState::On),
            "off" => Ok(ActuatorState::Off),
            "unknown" => Ok(ActuatorState::Unknown),
            other => Err(RuleError::InvalidFormat(format!(
                "unknown actuator state '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ActuatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Rule
// ============================================================================

/// Rule - execution structure loaded from the rule store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier
    pub id: RuleId,

    /// Owning user
    pub owner_id: String,

    /// Device whose readings trigger this rule
    pub device_id: String,

    /// Rule name
    pub name: String,

    /// Lower number = higher priority
    pub priority: i64,

    /// Whether the rule takes part in evaluation
    pub active: bool,

    /// Driven by scheduled ticks only; readings never evaluate it
    pub time_based: bool,

    /// Optional on/off threshold pair
    pub hysteresis: Option<Hysteresis>,

    /// Minimum time between two permitted state changes
    pub min_state_change_interval_ms: u64,

    /// Engine-owned: last state the rule drove its actuators into
    pub current_actuator_state: ActuatorState,

    /// Engine-owned: time of the last permitted state change
    pub last_state_change_at: Option<DateTime<Utc>>,

    /// Engine-owned: number of successful executions
    pub trigger_count: u64,

    /// Engine-owned: time of the last successful execution
    pub last_triggered_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    /// OR-combined groups
    pub groups: Vec<ConditionGroup>,

    /// At most one per actuator
    pub actions: Vec<Action>,
}

impl Rule {
    pub fn min_state_change_interval(&self) -> Duration {
        Duration::from_millis(self.min_state_change_interval_ms)
    }

    /// Sensor the hysteresis thresholds apply to (first condition of the first group)
    pub fn primary_sensor(&self) -> Option<&str> {
        self.groups
            .first()
            .and_then(|g| g.conditions.first())
            .map(|c| c.sensor_id.as_str())
    }
}

/// Rule definition as written by the authoring side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub owner_id: String,
    pub device_id: String,
    pub name: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub time_based: bool,
    #[serde(default)]
    pub hysteresis: Option<Hysteresis>,
    #[serde(default = "default_min_state_change_interval_ms")]
    pub min_state_change_interval_ms: u64,
    /// Defaults to insertion time
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub groups: Vec<ConditionGroup>,
    pub actions: Vec<Action>,
}

fn default_active() -> bool {
    true
}

fn default_min_state_change_interval_ms() -> u64 {
    DEFAULT_MIN_STATE_CHANGE_INTERVAL_MS
}

impl RuleDefinition {
    /// Minimal active definition with default interval and no hysteresis
    pub fn new(
        owner_id: impl Into<String>,
        device_id: impl Into<String>,
        name: impl Into<String>,
        priority: i64,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            device_id: device_id.into(),
            name: name.into(),
            priority,
            active: true,
            time_based: false,
            hysteresis: None,
            min_state_change_interval_ms: DEFAULT_MIN_STATE_CHANGE_INTERVAL_MS,
            created_at: None,
            groups: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Append a group; its order is its position
    pub fn with_group(mut self, conditions: Vec<Condition>) -> Self {
        let order = self.groups.len() as i64;
        self.groups.push(ConditionGroup::new(order, conditions));
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_hysteresis(mut self, on_threshold: f64, off_threshold: f64) -> Self {
        self.hysteresis = Some(Hysteresis {
            on_threshold,
            off_threshold,
        });
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_state_change_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Mark as a time-based rule, run by the scheduler instead of readings
    pub fn time_based(mut self) -> Self {
        self.time_based = true;
        self
    }
}

// ============================================================================
// Triggers and execution records
// ============================================================================

/// One accepted sensor measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub sensor_id: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(
        device_id: impl Into<String>,
        sensor_id: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            sensor_id: sensor_id.into(),
            value,
            timestamp,
        }
    }
}

/// What started an evaluation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Reading,
    Schedule,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Reading => "reading",
            TriggerKind::Schedule => "schedule",
        }
    }
}

impl FromStr for TriggerKind {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reading" => Ok(TriggerKind::Reading),
            "schedule" => Ok(TriggerKind::Schedule),
            other => Err(RuleError::InvalidFormat(format!(
                "unknown trigger kind '{}'",
                other
            ))),
        }
    }
}

/// Result of considering one rule in a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    Skipped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        }
    }
}

impl FromStr for Outcome {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "failed" => Ok(Outcome::Failed),
            "skipped" => Ok(Outcome::Skipped),
            other => Err(RuleError::InvalidFormat(format!(
                "unknown outcome '{}'",
                other
            ))),
        }
    }
}

/// Why a rule was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No group was fully satisfied
    ConditionsNotMet,
    /// No group was satisfied and at least one referenced sensor had no value
    MissingData,
    /// Value stayed inside the hysteresis band, or the state is already correct
    NoStateChange,
    /// Last state change is younger than the minimum interval
    Cooldown,
    /// Lost priority resolution on every targeted actuator
    Superseded,
    /// Rule breaks a configuration invariant
    InvalidConfiguration,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ConditionsNotMet => "conditions_not_met",
            SkipReason::MissingData => "missing_data",
            SkipReason::NoStateChange => "no_state_change",
            SkipReason::Cooldown => "cooldown",
            SkipReason::Superseded => "superseded",
            SkipReason::InvalidConfiguration => "invalid_configuration",
        }
    }
}

impl FromStr for SkipReason {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conditions_not_met" => Ok(SkipReason::ConditionsNotMet),
            "missing_data" => Ok(SkipReason::MissingData),
            "no_state_change" => Ok(SkipReason::NoStateChange),
            "cooldown" => Ok(SkipReason::Cooldown),
            "superseded" => Ok(SkipReason::Superseded),
            "invalid_configuration" => Ok(SkipReason::InvalidConfiguration),
            other => Err(RuleError::InvalidFormat(format!(
                "unknown skip reason '{}'",
                other
            ))),
        }
    }
}

/// Immutable record of one rule considered in one pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    /// Assigned by the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub rule_id: RuleId,
    pub trigger: TriggerKind,
    /// Triggering sensor (absent for scheduled ticks)
    pub sensor_id: Option<String>,
    /// Triggering value (absent for scheduled ticks)
    pub value: Option<f64>,
    pub executed_at: DateTime<Utc>,
    /// First command dispatched for this rule
    pub command_id: Option<String>,
    pub outcome: Outcome,
    pub reason: Option<SkipReason>,
    pub detail: Option<String>,
}

impl ExecutionLogEntry {
    pub fn is_skipped_for(&self, reason: SkipReason) -> bool {
        self.outcome == Outcome::Skipped && self.reason == Some(reason)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_operator_symbols_parse_back() {
        for op in [
            Operator::Gt,
            Operator::Lt,
            Operator::Gte,
            Operator::Lte,
            Operator::Eq,
            Operator::Neq,
            Operator::Between,
        ] {
            assert_eq!(op.as_str().parse::<Operator>().ok(), Some(op));
        }
        assert_eq!("≠".parse::<Operator>().ok(), Some(Operator::Neq));
        assert!("~=".parse::<Operator>().is_err());
    }

    #[test]
    fn test_between_is_inclusive() {
        let op = Operator::Between;
        assert!(op.compare(10.0, 10.0, Some(20.0)));
        assert!(op.compare(20.0, 10.0, Some(20.0)));
        assert!(!op.compare(20.1, 10.0, Some(20.0)));
        assert!(!op.compare(15.0, 10.0, None));
    }

    #[test]
    fn test_equality_operators() {
        assert!(Operator::Eq.compare(1.5, 1.5, None));
        assert!(!Operator::Eq.compare(1.5, 1.6, None));
        assert!(Operator::Neq.compare(1.5, 1.6, None));
    }

    #[test]
    fn test_group_numbers_conditions() {
        let group = ConditionGroup::new(
            2,
            vec![
                Condition::new("t", Operator::Gt, 1.0),
                Condition::new("h", Operator::Lt, 2.0),
            ],
        );
        assert_eq!(group.order, 2);
        assert_eq!(group.conditions[0].order, 0);
        assert_eq!(group.conditions[1].order, 1);
    }

    #[test]
    fn test_definition_defaults_from_json() {
        let def: RuleDefinition = serde_json::from_value(serde_json::json!({
            "owner_id": "u1",
            "device_id": "gh-1",
            "name": "Ventilation",
            "groups": [{ "conditions": [{ "sensor_id": "temperature", "operator": "gt", "value": 30.0 }] }],
            "actions": [{ "actuator_id": "fan_1", "kind": "on" }]
        }))
        .unwrap();
        assert!(def.active);
        assert_eq!(def.priority, 0);
        assert_eq!(
            def.min_state_change_interval_ms,
            DEFAULT_MIN_STATE_CHANGE_INTERVAL_MS
        );
        assert!(def.hysteresis.is_none());
    }
}
