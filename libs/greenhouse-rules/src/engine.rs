//! Rule Engine - evaluation trigger
//!
//! Runs one evaluation pass per accepted reading or scheduled tick:
//! 1. Lock the device and load its active rules
//! 2. Evaluate conditions against a shared sensor snapshot
//! 3. Apply hysteresis and cooldown admission
//! 4. Resolve priority per actuator
//! 5. Commit state, dispatch winning actions
//! 6. Append one log entry per rule considered
//!
//! Per-rule problems (malformed rule, missing data, failed dispatch) end up in that
//! rule's log entry. Only infrastructure failures (loading rules, writing the log)
//! fail the pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{ActionDispatcher, CommandQueue, DEFAULT_DISPATCH_TIMEOUT};
use crate::error::{Result, RuleError};
use crate::evaluator::{evaluate_rule, ConditionEvaluator, Evaluation};
use crate::hysteresis::{Admission, HysteresisTracker};
use crate::logger::{format_entry, ExecutionLog};
use crate::repository::{get_rule, load_active_rules, record_trigger};
use crate::resolver::{resolve, Contender};
use crate::sensors::SensorValueStore;
use crate::types::{
    Action, ActionKind, ActuatorState, ExecutionLogEntry, Outcome, Reading, Rule, RuleId,
    SkipReason, TriggerKind,
};
use crate::validation::validate_rule;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for a single enqueue on the command queue
    pub dispatch_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }
}

/// Command enqueued during a pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchedCommand {
    pub command_id: String,
    pub rule_id: RuleId,
    pub actuator_id: String,
    pub kind: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// Result of one evaluation pass
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub trigger: TriggerKind,
    pub device_id: String,
    pub executed_at: DateTime<Utc>,
    /// One entry per rule considered, ids assigned by the log
    pub entries: Vec<ExecutionLogEntry>,
    pub commands: Vec<DispatchedCommand>,
}

impl PassReport {
    pub fn entry_for(&self, rule_id: RuleId) -> Option<&ExecutionLogEntry> {
        self.entries.iter().find(|e| e.rule_id == rule_id)
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.entries.iter().filter(|e| e.outcome == outcome).count()
    }

    pub fn commands_for(&self, actuator_id: &str) -> Vec<&DispatchedCommand> {
        self.commands
            .iter()
            .filter(|c| c.actuator_id == actuator_id)
            .collect()
    }
}

/// Rule admitted by hysteresis, waiting for priority resolution
struct Candidate {
    rule: Rule,
    desired: ActuatorState,
    /// Actions for the desired state
    planned: Vec<Action>,
    /// Matched group, absent for scheduled ticks
    expression: Option<String>,
}

/// Entries accumulated during one pass
struct PassLog {
    trigger: TriggerKind,
    sensor_id: Option<String>,
    value: Option<f64>,
    executed_at: DateTime<Utc>,
    entries: Vec<ExecutionLogEntry>,
    commands: Vec<DispatchedCommand>,
}

impl PassLog {
    fn new(
        trigger: TriggerKind,
        sensor_id: Option<String>,
        value: Option<f64>,
        executed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            trigger,
            sensor_id,
            value,
            executed_at,
            entries: Vec::new(),
            commands: Vec::new(),
        }
    }

    fn record(
        &mut self,
        rule_id: RuleId,
        outcome: Outcome,
        reason: Option<SkipReason>,
        command_id: Option<String>,
        detail: Option<String>,
    ) {
        self.entries.push(ExecutionLogEntry {
            id: None,
            rule_id,
            trigger: self.trigger,
            sensor_id: self.sensor_id.clone(),
            value: self.value,
            executed_at: self.executed_at,
            command_id,
            outcome,
            reason,
            detail,
        });
    }

    fn skip(&mut self, rule_id: RuleId, reason: SkipReason, detail: impl Into<String>) {
        self.record(
            rule_id,
            Outcome::Skipped,
            Some(reason),
            None,
            Some(detail.into()),
        );
    }
}

/// Rule engine
pub struct RuleEngine<S: SensorValueStore + ?Sized, Q: CommandQueue + ?Sized> {
    pool: SqlitePool,
    evaluator: ConditionEvaluator<S>,
    tracker: HysteresisTracker,
    dispatcher: ActionDispatcher<Q>,
    log: ExecutionLog,
}

impl<S: SensorValueStore + ?Sized, Q: CommandQueue + ?Sized> RuleEngine<S, Q> {
    pub fn new(pool: SqlitePool, sensors: Arc<S>, queue: Arc<Q>, config: EngineConfig) -> Self {
        Self {
            evaluator: ConditionEvaluator::new(sensors),
            tracker: HysteresisTracker::new(pool.clone()),
            dispatcher: ActionDispatcher::new(queue, config.dispatch_timeout),
            log: ExecutionLog::new(pool.clone()),
            pool,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn execution_log(&self) -> &ExecutionLog {
        &self.log
    }

    /// Evaluate every active rule of the reading's device
    ///
    /// The reading timestamp is "now" for cooldown checks.
    pub async fn on_reading(&self, reading: &Reading) -> Result<PassReport> {
        if !reading.value.is_finite() {
            return Err(RuleError::InvalidFormat(format!(
                "non-finite value for sensor {}",
                reading.sensor_id
            )));
        }

        let _guard = self.tracker.lock_device(&reading.device_id).await;
        let loaded = load_active_rules(&self.pool, &reading.device_id).await?;
        let now = reading.timestamp;

        debug!(
            device_id = %reading.device_id,
            "Pass {}={}: {} rules",
            reading.sensor_id,
            reading.value,
            loaded.len()
        );

        let mut pass = PassLog::new(
            TriggerKind::Reading,
            Some(reading.sensor_id.clone()),
            Some(reading.value),
            now,
        );

        for bad in &loaded.malformed {
            warn!(rule_id = bad.id, "Rule {} malformed: {}", bad.name, bad.reason);
            pass.skip(bad.id, SkipReason::InvalidConfiguration, bad.reason.clone());
        }

        let mut snapshot = self
            .evaluator
            .snapshot(&reading.device_id, &reading.sensor_id, reading.value);
        let mut candidates = Vec::new();

        for rule in loaded.rules {
            if let Err(e) = validate_rule(&rule) {
                warn!(rule_id = rule.id, "Rule {} invalid: {}", rule.name, e);
                pass.skip(rule.id, SkipReason::InvalidConfiguration, e.to_string());
                continue;
            }

            let expression = match evaluate_rule(&rule, &mut snapshot).await {
                Evaluation::Matched { expression, .. } => expression,
                Evaluation::NotMatched => {
                    pass.skip(
                        rule.id,
                        SkipReason::ConditionsNotMet,
                        "no condition group matched",
                    );
                    continue;
                },
                Evaluation::MissingData { sensors } => {
                    pass.skip(
                        rule.id,
                        SkipReason::MissingData,
                        format!("no value for {}", sensors.join(", ")),
                    );
                    continue;
                },
            };

            let value = match (&rule.hysteresis, rule.primary_sensor()) {
                (Some(_), Some(sensor)) => snapshot.value(sensor).await,
                _ => None,
            };

            match self.tracker.admit(&rule, true, value, now) {
                Admission::Permit { desired } => {
                    candidates.push(Candidate::new(rule, desired, Some(expression)))
                },
                Admission::Deny { reason, detail } => pass.skip(rule.id, reason, detail),
            }
        }

        self.settle(&reading.device_id, pass, candidates).await
    }

    /// Run a time-based rule as an unconditional match
    ///
    /// Rules not marked time-based are refused with `SchedulerError`: a tick skips
    /// the conditions, so it must never drive a reading-triggered rule.
    pub async fn on_scheduled_tick(
        &self,
        rule_id: RuleId,
        timestamp: DateTime<Utc>,
    ) -> Result<PassReport> {
        let rule = get_rule(&self.pool, rule_id).await?;
        if !rule.time_based {
            return Err(RuleError::SchedulerError(format!(
                "rule {} is not time-based",
                rule_id
            )));
        }
        let device_id = rule.device_id;
        let _guard = self.tracker.lock_device(&device_id).await;

        let mut pass = PassLog::new(TriggerKind::Schedule, None, None, timestamp);

        // Re-read under the lock for fresh hysteresis state
        let rule = match get_rule(&self.pool, rule_id).await {
            Ok(rule) => rule,
            Err(e @ (RuleError::NotFound(_) | RuleError::DatabaseError(_))) => return Err(e),
            Err(e) => {
                warn!(rule_id, "Scheduled rule malformed: {}", e);
                pass.skip(rule_id, SkipReason::InvalidConfiguration, e.to_string());
                return self.settle(&device_id, pass, Vec::new()).await;
            },
        };

        if !rule.active {
            debug!(rule_id, "Tick for inactive rule ignored");
            return self.settle(&device_id, pass, Vec::new()).await;
        }

        let mut candidates = Vec::new();
        if let Err(e) = validate_rule(&rule) {
            warn!(rule_id, "Rule {} invalid: {}", rule.name, e);
            pass.skip(rule_id, SkipReason::InvalidConfiguration, e.to_string());
        } else {
            let value = match rule.primary_sensor() {
                Some(sensor) if rule.hysteresis.is_some() => {
                    self.evaluator
                        .snapshot_without_trigger(&rule.device_id)
                        .value(sensor)
                        .await
                },
                _ => None,
            };
            match self.tracker.admit(&rule, true, value, timestamp) {
                Admission::Permit { desired } => {
                    candidates.push(Candidate::new(rule, desired, None))
                },
                Admission::Deny { reason, detail } => pass.skip(rule_id, reason, detail),
            }
        }

        self.settle(&device_id, pass, candidates).await
    }

    /// Resolve, commit, dispatch and log
    async fn settle(
        &self,
        device_id: &str,
        mut pass: PassLog,
        candidates: Vec<Candidate>,
    ) -> Result<PassReport> {
        let now = pass.executed_at;
        let contenders: Vec<Contender<'_>> = candidates
            .iter()
            .map(|c| Contender {
                rule: &c.rule,
                actions: &c.planned,
            })
            .collect();
        let resolution = resolve(&contenders);

        for candidate in &candidates {
            let rule = &candidate.rule;
            let won = resolution.won_by(rule.id);
            let lost: Vec<String> = resolution
                .lost_by(rule.id)
                .into_iter()
                .map(|(actuator, winner)| format!("{} won by rule {}", actuator, winner))
                .collect();

            if won.is_empty() {
                pass.skip(
                    rule.id,
                    SkipReason::Superseded,
                    format!("superseded by priority: {}", lost.join(", ")),
                );
                continue;
            }

            match self.tracker.commit(rule, candidate.desired, now).await {
                Ok(true) => {},
                Ok(false) => {
                    pass.skip(rule.id, SkipReason::Cooldown, "state changed concurrently");
                    continue;
                },
                Err(e) => {
                    error!(rule_id = rule.id, "State commit err: {}", e);
                    pass.record(
                        rule.id,
                        Outcome::Failed,
                        None,
                        None,
                        Some(format!("state update failed: {}", e)),
                    );
                    continue;
                },
            }

            let mut dispatched = Vec::new();
            let mut errors = Vec::new();
            for action in candidate
                .planned
                .iter()
                .filter(|a| won.contains(&a.actuator_id.as_str()))
            {
                match self.dispatcher.dispatch(rule.id, action).await {
                    Ok(command_id) => dispatched.push(DispatchedCommand {
                        command_id,
                        rule_id: rule.id,
                        actuator_id: action.actuator_id.clone(),
                        kind: action.kind,
                        value: action.value,
                    }),
                    Err(e) => errors.push(format!("{}: {}", action.actuator_id, e)),
                }
            }

            // Nothing reached the queue: the state change never happened
            if dispatched.is_empty() {
                if let Err(e) = self.tracker.rollback(rule, now).await {
                    error!(rule_id = rule.id, "State rollback err: {}", e);
                }
            }

            let outcome = if errors.is_empty() {
                Outcome::Success
            } else {
                Outcome::Failed
            };
            if outcome == Outcome::Success {
                if let Err(e) = record_trigger(&self.pool, rule.id, now).await {
                    error!(rule_id = rule.id, "Trigger count err: {}", e);
                }
            }

            let mut detail = Vec::new();
            if let Some(expression) = &candidate.expression {
                detail.push(expression.clone());
            }
            if dispatched.len() > 1 {
                let ids: Vec<&str> = dispatched.iter().map(|c| c.command_id.as_str()).collect();
                detail.push(format!("commands {}", ids.join(", ")));
            }
            if !lost.is_empty() {
                detail.push(format!("superseded on {}", lost.join(", ")));
            }
            detail.extend(errors);

            let command_id = dispatched.first().map(|c| c.command_id.clone());
            pass.record(
                rule.id,
                outcome,
                None,
                command_id,
                (!detail.is_empty()).then(|| detail.join("; ")),
            );
            pass.commands.extend(dispatched);
        }

        let ids = self.log.append_all(&pass.entries).await?;
        for (entry, id) in pass.entries.iter_mut().zip(ids) {
            entry.id = Some(id);
            match entry.outcome {
                Outcome::Success => info!(rule_id = entry.rule_id, "{}", format_entry(entry)),
                Outcome::Failed => warn!(rule_id = entry.rule_id, "{}", format_entry(entry)),
                Outcome::Skipped => debug!(rule_id = entry.rule_id, "{}", format_entry(entry)),
            }
        }

        Ok(PassReport {
            trigger: pass.trigger,
            device_id: device_id.to_string(),
            executed_at: now,
            entries: pass.entries,
            commands: pass.commands,
        })
    }
}

impl Candidate {
    fn new(rule: Rule, desired: ActuatorState, expression: Option<String>) -> Self {
        let planned = match desired {
            ActuatorState::Off => rule
                .actions
                .iter()
                .map(|a| Action::off(a.actuator_id.clone()))
                .collect(),
            _ => rule.actions.clone(),
        };
        Self {
            rule,
            desired,
            planned,
            expression,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::dispatcher::MemoryCommandQueue;
    use crate::repository::insert_rule;
    use crate::schema::init_schema;
    use crate::sensors::MemorySensorStore;
    use crate::types::{Condition, Operator, RuleDefinition};
    use sqlx::sqlite::SqlitePoolOptions;
    use tracing_test::traced_test;

    async fn setup() -> (
        RuleEngine<MemorySensorStore, MemoryCommandQueue>,
        Arc<MemorySensorStore>,
        Arc<MemoryCommandQueue>,
    ) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        let sensors = Arc::new(MemorySensorStore::new());
        let queue = Arc::new(MemoryCommandQueue::new());
        let engine = RuleEngine::new(
            pool,
            sensors.clone(),
            queue.clone(),
            EngineConfig::default(),
        );
        (engine, sensors, queue)
    }

    #[tokio::test]
    async fn test_off_transition_plans_off_actions() {
        let (engine, _sensors, queue) = setup().await;
        let t0 = Utc::now();
        let id = insert_rule(
            engine.pool(),
            &RuleDefinition::new("u1", "gh-1", "Heater", 10)
                .with_group(vec![Condition::new("temperature", Operator::Gt, -40.0)])
                .with_action(Action::set_value("heater_1", 80.0))
                .with_hysteresis(15.0, 18.0),
        )
        .await
        .unwrap();

        let on = engine
            .on_reading(&Reading::new("gh-1", "temperature", 14.0, t0))
            .await
            .unwrap();
        assert_eq!(on.entry_for(id).unwrap().outcome, Outcome::Success);

        let off = engine
            .on_reading(&Reading::new(
                "gh-1",
                "temperature",
                19.0,
                t0 + chrono::Duration::minutes(5),
            ))
            .await
            .unwrap();
        assert_eq!(off.entry_for(id).unwrap().outcome, Outcome::Success);

        let commands = queue.commands().await;
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].1.kind, ActionKind::SetValue);
        assert_eq!(commands[1].1.kind, ActionKind::Off);
        assert_eq!(commands[1].1.value, None);
    }

    #[tokio::test]
    async fn test_partial_win_dispatches_won_actuators_only() {
        let (engine, _sensors, queue) = setup().await;
        let strong = insert_rule(
            engine.pool(),
            &RuleDefinition::new("u1", "gh-1", "Fan", 1)
                .with_group(vec![Condition::new("temperature", Operator::Gt, 30.0)])
                .with_action(Action::on("fan_1")),
        )
        .await
        .unwrap();
        let weak = insert_rule(
            engine.pool(),
            &RuleDefinition::new("u1", "gh-1", "Cooling", 50)
                .with_group(vec![Condition::new("temperature", Operator::Gt, 28.0)])
                .with_action(Action::off("fan_1"))
                .with_action(Action::on("mister_1")),
        )
        .await
        .unwrap();

        let report = engine
            .on_reading(&Reading::new("gh-1", "temperature", 35.0, Utc::now()))
            .await
            .unwrap();

        assert_eq!(report.entry_for(strong).unwrap().outcome, Outcome::Success);
        let weak_entry = report.entry_for(weak).unwrap();
        assert_eq!(weak_entry.outcome, Outcome::Success);
        assert!(weak_entry
            .detail
            .as_deref()
            .unwrap()
            .contains(&format!("fan_1 won by rule {}", strong)));

        let commands = queue.commands().await;
        assert_eq!(commands.len(), 2);
        assert_eq!(report.commands_for("fan_1")[0].rule_id, strong);
        assert_eq!(report.commands_for("mister_1")[0].rule_id, weak);
    }

    #[tokio::test]
    async fn test_rejected_dispatch_rolls_back_state() {
        let (engine, _sensors, queue) = setup().await;
        queue.set_rejecting(true);
        let t0 = Utc::now();
        let id = insert_rule(
            engine.pool(),
            &RuleDefinition::new("u1", "gh-1", "Ventilation", 10)
                .with_group(vec![Condition::new("temperature", Operator::Gt, 30.0)])
                .with_action(Action::on("fan_1")),
        )
        .await
        .unwrap();

        let report = engine
            .on_reading(&Reading::new("gh-1", "temperature", 35.0, t0))
            .await
            .unwrap();
        let entry = report.entry_for(id).unwrap();
        assert_eq!(entry.outcome, Outcome::Failed);
        assert!(entry.detail.as_deref().unwrap().contains("fan_1"));

        let rule = get_rule(engine.pool(), id).await.unwrap();
        assert_eq!(rule.current_actuator_state, ActuatorState::Unknown);
        assert!(rule.last_state_change_at.is_none());
        assert_eq!(rule.trigger_count, 0);

        // Queue back: the next reading is not held back by a cooldown
        queue.set_rejecting(false);
        let report = engine
            .on_reading(&Reading::new(
                "gh-1",
                "temperature",
                35.5,
                t0 + chrono::Duration::seconds(5),
            ))
            .await
            .unwrap();
        assert_eq!(report.entry_for(id).unwrap().outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn test_non_finite_reading_is_rejected() {
        let (engine, _sensors, _queue) = setup().await;
        let err = engine
            .on_reading(&Reading::new("gh-1", "temperature", f64::NAN, Utc::now()))
            .await;
        assert!(matches!(err, Err(RuleError::InvalidFormat(_))));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_pass_logs_one_line_per_rule() {
        let (engine, _sensors, _queue) = setup().await;
        insert_rule(
            engine.pool(),
            &RuleDefinition::new("u1", "gh-1", "Ventilation", 10)
                .with_group(vec![Condition::new("temperature", Operator::Gt, 30.0)])
                .with_action(Action::on("fan_1")),
        )
        .await
        .unwrap();

        engine
            .on_reading(&Reading::new("gh-1", "temperature", 35.0, Utc::now()))
            .await
            .unwrap();

        assert!(logs_contain("temperature=35 | success | temperature>30"));
    }
}
