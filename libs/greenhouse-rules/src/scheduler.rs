//! Rule Scheduler - time-based rule triggers
//!
//! Registered rules get a scheduled tick every `interval`. A tick goes straight to
//! `RuleEngine::on_scheduled_tick`, so hysteresis, cooldown, priority resolution
//! and logging apply exactly as for reading-triggered passes.
//!
//! The loop runs on a fixed tick granularity (default 100ms) and checks which
//! registrations are due.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::dispatcher::CommandQueue;
use crate::engine::{PassReport, RuleEngine};
use crate::error::{Result, RuleError};
use crate::repository::get_rule;
use crate::sensors::SensorValueStore;
use crate::types::RuleId;

/// Default scheduler tick interval (100ms)
pub const DEFAULT_TICK_MS: u64 = 100;

/// A rule that runs on a fixed interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub rule_id: RuleId,
    pub interval_secs: u64,
}

impl Schedule {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Runtime state for a scheduled rule
struct ScheduledRule {
    rule_id: RuleId,
    interval: Duration,
    last_execution: Option<Instant>,
}

impl ScheduledRule {
    fn is_due(&self, now: Instant) -> bool {
        match self.last_execution {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        }
    }
}

/// Rule Scheduler - drives scheduled ticks into the engine
pub struct RuleScheduler<S: SensorValueStore + ?Sized, Q: CommandQueue + ?Sized> {
    engine: Arc<RuleEngine<S, Q>>,
    rules: RwLock<Vec<ScheduledRule>>,
    shutdown: Notify,
    running: AtomicBool,
    tick_ms: u64,
}

impl<S: SensorValueStore + ?Sized, Q: CommandQueue + ?Sized> RuleScheduler<S, Q> {
    pub fn new(engine: Arc<RuleEngine<S, Q>>, tick_ms: u64) -> Self {
        Self {
            engine,
            rules: RwLock::new(Vec::new()),
            shutdown: Notify::new(),
            running: AtomicBool::new(false),
            tick_ms: tick_ms.max(1),
        }
    }

    /// Register (or re-register) a rule; the first tick is due immediately
    ///
    /// The rule must exist and be marked time-based.
    pub async fn register(&self, rule_id: RuleId, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(RuleError::SchedulerError(format!(
                "rule {}: interval must be positive",
                rule_id
            )));
        }
        if !get_rule(self.engine.pool(), rule_id).await?.time_based {
            return Err(RuleError::SchedulerError(format!(
                "rule {} is not time-based",
                rule_id
            )));
        }

        let mut rules = self.rules.write().await;
        rules.retain(|r| r.rule_id != rule_id);
        rules.push(ScheduledRule {
            rule_id,
            interval,
            last_execution: None,
        });
        debug!(rule_id, "Scheduled every {:?}", interval);
        Ok(())
    }

    /// Register every configured schedule
    pub async fn register_all(&self, schedules: &[Schedule]) -> Result<usize> {
        for schedule in schedules {
            self.register(schedule.rule_id, schedule.interval()).await?;
        }
        info!("Loaded {} schedules", schedules.len());
        Ok(schedules.len())
    }

    /// Remove a rule; returns whether it was registered
    pub async fn unregister(&self, rule_id: RuleId) -> bool {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.rule_id != rule_id);
        rules.len() != before
    }

    /// Start the scheduler loop
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return;
        }

        info!("Starting rule scheduler with {}ms tick", self.tick_ms);

        let mut tick_interval = interval(Duration::from_millis(self.tick_ms));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    self.tick().await;
                }
                _ = self.shutdown.notified() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Rule scheduler stopped");
    }

    /// Stop the scheduler
    pub fn stop(&self) {
        info!("Stopping rule scheduler...");
        self.shutdown.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Single scheduler tick - run every due rule
    async fn tick(&self) {
        let now = Instant::now();
        let due: Vec<RuleId> = {
            let mut rules = self.rules.write().await;
            rules
                .iter_mut()
                .filter(|r| r.is_due(now))
                .map(|r| {
                    r.last_execution = Some(now);
                    r.rule_id
                })
                .collect()
        };

        for rule_id in due {
            match self.engine.on_scheduled_tick(rule_id, Utc::now()).await {
                Ok(report) => debug!(
                    rule_id,
                    "Tick done: {} cmds, {} entries",
                    report.commands.len(),
                    report.entries.len()
                ),
                Err(RuleError::NotFound(_)) => {
                    warn!(rule_id, "Scheduled rule gone, unregistering");
                    self.unregister(rule_id).await;
                },
                Err(e) => error!(rule_id, "Scheduled tick err: {}", e),
            }
        }
    }

    /// Run a scheduled tick for a rule right now (manual trigger)
    pub async fn execute_rule(&self, rule_id: RuleId) -> Result<PassReport> {
        self.engine.on_scheduled_tick(rule_id, Utc::now()).await
    }

    /// Get scheduler status
    pub async fn status(&self) -> SchedulerStatus {
        let rules = self.rules.read().await;
        SchedulerStatus {
            running: self.is_running(),
            scheduled_rules: rules.iter().map(|r| r.rule_id).collect(),
            tick_interval_ms: self.tick_ms,
        }
    }
}

/// Scheduler status information
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub scheduled_rules: Vec<RuleId>,
    pub tick_interval_ms: u64,
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::dispatcher::MemoryCommandQueue;
    use crate::engine::EngineConfig;
    use crate::repository::{delete_rule, insert_rule};
    use crate::schema::init_schema;
    use crate::sensors::MemorySensorStore;
    use crate::types::{Action, Condition, Operator, RuleDefinition, TriggerKind};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (
        Arc<RuleScheduler<MemorySensorStore, MemoryCommandQueue>>,
        Arc<MemoryCommandQueue>,
        RuleId,
    ) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();

        let rule_id = insert_rule(
            &pool,
            &RuleDefinition::new("u1", "gh-1", "Morning irrigation", 10)
                .time_based()
                .with_group(vec![Condition::new("soil_moisture", Operator::Lt, 30.0)])
                .with_action(Action::on("pump_1")),
        )
        .await
        .unwrap();

        let queue = Arc::new(MemoryCommandQueue::new());
        let engine = Arc::new(RuleEngine::new(
            pool,
            Arc::new(MemorySensorStore::new()),
            queue.clone(),
            EngineConfig::default(),
        ));
        (Arc::new(RuleScheduler::new(engine, 10)), queue, rule_id)
    }

    #[tokio::test]
    async fn test_tick_runs_due_rules_once_per_interval() {
        let (scheduler, queue, rule_id) = setup().await;
        scheduler
            .register(rule_id, Duration::from_secs(3600))
            .await
            .unwrap();

        scheduler.tick().await;
        scheduler.tick().await;

        let commands = queue.commands().await;
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].1.actuator_id, "pump_1");
    }

    #[tokio::test]
    async fn test_register_rejects_zero_interval() {
        let (scheduler, _queue, rule_id) = setup().await;
        assert!(matches!(
            scheduler.register(rule_id, Duration::ZERO).await,
            Err(RuleError::SchedulerError(_))
        ));
    }

    #[tokio::test]
    async fn test_register_requires_time_based_rule() {
        let (scheduler, _queue, _rule_id) = setup().await;
        let ventilation = insert_rule(
            scheduler.engine.pool(),
            &RuleDefinition::new("u1", "gh-1", "Ventilation", 10)
                .with_group(vec![Condition::new("temperature", Operator::Gt, 30.0)])
                .with_action(Action::on("fan_1")),
        )
        .await
        .unwrap();

        assert!(matches!(
            scheduler
                .register(ventilation, Duration::from_secs(300))
                .await,
            Err(RuleError::SchedulerError(_))
        ));
        assert!(matches!(
            scheduler.register(9999, Duration::from_secs(300)).await,
            Err(RuleError::NotFound(_))
        ));
        assert!(matches!(
            scheduler.execute_rule(ventilation).await,
            Err(RuleError::SchedulerError(_))
        ));
        assert!(scheduler.status().await.scheduled_rules.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_rule_is_unregistered() {
        let (scheduler, _queue, rule_id) = setup().await;
        scheduler
            .register(rule_id, Duration::from_secs(1))
            .await
            .unwrap();
        delete_rule(scheduler.engine.pool(), rule_id).await.unwrap();
        scheduler.tick().await;
        assert!(scheduler.status().await.scheduled_rules.is_empty());
    }

    #[tokio::test]
    async fn test_execute_rule_is_schedule_trigger() {
        let (scheduler, _queue, rule_id) = setup().await;
        let report = scheduler.execute_rule(rule_id).await.unwrap();
        assert_eq!(report.trigger, TriggerKind::Schedule);
        assert_eq!(report.entries.len(), 1);
        assert!(report.entries[0].sensor_id.is_none());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (scheduler, queue, rule_id) = setup().await;
        scheduler
            .register_all(&[Schedule {
                rule_id,
                interval_secs: 3600,
            }])
            .await
            .unwrap();

        let runner = scheduler.clone();
        let handle = tokio::spawn(async move { runner.start().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.is_running());
        scheduler.stop();
        handle.await.unwrap();

        assert!(!scheduler.status().await.running);
        assert_eq!(queue.commands().await.len(), 1);
    }
}
