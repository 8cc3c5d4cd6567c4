//! Greenhouse Rules - sensor-to-actuator rule engine
//!
//! Decides, for every accepted sensor reading, which automation rules fire:
//! - Condition evaluation (AND within a group, OR across groups)
//! - Hysteresis and cooldown admission per rule
//! - Deterministic priority resolution per actuator
//! - Command dispatch to an external actuator queue
//! - Append-only execution log with retention
//! - SQLite persistence for rules and engine-owned state
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Ingestion  │────▶│    Engine    │────▶│  Evaluator   │──▶ SensorValueStore
//! │  Scheduler  │     │ (device lock)│     └──────────────┘
//! └─────────────┘     └──────────────┘            │
//!                            │                    ▼
//!                            │             ┌──────────────┐     ┌──────────────┐
//!                            │             │  Hysteresis  │────▶│   Resolver   │
//!                            │             └──────────────┘     └──────────────┘
//!                            ▼                                         │
//!                     ┌──────────────┐     ┌──────────────┐            │
//!                     │ ExecutionLog │◀────│  Dispatcher  │◀───────────┘
//!                     │   (SQLite)   │     │ CommandQueue │
//!                     └──────────────┘     └──────────────┘
//! ```

mod dispatcher;
mod engine;
mod error;
mod evaluator;
mod hysteresis;
pub mod logger;
mod repository;
mod resolver;
mod scheduler;
pub mod schema;
mod sensors;
pub mod types;
mod validation;

// Re-export public API
pub use dispatcher::{
    ActionDispatcher, ActuatorCommand, CommandQueue, CommandStatus, MemoryCommandQueue,
    SqliteCommandQueue, StoredCommand, DEFAULT_DISPATCH_TIMEOUT,
};
pub use engine::{DispatchedCommand, EngineConfig, PassReport, RuleEngine};
pub use error::{Result, RuleError};
pub use evaluator::{
    evaluate_condition, evaluate_rule, ConditionEvaluator, Evaluation, SensorSnapshot,
};
pub use hysteresis::{
    arm_direction, desired_state, Admission, ArmDirection, DeviceGuard, DeviceLocks,
    HysteresisTracker,
};
pub use logger::{format_entry, format_group, ExecutionLog, RetentionPolicy};
pub use repository::{
    compare_and_set_state, delete_rule, get_rule, insert_rule, list_rules, load_active_rules,
    record_trigger, set_rule_active, LoadedRules, MalformedRule,
};
pub use resolver::{compare_priority, resolve, Award, Contender, Resolution};
pub use scheduler::{RuleScheduler, Schedule, SchedulerStatus, DEFAULT_TICK_MS};
pub use schema::init_schema;
pub use sensors::{MemorySensorStore, SensorValueStore, SqliteSensorStore};
pub use validation::{validate_definition, validate_rule};

// Re-export rule types for convenience
pub use types::{
    Action, ActionKind, ActuatorState, Condition, ConditionGroup, ExecutionLogEntry, Hysteresis,
    Operator, Outcome, Reading, Rule, RuleDefinition, RuleId, SkipReason, TriggerKind,
};
