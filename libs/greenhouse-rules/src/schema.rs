//! Rule store schema
//!
//! DDL for every table the engine reads or writes. All timestamps are UTC epoch
//! milliseconds so the hysteresis compare-and-swap can match them exactly.

use crate::error::Result;
use sqlx::SqlitePool;

/// Rules table DDL (engine-owned columns: current_actuator_state .. last_triggered_at)
pub const RULES_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS rules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        name TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 100,
        active INTEGER NOT NULL DEFAULT 1,
        time_based INTEGER NOT NULL DEFAULT 0,
        hysteresis_on REAL,
        hysteresis_off REAL,
        min_state_change_interval_ms INTEGER NOT NULL DEFAULT 60000,
        current_actuator_state TEXT NOT NULL DEFAULT 'unknown',
        last_state_change_at INTEGER,
        trigger_count INTEGER NOT NULL DEFAULT 0,
        last_triggered_at INTEGER,
        created_at INTEGER NOT NULL,
        CHECK ((hysteresis_on IS NULL) = (hysteresis_off IS NULL))
    )
"#;

/// Condition groups table DDL
pub const CONDITION_GROUPS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS condition_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        rule_id INTEGER NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
        group_order INTEGER NOT NULL,
        UNIQUE (rule_id, group_order)
    )
"#;

/// Conditions table DDL
pub const CONDITIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS conditions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL REFERENCES condition_groups(id) ON DELETE CASCADE,
        condition_order INTEGER NOT NULL,
        sensor_id TEXT NOT NULL,
        operator TEXT NOT NULL,
        value REAL NOT NULL,
        value_max REAL,
        UNIQUE (group_id, condition_order)
    )
"#;

/// Actions table DDL
pub const ACTIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS actions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        rule_id INTEGER NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
        actuator_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        value REAL,
        UNIQUE (rule_id, actuator_id)
    )
"#;

/// Execution log table DDL (append-only, pruned by retention only)
pub const EXECUTION_LOG_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS execution_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        rule_id INTEGER NOT NULL,
        trigger TEXT NOT NULL,
        sensor_id TEXT,
        value REAL,
        executed_at INTEGER NOT NULL,
        command_id TEXT,
        outcome TEXT NOT NULL,
        reason TEXT,
        detail TEXT
    )
"#;

pub const EXECUTION_LOG_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_execution_log_rule_time
        ON execution_log (rule_id, executed_at)
"#;

/// Outbound actuator command queue
pub const ACTUATOR_COMMANDS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS actuator_commands (
        id TEXT PRIMARY KEY,
        rule_id INTEGER,
        actuator_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        value REAL,
        status TEXT NOT NULL DEFAULT 'pending',
        error TEXT,
        created_at INTEGER NOT NULL,
        acknowledged_at INTEGER
    )
"#;

pub const ACTUATOR_COMMANDS_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_actuator_commands_pending
        ON actuator_commands (actuator_id, status, created_at)
"#;

/// Latest known value per device sensor
pub const SENSOR_LATEST_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS sensor_latest (
        device_id TEXT NOT NULL,
        sensor_id TEXT NOT NULL,
        value REAL NOT NULL,
        recorded_at INTEGER NOT NULL,
        PRIMARY KEY (device_id, sensor_id)
    )
"#;

/// Create every table and index if missing
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for ddl in [
        RULES_TABLE,
        CONDITION_GROUPS_TABLE,
        CONDITIONS_TABLE,
        ACTIONS_TABLE,
        EXECUTION_LOG_TABLE,
        EXECUTION_LOG_INDEX,
        ACTUATOR_COMMANDS_TABLE,
        ACTUATOR_COMMANDS_INDEX,
        SENSOR_LATEST_TABLE,
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
