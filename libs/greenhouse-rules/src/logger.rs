//! Rule execution logger
//!
//! Every rule considered in a pass leaves exactly one row in `execution_log`.
//! Rows are append-only; only the retention sweep removes them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;

use crate::error::Result;
use crate::repository::millis_to_datetime;
use crate::types::{ConditionGroup, ExecutionLogEntry, Operator, RuleId};

/// Default number of newest entries kept per rule
pub const DEFAULT_MAX_ENTRIES_PER_RULE: u32 = 1000;

/// Default maximum entry age (90 days)
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(90 * 24 * 3600);

/// Retention policy for the execution log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_entries_per_rule: u32,
    pub max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_entries_per_rule: DEFAULT_MAX_ENTRIES_PER_RULE,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

/// SQLite execution log
#[derive(Clone)]
pub struct ExecutionLog {
    pool: SqlitePool,
}

impl ExecutionLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append the entries of one pass atomically, returning their ids
    pub async fn append_all(&self, entries: &[ExecutionLogEntry]) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(entries.len());

        for entry in entries {
            let result = sqlx::query(
                r#"
                INSERT INTO execution_log
                    (rule_id, trigger, sensor_id, value, executed_at, command_id, outcome, reason, detail)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(entry.rule_id)
            .bind(entry.trigger.as_str())
            .bind(&entry.sensor_id)
            .bind(entry.value)
            .bind(entry.executed_at.timestamp_millis())
            .bind(&entry.command_id)
            .bind(entry.outcome.as_str())
            .bind(entry.reason.map(|r| r.as_str()))
            .bind(&entry.detail)
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Entries of a rule inside `[from, to]`, newest first
    pub async fn history(
        &self,
        rule_id: RuleId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<ExecutionLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, rule_id, trigger, sensor_id, value, executed_at, command_id, outcome, reason, detail
            FROM execution_log
            WHERE rule_id = ? AND executed_at >= ? AND executed_at <= ?
            ORDER BY executed_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(rule_id)
        .bind(from.map_or(i64::MIN, |t| t.timestamp_millis()))
        .bind(to.map_or(i64::MAX, |t| t.timestamp_millis()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate_entry).collect()
    }

    /// Apply the retention policy; returns the number of deleted entries
    pub async fn prune(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<u64> {
        let max_age_ms = i64::try_from(policy.max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.timestamp_millis().saturating_sub(max_age_ms);
        let mut tx = self.pool.begin().await?;

        let aged = sqlx::query("DELETE FROM execution_log WHERE executed_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let overflow = sqlx::query(
            r#"
            DELETE FROM execution_log WHERE id IN (
                SELECT id FROM (
                    SELECT id, ROW_NUMBER() OVER (
                        PARTITION BY rule_id ORDER BY executed_at DESC, id DESC
                    ) AS rn
                    FROM execution_log
                ) WHERE rn > ?
            )
            "#,
        )
        .bind(i64::from(policy.max_entries_per_rule))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if aged + overflow > 0 {
            debug!("Log prune: {} aged, {} overflow", aged, overflow);
        }
        Ok(aged + overflow)
    }
}

fn hydrate_entry(row: SqliteRow) -> Result<ExecutionLogEntry> {
    let trigger: String = row.try_get("trigger")?;
    let outcome: String = row.try_get("outcome")?;
    let reason: Option<String> = row.try_get("reason")?;
    Ok(ExecutionLogEntry {
        id: Some(row.try_get("id")?),
        rule_id: row.try_get("rule_id")?,
        trigger: trigger.parse()?,
        sensor_id: row.try_get("sensor_id")?,
        value: row.try_get("value")?,
        executed_at: millis_to_datetime(row.try_get("executed_at")?)?,
        command_id: row.try_get("command_id")?,
        outcome: outcome.parse()?,
        reason: reason.map(|r| r.parse()).transpose()?,
        detail: row.try_get("detail")?,
    })
}

/// Format a group as expression string (e.g. "temperature>30 && humidity<80")
pub fn format_group(group: &ConditionGroup) -> String {
    group
        .conditions
        .iter()
        .map(|c| match (c.operator, c.value_max) {
            (Operator::Between, Some(max)) => {
                format!("{} between {}..{}", c.sensor_id, c.value, max)
            },
            _ => format!("{}{}{}", c.sensor_id, c.operator, c.value),
        })
        .collect::<Vec<_>>()
        .join(" && ")
}

/// One-line summary of an entry: "temperature=35 | reason | detail"
pub fn format_entry(entry: &ExecutionLogEntry) -> String {
    let reading = match (&entry.sensor_id, entry.value) {
        (Some(sensor), Some(value)) => format!("{}={}", sensor, value),
        _ => entry.trigger.as_str().to_string(),
    };
    let status = match entry.reason {
        Some(reason) => reason.as_str(),
        None => entry.outcome.as_str(),
    };
    format!(
        "{} | {} | {}",
        reading,
        status,
        entry.detail.as_deref().unwrap_or("-")
    )
}
