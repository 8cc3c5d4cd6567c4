//! Rules Repository - SQLite persistence for rules
//!
//! Definitions (rules, groups, conditions, actions) are written by the authoring
//! side and only read by the engine. The hysteresis and trigger bookkeeping columns
//! on `rules` are the only engine-owned writes.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::error::{Result, RuleError};
use crate::types::{
    Action, ActuatorState, Condition, ConditionGroup, Hysteresis, Rule, RuleDefinition, RuleId,
};
use crate::validation::validate_definition;

const RULE_COLUMNS: &str = r#"
    id, owner_id, device_id, name, priority, active, time_based, hysteresis_on, hysteresis_off,
    min_state_change_interval_ms, current_actuator_state, last_state_change_at,
    trigger_count, last_triggered_at, created_at
"#;

/// Rule row that could not be turned into an executable `Rule`
#[derive(Debug, Clone)]
pub struct MalformedRule {
    pub id: RuleId,
    pub name: String,
    pub reason: String,
}

/// Active rules of one device, split into usable and undecodable ones
#[derive(Debug, Default)]
pub struct LoadedRules {
    pub rules: Vec<Rule>,
    pub malformed: Vec<MalformedRule>,
}

impl LoadedRules {
    pub fn len(&self) -> usize {
        self.rules.len() + self.malformed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validate and insert a rule definition with its groups and actions
pub async fn insert_rule(pool: &SqlitePool, def: &RuleDefinition) -> Result<RuleId> {
    validate_definition(def)?;

    let created_at = def.created_at.unwrap_or_else(Utc::now);
    let mut tx = pool.begin().await?;

    let rule_id = sqlx::query(
        r#"
        INSERT INTO rules (owner_id, device_id, name, priority, active, time_based,
                           hysteresis_on, hysteresis_off, min_state_change_interval_ms,
                           created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&def.owner_id)
    .bind(&def.device_id)
    .bind(&def.name)
    .bind(def.priority)
    .bind(def.active)
    .bind(def.time_based)
    .bind(def.hysteresis.map(|h| h.on_threshold))
    .bind(def.hysteresis.map(|h| h.off_threshold))
    .bind(def.min_state_change_interval_ms as i64)
    .bind(created_at.timestamp_millis())
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    for group in &def.groups {
        let group_id =
            sqlx::query("INSERT INTO condition_groups (rule_id, group_order) VALUES (?, ?)")
                .bind(rule_id)
                .bind(group.order)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();

        for cond in &group.conditions {
            sqlx::query(
                r#"
                INSERT INTO conditions (group_id, condition_order, sensor_id, operator, value, value_max)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(group_id)
            .bind(cond.order)
            .bind(&cond.sensor_id)
            .bind(cond.operator.as_str())
            .bind(cond.value)
            .bind(cond.value_max)
            .execute(&mut *tx)
            .await?;
        }
    }

    for action in &def.actions {
        sqlx::query("INSERT INTO actions (rule_id, actuator_id, kind, value) VALUES (?, ?, ?, ?)")
            .bind(rule_id)
            .bind(&action.actuator_id)
            .bind(action.kind.as_str())
            .bind(action.value)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(rule_id)
}

/// Get a single rule by ID (active or not)
pub async fn get_rule(pool: &SqlitePool, id: RuleId) -> Result<Rule> {
    let row = sqlx::query(&format!("SELECT {} FROM rules WHERE id = ?", RULE_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => hydrate_rule(pool, row).await,
        None => Err(RuleError::NotFound(id.to_string())),
    }
}

/// Load all active reading-triggered rules scoped to a device
///
/// Time-based rules are left out; only scheduled ticks run them.
///
/// Rows that fail to decode are returned as `malformed` instead of failing the load.
pub async fn load_active_rules(pool: &SqlitePool, device_id: &str) -> Result<LoadedRules> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM rules WHERE device_id = ? AND active = 1 AND time_based = 0 ORDER BY id ASC",
        RULE_COLUMNS
    ))
    .bind(device_id)
    .fetch_all(pool)
    .await?;

    let mut loaded = LoadedRules::default();
    for row in rows {
        let id: RuleId = row.try_get("id")?;
        let name: String = row.try_get("name")?;
        match hydrate_rule(pool, row).await {
            Ok(rule) => loaded.rules.push(rule),
            Err(RuleError::DatabaseError(e)) => return Err(RuleError::DatabaseError(e)),
            Err(e) => loaded.malformed.push(MalformedRule {
                id,
                name,
                reason: e.to_string(),
            }),
        }
    }
    Ok(loaded)
}

/// List all rules of an owner (including inactive)
pub async fn list_rules(pool: &SqlitePool, owner_id: &str) -> Result<Vec<Rule>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM rules WHERE owner_id = ? ORDER BY priority ASC, id ASC",
        RULE_COLUMNS
    ))
    .bind(owner_id)
    .fetch_all(pool)
    .await?;

    let mut rules = Vec::with_capacity(rows.len());
    for row in rows {
        rules.push(hydrate_rule(pool, row).await?);
    }
    Ok(rules)
}

/// Delete a rule with its groups, conditions and actions
pub async fn delete_rule(pool: &SqlitePool, id: RuleId) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM conditions WHERE group_id IN (SELECT id FROM condition_groups WHERE rule_id = ?)",
    )
    .bind(id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM condition_groups WHERE rule_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM actions WHERE rule_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM rules WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(RuleError::NotFound(id.to_string()));
    }

    tx.commit().await?;
    Ok(())
}

/// Activate or deactivate a rule
pub async fn set_rule_active(pool: &SqlitePool, id: RuleId, active: bool) -> Result<()> {
    let result = sqlx::query("UPDATE rules SET active = ? WHERE id = ?")
        .bind(active)
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(RuleError::NotFound(id.to_string()));
    }

    Ok(())
}

/// Compare-and-swap the hysteresis state of a rule
///
/// Succeeds only if `last_state_change_at` still equals `expected`; returns whether
/// the row was updated.
pub async fn compare_and_set_state(
    pool: &SqlitePool,
    id: RuleId,
    expected: Option<DateTime<Utc>>,
    state: ActuatorState,
    changed_at: Option<DateTime<Utc>>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE rules
        SET current_actuator_state = ?, last_state_change_at = ?
        WHERE id = ? AND last_state_change_at IS ?
        "#,
    )
    .bind(state.as_str())
    .bind(changed_at.map(|t| t.timestamp_millis()))
    .bind(id)
    .bind(expected.map(|t| t.timestamp_millis()))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Count a successful execution
pub async fn record_trigger(pool: &SqlitePool, id: RuleId, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE rules
        SET trigger_count = trigger_count + 1, last_triggered_at = ?
        WHERE id = ?
        "#,
    )
    .bind(at.timestamp_millis())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Hydrate a rule row plus its groups and actions into a Rule struct
async fn hydrate_rule(pool: &SqlitePool, row: SqliteRow) -> Result<Rule> {
    let id: RuleId = row.try_get("id")?;
    let hysteresis_on: Option<f64> = row.try_get("hysteresis_on")?;
    let hysteresis_off: Option<f64> = row.try_get("hysteresis_off")?;
    let state: String = row.try_get("current_actuator_state")?;
    let interval_ms: i64 = row.try_get("min_state_change_interval_ms")?;
    let trigger_count: i64 = row.try_get("trigger_count")?;

    let hysteresis = match (hysteresis_on, hysteresis_off) {
        (Some(on_threshold), Some(off_threshold)) => Some(Hysteresis {
            on_threshold,
            off_threshold,
        }),
        (None, None) => None,
        _ => {
            return Err(RuleError::InvalidDefinition(
                "hysteresis thresholds must both be set or both be absent".to_string(),
            ))
        },
    };

    if interval_ms < 0 {
        return Err(RuleError::InvalidDefinition(format!(
            "negative min_state_change_interval_ms {}",
            interval_ms
        )));
    }

    Ok(Rule {
        id,
        owner_id: row.try_get("owner_id")?,
        device_id: row.try_get("device_id")?,
        name: row.try_get("name")?,
        priority: row.try_get("priority")?,
        active: row.try_get::<i64, _>("active")? != 0,
        time_based: row.try_get::<i64, _>("time_based")? != 0,
        hysteresis,
        min_state_change_interval_ms: interval_ms as u64,
        current_actuator_state: state.parse()?,
        last_state_change_at: optional_millis(row.try_get("last_state_change_at")?)?,
        trigger_count: trigger_count.max(0) as u64,
        last_triggered_at: optional_millis(row.try_get("last_triggered_at")?)?,
        created_at: millis_to_datetime(row.try_get("created_at")?)?,
        groups: load_groups(pool, id).await?,
        actions: load_actions(pool, id).await?,
    })
}

async fn load_groups(pool: &SqlitePool, rule_id: RuleId) -> Result<Vec<ConditionGroup>> {
    let rows = sqlx::query(
        r#"
        SELECT g.group_order, c.condition_order, c.sensor_id, c.operator, c.value, c.value_max
        FROM condition_groups g
        LEFT JOIN conditions c ON c.group_id = g.id
        WHERE g.rule_id = ?
        ORDER BY g.group_order ASC, c.condition_order ASC
        "#,
    )
    .bind(rule_id)
    .fetch_all(pool)
    .await?;

    let mut groups: Vec<ConditionGroup> = Vec::new();
    for row in rows {
        let group_order: i64 = row.try_get("group_order")?;
        if groups.last().map(|g| g.order) != Some(group_order) {
            groups.push(ConditionGroup {
                order: group_order,
                conditions: Vec::new(),
            });
        }

        // LEFT JOIN: a group without conditions yields one row of NULLs
        let Some(sensor_id) = row.try_get::<Option<String>, _>("sensor_id")? else {
            continue;
        };
        let operator: String = row.try_get("operator")?;
        let condition = Condition {
            order: row.try_get("condition_order")?,
            sensor_id,
            operator: operator.parse()?,
            value: row.try_get("value")?,
            value_max: row.try_get("value_max")?,
        };
        if let Some(group) = groups.last_mut() {
            group.conditions.push(condition);
        }
    }
    Ok(groups)
}

async fn load_actions(pool: &SqlitePool, rule_id: RuleId) -> Result<Vec<Action>> {
    let rows = sqlx::query(
        "SELECT actuator_id, kind, value FROM actions WHERE rule_id = ? ORDER BY id ASC",
    )
    .bind(rule_id)
    .fetch_all(pool)
    .await?;

    let mut actions = Vec::with_capacity(rows.len());
    for row in rows {
        let kind: String = row.try_get("kind")?;
        actions.push(Action {
            actuator_id: row.try_get("actuator_id")?,
            kind: kind.parse()?,
            value: row.try_get("value")?,
        });
    }
    Ok(actions)
}

pub(crate) fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| RuleError::InvalidFormat(format!("timestamp out of range: {}", ms)))
}

pub(crate) fn optional_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(millis_to_datetime).transpose()
}
