//! Action Dispatcher
//!
//! Turns a winning rule's actions into actuator commands on an external queue.
//! Dispatch is fire-and-forget: the queue returns a command id, delivery to the
//! device happens elsewhere. Every enqueue is bounded by a timeout and never retried
//! here.
//!
//! Queues:
//! - `SqliteCommandQueue`: `actuator_commands` table with device acknowledgement
//! - `MemoryCommandQueue`: in-memory queue for tests and embedding

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, RuleError};
use crate::repository::{millis_to_datetime, optional_millis};
use crate::types::{Action, ActionKind, RuleId};

/// Default enqueue timeout
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_millis(500);

/// Command handed to the actuator command queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorCommand {
    /// Rule that produced the command
    pub rule_id: Option<RuleId>,
    pub actuator_id: String,
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl ActuatorCommand {
    pub fn from_action(rule_id: RuleId, action: &Action) -> Self {
        Self {
            rule_id: Some(rule_id),
            actuator_id: action.actuator_id.clone(),
            kind: action.kind,
            value: action.value,
        }
    }
}

/// Write side of the actuator command queue
#[async_trait]
pub trait CommandQueue: Send + Sync + 'static {
    /// Enqueue a command and return its id
    async fn enqueue(&self, command: &ActuatorCommand) -> Result<String>;
}

/// Action dispatcher with a bounded enqueue
pub struct ActionDispatcher<Q: CommandQueue + ?Sized> {
    queue: Arc<Q>,
    timeout: Duration,
}

impl<Q: CommandQueue + ?Sized> ActionDispatcher<Q> {
    pub fn new(queue: Arc<Q>, timeout: Duration) -> Self {
        Self { queue, timeout }
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Enqueue one action of a winning rule
    pub async fn dispatch(&self, rule_id: RuleId, action: &Action) -> Result<String> {
        let command = ActuatorCommand::from_action(rule_id, action);

        match tokio::time::timeout(self.timeout, self.queue.enqueue(&command)).await {
            Ok(Ok(command_id)) => {
                debug!(
                    rule_id,
                    actuator_id = %command.actuator_id,
                    "Cmd {} {} queued",
                    command_id,
                    command.kind
                );
                Ok(command_id)
            },
            Ok(Err(e)) => {
                warn!(rule_id, actuator_id = %command.actuator_id, "Enqueue err: {}", e);
                Err(RuleError::DispatchError(e.to_string()))
            },
            Err(_) => {
                warn!(rule_id, actuator_id = %command.actuator_id, "Enqueue timeout");
                Err(RuleError::DispatchError(format!(
                    "enqueue timed out after {}ms",
                    self.timeout.as_millis()
                )))
            },
        }
    }
}

// ============================================================================
// SQLite command queue
// ============================================================================

/// Delivery status of a stored command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Acknowledged,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Acknowledged => "acknowledged",
            CommandStatus::Failed => "failed",
        }
    }
}

impl FromStr for CommandStatus {
    type Err = RuleError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "acknowledged" => Ok(CommandStatus::Acknowledged),
            "failed" => Ok(CommandStatus::Failed),
            other => Err(RuleError::InvalidFormat(format!(
                "unknown command status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command as stored in `actuator_commands`
#[derive(Debug, Clone, Serialize)]
pub struct StoredCommand {
    pub id: String,
    pub rule_id: Option<RuleId>,
    pub actuator_id: String,
    pub kind: ActionKind,
    pub value: Option<f64>,
    pub status: CommandStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// SQLite-backed actuator command queue
#[derive(Clone)]
pub struct SqliteCommandQueue {
    pool: SqlitePool,
}

impl SqliteCommandQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a command by id
    pub async fn get(&self, id: &str) -> Result<StoredCommand> {
        let row = sqlx::query(
            r#"
            SELECT id, rule_id, actuator_id, kind, value, status, error, created_at, acknowledged_at
            FROM actuator_commands
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => hydrate_command(row),
            None => Err(RuleError::NotFound(id.to_string())),
        }
    }

    /// Pending commands of an actuator, oldest first (device polling)
    pub async fn pending_for(&self, actuator_id: &str) -> Result<Vec<StoredCommand>> {
        let rows = sqlx::query(
            r#"
            SELECT id, rule_id, actuator_id, kind, value, status, error, created_at, acknowledged_at
            FROM actuator_commands
            WHERE actuator_id = ? AND status = 'pending'
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(actuator_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(hydrate_command).collect()
    }

    /// Record the device's acknowledgement of a pending command
    pub async fn acknowledge(&self, id: &str, success: bool, error: Option<&str>) -> Result<()> {
        let status = if success {
            CommandStatus::Acknowledged
        } else {
            CommandStatus::Failed
        };

        let result = sqlx::query(
            r#"
            UPDATE actuator_commands
            SET status = ?, error = ?, acknowledged_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RuleError::NotFound(format!("pending command {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandQueue for SqliteCommandQueue {
    async fn enqueue(&self, command: &ActuatorCommand) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO actuator_commands (id, rule_id, actuator_id, kind, value, status, created_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&id)
        .bind(command.rule_id)
        .bind(&command.actuator_id)
        .bind(command.kind.as_str())
        .bind(command.value)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }
}

fn hydrate_command(row: SqliteRow) -> Result<StoredCommand> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(StoredCommand {
        id: row.try_get("id")?,
        rule_id: row.try_get("rule_id")?,
        actuator_id: row.try_get("actuator_id")?,
        kind: kind.parse()?,
        value: row.try_get("value")?,
        status: status.parse()?,
        error: row.try_get("error")?,
        created_at: millis_to_datetime(row.try_get("created_at")?)?,
        acknowledged_at: optional_millis(row.try_get("acknowledged_at")?)?,
    })
}

// ============================================================================
// In-memory command queue
// ============================================================================

/// In-memory command queue
#[derive(Default)]
pub struct MemoryCommandQueue {
    commands: Mutex<Vec<(String, ActuatorCommand)>>,
    rejecting: AtomicBool,
    delay: Option<Duration>,
}

impl MemoryCommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that takes `delay` to answer every enqueue
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make every following enqueue fail (or succeed again)
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// All commands enqueued so far, in order
    pub async fn commands(&self) -> Vec<(String, ActuatorCommand)> {
        self.commands.lock().await.clone()
    }
}

#[async_trait]
impl CommandQueue for MemoryCommandQueue {
    async fn enqueue(&self, command: &ActuatorCommand) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(RuleError::DispatchError("queue rejected command".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        self.commands.lock().await.push((id.clone(), command.clone()));
        Ok(id)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::schema::init_schema;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn sqlite_queue() -> SqliteCommandQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        SqliteCommandQueue::new(pool)
    }

    #[tokio::test]
    async fn test_dispatch_returns_command_id() {
        let queue = Arc::new(MemoryCommandQueue::new());
        let dispatcher = ActionDispatcher::new(queue.clone(), DEFAULT_DISPATCH_TIMEOUT);

        let id = dispatcher
            .dispatch(3, &Action::set_value("vent_1", 40.0))
            .await
            .unwrap();

        let commands = queue.commands().await;
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].0, id);
        assert_eq!(commands[0].1.kind, ActionKind::SetValue);
        assert_eq!(commands[0].1.value, Some(40.0));
        assert_eq!(commands[0].1.rule_id, Some(3));
    }

    #[tokio::test]
    async fn test_dispatch_rejection_is_error() {
        let queue = Arc::new(MemoryCommandQueue::new());
        queue.set_rejecting(true);
        let dispatcher = ActionDispatcher::new(queue.clone(), DEFAULT_DISPATCH_TIMEOUT);

        let err = dispatcher.dispatch(1, &Action::on("fan_1")).await;
        assert!(matches!(err, Err(RuleError::DispatchError(_))));
        assert!(queue.commands().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_timeout() {
        let queue = Arc::new(MemoryCommandQueue::with_delay(Duration::from_secs(5)));
        let dispatcher = ActionDispatcher::new(queue, Duration::from_millis(100));

        match dispatcher.dispatch(1, &Action::on("fan_1")).await {
            Err(RuleError::DispatchError(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sqlite_queue_acknowledge_flow() {
        let queue = sqlite_queue().await;
        let id = queue
            .enqueue(&ActuatorCommand::from_action(1, &Action::on("pump_1")))
            .await
            .unwrap();
        let second = queue
            .enqueue(&ActuatorCommand::from_action(1, &Action::off("pump_1")))
            .await
            .unwrap();

        let pending = queue.pending_for("pump_1").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].status, CommandStatus::Pending);

        queue.acknowledge(&id, true, None).await.unwrap();
        queue
            .acknowledge(&second, false, Some("relay stuck"))
            .await
            .unwrap();

        assert!(queue.pending_for("pump_1").await.unwrap().is_empty());
        let failed = queue.get(&second).await.unwrap();
        assert_eq!(failed.status, CommandStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("relay stuck"));
        assert!(failed.acknowledged_at.is_some());

        // Only pending commands can be acknowledged
        assert!(matches!(
            queue.acknowledge(&id, true, None).await,
            Err(RuleError::NotFound(_))
        ));
    }
}
