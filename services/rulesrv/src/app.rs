//! Application state and initialization logic
//!
//! One SQLite database holds rules, sensor values, the command queue and the
//! execution log. The engine, scheduler and HTTP handlers share it through
//! `AppState`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use greenhouse_rules::{
    init_schema, RuleEngine, RuleScheduler, SqliteCommandQueue, SqliteSensorStore,
    DEFAULT_TICK_MS,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{Config, DatabaseConfig};
use crate::ingest::ReadingDeduplicator;

pub type Engine = RuleEngine<SqliteSensorStore, SqliteCommandQueue>;
pub type Scheduler = RuleScheduler<SqliteSensorStore, SqliteCommandQueue>;

/// Application state shared across all handlers
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub engine: Arc<Engine>,
    pub sensors: Arc<SqliteSensorStore>,
    pub commands: Arc<SqliteCommandQueue>,
    pub scheduler: Arc<Scheduler>,
    pub dedup: ReadingDeduplicator,
}

/// Open (and create if missing) the SQLite database
pub async fn open_database(config: &DatabaseConfig) -> anyhow::Result<SqlitePool> {
    if let Some(dir) = std::path::Path::new(&config.path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(&config.path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", config.path))?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Build the state on top of an initialized pool
pub async fn build_app_state(config: Config, pool: SqlitePool) -> anyhow::Result<Arc<AppState>> {
    let sensors = Arc::new(SqliteSensorStore::new(pool.clone()));
    let commands = Arc::new(SqliteCommandQueue::new(pool.clone()));
    let engine = Arc::new(RuleEngine::new(
        pool.clone(),
        sensors.clone(),
        commands.clone(),
        config.engine.engine_config(),
    ));

    let scheduler = Arc::new(RuleScheduler::new(engine.clone(), DEFAULT_TICK_MS));
    scheduler.register_all(&config.schedules).await?;

    Ok(Arc::new(AppState {
        config: Arc::new(config),
        pool,
        engine,
        sensors,
        commands,
        scheduler,
        dedup: ReadingDeduplicator::new(),
    }))
}

/// Open the configured database and build the state
pub async fn create_app_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let pool = open_database(&config.database).await?;
    build_app_state(config, pool).await
}

/// Periodic execution log retention
pub fn spawn_retention(state: Arc<AppState>) -> JoinHandle<()> {
    let policy = state.config.retention.policy();
    let every = Duration::from_secs(state.config.retention.interval_secs);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match state.engine.execution_log().prune(&policy, Utc::now()).await {
                Ok(0) => {},
                Ok(n) => info!("Retention removed {} log entries", n),
                Err(e) => error!("Retention err: {}", e),
            }
        }
    })
}
