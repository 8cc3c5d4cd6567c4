//! API routes and handlers for Rule Service
//!
//! Reading ingestion, scheduled ticks, execution history and the device-side
//! command polling/acknowledgement flow.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use greenhouse_rules::{
    get_rule, ExecutionLogEntry, PassReport, Reading, RuleId, SchedulerStatus, StoredCommand,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api_types::{
    AckRequest, ApiError, HistoryQuery, IngestResponse, ReadingRequest, SuccessResponse,
};
use crate::app::AppState;
use crate::ingest::ingest_reading;

/// Default and maximum page size for execution history
pub const DEFAULT_HISTORY_LIMIT: u32 = 100;
pub const MAX_HISTORY_LIMIT: u32 = 1000;

type ApiResult<T> = Result<Json<SuccessResponse<T>>, ApiError>;

/// Create all API routes with state
pub fn create_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/readings", post(post_reading))
        .route("/api/rules/{id}/tick", post(tick_rule))
        .route("/api/rules/{id}/executions", get(rule_executions))
        .route("/api/actuators/{id}/commands", get(pending_commands))
        .route("/api/commands/{id}/ack", post(ack_command))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    service: &'static str,
    scheduler: SchedulerStatus,
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<SuccessResponse<HealthStatus>> {
    Json(SuccessResponse::new(HealthStatus {
        status: "ok",
        service: "rulesrv",
        scheduler: state.scheduler.status().await,
    }))
}

/// Accept a sensor reading and run the evaluation pass
async fn post_reading(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReadingRequest>,
) -> ApiResult<IngestResponse> {
    let reading = Reading::new(
        req.device_id,
        req.sensor_id,
        req.value,
        req.timestamp.unwrap_or_else(Utc::now),
    );

    let report = ingest_reading(&state, reading).await?;
    Ok(Json(SuccessResponse::new(IngestResponse {
        accepted: report.is_some(),
        report,
    })))
}

/// Run a scheduled tick for a rule now
async fn tick_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RuleId>,
) -> ApiResult<PassReport> {
    info!(rule_id = id, "Manual tick");
    let report = state.scheduler.execute_rule(id).await?;
    Ok(Json(SuccessResponse::new(report)))
}

/// Execution history of a rule, newest first
async fn rule_executions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RuleId>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<ExecutionLogEntry>> {
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Err(ApiError::bad_request("'from' must not be after 'to'"));
        }
    }
    get_rule(&state.pool, id).await?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let entries = state
        .engine
        .execution_log()
        .history(id, query.from, query.to, limit)
        .await?;
    Ok(Json(SuccessResponse::new(entries)))
}

/// Pending commands of an actuator (device polling)
async fn pending_commands(
    State(state): State<Arc<AppState>>,
    Path(actuator_id): Path<String>,
) -> ApiResult<Vec<StoredCommand>> {
    let commands = state.commands.pending_for(&actuator_id).await?;
    Ok(Json(SuccessResponse::new(commands)))
}

/// Device acknowledgement of a delivered command
async fn ack_command(
    State(state): State<Arc<AppState>>,
    Path(command_id): Path<String>,
    Json(req): Json<AckRequest>,
) -> ApiResult<StoredCommand> {
    state
        .commands
        .acknowledge(&command_id, req.success, req.error.as_deref())
        .await?;
    let command = state.commands.get(&command_id).await?;
    Ok(Json(SuccessResponse::new(command)))
}
