//! API request/response models
//!
//! Success: `{"success":true,"data":...}`
//! Error: `{"success":false,"error":{"code":404,"message":"..."}}`

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use greenhouse_rules::{PassReport, RuleError};
use serde::{Deserialize, Serialize};

/// Standard success response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Standard error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: u16,
    pub message: String,
}

/// Handler error with HTTP status code
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                success: false,
                error: ErrorInfo {
                    code: self.status.as_u16(),
                    message: self.message,
                },
            }),
        )
            .into_response()
    }
}

impl From<RuleError> for ApiError {
    fn from(err: RuleError) -> Self {
        match err {
            RuleError::NotFound(_) => Self::not_found(err.to_string()),
            RuleError::InvalidDefinition(_)
            | RuleError::InvalidFormat(_)
            | RuleError::SchedulerError(_) => Self::bad_request(err.to_string()),
            _ => Self::internal_error(err.to_string()),
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Body of `POST /api/readings`
#[derive(Debug, Clone, Deserialize)]
pub struct ReadingRequest {
    pub device_id: String,
    pub sensor_id: String,
    pub value: f64,
    /// Defaults to the time of receipt
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Query of `GET /api/rules/{id}/executions`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Body of `POST /api/commands/{id}/ack`
#[derive(Debug, Clone, Deserialize)]
pub struct AckRequest {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

// ============================================================================
// Responses
// ============================================================================

/// Result of `POST /api/readings`
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    /// False when the reading was an exact duplicate and nothing ran
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<PassReport>,
}
