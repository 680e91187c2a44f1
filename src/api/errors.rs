//! API Error Handling
//!
//! Structured error responses with HTTP status codes and request tracking.

use crate::errors::{OperatorError, StorageError, WagerError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// Top-level API error response with request tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable reason code (ROUND_LOCKED, NOT_FOUND, ...)
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
    /// Machine-readable context, e.g. the period that is actually open
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    /// A wager was refused; carries the engine's reason code
    Rejected { code: &'static str, message: String },
    Conflict { code: &'static str, message: String },
    InternalError(String),
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn not_found(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::NotFound(message),
            request_id,
            details: None,
        }
    }

    pub fn bad_request(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::BadRequest(message),
            request_id,
            details: None,
        }
    }

    pub fn unauthorized(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::Unauthorized(message),
            request_id,
            details: None,
        }
    }

    pub fn internal_error(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::InternalError(message),
            request_id,
            details: None,
        }
    }

    pub fn service_unavailable(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::ServiceUnavailable(message),
            request_id,
            details: None,
        }
    }

    pub fn from_wager(request_id: String, error: WagerError) -> Self {
        let kind = match &error {
            WagerError::UnknownMode(_) | WagerError::NotFound(_) => ApiErrorKind::NotFound(error.to_string()),
            WagerError::Unavailable(msg) => ApiErrorKind::ServiceUnavailable(msg.clone()),
            WagerError::DuplicateId(_) | WagerError::InProgress(_) => ApiErrorKind::Conflict {
                code: error.code(),
                message: error.to_string(),
            },
            _ => ApiErrorKind::Rejected {
                code: error.code(),
                message: error.to_string(),
            },
        };
        Self {
            kind,
            request_id,
            details: wager_details(&error),
        }
    }

    pub fn from_operator(request_id: String, error: OperatorError) -> Self {
        let kind = match &error {
            OperatorError::UnknownMode(_) => ApiErrorKind::NotFound(error.to_string()),
            OperatorError::Superseded { .. } => ApiErrorKind::Conflict {
                code: "SUPERSEDED",
                message: error.to_string(),
            },
            OperatorError::StrategyMismatch { .. } => ApiErrorKind::Conflict {
                code: "STRATEGY_MISMATCH",
                message: error.to_string(),
            },
            OperatorError::InvalidNumber(_)
            | OperatorError::UnsupportedMode(_)
            | OperatorError::InvalidSettings(_) => ApiErrorKind::BadRequest(error.to_string()),
        };
        let details = match &error {
            OperatorError::Superseded { period } => Some(json!({ "period": period })),
            _ => None,
        };
        Self {
            kind,
            request_id,
            details,
        }
    }

    pub fn from_storage(request_id: String, error: StorageError) -> Self {
        Self::internal_error(request_id, format!("Storage failure: {}", error))
    }
}

fn wager_details(error: &WagerError) -> Option<serde_json::Value> {
    match error {
        WagerError::PeriodMismatch { requested, current } => {
            Some(json!({ "requested": requested, "current": current }))
        }
        WagerError::RoundLocked { period } => Some(json!({ "period": period })),
        WagerError::BelowMinimum { amount, min } => Some(json!({ "amount": amount, "min": min })),
        WagerError::AboveMaximum { amount, max } => Some(json!({ "amount": amount, "max": max })),
        WagerError::DuplicateId(id) | WagerError::InProgress(id) => Some(json!({ "wager_id": id })),
        _ => None,
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ApiErrorKind::NotFound(msg) => write!(f, "[{}] Not Found: {}", self.request_id, msg),
            ApiErrorKind::BadRequest(msg) => write!(f, "[{}] Bad Request: {}", self.request_id, msg),
            ApiErrorKind::Unauthorized(msg) => write!(f, "[{}] Unauthorized: {}", self.request_id, msg),
            ApiErrorKind::Rejected { code, message } => write!(f, "[{}] Rejected {}: {}", self.request_id, code, message),
            ApiErrorKind::Conflict { code, message } => write!(f, "[{}] Conflict {}: {}", self.request_id, code, message),
            ApiErrorKind::InternalError(msg) => write!(f, "[{}] Internal Error: {}", self.request_id, msg),
            ApiErrorKind::ServiceUnavailable(msg) => write!(f, "[{}] Service Unavailable: {}", self.request_id, msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self.kind {
            ApiErrorKind::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiErrorKind::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiErrorKind::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            ApiErrorKind::Rejected { code, message } => (StatusCode::UNPROCESSABLE_ENTITY, code, message),
            ApiErrorKind::Conflict { code, message } => (StatusCode::CONFLICT, code, message),
            ApiErrorKind::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiErrorKind::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg),
        };

        let body = Json(ErrorResponse {
            request_id: self.request_id,
            error: ErrorBody {
                code: code.to_string(),
                message,
                details: self.details,
            },
        });

        (status, body).into_response()
    }
}
