//! REST response envelope shared by every `/api` handler.
//!
//! Success bodies are `{"success": true, "data": ...}` (or `count`/`message`);
//! failures are `{"success": false, "message": ...}` with a matching status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::notifications::dispatcher::DispatchError;
use crate::notifications::store::NotificationError;
use crate::rides::RideError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn data(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            count: None,
            message: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn count(count: u64) -> Self {
        Self {
            success: true,
            data: None,
            count: Some(count),
            message: None,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            count: None,
            message: Some(message.into()),
        }
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiFailure>;

#[derive(Debug, thiserror::Error)]
pub enum ApiFailure {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiFailure {
    pub fn forbidden() -> Self {
        Self::Forbidden("Insufficient permissions".to_string())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            tracing::error!(error = %detail, "Request failed");
        }
        let status = self.status();
        let message = match &self {
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            count: None,
            message: Some(message),
        };
        (status, Json(body)).into_response()
    }
}

impl From<NotificationError> for ApiFailure {
    fn from(e: NotificationError) -> Self {
        match e {
            NotificationError::NotFound => Self::NotFound("Notification not found".to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<DispatchError> for ApiFailure {
    fn from(e: DispatchError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<RideError> for ApiFailure {
    fn from(e: RideError) -> Self {
        match e {
            RideError::NotFound => Self::NotFound(e.to_string()),
            RideError::Conflict(_) | RideError::InvalidState(_) => Self::Conflict(e.to_string()),
            RideError::Forbidden(_) => Self::Forbidden(e.to_string()),
            RideError::Storage(_) | RideError::Dispatch(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiFailure {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Task join error: {}", e))
    }
}
