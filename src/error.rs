use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

pub const CONCURRENT_OPERATION_IN_PROGRESS: &str = "ConcurrentOperationInProgress";
pub const SERVICE_INSTANCE_NOT_READY: &str = "ServiceInstanceNotReady";
pub const DELETION_IN_PROGRESS: &str = "DeletionInProgress";

/// Errors surfaced to API callers and recorded on failed operations.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{description}")]
    UnprocessableEntity {
        error_type: &'static str,
        description: String,
    },

    #[error("{0}")]
    BrokerError(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_request(description: impl Into<String>) -> Self {
        Self::BadRequest(description.into())
    }

    pub fn not_found(description: impl Into<String>) -> Self {
        Self::NotFound(description.into())
    }

    pub fn conflict(description: impl Into<String>) -> Self {
        Self::Conflict(description.into())
    }

    pub fn broker(description: impl Into<String>) -> Self {
        Self::BrokerError(description.into())
    }

    pub fn concurrent_operation(resource_id: &str) -> Self {
        Self::UnprocessableEntity {
            error_type: CONCURRENT_OPERATION_IN_PROGRESS,
            description: format!(
                "another operation for resource {} is in progress",
                resource_id
            ),
        }
    }

    pub fn instance_not_ready(instance_id: &str) -> Self {
        Self::UnprocessableEntity {
            error_type: SERVICE_INSTANCE_NOT_READY,
            description: format!("service instance {} is not ready", instance_id),
        }
    }

    pub fn deletion_in_progress(instance_id: &str) -> Self {
        Self::UnprocessableEntity {
            error_type: DELETION_IN_PROGRESS,
            description: format!(
                "could not create binding: service instance {} is being deleted",
                instance_id
            ),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::UnprocessableEntity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BrokerError(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine readable tag used in response bodies and operation errors.
    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::NotFound(_) => "NotFound",
            ApiError::Conflict(_) => "Conflict",
            ApiError::UnprocessableEntity { error_type, .. } => *error_type,
            ApiError::BrokerError(_) => "BrokerError",
            ApiError::Internal(_) => "InternalError",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::UniqueViolation { .. } => ApiError::Conflict(err.to_string()),
            StoreError::TypeMismatch { .. } => ApiError::Internal(anyhow::Error::new(err)),
            StoreError::Internal(inner) => ApiError::Internal(inner),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub description: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("Request failed with {}: {:#}", status, self);
        }
        let body = ErrorResponse {
            error: self.error_type().to_string(),
            description: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
