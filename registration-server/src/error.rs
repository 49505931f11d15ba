use crate::remote::RemoteError;
use crate::services::backup::BackupError;
use crate::services::participants::ParticipantError;
use crate::services::settings_store::PolicyError;
use crate::storage::StorageError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    BadGateway(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            AppError::BadGateway(m) => (StatusCode::BAD_GATEWAY, m.clone()),
            AppError::Storage(e) => {
                tracing::error!("Storage error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to save data".into())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

impl From<ParticipantError> for AppError {
    fn from(e: ParticipantError) -> Self {
        match e {
            ParticipantError::Validation(m) => AppError::BadRequest(m),
            ParticipantError::DuplicateEntry(_) => AppError::Conflict(e.to_string()),
            ParticipantError::NotFound(_) => AppError::NotFound(e.to_string()),
            ParticipantError::Storage(e) => AppError::Storage(e),
        }
    }
}

impl From<PolicyError> for AppError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::Validation(m) => AppError::BadRequest(m),
            PolicyError::Storage(e) => AppError::Storage(e),
        }
    }
}

impl From<BackupError> for AppError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::InProgress => AppError::Conflict(e.to_string()),
            BackupError::NoCredential | BackupError::NothingToBackUp => {
                AppError::BadRequest(e.to_string())
            }
            BackupError::Remote { .. } => AppError::BadGateway(e.to_string()),
            BackupError::Export(_) | BackupError::Record(_) => AppError::Internal(e.into()),
        }
    }
}

impl From<RemoteError> for AppError {
    fn from(e: RemoteError) -> Self {
        AppError::BadGateway(e.to_string())
    }
}
