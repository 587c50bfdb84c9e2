use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use taskmgr_core::TaskManagerError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    TaskManager(#[from] TaskManagerError),
}

impl ApiError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::TaskManager(error) => match error {
                TaskManagerError::ObjectNotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                TaskManagerError::AlreadyExists { .. } => (StatusCode::CONFLICT, "ALREADY_EXISTS"),
                TaskManagerError::StateConflict { .. } => (StatusCode::CONFLICT, "STATE_CONFLICT"),
                TaskManagerError::SchemaViolation(_) | TaskManagerError::InvalidCron { .. } => {
                    (StatusCode::BAD_REQUEST, "SCHEMA_VIOLATION")
                }
                TaskManagerError::Scheduler(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "SCHEDULER_UNAVAILABLE")
                }
                TaskManagerError::CommunicationFailure { .. } => {
                    (StatusCode::BAD_GATEWAY, "COMMUNICATION_FAILURE")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        if status.is_server_error() {
            tracing::error!("请求处理失败: {}", self);
        }

        let body = Json(json!({
            "success": false,
            "data": null,
            "message": self.to_string(),
            "error_type": error_type,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
