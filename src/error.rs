use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is required")]
    MissingField { field: &'static str },

    #[error("{field} is outside valid latitude/longitude ranges")]
    InvalidLocation { field: &'static str },

    #[error("{field} must be positive")]
    NotPositive { field: &'static str },
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("an active assignment already exists for order {0}")]
    AlreadyActive(String),

    #[error("assignment store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error)]
pub enum DirectoryError {
    #[error("courier directory unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    #[error("no subscribers for assignment events")]
    NoSubscribers,

    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid assignment input: {0}")]
    Validation(#[from] ValidationError),

    #[error("an active assignment already exists for order {0}")]
    AlreadyActive(String),

    #[error("{actor} may not cancel order {order_id}")]
    Forbidden { actor: String, order_id: String },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyActive(order_id) => DispatchError::AlreadyActive(order_id),
            other => DispatchError::Store(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation(err) => AppError::BadRequest(err.to_string()),
            err @ DispatchError::AlreadyActive(_) => AppError::Conflict(err.to_string()),
            err @ DispatchError::Forbidden { .. } => AppError::Forbidden(err.to_string()),
            DispatchError::Store(err) => AppError::Unavailable(err.to_string()),
            DispatchError::Directory(err) => AppError::Unavailable(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
