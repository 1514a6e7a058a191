//! HTTP request handlers.

mod health;
mod status;
mod tasks;

pub use health::{health_check, metrics_handler};
pub use status::{list_workers, pool_status};
pub use tasks::{cancel_task, submit_task};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::PoolError;
use crate::http::responses::ErrorResponse;

/// Map a manager error onto an HTTP status.
pub(crate) fn error_response(error: PoolError) -> Response {
    let status = match &error {
        PoolError::Validation(_) | PoolError::UnknownDependency(_) | PoolError::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        PoolError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        PoolError::AlreadyTerminal(_) => StatusCode::CONFLICT,
        PoolError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(ErrorResponse::new(error))).into_response()
}
