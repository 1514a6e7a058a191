//! Task submission and cancellation handlers.

use agentpool_core::{Task, TaskId};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{info, warn};

use super::error_response;
use crate::http::responses::{CancelResponse, ErrorResponse, SubmitResponse};
use crate::manager::PoolManager;

/// Queue a task. Responds once it is queued, not when it finishes.
pub async fn submit_task(
    State(pool): State<PoolManager>,
    payload: Result<Json<Task>, JsonRejection>,
) -> Response {
    let task = match payload {
        Ok(Json(task)) => task,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Rejected task submission");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(rejection.body_text())),
            )
                .into_response();
        }
    };

    match pool.submit(task).await {
        Ok(handle) => {
            info!(task_id = %handle.task_id(), "Task submitted over HTTP");
            let body = SubmitResponse {
                task_id: handle.task_id().clone(),
            };
            (StatusCode::CREATED, Json(body)).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn cancel_task(State(pool): State<PoolManager>, Path(id): Path<String>) -> Response {
    let task_id = TaskId::new(id);
    match pool.cancel(&task_id).await {
        Ok(outcome) => (
            StatusCode::ACCEPTED,
            Json(CancelResponse { task_id, outcome }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}
