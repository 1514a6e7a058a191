//! Pool status handlers.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};

use super::error_response;
use crate::manager::PoolManager;

/// Metrics, workers and the last scaling action.
pub async fn pool_status(State(pool): State<PoolManager>) -> Response {
    match pool.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_workers(State(pool): State<PoolManager>) -> Response {
    match pool.worker_snapshots().await {
        Ok(workers) => Json(workers).into_response(),
        Err(e) => error_response(e),
    }
}
