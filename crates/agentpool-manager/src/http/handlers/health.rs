//! Health and metrics handlers.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use super::error_response;
use crate::http::responses::HealthResponse;
use crate::manager::PoolManager;

/// Health check endpoint: 200 while at least one worker is live.
pub async fn health_check(State(pool): State<PoolManager>) -> Response {
    let Ok(metrics) = pool.metrics().await else {
        let body = HealthResponse {
            status: "shutting_down",
            workers: Default::default(),
            queue_depth: 0,
        };
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    };

    let (code, status) = if metrics.total_workers > 0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    let body = HealthResponse {
        status,
        workers: metrics.workers,
        queue_depth: metrics.queue_depth,
    };
    (code, Json(body)).into_response()
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(pool): State<PoolManager>) -> Response {
    match pool.metrics().await {
        Ok(metrics) => {
            let body = crate::metrics::render_prometheus(&metrics);
            ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
        }
        Err(e) => error_response(e),
    }
}
