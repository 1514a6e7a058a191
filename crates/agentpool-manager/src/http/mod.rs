//! HTTP status surface for the pool.
//!
//! Provides endpoints for:
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)
//! - Pool status and worker list (`/v1/status`, `/v1/workers`)
//! - Task submission and cancellation (`/v1/tasks`)

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::manager::PoolManager;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(pool: PoolManager) -> Router {
    Router::new()
        // API routes
        .route("/v1/status", get(handlers::pool_status))
        .route("/v1/workers", get(handlers::list_workers))
        .route("/v1/tasks", post(handlers::submit_task))
        .route("/v1/tasks/:id", delete(handlers::cancel_task))
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_config, wait_for_idle, FailingLauncher, InProcessLauncher};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn pool() -> PoolManager {
        let config = test_config(1, 1);
        let launcher = InProcessLauncher::new(&config);
        PoolManager::start(config, launcher).unwrap()
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn post_task(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/tasks")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_live_workers() {
        let pool = pool();
        wait_for_idle(&pool, 1).await;
        let (status, body) = send(create_router(pool.clone()), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["workers"]["idle"], 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_unavailable_without_workers() {
        let pool = PoolManager::start(test_config(1, 1), Arc::new(FailingLauncher)).unwrap();
        let (status, _) = send(create_router(pool.clone()), get("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        pool.shutdown().await.unwrap();
        let (status, body) = send(create_router(pool), get("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "shutting_down");
    }

    #[tokio::test]
    async fn test_metrics_is_prometheus_text() {
        let pool = pool();
        let response = create_router(pool.clone()).oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("agentpool_queue_depth"));
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_and_cancel_task() {
        let pool = pool();
        let router = create_router(pool.clone());

        let (status, body) = send(
            router.clone(),
            post_task(r#"{"id":"long","kind":"shell","command":"sleep 30"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["task_id"], "long");

        let cancel = || {
            Request::builder()
                .method("DELETE")
                .uri("/v1/tasks/long")
                .body(Body::empty())
                .unwrap()
        };
        let (status, body) = send(router.clone(), cancel()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["outcome"] == "dequeued" || body["outcome"] == "abort_requested");

        // Wait for the cancellation to land, then it is a conflict.
        tokio::time::timeout(std::time::Duration::from_secs(15), async {
            loop {
                let (status, _) = send(router.clone(), cancel()).await;
                if status == StatusCode::CONFLICT {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let missing = Request::builder()
            .method("DELETE")
            .uri("/v1/tasks/nope")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(router, missing).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_input() {
        let pool = pool();
        let router = create_router(pool.clone());

        let (status, body) = send(router.clone(), post_task("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = send(router.clone(), post_task(r#"{"kind":"shell","command":""}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            router,
            post_task(r#"{"kind":"shell","command":"true","depends_on":["ghost"]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_and_workers() {
        let pool = pool();
        wait_for_idle(&pool, 1).await;
        let router = create_router(pool.clone());

        let (status, body) = send(router.clone(), get("/v1/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["metrics"]["total_workers"], 1);

        let (status, body) = send(router, get("/v1/workers")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));
        assert_eq!(body[0]["status"], "IDLE");
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_unavailable() {
        let pool = pool();
        pool.shutdown().await.unwrap();
        let (status, _) = send(
            create_router(pool),
            post_task(r#"{"kind":"shell","command":"true"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
