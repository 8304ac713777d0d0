//! Job API: Axum web server over `LendingService`.
//!
//! Thin HTTP façade for submitting and polling background jobs and for
//! reading the stored loans.
//! CORS enabled for local tooling.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use routes::AppState;

/// Bind `port` and serve the API until `shutdown` is cancelled.
pub async fn serve_api(state: AppState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API port {port}"))?;
    info!(port, "Job API listening on http://localhost:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Job API server error")?;

    info!("Job API stopped");
    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/jobs", get(routes::list_jobs))
        .route("/api/jobs/harvest", post(routes::submit_harvest))
        .route("/api/jobs/bid", post(routes::submit_bid))
        .route("/api/jobs/analyze/:loan_id", post(routes::submit_analysis))
        .route(
            "/api/jobs/:job_id",
            get(routes::get_job).delete(routes::cancel_job),
        )
        .route("/api/loans", get(routes::list_loans))
        .route("/api/loans/stats", get(routes::loan_stats))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::engine::{JobRegistry, LendingService};
    use crate::marketplace::Marketplace;
    use crate::storage::JsonLoanStore;
    use crate::types::Credentials;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    const UNREACHABLE: &str = "http://127.0.0.1:9";

    fn test_state() -> AppState {
        // Nothing listens on the discard port; jobs fail, routing is what matters.
        state_for(UNREACHABLE)
    }

    fn state_for(origin: &str) -> AppState {
        let mut config = AppConfig::from_toml("[marketplace]\n").unwrap();
        config.marketplace.base_url = origin.to_string();
        config.marketplace.api_base_url = origin.to_string();
        let creds = Credentials::new("a@b.se", "pw", None).unwrap();
        let marketplace = Marketplace::new(&config, creds).unwrap();
        Arc::new(LendingService::new(
            marketplace,
            Arc::new(JsonLoanStore::in_memory()),
            JobRegistry::new(&config.jobs),
            config.harvest.default_max_pages,
        ))
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submit_harvest_then_poll() {
        let state = test_state();
        let app = build_router(state.clone());

        let resp = app
            .clone()
            .oneshot(post_json("/api/jobs/harvest", r#"{"max_pages": 2}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let job_id = json_body(resp).await["job_id"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/jobs/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let job = json_body(resp).await;
        assert_eq!(job["kind"]["type"], "harvest");
        assert_eq!(job["kind"]["max_pages"], 2);

        let resp = app
            .oneshot(Request::builder().uri("/api/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(resp).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_harvest_without_body_uses_default_pages() {
        let app = build_router(test_state());
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/jobs/harvest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = app
            .oneshot(Request::builder().uri("/api/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(resp).await[0]["kind"]["max_pages"], 10);
    }

    #[tokio::test]
    async fn test_invalid_bid_is_bad_request() {
        let app = build_router(test_state());
        let resp = app
            .oneshot(post_json(
                "/api/jobs/bid",
                r#"{"loan_id": 5, "amount": 0, "payment_option": "ip"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["kind"], "validation");
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let app = build_router(test_state());
        let uri = format!("/api/jobs/{}", uuid::Uuid::new_v4());
        let resp = app
            .clone()
            .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .oneshot(Request::builder().method("DELETE").uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_pending_analysis() {
        // A slow login page keeps the job pending while we cancel it.
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::path("/user/login"))
            .respond_with(
                wiremock::ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let app = build_router(state_for(&server.uri()));
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/jobs/analyze/42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let job_id = json_body(resp).await["job_id"].as_str().unwrap().to_string();

        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/jobs/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["cancelled"], true);
    }

    #[tokio::test]
    async fn test_stored_loans_and_stats() {
        let app = build_router(test_state());

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/api/loans").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let page = json_body(resp).await;
        assert_eq!(page["total"], 0);
        assert_eq!(page["page"], 1);
        assert_eq!(page["limit"], 50);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/loans?page=0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(Request::builder().uri("/api/loans/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["total_loans"], 0);
    }
}
