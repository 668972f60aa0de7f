//! ReaderLoop API Gateway
//!
//! The HTTP surface of the review lifecycle engine.
//! Handles:
//! - Reader review submission and reader-facing views
//! - Admin decisions, issues and replacement dispatch
//! - Monitoring results and ledger queries
//! - Observability (logging, metrics, request ids) and rate limiting

mod extractors;
mod handlers;
mod middleware;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use readerloop_common::{
    config::{AppConfig, ObservabilityConfig},
    db::{schema, DbPool},
    metrics, ReviewEngine,
};
use std::net::SocketAddr;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub engine: ReviewEngine,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    init_tracing(&config.observability);

    info!("Starting ReaderLoop API Gateway v{}", readerloop_common::VERSION);

    // Initialize metrics; descriptions need the recorder installed first
    if config.observability.metrics_port != 0 {
        let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()?;
        info!("Prometheus exporter listening on {}", metrics_addr);
    }
    metrics::register_metrics();

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    if config.database.auto_migrate {
        schema::ensure_schema(db.write()).await?;
    }

    let engine = ReviewEngine::from_config(&config, db.clone()).await?;
    let state = AppState { db, engine };

    // Build the router
    let app = create_router(state, &config);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Create the main application router
fn create_router(state: AppState, config: &AppConfig) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // API routes
    let mut api_routes = Router::new()
        // Health endpoints (no identity)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))

        // Reviews
        .route(
            "/reviews",
            post(handlers::reviews::submit_review).get(handlers::reviews::list_reviews),
        )
        .route("/reviews/{id}", get(handlers::reviews::get_review))
        .route("/reviews/{id}/decision", post(handlers::reviews::decide))
        .route("/reviews/decisions/bulk", post(handlers::reviews::bulk_decide))
        .route(
            "/reviews/{id}/issues",
            post(handlers::issues::create_issue).get(handlers::reviews::get_review_issues),
        )
        .route(
            "/reviews/{id}/replacement",
            post(handlers::reviews::redispatch_replacement),
        )
        .route(
            "/books/{id}/replacements",
            get(handlers::reviews::pending_replacements),
        )

        // Reader views
        .route("/reader/reviews/{id}", get(handlers::reviews::get_reader_review))
        .route(
            "/reader/assignments/{id}/review",
            get(handlers::reviews::get_assignment_review),
        )

        // Issues
        .route("/issues/{id}/resolve", post(handlers::issues::resolve_issue))
        .route(
            "/issues/{id}/resubmission",
            post(handlers::issues::request_resubmission),
        )

        // Monitoring
        .route(
            "/monitoring/{id}/result",
            post(handlers::monitoring::report_check_result),
        )
        .route("/monitoring/stats", get(handlers::monitoring::stats))

        // Ledger
        .route("/readers/{id}/balance", get(handlers::ledger::balance))
        .route("/readers/{id}/ledger", get(handlers::ledger::entries))
        .route(
            "/readers/{id}/adjustments",
            post(handlers::ledger::record_adjustment),
        )
        .layer(from_fn(middleware::metrics::track_requests));

    if config.rate_limit.enabled {
        let limiter = middleware::rate_limit::create_rate_limiter(&config.rate_limit);
        api_routes = api_routes.layer(from_fn_with_state(
            limiter,
            middleware::rate_limit::rate_limit_middleware,
        ));
    } else {
        warn!("Rate limiting disabled");
    }

    // Compose the app
    Router::new()
        .nest("/v1", api_routes)
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractors::{ADMIN_HEADER, READER_HEADER};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn test_app(config: AppConfig) -> Router {
        let db = DbPool::sqlite_memory().await.unwrap();
        schema::ensure_schema(db.write()).await.unwrap();
        let engine = ReviewEngine::from_config(&config, db.clone()).await.unwrap();
        create_router(AppState { db, engine }, &config)
    }

    fn quiet_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.notifications.provider = "none".to_string();
        config.rate_limit.enabled = false;
        config
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn get(uri: &str, header: Option<(&str, Uuid)>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some((name, id)) = header {
            builder = builder.header(name, id.to_string());
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, admin: Uuid, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(ADMIN_HEADER, admin.to_string())
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_request_id() {
        let app = test_app(quiet_config()).await;
        let response = app.clone().oneshot(get("/v1/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));

        let (status, body) = send(&app, get("/v1/ready", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[tokio::test]
    async fn test_admin_routes_require_identity() {
        let app = test_app(quiet_config()).await;
        let uri = format!("/v1/reviews/{}", Uuid::new_v4());

        let (status, _) = send(&app, get(&uri, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(&app, get(&uri, Some((ADMIN_HEADER, Uuid::new_v4())))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn test_balance_visible_to_owner_only() {
        let app = test_app(quiet_config()).await;
        let reader = Uuid::new_v4();
        let uri = format!("/v1/readers/{}/balance", reader);

        let (status, body) = send(&app, get(&uri, Some((READER_HEADER, reader)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance_cents"], 0);

        let (status, _) = send(&app, get(&uri, Some((READER_HEADER, Uuid::new_v4())))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(&app, get(&uri, Some((ADMIN_HEADER, Uuid::new_v4())))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_reject_without_issue_type_is_bad_request() {
        let app = test_app(quiet_config()).await;
        let uri = format!("/v1/reviews/{}/decision", Uuid::new_v4());
        let (status, _) = send(
            &app,
            post_json(&uri, Uuid::new_v4(), serde_json::json!({ "action": "REJECT" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bulk_decision_reports_each_failure() {
        let app = test_app(quiet_config()).await;
        let ids = [Uuid::new_v4(), Uuid::new_v4()];
        let (status, body) = send(
            &app,
            post_json(
                "/v1/reviews/decisions/bulk",
                Uuid::new_v4(),
                serde_json::json!({ "review_ids": ids, "action": "APPROVE" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["succeeded"].as_array().unwrap().len(), 0);
        assert_eq!(body["failed"].as_array().unwrap().len(), 2);

        let (status, _) = send(
            &app,
            post_json(
                "/v1/reviews/decisions/bulk",
                Uuid::new_v4(),
                serde_json::json!({ "review_ids": [], "action": "APPROVE" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_monitoring_stats_empty() {
        let app = test_app(quiet_config()).await;
        let (status, body) = send(
            &app,
            get("/v1/monitoring/stats", Some((ADMIN_HEADER, Uuid::new_v4()))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active"], 0);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_over_burst() {
        let mut config = quiet_config();
        config.rate_limit.enabled = true;
        config.rate_limit.requests_per_second = 1;
        config.rate_limit.burst = 1;
        let app = test_app(config).await;

        let (first, _) = send(&app, get("/v1/health", None)).await;
        let (second, _) = send(&app, get("/v1/health", None)).await;
        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
    }
}
