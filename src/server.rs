//! REST surface over the orchestrator.
//!
//! Every handler answers HTTP 200; failures ride inside the response body as
//! `success = false` envelopes with the error taxonomy code, so clients parse
//! exactly one shape per endpoint.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use crate::config::HttpConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{DatabaseSchema, QueryRequest, QueryResponse};
use crate::orchestrator::QueryOrchestrator;

/// Builds the API router. The returned router owns its state and can be
/// served directly or driven in-process by tests.
pub fn build_router(gateway: Arc<QueryOrchestrator>, http: &HttpConfig) -> Router {
    let mut router = Router::new()
        .route("/api/query", post(post_query))
        .route("/api/databases", get(list_databases))
        .route("/api/databases/:database/schema", get(get_schema))
        .route("/api/stats", get(get_stats))
        .route("/health", get(health))
        .layer(RequestBodyLimitLayer::new(http.max_body_bytes))
        .with_state(gateway);

    if let Some(cors) = cors_layer(http) {
        router = router.layer(cors);
    }
    router
}

/// Binds the configured address and serves until ctrl-c.
pub async fn serve(gateway: Arc<QueryOrchestrator>, http: HttpConfig) -> GatewayResult<()> {
    let addr = format!("{}:{}", http.host, http.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        GatewayError::internal_error(format!("Failed to bind {addr}: {e}"))
    })?;
    tracing::info!(addr = %addr, "HTTP server listening");

    let router = build_router(Arc::clone(&gateway), &http);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::internal_error(format!("HTTP server error: {e}")))?;

    tracing::info!("HTTP server stopped");
    gateway.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to install ctrl-c handler");
        // Without a signal handler the server would never stop; park instead
        // of returning so it keeps serving.
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

fn cors_layer(http: &HttpConfig) -> Option<CorsLayer> {
    if http.cors_allow_all {
        return Some(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    if http.cors_origins.is_empty() {
        return None;
    }

    let origins: Vec<HeaderValue> = http
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

async fn post_query(
    State(gateway): State<Arc<QueryOrchestrator>>,
    Json(request): Json<QueryRequest>,
) -> Json<QueryResponse> {
    Json(gateway.execute_query(request).await)
}

#[derive(Debug, Serialize)]
struct DatabaseListing {
    databases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    default: Option<String>,
}

async fn list_databases(
    State(gateway): State<Arc<QueryOrchestrator>>,
) -> Json<DatabaseListing> {
    Json(DatabaseListing {
        databases: gateway.database_names(),
        default: gateway.default_database(),
    })
}

#[derive(Debug, Serialize)]
struct SchemaEnvelope {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<Arc<DatabaseSchema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<GatewayError>,
}

async fn get_schema(
    State(gateway): State<Arc<QueryOrchestrator>>,
    Path(database): Path<String>,
) -> Json<SchemaEnvelope> {
    match gateway.schema(&database).await {
        Ok(schema) => Json(SchemaEnvelope {
            success: true,
            schema: Some(schema),
            error: None,
        }),
        Err(error) => Json(SchemaEnvelope {
            success: false,
            schema: None,
            error: Some(error),
        }),
    }
}

async fn get_stats(State(gateway): State<Arc<QueryOrchestrator>>) -> Json<serde_json::Value> {
    let stats = gateway.stats();
    Json(serde_json::to_value(&stats).unwrap_or_else(|_| json!({})))
}

async fn health(State(gateway): State<Arc<QueryOrchestrator>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "databases": gateway.database_names(),
    }))
}
