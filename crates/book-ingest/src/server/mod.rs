//! HTTP server for the ingestion pipeline

pub mod routes;
pub mod state;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::IngestConfig;
use crate::error::{Error, Result};
use state::AppState;

/// Ingestion HTTP server
pub struct IngestServer {
    config: IngestConfig,
    state: AppState,
}

impl IngestServer {
    /// Create a new server, starting the worker pool
    pub async fn new(config: IngestConfig) -> Result<Self> {
        let state = AppState::new(config.clone()).await?;
        Ok(Self { config, state })
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Start the server and run until Ctrl+C
    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid address: {}", e)))?;

        let router = self.build_router();

        tracing::info!("Starting ingestion server on http://{}", addr);
        tracing::info!("API documentation: http://{}/api", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("Failed to bind: {}", e)))?;

        let state = self.state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Shutdown requested; running jobs resume on next start");
                }
                state.set_ready(false);
            })
            .await
            .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;

        Ok(())
    }

    /// Get the server address
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.server.host, self.config.server.port)
    }
}

/// Router over an existing state
pub fn build_router(state: AppState) -> Router {
    let max_upload_size = state.config().server.max_upload_size;
    let enable_cors = state.config().server.enable_cors;

    let router = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness))
        .nest("/api", routes::api_routes(max_upload_size))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new());

    if enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router.layer(cors)
    } else {
        router
    }
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Readiness check endpoint
async fn readiness(state: axum::extract::State<AppState>) -> axum::http::StatusCode {
    if state.is_ready() {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineKind, RendererKind};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOUNDARY: &str = "book-ingest-test-boundary";

    async fn test_router(dir: &tempfile::TempDir) -> Router {
        let mut config = IngestConfig::default();
        config.storage.root = dir.path().to_path_buf();
        config.storage.database_path = dir.path().join("catalog.db");
        config.engine.kind = EngineKind::Text;
        config.renderer.kind = RendererKind::Disabled;
        config.processing.render_all_pages = false;
        config.processing.max_concurrent_jobs = Some(1);

        let state = AppState::new(config).await.unwrap();
        build_router(state)
    }

    async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn upload(owner: &str, file_name: &str, content: &str) -> Request<Body> {
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"owner_id\"\r\n\r\n{owner}\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: application/pdf\r\n\r\n{content}\r\n--{b}--\r\n",
            b = BOUNDARY,
        );
        Request::builder()
            .method("POST")
            .uri("/api/books")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(&dir).await;

        let response = router.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (status, body) = call(&router, get(&format!("/api/jobs/{}", uuid::Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["type"], "NotFound");

        let (status, body) = call(&router, get("/api/search?q=")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "ValidationError");

        let (status, _) = call(&router, upload("alice", "notes.txt", "plain words")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_parse_and_search_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(&dir).await;

        let content = "%PDF-1.4\n# Harbours\n\nThe lighthouse keeper wrote every night.\n";
        let (status, body) = call(&router, upload("alice", "harbours.pdf", content)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["deduplicated"], false);
        let job_id = body["job_id"].as_str().unwrap().to_string();
        let book_id = body["book_id"].as_str().unwrap().to_string();

        let mut state = String::new();
        for _ in 0..200 {
            let (_, job) = call(&router, get(&format!("/api/jobs/{}", job_id))).await;
            state = job["state"].as_str().unwrap_or_default().to_string();
            if state == "completed" || state == "failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, "completed");

        let (status, page) = call(&router, get(&format!("/api/books/{}/pages/1", book_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["blocks"][0]["block_type"], "heading");
        assert_eq!(page["blocks"][1]["text"], "The lighthouse keeper wrote every night.");

        let (status, hits) = call(&router, get(&format!("/api/books/{}/search?q=keeper", book_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(hits["hits"].as_array().unwrap().len(), 1);

        let (status, body) = call(&router, upload("alice", "again.pdf", content)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deduplicated"], true);

        let (status, _) = call(&router, get(&format!("/api/books/{}/pages/1/image", book_id))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
