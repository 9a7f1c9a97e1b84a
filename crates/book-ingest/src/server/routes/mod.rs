//! API routes for the ingestion server

pub mod books;
pub mod jobs;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use crate::server::state::AppState;

/// Build all API routes
pub fn api_routes(max_upload_size: usize) -> Router<AppState> {
    Router::new()
        // Books - upload with a larger body limit
        .route(
            "/books",
            post(books::upload_book)
                .layer(DefaultBodyLimit::max(max_upload_size))
                .get(books::list_books),
        )
        .route("/books/:id", get(books::get_book))
        .route("/books/:id/reparse", post(books::reparse_book))
        .route("/books/:id/pages/:page", get(books::get_page))
        .route("/books/:id/pages/:page/image", get(books::get_page_image))
        .route("/books/:id/search", get(books::search_book))
        // Search across books
        .route("/search", get(books::search_all))
        // Job control
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/pause", post(jobs::pause_job))
        .route("/jobs/:id/resume", post(jobs::resume_job))
        .route("/jobs/:id/retry", post(jobs::retry_job))
        .route("/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/jobs/:id/events", get(jobs::job_events))
        .route("/stats", get(jobs::queue_stats))
        // Info
        .route("/", get(info))
}

/// API info endpoint
async fn info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": "book-ingest",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Resumable PDF book ingestion with pausable jobs and full-text search",
        "endpoints": {
            "POST /api/books": "Upload a PDF (multipart field `file`, optional `owner_id`, `title`, `author`, `language`, `ocr`)",
            "GET /api/books": "List books (optional ?owner_id=)",
            "GET /api/books/:id": "Book metadata, outline and index status",
            "POST /api/books/:id/reparse": "Discard content and parse again",
            "GET /api/books/:id/pages/:page": "Blocks of a page in reading order",
            "GET /api/books/:id/pages/:page/image": "Rendered page PNG (?thumbnail=true)",
            "GET /api/books/:id/search": "Full-text search within a book (?q=)",
            "GET /api/search": "Full-text search across books (?q=)",
            "GET /api/jobs": "List jobs (optional ?state=)",
            "GET /api/jobs/:id": "Job status and progress",
            "POST /api/jobs/:id/pause": "Pause at the next checkpoint",
            "POST /api/jobs/:id/resume": "Resume a paused job",
            "POST /api/jobs/:id/retry": "Retry a failed job",
            "POST /api/jobs/:id/cancel": "Cancel a job and discard its content",
            "GET /api/jobs/:id/events": "Server-sent progress events",
            "GET /api/stats": "Job counts by state"
        }
    }))
}
