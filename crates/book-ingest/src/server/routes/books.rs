//! Book upload, content and search endpoints

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::processing::{JobStatusView, SubmitOutcome, SubmitRequest};
use crate::server::state::AppState;
use crate::storage::{BookDetail, ImageVariant, PageContent};
use crate::types::{Book, SearchHit};

/// Owner recorded when the upload names none
const DEFAULT_OWNER: &str = "default";
const DEFAULT_SEARCH_LIMIT: usize = 20;

/// POST /api/books - Upload a PDF and queue its parse
pub async fn upload_book(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitOutcome>)> {
    let mut file: Option<(String, bytes::Bytes)> = None;
    let mut owner_id = DEFAULT_OWNER.to_string();
    let mut title = None;
    let mut author = None;
    let mut language = None;
    let mut ocr_enabled = false;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        Error::validation(format!("Failed to read multipart field: {}", e))
    })? {
        let name = field.name().unwrap_or("").to_string();

        if name == "file" {
            let filename = field
                .file_name()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("book_{}.pdf", Uuid::new_v4()));
            let data = field
                .bytes()
                .await
                .map_err(|e| Error::validation(format!("Failed to read file {}: {}", filename, e)))?;
            file = Some((filename, data));
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| Error::validation(format!("Failed to read field {}: {}", name, e)))?;
        let value = value.trim().to_string();
        if value.is_empty() {
            continue;
        }
        match name.as_str() {
            "owner_id" => owner_id = value,
            "title" => title = Some(value),
            "author" => author = Some(value),
            "language" => language = Some(value),
            "ocr" => ocr_enabled = matches!(value.as_str(), "true" | "1" | "yes"),
            other => tracing::debug!("Ignoring unknown upload field {}", other),
        }
    }

    let (file_name, data) = file.ok_or_else(|| Error::validation("No file provided"))?;
    tracing::info!("Received upload {} ({} bytes) from {}", file_name, data.len(), owner_id);

    let outcome = state
        .manager()
        .submit(SubmitRequest {
            owner_id,
            file_name,
            data,
            title,
            author,
            language,
            ocr_enabled,
        })
        .await?;

    let status = if outcome.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(outcome)))
}

#[derive(Debug, Deserialize)]
pub struct ListBooksQuery {
    pub owner_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BookListResponse {
    pub books: Vec<Book>,
    pub total: usize,
}

/// GET /api/books - List books
pub async fn list_books(
    State(state): State<AppState>,
    Query(query): Query<ListBooksQuery>,
) -> Result<Json<BookListResponse>> {
    let books = state.reader().list_books(query.owner_id.as_deref())?;
    Ok(Json(BookListResponse {
        total: books.len(),
        books,
    }))
}

#[derive(Debug, Serialize)]
pub struct BookResponse {
    #[serde(flatten)]
    pub detail: BookDetail,
    pub latest_job: Option<JobStatusView>,
}

/// GET /api/books/:id - Book metadata with its latest job
pub async fn get_book(
    State(state): State<AppState>,
    Path(book_id): Path<Uuid>,
) -> Result<Json<BookResponse>> {
    let detail = state.reader().book_detail(book_id)?;
    let latest_job = state
        .context()
        .db
        .latest_job_for_book(book_id)?
        .map(|job| JobStatusView::from(&job));
    Ok(Json(BookResponse { detail, latest_job }))
}

/// POST /api/books/:id/reparse - Discard content and queue a fresh parse
pub async fn reparse_book(
    State(state): State<AppState>,
    Path(book_id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobStatusView>)> {
    let status = state.manager().reparse(book_id).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

/// GET /api/books/:id/pages/:page - Blocks of one page in reading order
pub async fn get_page(
    State(state): State<AppState>,
    Path((book_id, page)): Path<(Uuid, u32)>,
) -> Result<Json<PageContent>> {
    Ok(Json(state.reader().page_content(book_id, page)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct PageImageQuery {
    #[serde(default)]
    pub thumbnail: bool,
}

/// GET /api/books/:id/pages/:page/image - Rendered page as PNG
pub async fn get_page_image(
    State(state): State<AppState>,
    Path((book_id, page)): Path<(Uuid, u32)>,
    Query(query): Query<PageImageQuery>,
) -> Result<impl IntoResponse> {
    let variant = if query.thumbnail {
        ImageVariant::Thumbnail
    } else {
        ImageVariant::Full
    };
    let bytes = state.reader().page_image(book_id, page, variant).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub hits: Vec<SearchHit>,
    pub processing_time_ms: u64,
}

/// GET /api/books/:id/search - Full-text search within one book
pub async fn search_book(
    State(state): State<AppState>,
    Path(book_id): Path<Uuid>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>> {
    search(&state, query, Some(book_id))
}

/// GET /api/search - Full-text search across all books
pub async fn search_all(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>> {
    search(&state, query, None)
}

fn search(state: &AppState, query: SearchQuery, book_id: Option<Uuid>) -> Result<Json<SearchResponse>> {
    let start = Instant::now();
    let hits = state.reader().search(
        &query.q,
        book_id,
        query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT),
    )?;
    tracing::debug!("Search {:?} returned {} hits", query.q, hits.len());

    Ok(Json(SearchResponse {
        query: query.q,
        hits,
        processing_time_ms: start.elapsed().as_millis() as u64,
    }))
}
