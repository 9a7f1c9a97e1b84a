//! Book records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a book
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    /// Stored, waiting for its first job
    Uploaded,
    /// A job is running
    Parsing,
    /// The job is suspended
    Paused,
    /// Content and index are complete
    Parsed,
    /// The last job failed or was cancelled
    Failed,
    /// Content was discarded, a fresh job is pending
    NeedsReparse,
}

/// Kind of PDF as reported by the parsing engine
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Digital,
    Scanned,
    Mixed,
    #[default]
    Unknown,
}

/// One uploaded document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    /// Book ID
    pub id: Uuid,
    /// Owning user reference
    pub owner_id: String,
    /// SHA-256 of the uploaded bytes (dedup key per owner)
    pub checksum: String,
    /// Title
    pub title: String,
    /// Author, if supplied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Digital, scanned or mixed
    pub source_kind: SourceKind,
    /// Upload file name
    pub file_name: String,
    /// Original file, relative to the storage root
    pub storage_path: String,
    /// Physical page count, unknown until precheck
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    /// Language tag
    pub language: String,
    /// Parsing engine version that produced the content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    /// Lifecycle status
    pub status: BookStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    /// New upload; the title defaults to the file stem
    pub fn new(
        id: Uuid,
        owner_id: impl Into<String>,
        checksum: impl Into<String>,
        file_name: impl Into<String>,
        storage_path: impl Into<String>,
    ) -> Self {
        let file_name = file_name.into();
        let title = std::path::Path::new(&file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&file_name)
            .to_string();
        let now = Utc::now();
        Self {
            id,
            owner_id: owner_id.into(),
            checksum: checksum.into(),
            title,
            author: None,
            source_kind: SourceKind::Unknown,
            file_name,
            storage_path: storage_path.into(),
            page_count: None,
            language: "en".to_string(),
            engine_version: None,
            status: BookStatus::Uploaded,
            created_at: now,
            updated_at: now,
        }
    }
}
