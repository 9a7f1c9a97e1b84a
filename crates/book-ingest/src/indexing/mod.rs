//! Full-text (and vector) indexing of ingested blocks
//!
//! Indexing always replaces everything a book had in the index, so the phase
//! can be re-entered after a pause or retry without duplicating entries.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::storage::CatalogDb;
use crate::types::{Block, IndexStatus, SearchHit};

/// Trait for block indexers
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Indexer name
    fn name(&self) -> &str;

    /// Replace the book's index entries with `blocks`
    async fn index_book(&self, book_id: Uuid, blocks: &[Block]) -> Result<IndexStatus>;

    /// Remove all index entries of a book
    async fn delete_book(&self, book_id: Uuid) -> Result<()>;

    /// Ranked search, optionally within one book
    async fn search(&self, query: &str, book_id: Option<Uuid>, limit: usize) -> Result<Vec<SearchHit>>;
}

/// SQLite FTS5 indexer living in the catalog database.
///
/// Vector indexing is not implemented; statuses report `not_indexed`.
pub struct FtsIndexer {
    db: Arc<CatalogDb>,
    version: String,
}

impl FtsIndexer {
    pub fn new(db: Arc<CatalogDb>, version: impl Into<String>) -> Self {
        Self {
            db,
            version: version.into(),
        }
    }
}

#[async_trait]
impl Indexer for FtsIndexer {
    fn name(&self) -> &str {
        "fts5"
    }

    async fn index_book(&self, book_id: Uuid, blocks: &[Block]) -> Result<IndexStatus> {
        let status = self.db.replace_fulltext(book_id, blocks, &self.version)?;
        tracing::info!(
            "Indexed {} of {} blocks for book {}",
            status.blocks_indexed,
            blocks.len(),
            book_id
        );
        Ok(status)
    }

    async fn delete_book(&self, book_id: Uuid) -> Result<()> {
        self.db.clear_fulltext(book_id)
    }

    async fn search(&self, query: &str, book_id: Option<Uuid>, limit: usize) -> Result<Vec<SearchHit>> {
        self.db.search_blocks(query, book_id, limit)
    }
}
