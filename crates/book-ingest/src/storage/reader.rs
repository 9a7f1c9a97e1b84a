//! Read access to ingested books for callers outside the pipeline

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::{BookLayout, CatalogDb};
use crate::error::{Error, Result};
use crate::types::{Asset, Block, Book, IndexStatus, Page, SearchHit, Section};

/// Upper bound on hits returned by one search
pub const MAX_SEARCH_LIMIT: usize = 100;

/// Book metadata with its outline and index state
#[derive(Debug, Clone, Serialize)]
pub struct BookDetail {
    #[serde(flatten)]
    pub book: Book,
    pub pages_ingested: usize,
    pub sections: Vec<Section>,
    pub index: IndexStatus,
}

/// One page with its blocks in reading order
#[derive(Debug, Clone, Serialize)]
pub struct PageContent {
    pub page: Page,
    pub blocks: Vec<Block>,
    pub assets: Vec<Asset>,
}

/// Which rendition of a page image to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageVariant {
    Full,
    Thumbnail,
}

/// Catalog and file reads used by the HTTP surface
#[derive(Clone)]
pub struct ContentReader {
    db: Arc<CatalogDb>,
    layout: BookLayout,
}

impl ContentReader {
    pub fn new(db: Arc<CatalogDb>, layout: BookLayout) -> Self {
        Self { db, layout }
    }

    pub fn list_books(&self, owner_id: Option<&str>) -> Result<Vec<Book>> {
        self.db.list_books(owner_id)
    }

    pub fn book(&self, book_id: Uuid) -> Result<Book> {
        self.db
            .get_book(book_id)?
            .ok_or_else(|| Error::not_found(format!("book {}", book_id)))
    }

    pub fn book_detail(&self, book_id: Uuid) -> Result<BookDetail> {
        let book = self.book(book_id)?;
        let pages_ingested = self.db.list_pages(book_id)?.len();
        let sections = self.db.list_sections(book_id)?;
        let index = self
            .db
            .get_index_status(book_id)?
            .unwrap_or_else(|| IndexStatus::empty(book_id));

        Ok(BookDetail {
            book,
            pages_ingested,
            sections,
            index,
        })
    }

    /// Blocks of one page sorted by reading order.
    ///
    /// Fails with `ContractViolation` when a text-bearing block has no text.
    pub fn page_content(&self, book_id: Uuid, page_number: u32) -> Result<PageContent> {
        let page = self
            .db
            .get_page(book_id, page_number)?
            .ok_or_else(|| Error::not_found(format!("page {} of book {}", page_number, book_id)))?;

        let mut blocks = self.db.blocks_for_page(book_id, page_number)?;
        blocks.sort_by_key(|b| b.reading_order);
        check_blocks(&blocks)?;

        let assets = self
            .db
            .assets_for_book(book_id)?
            .into_iter()
            .filter(|a| a.page_number == page_number)
            .collect();

        Ok(PageContent { page, blocks, assets })
    }

    /// PNG bytes of a rendered page
    pub async fn page_image(&self, book_id: Uuid, page_number: u32, variant: ImageVariant) -> Result<Vec<u8>> {
        let page = self
            .db
            .get_page(book_id, page_number)?
            .ok_or_else(|| Error::not_found(format!("page {} of book {}", page_number, book_id)))?;

        let relative = match variant {
            ImageVariant::Full => page.image_path,
            ImageVariant::Thumbnail => page.thumbnail_path,
        }
        .ok_or_else(|| Error::not_found(format!("no image for page {} of book {}", page_number, book_id)))?;

        match tokio::fs::read(self.layout.resolve(&relative)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::ContractViolation(format!(
                "image {} recorded for page {} is missing",
                relative, page_number
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Ranked full-text search, global or within one book
    pub fn search(&self, query: &str, book_id: Option<Uuid>, limit: usize) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Err(Error::validation("search query is empty"));
        }
        if let Some(book_id) = book_id {
            self.book(book_id)?;
        }
        self.db.search_blocks(query, book_id, limit.clamp(1, MAX_SEARCH_LIMIT))
    }
}

fn check_blocks(blocks: &[Block]) -> Result<()> {
    for (expected, block) in blocks.iter().enumerate() {
        if block.block_type.requires_text() && block.text.trim().is_empty() {
            return Err(Error::ContractViolation(format!(
                "{} block {} on page {} has no text",
                block.block_type.as_str(),
                block.id,
                block.page_number
            )));
        }
        if block.reading_order as usize != expected {
            return Err(Error::ContractViolation(format!(
                "reading order on page {} has a gap at {}",
                block.page_number, expected
            )));
        }
    }
    Ok(())
}
