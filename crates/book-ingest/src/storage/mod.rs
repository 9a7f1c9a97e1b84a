//! Storage module for persistent data
//!
//! SQLite catalog for books, jobs and content, the per-book file layout, and
//! the read side used by API callers.

mod database;
mod layout;
mod reader;

pub use database::{BatchRows, CancelOutcome, CatalogDb};
pub use layout::BookLayout;
pub use reader::{BookDetail, ContentReader, ImageVariant, PageContent, MAX_SEARCH_LIMIT};
