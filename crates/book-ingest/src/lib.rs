//! book-ingest: resumable PDF book ingestion pipeline
//!
//! Uploaded books are parsed by a pluggable engine into an engine-agnostic
//! document, then ingested page-batch by page-batch into a SQLite catalog
//! (pages, sections, blocks, cropped assets) and indexed for full-text
//! search. Jobs can be paused, resumed, cancelled and retried, and survive
//! process restarts without re-ingesting committed pages.

pub mod config;
pub mod engine;
pub mod error;
pub mod indexing;
pub mod processing;
pub mod render;
pub mod server;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::IngestConfig;
pub use error::{Error, Result};
pub use processing::{JobManager, SubmitOutcome, SubmitRequest};
pub use types::{Book, JobPhase, JobState, ParseJob, ParsedDocument};
