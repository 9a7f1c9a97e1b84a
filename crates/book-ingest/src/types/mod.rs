//! Core types for the ingestion pipeline

pub mod book;
pub mod content;
pub mod job;
pub mod parsed;

pub use book::{Book, BookStatus, SourceKind};
pub use content::{
    Asset, AssetType, BBox, Block, BlockType, IndexStatus, Page, PageStatus, SearchHit,
    Section, VectorStatus,
};
pub use job::{JobConfig, JobPhase, JobState, ParseJob};
pub use parsed::{
    AssetSource, ParsedAsset, ParsedBlock, ParsedDocument, ParsedPage, ParsedSection,
};
