//! Persisted content entities: pages, sections, blocks, assets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bounding box in page units, origin at the top-left corner
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl BBox {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    /// Finite with non-negative extent
    pub fn is_well_formed(&self) -> bool {
        [self.x, self.y, self.w, self.h].iter().all(|v| v.is_finite()) && self.w >= 0.0 && self.h >= 0.0
    }

    /// Whether the box lies inside a `width` x `height` page, allowing `tolerance` units of slack
    pub fn is_within(&self, width: f64, height: f64, tolerance: f64) -> bool {
        self.x >= -tolerance
            && self.y >= -tolerance
            && self.x + self.w <= width + tolerance
            && self.y + self.h <= height + tolerance
    }

    /// Clamp the box to the page rectangle
    pub fn clamp_to(&self, width: f64, height: f64) -> BBox {
        let x0 = self.x.clamp(0.0, width);
        let y0 = self.y.clamp(0.0, height);
        let x1 = (self.x + self.w).clamp(x0, width);
        let y1 = (self.y + self.h).clamp(y0, height);
        BBox::new(x0, y0, x1 - x0, y1 - y0)
    }
}

/// Per-page parse outcome
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Parsed,
    /// Page exists but rendering it failed
    Failed,
    /// Page absent from the engine output
    Skipped,
}

/// One physical PDF page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: Uuid,
    pub book_id: Uuid,
    /// 1-based page number
    pub page_number: u32,
    pub width: f64,
    pub height: f64,
    /// Rendered image, relative to the storage root
    pub image_path: Option<String>,
    /// Thumbnail, relative to the storage root
    pub thumbnail_path: Option<String>,
    pub status: PageStatus,
}

/// Outline node; sections form a forest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub id: Uuid,
    pub book_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub level: u32,
    pub title: String,
    pub start_page: u32,
    pub end_page: u32,
    pub order_index: u32,
}

/// Content unit type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Heading,
    Paragraph,
    ListItem,
    Table,
    Figure,
    Caption,
    Footnote,
    Code,
    Equation,
    Quote,
    /// Headers, footers, page numbers
    Furniture,
}

impl BlockType {
    /// Text-bearing types must carry non-empty text
    pub fn requires_text(self) -> bool {
        matches!(
            self,
            BlockType::Heading
                | BlockType::Paragraph
                | BlockType::ListItem
                | BlockType::Caption
                | BlockType::Footnote
                | BlockType::Code
                | BlockType::Quote
        )
    }

    /// Types whose visual rendition is kept as an asset
    pub fn is_visual(self) -> bool {
        matches!(self, BlockType::Figure | BlockType::Table | BlockType::Equation)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlockType::Heading => "heading",
            BlockType::Paragraph => "paragraph",
            BlockType::ListItem => "list_item",
            BlockType::Table => "table",
            BlockType::Figure => "figure",
            BlockType::Caption => "caption",
            BlockType::Footnote => "footnote",
            BlockType::Code => "code",
            BlockType::Equation => "equation",
            BlockType::Quote => "quote",
            BlockType::Furniture => "furniture",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "heading" => BlockType::Heading,
            "paragraph" => BlockType::Paragraph,
            "list_item" => BlockType::ListItem,
            "table" => BlockType::Table,
            "figure" => BlockType::Figure,
            "caption" => BlockType::Caption,
            "footnote" => BlockType::Footnote,
            "code" => BlockType::Code,
            "equation" => BlockType::Equation,
            "quote" => BlockType::Quote,
            "furniture" => BlockType::Furniture,
            _ => return None,
        })
    }
}

/// Atomic positioned content unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: Uuid,
    pub book_id: Uuid,
    pub page_id: Uuid,
    pub page_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_id: Option<Uuid>,
    pub block_type: BlockType,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markup: Option<String>,
    pub bbox: BBox,
    /// Dense per page, starting at 0
    pub reading_order: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<Uuid>,
    /// Engine-native id, for traceability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Visual asset type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Figure,
    Table,
    Equation,
}

/// Cropped or engine-supplied image for a visual block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub book_id: Uuid,
    pub page_id: Uuid,
    pub page_number: u32,
    /// Owning block
    pub block_id: Uuid,
    pub asset_type: AssetType,
    /// Image file, relative to the storage root
    pub file_path: String,
    pub bbox: BBox,
}

/// Vector indexing outcome
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VectorStatus {
    #[default]
    NotIndexed,
    Indexed,
}

/// Per-book indexing flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStatus {
    pub book_id: Uuid,
    pub fulltext_indexed: bool,
    pub fulltext_version: Option<String>,
    pub vector_status: VectorStatus,
    pub vector_version: Option<String>,
    pub blocks_indexed: u64,
    pub indexed_at: Option<DateTime<Utc>>,
}

impl IndexStatus {
    /// Status of a book that has never been indexed
    pub fn empty(book_id: Uuid) -> Self {
        Self {
            book_id,
            fulltext_indexed: false,
            fulltext_version: None,
            vector_status: VectorStatus::NotIndexed,
            vector_version: None,
            blocks_indexed: 0,
            indexed_at: None,
        }
    }
}

/// Ranked full-text match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub block_id: Uuid,
    pub book_id: Uuid,
    pub page_number: u32,
    pub reading_order: u32,
    pub text: String,
    /// bm25 score, lower is better
    pub score: f64,
}
