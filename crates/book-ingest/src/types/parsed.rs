//! Engine-agnostic exchange schema produced by every parsing engine
//!
//! Engines emit this structure (as JSON when run out of process). Identifiers are
//! engine-local strings; the ingestion batcher maps them to fresh row ids.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::{BBox, BlockType, SourceKind};
use crate::error::{Error, Result};

/// Slack allowed when checking that an asset lies inside its page
pub const BBOX_TOLERANCE: f64 = 1.0;

/// Full output of one structural parse
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedDocument {
    /// Engine that produced the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    #[serde(default)]
    pub source_kind: SourceKind,
    pub pages: Vec<ParsedPage>,
    #[serde(default)]
    pub sections: Vec<ParsedSection>,
    #[serde(default)]
    pub blocks: Vec<ParsedBlock>,
    #[serde(default)]
    pub assets: Vec<ParsedAsset>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedPage {
    pub number: u32,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedSection {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub level: u32,
    pub title: String,
    pub start_page: u32,
    pub end_page: u32,
    pub order_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedBlock {
    pub id: String,
    pub page: u32,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub markup: Option<String>,
    pub bbox: BBox,
    pub reading_order: u32,
    /// Enclosing section ids, outermost first
    #[serde(default)]
    pub section_path: Vec<String>,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// How the asset image is obtained
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetSource {
    /// Crop the bounding box out of the rendered page
    #[default]
    Crop,
    /// Engine supplied the encoded image
    Inline {
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedAsset {
    pub id: String,
    pub page: u32,
    #[serde(rename = "type")]
    pub asset_type: super::AssetType,
    pub bbox: BBox,
    #[serde(default)]
    pub source: AssetSource,
}

impl ParsedDocument {
    /// Highest page number present
    pub fn max_page(&self) -> u32 {
        self.pages.iter().map(|p| p.number).max().unwrap_or(0)
    }

    /// Look up a page by number
    pub fn page(&self, number: u32) -> Option<&ParsedPage> {
        self.pages.iter().find(|p| p.number == number)
    }

    /// Check structural integrity against the physical page count.
    ///
    /// Any violation is reported as a malformed engine output.
    pub fn validate(&self, total_pages: u32) -> Result<()> {
        if self.pages.is_empty() {
            return Err(malformed("document has no pages"));
        }

        let mut pages: HashMap<u32, &ParsedPage> = HashMap::new();
        for page in &self.pages {
            if page.number == 0 || page.number > total_pages {
                return Err(malformed(format!(
                    "page {} outside 1..={}",
                    page.number, total_pages
                )));
            }
            if !(page.width.is_finite() && page.height.is_finite())
                || page.width <= 0.0
                || page.height <= 0.0
            {
                return Err(malformed(format!("page {} has no extent", page.number)));
            }
            if pages.insert(page.number, page).is_some() {
                return Err(malformed(format!("duplicate page {}", page.number)));
            }
        }

        self.validate_sections()?;

        let mut assets: HashMap<&str, &ParsedAsset> = HashMap::new();
        for asset in &self.assets {
            let page = pages
                .get(&asset.page)
                .ok_or_else(|| malformed(format!("asset {} on unknown page {}", asset.id, asset.page)))?;
            if !asset.bbox.is_well_formed()
                || !asset.bbox.is_within(page.width, page.height, BBOX_TOLERANCE)
            {
                return Err(malformed(format!(
                    "asset {} bounding box outside page {}",
                    asset.id, asset.page
                )));
            }
            if assets.insert(asset.id.as_str(), asset).is_some() {
                return Err(malformed(format!("duplicate asset id {}", asset.id)));
            }
        }

        let section_ids: HashSet<&str> = self.sections.iter().map(|s| s.id.as_str()).collect();
        let mut block_ids = HashSet::new();
        let mut claimed_assets = HashSet::new();
        let mut orders: HashMap<u32, Vec<u32>> = HashMap::new();

        for block in &self.blocks {
            if !block_ids.insert(block.id.as_str()) {
                return Err(malformed(format!("duplicate block id {}", block.id)));
            }
            if !pages.contains_key(&block.page) {
                return Err(malformed(format!("block {} on unknown page {}", block.id, block.page)));
            }
            if !block.bbox.is_well_formed() {
                return Err(malformed(format!("block {} has an invalid bounding box", block.id)));
            }
            if block.block_type.requires_text() && block.text.trim().is_empty() {
                return Err(malformed(format!(
                    "{} block {} has no text",
                    block.block_type.as_str(),
                    block.id
                )));
            }
            if let Some(unknown) = block.section_path.iter().find(|s| !section_ids.contains(s.as_str())) {
                return Err(malformed(format!("block {} references unknown section {}", block.id, unknown)));
            }
            if let Some(asset_id) = &block.asset_id {
                let asset = assets
                    .get(asset_id.as_str())
                    .ok_or_else(|| malformed(format!("block {} references unknown asset {}", block.id, asset_id)))?;
                if asset.page != block.page {
                    return Err(malformed(format!("asset {} is not on the page of block {}", asset_id, block.id)));
                }
                if !claimed_assets.insert(asset_id.as_str()) {
                    return Err(malformed(format!("asset {} claimed by more than one block", asset_id)));
                }
            }
            orders.entry(block.page).or_default().push(block.reading_order);
        }

        for (page, mut values) in orders {
            values.sort_unstable();
            if values.iter().enumerate().any(|(i, v)| *v != i as u32) {
                return Err(malformed(format!(
                    "reading order on page {} is not dense from 0",
                    page
                )));
            }
        }

        Ok(())
    }

    fn validate_sections(&self) -> Result<()> {
        let mut by_id: HashMap<&str, &ParsedSection> = HashMap::new();
        for section in &self.sections {
            if section.start_page == 0 || section.start_page > section.end_page {
                return Err(malformed(format!(
                    "section {} has page range {}..{}",
                    section.id, section.start_page, section.end_page
                )));
            }
            if by_id.insert(section.id.as_str(), section).is_some() {
                return Err(malformed(format!("duplicate section id {}", section.id)));
            }
        }

        for section in &self.sections {
            if let Some(parent) = section.parent_id.as_deref().and_then(|id| by_id.get(id)) {
                if section.start_page < parent.start_page || section.end_page > parent.end_page {
                    return Err(malformed(format!(
                        "section {} spans pages {}..{} outside its parent {} ({}..{})",
                        section.id,
                        section.start_page,
                        section.end_page,
                        parent.id,
                        parent.start_page,
                        parent.end_page
                    )));
                }
            }

            // Walk to the root; more steps than sections means a cycle
            let mut seen = 0usize;
            let mut cursor = section.parent_id.as_deref();
            while let Some(parent_id) = cursor {
                let parent = by_id.get(parent_id).ok_or_else(|| {
                    malformed(format!("section {} has unknown parent {}", section.id, parent_id))
                })?;
                seen += 1;
                if seen > self.sections.len() {
                    return Err(malformed(format!("section {} is part of a cycle", section.id)));
                }
                cursor = parent.parent_id.as_deref();
            }
        }
        Ok(())
    }
}

fn malformed(detail: impl std::fmt::Display) -> Error {
    Error::Engine(format!("malformed document: {}", detail))
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetType;

    fn page(number: u32) -> ParsedPage {
        ParsedPage { number, width: 612.0, height: 792.0 }
    }

    fn paragraph(id: &str, page: u32, order: u32) -> ParsedBlock {
        ParsedBlock {
            id: id.into(),
            page,
            block_type: BlockType::Paragraph,
            text: format!("text {}", id),
            markup: None,
            bbox: BBox::new(50.0, 50.0 + order as f64 * 20.0, 400.0, 18.0),
            reading_order: order,
            section_path: Vec::new(),
            asset_id: None,
            source_id: None,
            confidence: None,
        }
    }

    fn valid_doc() -> ParsedDocument {
        ParsedDocument {
            pages: vec![page(1), page(2)],
            sections: vec![ParsedSection {
                id: "s1".into(),
                parent_id: None,
                level: 1,
                title: "Intro".into(),
                start_page: 1,
                end_page: 2,
                order_index: 0,
            }],
            blocks: vec![paragraph("b1", 1, 0), paragraph("b2", 1, 1), paragraph("b3", 2, 0)],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_document_passes() {
        assert!(valid_doc().validate(2).is_ok());
    }

    #[test]
    fn test_empty_document_is_malformed() {
        let err = ParsedDocument::default().validate(3).unwrap_err();
        assert_eq!(err.kind(), "EngineError");
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn test_reading_order_gap_rejected() {
        let mut doc = valid_doc();
        doc.blocks[1].reading_order = 2;
        assert!(matches!(doc.validate(2), Err(Error::Engine(_))));
    }

    #[test]
    fn test_page_beyond_total_rejected() {
        assert!(valid_doc().validate(1).is_err());
    }

    #[test]
    fn test_section_cycle_rejected() {
        let mut doc = valid_doc();
        doc.sections.push(ParsedSection {
            id: "s2".into(),
            parent_id: Some("s3".into()),
            level: 2,
            title: "A".into(),
            start_page: 1,
            end_page: 1,
            order_index: 1,
        });
        doc.sections.push(ParsedSection {
            id: "s3".into(),
            parent_id: Some("s2".into()),
            level: 2,
            title: "B".into(),
            start_page: 1,
            end_page: 1,
            order_index: 2,
        });
        let err = doc.validate(2).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_child_section_outside_parent_rejected() {
        let mut doc = valid_doc();
        doc.sections.push(ParsedSection {
            id: "s2".into(),
            parent_id: None,
            level: 1,
            title: "Part".into(),
            start_page: 2,
            end_page: 2,
            order_index: 1,
        });
        doc.sections.push(ParsedSection {
            id: "s3".into(),
            parent_id: Some("s2".into()),
            level: 2,
            title: "Leaks back".into(),
            start_page: 1,
            end_page: 2,
            order_index: 2,
        });
        let err = doc.validate(2).unwrap_err();
        assert_eq!(err.kind(), "EngineError");
        assert!(err.to_string().contains("outside its parent s2"));

        // Nested within the parent's pages is fine
        doc.sections[2].start_page = 2;
        assert!(doc.validate(2).is_ok());
    }

    #[test]
    fn test_asset_outside_page_rejected() {
        let mut doc = valid_doc();
        doc.assets.push(ParsedAsset {
            id: "a1".into(),
            page: 1,
            asset_type: AssetType::Figure,
            bbox: BBox::new(500.0, 700.0, 200.0, 200.0),
            source: AssetSource::Crop,
        });
        assert!(doc.validate(2).is_err());
    }

    #[test]
    fn test_text_block_without_text_rejected() {
        let mut doc = valid_doc();
        doc.blocks[0].text = "   ".into();
        assert!(doc.validate(2).is_err());
    }

    #[test]
    fn test_inline_asset_json_uses_hex() {
        let json = r#"{
            "pages": [{"number": 1, "width": 100.0, "height": 100.0}],
            "assets": [{"id": "a", "page": 1, "type": "figure",
                        "bbox": {"x": 0, "y": 0, "w": 10, "h": 10},
                        "source": {"kind": "inline", "data": "89504e47"}}]
        }"#;
        let doc: ParsedDocument = serde_json::from_str(json).unwrap();
        assert_eq!(
            doc.assets[0].source,
            AssetSource::Inline { data: vec![0x89, 0x50, 0x4e, 0x47] }
        );
        assert_eq!(doc.source_kind, SourceKind::Unknown);
    }
}
