//! Plain text parsing engine for development and tests
//!
//! Reads the stored file as UTF-8: form feeds separate pages, blank lines
//! separate paragraphs, `#` lines are headings that open sections (the number
//! of `#` is the level), and `%` lines are ignored so a `%PDF-` signature line
//! passes the upload check.

use async_trait::async_trait;
use std::path::Path;

use super::{EngineOptions, ParsingEngine};
use crate::error::{Error, Result};
use crate::types::{
    BBox, BlockType, ParsedBlock, ParsedDocument, ParsedPage, ParsedSection, SourceKind,
};

const PAGE_WIDTH: f64 = 612.0;
const PAGE_HEIGHT: f64 = 792.0;
const MARGIN: f64 = 72.0;
const LINE_HEIGHT: f64 = 14.0;

/// Development engine over plain text files
pub struct TextEngine {
    version: String,
}

impl TextEngine {
    pub fn new(version: impl Into<String>) -> Self {
        Self { version: version.into() }
    }

    async fn read(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[async_trait]
impl ParsingEngine for TextEngine {
    fn name(&self) -> &str {
        "text"
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn count_pages(&self, pdf_path: &Path) -> Result<u32> {
        let content = self
            .read(pdf_path)
            .await
            .map_err(|e| Error::corrupt(format!("cannot read {}: {}", pdf_path.display(), e)))?;
        Ok(split_pages(&content).len() as u32)
    }

    async fn parse(&self, pdf_path: &Path, _options: &EngineOptions) -> Result<ParsedDocument> {
        let content = self
            .read(pdf_path)
            .await
            .map_err(|e| Error::engine(format!("cannot read {}: {}", pdf_path.display(), e)))?;
        let mut doc = parse_text(&content);
        doc.engine = Some(self.name().to_string());
        doc.engine_version = Some(self.version.clone());
        Ok(doc)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

fn split_pages(content: &str) -> Vec<&str> {
    content.split('\u{c}').collect()
}

/// Open section on the heading stack
struct OpenSection {
    index: usize,
    level: u32,
}

fn parse_text(content: &str) -> ParsedDocument {
    let mut doc = ParsedDocument {
        source_kind: SourceKind::Digital,
        ..Default::default()
    };
    let mut stack: Vec<OpenSection> = Vec::new();
    let mut last_content_page = 1;

    for (page_idx, page_text) in split_pages(content).into_iter().enumerate() {
        let page_number = page_idx as u32 + 1;
        doc.pages.push(ParsedPage {
            number: page_number,
            width: PAGE_WIDTH,
            height: PAGE_HEIGHT,
        });

        let mut order = 0u32;
        let mut y = MARGIN;
        for chunk in paragraphs(page_text) {
            let line_count = chunk.lines().count().max(1) as f64;
            let height = (line_count * LINE_HEIGHT).min(PAGE_HEIGHT - y).max(0.0);
            let bbox = BBox::new(MARGIN, y.min(PAGE_HEIGHT), PAGE_WIDTH - 2.0 * MARGIN, height);

            let (block_type, text) = match heading_level(&chunk) {
                Some(level) => {
                    let title = chunk.trim_start_matches('#').trim().to_string();
                    // A heading first on its page closes earlier sections on the previous page
                    let close_at = if order == 0 { page_number.saturating_sub(1) } else { page_number };
                    while stack.last().is_some_and(|s| s.level >= level) {
                        if let Some(open) = stack.pop() {
                            let section = &mut doc.sections[open.index];
                            section.end_page = close_at.max(section.start_page);
                        }
                    }
                    let index = doc.sections.len();
                    let parent_id = stack.last().map(|s| doc.sections[s.index].id.clone());
                    doc.sections.push(ParsedSection {
                        id: format!("s{}", index + 1),
                        parent_id,
                        level,
                        title: title.clone(),
                        start_page: page_number,
                        end_page: page_number,
                        order_index: index as u32,
                    });
                    stack.push(OpenSection { index, level });
                    (BlockType::Heading, title)
                }
                None => (BlockType::Paragraph, chunk.clone()),
            };

            if text.is_empty() {
                continue;
            }

            doc.blocks.push(ParsedBlock {
                id: format!("p{}-b{}", page_number, order),
                page: page_number,
                block_type,
                text,
                markup: None,
                bbox,
                reading_order: order,
                section_path: stack.iter().map(|s| doc.sections[s.index].id.clone()).collect(),
                asset_id: None,
                source_id: None,
                confidence: None,
            });
            order += 1;
            y += line_count * LINE_HEIGHT + LINE_HEIGHT;
            last_content_page = page_number;
        }
    }

    let last_page = doc.max_page().max(last_content_page);
    for open in stack {
        let section = &mut doc.sections[open.index];
        section.end_page = last_page.max(section.start_page);
    }
    doc
}

/// Paragraphs of a page, with `%` comment lines dropped
fn paragraphs(page_text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in page_text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('%') {
            continue;
        }
        if trimmed.is_empty() {
            if !current.is_empty() {
                out.push(current.join("\n"));
                current.clear();
            }
            continue;
        }
        // Headings always stand alone
        if trimmed.starts_with('#') {
            if !current.is_empty() {
                out.push(current.join("\n"));
                current.clear();
            }
            out.push(trimmed.to_string());
            continue;
        }
        current.push(trimmed);
    }
    if !current.is_empty() {
        out.push(current.join("\n"));
    }
    out
}

fn heading_level(chunk: &str) -> Option<u32> {
    let level = chunk.chars().take_while(|c| *c == '#').count();
    if level == 0 {
        None
    } else {
        Some(level as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "%PDF-1.4 text fixture\n# Part One\n\nFirst paragraph\ncontinues here.\n\n## Chapter 1\nBody of chapter one.\n\u{c}More of chapter one.\n\u{c}# Part Two\nClosing words.\n";

    #[test]
    fn test_pages_and_paragraphs() {
        let doc = parse_text(SAMPLE);
        assert_eq!(doc.pages.len(), 3);
        assert!(doc.validate(3).is_ok());

        let page1: Vec<_> = doc.blocks.iter().filter(|b| b.page == 1).collect();
        assert_eq!(page1.len(), 4);
        assert_eq!(page1[0].block_type, BlockType::Heading);
        assert_eq!(page1[1].text, "First paragraph\ncontinues here.");
        assert!(page1.iter().all(|b| !b.text.contains("%PDF")));
    }

    #[test]
    fn test_sections_nest_and_close() {
        let doc = parse_text(SAMPLE);
        assert_eq!(doc.sections.len(), 3);

        let part_one = &doc.sections[0];
        let chapter = &doc.sections[1];
        let part_two = &doc.sections[2];

        assert_eq!(chapter.parent_id.as_deref(), Some(part_one.id.as_str()));
        assert_eq!((part_one.start_page, part_one.end_page), (1, 2));
        assert_eq!((chapter.start_page, chapter.end_page), (1, 2));
        assert_eq!((part_two.start_page, part_two.end_page), (3, 3));
        assert!(part_two.parent_id.is_none());

        let page2 = doc.blocks.iter().find(|b| b.page == 2).unwrap();
        assert_eq!(page2.section_path, vec![part_one.id.clone(), chapter.id.clone()]);
    }

    #[tokio::test]
    async fn test_engine_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.pdf");
        std::fs::write(&path, SAMPLE).unwrap();

        let engine = TextEngine::new("t1");
        assert_eq!(engine.count_pages(&path).await.unwrap(), 3);
        let options = EngineOptions { language: "en".into(), ocr_enabled: false };
        let doc = engine.parse(&path, &options).await.unwrap();
        assert_eq!(doc.engine_version.as_deref(), Some("t1"));

        let missing = dir.path().join("missing.pdf");
        assert_eq!(engine.count_pages(&missing).await.unwrap_err().kind(), "CorruptDocumentError");
    }
}
