//! Parsing engine adapters
//!
//! A parsing engine turns a stored PDF into a [`ParsedDocument`]. Engines are
//! swappable behind [`ParsingEngine`] and selected by configuration.

pub mod subprocess;
pub mod text;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::config::{EngineConfig, EngineKind};
use crate::error::{Error, Result};
use crate::types::{JobConfig, ParsedDocument};

pub use subprocess::SubprocessEngine;
pub use text::TextEngine;

/// Options passed to a single parse
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Language hint
    pub language: String,
    /// Run OCR on image-only pages
    pub ocr_enabled: bool,
}

impl From<&JobConfig> for EngineOptions {
    fn from(config: &JobConfig) -> Self {
        Self {
            language: config.language.clone(),
            ocr_enabled: config.ocr_enabled,
        }
    }
}

/// Trait for parsing engines
#[async_trait]
pub trait ParsingEngine: Send + Sync {
    /// Engine name
    fn name(&self) -> &str;

    /// Version recorded on books parsed by this engine
    fn version(&self) -> &str;

    /// Cheap page count used by precheck; fails with `CorruptDocument`
    async fn count_pages(&self, pdf_path: &Path) -> Result<u32> {
        count_pdf_pages(pdf_path).await
    }

    /// Parse the whole document
    async fn parse(&self, pdf_path: &Path, options: &EngineOptions) -> Result<ParsedDocument>;

    /// Check if the engine is available
    async fn health_check(&self) -> Result<bool>;
}

/// Build the engine selected in the configuration
pub fn from_config(config: &EngineConfig) -> Arc<dyn ParsingEngine> {
    match config.kind {
        EngineKind::Subprocess => Arc::new(SubprocessEngine::new(config)),
        EngineKind::Text => Arc::new(TextEngine::new(config.version.clone())),
    }
}

/// Count pages from the PDF page tree without touching content streams
pub async fn count_pdf_pages(pdf_path: &Path) -> Result<u32> {
    let path = pdf_path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let doc = lopdf::Document::load(&path)
            .map_err(|e| Error::corrupt(format!("cannot open PDF: {}", e)))?;
        match doc.get_pages().len() {
            0 => Err(Error::corrupt("PDF has no pages")),
            n => Ok(n as u32),
        }
    })
    .await
    .map_err(|e| Error::internal(format!("page count task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_count_pages_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"%PDF-1.4\nthis is not a pdf").unwrap();

        let err = count_pdf_pages(&path).await.unwrap_err();
        assert_eq!(err.kind(), "CorruptDocumentError");
    }

    #[tokio::test]
    async fn test_count_pages_reads_page_tree() {
        use lopdf::dictionary;

        let mut doc = lopdf::Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids: Vec<lopdf::Object> = Vec::new();
        for _ in 0..3 {
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            });
            kids.push(page_id.into());
        }
        doc.objects.insert(
            pages_id,
            lopdf::Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => 3,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("three.pdf");
        doc.save(&path).unwrap();

        assert_eq!(count_pdf_pages(&path).await.unwrap(), 3);
    }

    #[test]
    fn test_from_config_selects_engine() {
        let mut config = EngineConfig::default();
        assert_eq!(from_config(&config).name(), "subprocess");
        config.kind = EngineKind::Text;
        assert_eq!(from_config(&config).name(), "text");
    }
}
