//! Per-book filesystem layout
//!
//! Every book owns one subtree under the storage root:
//!
//! ```text
//! books/<book_id>/original.pdf
//! books/<book_id>/engine_output.json
//! books/<book_id>/pages/<n>.png
//! books/<book_id>/pages/<n>_thumb.png
//! books/<book_id>/assets/<n>/<asset_id>.png
//! ```
//!
//! Paths stored in rows are relative to the storage root, so cleanup can
//! locate files from a page number alone.

use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::Result;

const ORIGINAL_FILE: &str = "original.pdf";
const ENGINE_OUTPUT_FILE: &str = "engine_output.json";
const PAGES_DIR: &str = "pages";
const ASSETS_DIR: &str = "assets";

/// Path conventions for the storage root
#[derive(Debug, Clone)]
pub struct BookLayout {
    root: PathBuf,
}

impl BookLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a stored relative path
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn book_dir(&self, book_id: Uuid) -> PathBuf {
        self.root.join(book_prefix(book_id))
    }

    pub fn original_rel(&self, book_id: Uuid) -> String {
        format!("{}/{}", book_prefix(book_id), ORIGINAL_FILE)
    }

    pub fn engine_output_rel(&self, book_id: Uuid) -> String {
        format!("{}/{}", book_prefix(book_id), ENGINE_OUTPUT_FILE)
    }

    pub fn page_image_rel(&self, book_id: Uuid, page: u32) -> String {
        format!("{}/{}/{}.png", book_prefix(book_id), PAGES_DIR, page)
    }

    pub fn thumbnail_rel(&self, book_id: Uuid, page: u32) -> String {
        format!("{}/{}/{}_thumb.png", book_prefix(book_id), PAGES_DIR, page)
    }

    pub fn asset_rel(&self, book_id: Uuid, page: u32, asset_id: Uuid) -> String {
        format!("{}/{}/{}/{}.png", book_prefix(book_id), ASSETS_DIR, page, asset_id)
    }

    /// Write the uploaded bytes to `original.pdf`
    pub async fn write_original(&self, book_id: Uuid, data: &[u8]) -> Result<PathBuf> {
        let path = self.resolve(&self.original_rel(book_id));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    /// Create parent directories for a relative path
    pub fn prepare(&self, relative: &str) -> Result<PathBuf> {
        let path = self.resolve(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// Delete rendered pages and asset directories for pages after `page`.
    ///
    /// Returns the number of entries removed.
    pub fn remove_pages_after(&self, book_id: Uuid, page: u32) -> Result<usize> {
        let book_dir = self.book_dir(book_id);
        let mut removed = 0;

        let pages_dir = book_dir.join(PAGES_DIR);
        if pages_dir.is_dir() {
            for entry in std::fs::read_dir(&pages_dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(number) = name.to_str().and_then(page_number_of_image) else {
                    continue;
                };
                if number > page {
                    std::fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }

        let assets_dir = book_dir.join(ASSETS_DIR);
        if assets_dir.is_dir() {
            for entry in std::fs::read_dir(&assets_dir)? {
                let entry = entry?;
                let number = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok());
                if matches!(number, Some(n) if n > page) {
                    std::fs::remove_dir_all(entry.path())?;
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }

    /// Delete everything derived from the original file
    pub fn remove_derived(&self, book_id: Uuid) -> Result<()> {
        let book_dir = self.book_dir(book_id);
        for dir in [PAGES_DIR, ASSETS_DIR] {
            let path = book_dir.join(dir);
            if path.exists() {
                std::fs::remove_dir_all(path)?;
            }
        }
        let output = book_dir.join(ENGINE_OUTPUT_FILE);
        if output.exists() {
            std::fs::remove_file(output)?;
        }
        Ok(())
    }

    /// Best-effort removal of files written for an uncommitted batch
    pub fn remove_files(&self, relative_paths: &[String]) {
        for rel in relative_paths {
            let path = self.resolve(rel);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

fn book_prefix(book_id: Uuid) -> String {
    format!("books/{}", book_id)
}

/// `12.png` and `12_thumb.png` both belong to page 12
fn page_number_of_image(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(".png")?;
    let stem = stem.strip_suffix("_thumb").unwrap_or(stem);
    stem.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths_follow_convention() {
        let layout = BookLayout::new("/data");
        let id = Uuid::nil();
        assert_eq!(
            layout.page_image_rel(id, 3),
            "books/00000000-0000-0000-0000-000000000000/pages/3.png"
        );
        assert!(layout.thumbnail_rel(id, 3).ends_with("pages/3_thumb.png"));
        assert_eq!(
            layout.resolve(&layout.original_rel(id)),
            PathBuf::from("/data/books/00000000-0000-0000-0000-000000000000/original.pdf")
        );
    }

    #[test]
    fn test_remove_pages_after() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BookLayout::new(dir.path());
        let book = Uuid::new_v4();
        let asset = Uuid::new_v4();

        for page in [1, 2, 3] {
            for rel in [layout.page_image_rel(book, page), layout.thumbnail_rel(book, page)] {
                std::fs::write(layout.prepare(&rel).unwrap(), b"png").unwrap();
            }
            std::fs::write(layout.prepare(&layout.asset_rel(book, page, asset)).unwrap(), b"png")
                .unwrap();
        }

        let removed = layout.remove_pages_after(book, 1).unwrap();
        assert_eq!(removed, 6);
        assert!(layout.resolve(&layout.page_image_rel(book, 1)).exists());
        assert!(layout.resolve(&layout.asset_rel(book, 1, asset)).exists());
        assert!(!layout.resolve(&layout.thumbnail_rel(book, 2)).exists());
        assert!(!layout.resolve(&layout.asset_rel(book, 3, asset)).exists());
    }

    #[tokio::test]
    async fn test_remove_derived_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BookLayout::new(dir.path());
        let book = Uuid::new_v4();
        layout.write_original(book, b"%PDF-1.4").await.unwrap();
        std::fs::write(layout.prepare(&layout.page_image_rel(book, 1)).unwrap(), b"png").unwrap();

        layout.remove_derived(book).unwrap();
        assert!(layout.resolve(&layout.original_rel(book)).exists());
        assert!(!layout.book_dir(book).join("pages").exists());
    }

    #[test]
    fn test_page_number_of_image() {
        assert_eq!(page_number_of_image("12.png"), Some(12));
        assert_eq!(page_number_of_image("12_thumb.png"), Some(12));
        assert_eq!(page_number_of_image("notes.txt"), None);
    }
}
