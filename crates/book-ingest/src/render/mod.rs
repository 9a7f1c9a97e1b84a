//! Page rendering and asset cropping

pub mod cropper;

use async_trait::async_trait;
use image::DynamicImage;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::{RendererConfig, RendererKind};
use crate::error::{Error, Result};

pub use cropper::AssetCropper;

/// Trait for page renderers
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Renderer name
    fn name(&self) -> &str;

    /// Render one 1-based page to an image
    async fn render(&self, pdf_path: &Path, page_number: u32) -> Result<DynamicImage>;
}

/// Build the renderer selected in the configuration
pub fn from_config(config: &RendererConfig) -> Arc<dyn PageRenderer> {
    match config.kind {
        RendererKind::Pdftoppm => Arc::new(PdftoppmRenderer::new(config)),
        RendererKind::Disabled => Arc::new(DisabledRenderer),
    }
}

/// Renders pages with poppler's `pdftoppm`
pub struct PdftoppmRenderer {
    dpi: u32,
    timeout: Duration,
}

impl PdftoppmRenderer {
    pub fn new(config: &RendererConfig) -> Self {
        Self {
            dpi: config.dpi,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Check if pdftoppm is installed
    pub async fn is_available() -> bool {
        Command::new("pdftoppm")
            .arg("-v")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok() // pdftoppm -v exits non-zero on some versions
    }
}

#[async_trait]
impl PageRenderer for PdftoppmRenderer {
    fn name(&self) -> &str {
        "pdftoppm"
    }

    async fn render(&self, pdf_path: &Path, page_number: u32) -> Result<DynamicImage> {
        let temp_dir = tempfile::tempdir()?;
        let prefix = temp_dir.path().join("page");
        let page = page_number.to_string();
        let dpi = self.dpi.to_string();

        let child = Command::new("pdftoppm")
            .args(["-png", "-r", dpi.as_str(), "-f", page.as_str(), "-l", page.as_str(), "-singlefile"])
            .arg(pdf_path)
            .arg(&prefix)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::storage(format!("failed to start pdftoppm: {}", e)))?;

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::storage(format!(
                    "pdftoppm timed out on page {} after {}s",
                    page_number,
                    self.timeout.as_secs()
                ))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::storage(format!(
                "pdftoppm failed on page {}: {}",
                page_number,
                stderr.trim()
            )));
        }

        let png = prefix.with_extension("png");
        let image = image::open(&png)
            .map_err(|e| Error::storage(format!("unreadable render of page {}: {}", page_number, e)))?;
        Ok(image)
    }
}

/// Renderer used when rendering is switched off
pub struct DisabledRenderer;

#[async_trait]
impl PageRenderer for DisabledRenderer {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn render(&self, _pdf_path: &Path, page_number: u32) -> Result<DynamicImage> {
        Err(Error::storage(format!(
            "cannot render page {}: page rendering is disabled",
            page_number
        )))
    }
}
