//! Writes rendered pages, thumbnails and cropped asset images
//!
//! Bounding boxes arrive in page units (top-left origin) and are scaled to the
//! pixel grid of the rendered page before cropping.

use image::{imageops::FilterType, DynamicImage, ImageFormat};

use crate::error::{Error, Result};
use crate::storage::BookLayout;
use crate::types::BBox;

/// Persists page and asset images under the book layout
#[derive(Debug, Clone)]
pub struct AssetCropper {
    layout: BookLayout,
    thumbnail_scale: f32,
}

impl AssetCropper {
    pub fn new(layout: BookLayout, thumbnail_scale: f32) -> Self {
        Self {
            layout,
            thumbnail_scale,
        }
    }

    /// Save a rendered page and its thumbnail
    pub fn save_page(&self, image: &DynamicImage, page_rel: &str, thumb_rel: &str) -> Result<()> {
        let path = self.layout.prepare(page_rel)?;
        image.save_with_format(&path, ImageFormat::Png)?;

        let width = ((image.width() as f32 * self.thumbnail_scale).round() as u32).max(1);
        let height = ((image.height() as f32 * self.thumbnail_scale).round() as u32).max(1);
        let thumb = image.resize_exact(width, height, FilterType::Triangle);
        thumb.save_with_format(self.layout.prepare(thumb_rel)?, ImageFormat::Png)?;
        Ok(())
    }

    /// Crop `bbox` out of a rendered page and save it as PNG
    pub fn crop(
        &self,
        page_image: &DynamicImage,
        page_width: f64,
        page_height: f64,
        bbox: &BBox,
        asset_rel: &str,
    ) -> Result<()> {
        let (x, y, w, h) = pixel_rect(
            page_image.width(),
            page_image.height(),
            page_width,
            page_height,
            bbox,
        )
        .ok_or_else(|| Error::storage(format!("empty crop region for {}", asset_rel)))?;

        let cropped = page_image.crop_imm(x, y, w, h);
        cropped.save_with_format(self.layout.prepare(asset_rel)?, ImageFormat::Png)?;
        Ok(())
    }

    /// Decode engine-supplied image bytes and save them as PNG
    pub fn save_inline(&self, data: &[u8], asset_rel: &str) -> Result<()> {
        let image = image::load_from_memory(data)
            .map_err(|e| Error::storage(format!("undecodable inline asset {}: {}", asset_rel, e)))?;
        image.save_with_format(self.layout.prepare(asset_rel)?, ImageFormat::Png)?;
        Ok(())
    }
}

/// Map a page-unit box onto an `img_w` x `img_h` pixel grid, clamped to the image.
///
/// Returns `None` when nothing of the box remains.
pub fn pixel_rect(
    img_w: u32,
    img_h: u32,
    page_width: f64,
    page_height: f64,
    bbox: &BBox,
) -> Option<(u32, u32, u32, u32)> {
    if page_width <= 0.0 || page_height <= 0.0 {
        return None;
    }
    let to_px = |v: f64, pixels: u32, units: f64| -> u32 {
        (v * pixels as f64 / units).round().clamp(0.0, pixels as f64) as u32
    };

    let clamped = bbox.clamp_to(page_width, page_height);
    let x0 = to_px(clamped.x, img_w, page_width);
    let y0 = to_px(clamped.y, img_h, page_height);
    let x1 = to_px(clamped.x + clamped.w, img_w, page_width);
    let y1 = to_px(clamped.y + clamped.h, img_h, page_height);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some((x0, y0, x1 - x0, y1 - y0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};

    #[test]
    fn test_pixel_rect_scales_page_units() {
        // 612x792pt page rendered at 150 dpi
        let rect = pixel_rect(1275, 1650, 612.0, 792.0, &BBox::new(72.0, 72.0, 144.0, 72.0));
        assert_eq!(rect, Some((150, 150, 300, 150)));
    }

    #[test]
    fn test_pixel_rect_clamps_and_rejects_empty() {
        let rect = pixel_rect(100, 100, 100.0, 100.0, &BBox::new(90.0, 90.0, 20.0, 20.0));
        assert_eq!(rect, Some((90, 90, 10, 10)));
        assert_eq!(pixel_rect(100, 100, 100.0, 100.0, &BBox::new(10.0, 10.0, 0.0, 5.0)), None);
    }

    #[test]
    fn test_crop_and_page_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BookLayout::new(dir.path());
        let cropper = AssetCropper::new(layout.clone(), 0.5);

        let mut canvas = RgbaImage::from_pixel(200, 100, Rgba([255, 255, 255, 255]));
        for x in 100..200 {
            for y in 0..100 {
                canvas.put_pixel(x, y, Rgba([255, 0, 0, 255]));
            }
        }
        let page = DynamicImage::ImageRgba8(canvas);

        cropper.save_page(&page, "books/b/pages/1.png", "books/b/pages/1_thumb.png").unwrap();
        let thumb = image::open(layout.resolve("books/b/pages/1_thumb.png")).unwrap();
        assert_eq!(thumb.dimensions(), (100, 50));

        // Right half of a 100x50 page is red
        cropper
            .crop(&page, 100.0, 50.0, &BBox::new(50.0, 0.0, 50.0, 50.0), "books/b/assets/1/a.png")
            .unwrap();
        let asset = image::open(layout.resolve("books/b/assets/1/a.png")).unwrap();
        assert_eq!(asset.dimensions(), (100, 100));
        assert_eq!(asset.get_pixel(0, 0), Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_save_inline_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let cropper = AssetCropper::new(BookLayout::new(dir.path()), 0.3);
        let err = cropper.save_inline(b"not an image", "books/b/assets/1/x.png").unwrap_err();
        assert_eq!(err.kind(), "StorageError");
    }
}
