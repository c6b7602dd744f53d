use std::io::Cursor;

use image::DynamicImage;
use pdfium_render::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RenderError {
    /// Malformed PDF or image input.
    #[error("decode error: {0}")]
    Decode(String),
    #[error("render error: {0}")]
    Internal(String),
}

/// PDF/image rasterizer.
///
/// Renders each PDF page at the configured DPI and scales down so the long
/// edge stays within the configured pixel cap. A single-image upload yields a
/// one-page document.
#[derive(Debug, Clone, Copy)]
pub struct Renderer {
    pub dpi: u32,
    pub long_edge_px: u32,
}

impl Renderer {
    pub fn new(dpi: u32, long_edge_px: u32) -> Self {
        Self { dpi, long_edge_px }
    }

    /// Rasterize every page of a PDF to PNG bytes, in source page order.
    ///
    /// pdfium is not safe to call from async contexts, so the work runs on
    /// the blocking pool.
    pub async fn render_pdf(&self, pdf_bytes: Vec<u8>) -> Result<Vec<Vec<u8>>, RenderError> {
        let renderer = *self;
        tokio::task::spawn_blocking(move || renderer.render_pdf_blocking(&pdf_bytes))
            .await
            .map_err(|e| RenderError::Internal(format!("render task panicked: {e}")))?
    }

    fn render_pdf_blocking(&self, pdf_bytes: &[u8]) -> Result<Vec<Vec<u8>>, RenderError> {
        let pdfium = Pdfium::default();

        let document = pdfium
            .load_pdf_from_byte_slice(pdf_bytes, None)
            .map_err(|e| RenderError::Decode(format!("{e:?}")))?;

        let pages = document.pages();
        let total = pages.len();
        info!("PDF loaded: {total} pages");

        let scale = self.dpi as f32 / 72.0;
        let mut results = Vec::with_capacity(total as usize);

        for idx in 0..total {
            let page = pages
                .get(idx)
                .map_err(|e| RenderError::Internal(format!("page {}: {e:?}", idx + 1)))?;

            let pw = page.width().value * scale;
            let ph = page.height().value * scale;
            let cap = self.long_edge_px as f32;
            let factor = (cap / pw).min(cap / ph).min(1.0);
            let target_width = (pw * factor).round().max(1.0) as i32;

            let render_config = PdfRenderConfig::new()
                .set_target_width(target_width)
                .set_maximum_height(self.long_edge_px as i32);

            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| RenderError::Internal(format!("page {}: {e:?}", idx + 1)))?;

            let image = bitmap.as_image();
            debug!(
                "Rendered page {} -> {}x{} px",
                idx + 1,
                image.width(),
                image.height()
            );
            results.push(encode_png(&image)?);
        }

        Ok(results)
    }

    /// Treat a single uploaded image as a one-page document.
    pub async fn render_image(&self, image_bytes: Vec<u8>) -> Result<Vec<Vec<u8>>, RenderError> {
        let renderer = *self;
        tokio::task::spawn_blocking(move || {
            let img = image::load_from_memory(&image_bytes)
                .map_err(|e| RenderError::Decode(format!("{e}")))?;

            let cap = renderer.long_edge_px;
            let img = if img.width().max(img.height()) > cap {
                img.resize(cap, cap, image::imageops::FilterType::Lanczos3)
            } else {
                img
            };

            Ok(vec![encode_png(&img)?])
        })
        .await
        .map_err(|e| RenderError::Internal(format!("render task panicked: {e}")))?
    }
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, RenderError> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| RenderError::Internal(format!("PNG encode failed: {e}")))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_render_image_round_trip() {
        let img = DynamicImage::new_rgb8(40, 20);
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let renderer = Renderer::new(200, 1540);
        let pages = renderer.render_image(png).await.unwrap();
        assert_eq!(pages.len(), 1);

        let decoded = image::load_from_memory(&pages[0]).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 20));
    }

    #[tokio::test]
    async fn test_render_image_caps_long_edge() {
        let img = DynamicImage::new_rgb8(3200, 1600);
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let renderer = Renderer::new(200, 1540);
        let pages = renderer.render_image(png).await.unwrap();
        let decoded = image::load_from_memory(&pages[0]).unwrap();
        assert!(decoded.width() <= 1540);
        assert!(decoded.height() <= 1540);
        // Aspect ratio preserved.
        assert_eq!(decoded.width(), 1540);
        assert_eq!(decoded.height(), 770);
    }

    #[tokio::test]
    async fn test_render_image_malformed_is_decode_error() {
        let renderer = Renderer::new(200, 1540);
        let result = renderer.render_image(b"not an image".to_vec()).await;
        assert!(matches!(result, Err(RenderError::Decode(_))));
    }

    #[tokio::test]
    async fn test_render_pdf_malformed_is_decode_error() {
        let renderer = Renderer::new(200, 1540);
        let result = renderer.render_pdf(b"not a pdf".to_vec()).await;
        assert!(matches!(result, Err(RenderError::Decode(_))));
    }
}
