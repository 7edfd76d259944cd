use crate::error::IngestError;
use image::{DynamicImage, GrayImage};
use std::path::Path;

pub const PROBE_SCALE: f32 = 1.0;
pub const ARTIFACT_SCALE: f32 = 2.0;

pub trait PageRasterizer: Send + Sync {
    fn render(&self, path: &Path, ordinal: u32, scale: f32) -> Result<DynamicImage, IngestError>;
}

pub fn white_ratio(image: &GrayImage, brightness: u8) -> f32 {
    let total = image.pixels().len();
    if total == 0 {
        return 1.0;
    }
    let white = image.pixels().filter(|pixel| pixel.0[0] > brightness).count();
    white as f32 / total as f32
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlankPolicy {
    pub white_ratio: f32,
    pub brightness: u8,
    pub min_text_chars: usize,
}

impl Default for BlankPolicy {
    fn default() -> Self {
        Self {
            white_ratio: 0.95,
            brightness: 240,
            min_text_chars: 10,
        }
    }
}

impl BlankPolicy {
    /// Text wins: a page with enough extracted text is never blank, however
    /// white it renders. Without a raster, only an empty text layer is blank.
    pub fn is_blank(&self, text: &str, raster: Option<&DynamicImage>) -> bool {
        let text_chars = text.trim().chars().count();
        if text_chars >= self.min_text_chars {
            return false;
        }

        match raster {
            Some(image) => white_ratio(&image.to_luma8(), self.brightness) > self.white_ratio,
            None => text_chars == 0,
        }
    }
}

#[cfg(feature = "pdfium")]
pub use pdfium::PdfiumRasterizer;

#[cfg(feature = "pdfium")]
mod pdfium {
    use super::PageRasterizer;
    use crate::error::IngestError;
    use image::DynamicImage;
    use pdfium_render::prelude::*;
    use std::path::{Path, PathBuf};

    #[derive(Debug, Clone, Default)]
    pub struct PdfiumRasterizer {
        library_dir: Option<PathBuf>,
    }

    impl PdfiumRasterizer {
        pub fn new(library_dir: Option<PathBuf>) -> Self {
            Self { library_dir }
        }

        fn bind(&self) -> Result<Pdfium, IngestError> {
            let bindings = match &self.library_dir {
                Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir)),
                None => Pdfium::bind_to_system_library(),
            }
            .map_err(|error| IngestError::Raster(error.to_string()))?;
            Ok(Pdfium::new(bindings))
        }
    }

    impl PageRasterizer for PdfiumRasterizer {
        fn render(&self, path: &Path, ordinal: u32, scale: f32) -> Result<DynamicImage, IngestError> {
            let pdfium = self.bind()?;
            let document = pdfium
                .load_pdf_from_file(path, None)
                .map_err(|error| IngestError::Raster(error.to_string()))?;
            let index = ordinal
                .checked_sub(1)
                .ok_or_else(|| IngestError::Raster("page ordinals start at 1".to_string()))?;
            let page = document
                .pages()
                .get(index as PdfPageIndex)
                .map_err(|error| IngestError::Raster(error.to_string()))?;
            let bitmap = page
                .render_with_config(&PdfRenderConfig::new().scale_page_by_factor(scale))
                .map_err(|error| IngestError::Raster(error.to_string()))?;
            Ok(bitmap.as_image())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, RgbImage};

    fn uniform(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([value])))
    }

    #[test]
    fn white_ratio_counts_bright_pixels() {
        let mut image = GrayImage::from_pixel(10, 10, Luma([255]));
        for x in 0..10 {
            image.put_pixel(x, 0, Luma([0]));
        }
        assert!((white_ratio(&image, 240) - 0.9).abs() < 1e-6);
    }

    #[test]
    fn uniform_white_page_without_text_is_blank() {
        let policy = BlankPolicy::default();
        assert!(policy.is_blank("", Some(&uniform(40, 60, 255))));
    }

    #[test]
    fn text_heavy_page_is_never_blank() {
        let policy = BlankPolicy::default();
        let white = uniform(40, 60, 255);
        assert!(!policy.is_blank("Crimp height table", Some(&white)));
        assert!(!policy.is_blank("0123456789A", None));
    }

    #[test]
    fn short_caption_on_drawing_is_not_blank() {
        let policy = BlankPolicy::default();
        let mut drawing = RgbImage::from_pixel(20, 20, image::Rgb([255, 255, 255]));
        for y in 0..20 {
            for x in 0..4 {
                drawing.put_pixel(x, y, image::Rgb([10, 10, 10]));
            }
        }
        assert!(!policy.is_blank("Fig 3", Some(&DynamicImage::ImageRgb8(drawing))));
    }

    #[test]
    fn missing_raster_only_blanks_empty_text() {
        let policy = BlankPolicy::default();
        assert!(policy.is_blank("   ", None));
        assert!(!policy.is_blank("Fig 3", None));
    }
}
