use crate::error::IngestError;
use crate::models::{ExtractedDocument, Page};
use crate::raster::{BlankPolicy, PageRasterizer, ARTIFACT_SCALE, PROBE_SCALE};
use lopdf::Document;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: Option<String>,
}

pub trait PdfExtractor: Send + Sync {
    /// Every page of the document in order. Failing to open the document is an
    /// error; failing to decode a single page is not.
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let pages = document
            .get_pages()
            .into_keys()
            .map(|page_no| match document.extract_text(&[page_no]) {
                Ok(text) => PageText {
                    number: page_no,
                    text: Some(text),
                },
                Err(error) => {
                    warn!(page = page_no, %error, "page text could not be decoded");
                    PageText {
                        number: page_no,
                        text: None,
                    }
                }
            })
            .collect::<Vec<_>>();

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf has no pages: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

#[derive(Clone)]
pub struct PageExtractor {
    text: Arc<dyn PdfExtractor>,
    rasterizer: Option<Arc<dyn PageRasterizer>>,
    policy: BlankPolicy,
    image_dir: Option<PathBuf>,
}

impl Default for PageExtractor {
    fn default() -> Self {
        Self::new(Arc::new(LopdfExtractor))
    }
}

impl PageExtractor {
    pub fn new(text: Arc<dyn PdfExtractor>) -> Self {
        Self {
            text,
            rasterizer: None,
            policy: BlankPolicy::default(),
            image_dir: None,
        }
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn PageRasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    pub fn with_policy(mut self, policy: BlankPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_image_dir(mut self, image_dir: impl Into<PathBuf>) -> Self {
        self.image_dir = Some(image_dir.into());
        self
    }

    pub fn extract(
        &self,
        path: &Path,
        stem: &str,
        max_pages: Option<u32>,
    ) -> Result<ExtractedDocument, IngestError> {
        let page_texts = self.text.extract_pages(path)?;
        let total_pages = page_texts.len() as u32;

        let pages = page_texts
            .into_iter()
            .filter(|page| max_pages.map_or(true, |cap| page.number <= cap))
            .map(|page| self.classify(path, stem, page))
            .collect::<Vec<_>>();

        let blank = pages.iter().filter(|page| page.is_blank).count();
        info!(
            path = %path.display(),
            total_pages,
            selected = pages.len(),
            blank,
            "pages extracted"
        );

        Ok(ExtractedDocument { pages, total_pages })
    }

    fn classify(&self, path: &Path, stem: &str, page: PageText) -> Page {
        let Some(raw_text) = page.text else {
            return blank_page(page.number, String::new());
        };

        let needs_probe = raw_text.trim().chars().count() < self.policy.min_text_chars;
        let is_blank = if needs_probe {
            match &self.rasterizer {
                Some(rasterizer) => match rasterizer.render(path, page.number, PROBE_SCALE) {
                    Ok(probe) => self.policy.is_blank(&raw_text, Some(&probe)),
                    Err(error) => {
                        warn!(page = page.number, %error, "blank probe failed, treating page as blank");
                        true
                    }
                },
                None => self.policy.is_blank(&raw_text, None),
            }
        } else {
            false
        };

        if is_blank {
            debug!(page = page.number, "blank page skipped");
            return blank_page(page.number, raw_text);
        }

        let image_ref = self.page_image(path, stem, page.number);
        Page {
            ordinal: page.number,
            raw_text,
            is_blank: false,
            image_ref,
        }
    }

    fn page_image(&self, path: &Path, stem: &str, ordinal: u32) -> Option<PathBuf> {
        let rasterizer = self.rasterizer.as_ref()?;
        let image_dir = self.image_dir.as_ref()?;
        let target = image_dir.join(format!("{stem}_page_{ordinal}.png"));
        if target.exists() {
            return Some(target);
        }

        let rendered = rasterizer
            .render(path, ordinal, ARTIFACT_SCALE)
            .and_then(|image| {
                std::fs::create_dir_all(image_dir)?;
                image
                    .save(&target)
                    .map_err(|error| IngestError::Raster(error.to_string()))
            });

        match rendered {
            Ok(()) => Some(target),
            Err(error) => {
                warn!(page = ordinal, %error, "page image not generated");
                None
            }
        }
    }
}

fn blank_page(ordinal: u32, raw_text: String) -> Page {
    Page {
        ordinal,
        raw_text,
        is_blank: true,
        image_ref: None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, Luma};
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Object, Stream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn write_test_pdf(path: &Path, page_texts: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
        let mut document = lopdf::Document::with_version("1.5");
        let pages_id = document.new_object_id();
        let font_id = document.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = document.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for text in page_texts {
            let operations = if text.is_empty() {
                Vec::new()
            } else {
                vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ]
            };
            let content = Content { operations };
            let content_id = document.add_object(Stream::new(dictionary! {}, content.encode()?));
            let page_id = document.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        document.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "Resources" => resources_id,
                "MediaBox" => Object::Array(vec![0.into(), 0.into(), 612.into(), 792.into()]),
            }),
        );
        let catalog_id = document.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        document.trailer.set("Root", catalog_id);
        document.save(path)?;
        Ok(())
    }

    pub(crate) struct FakeRasterizer {
        pub inked: Vec<u32>,
        pub renders: AtomicUsize,
    }

    impl FakeRasterizer {
        pub(crate) fn new(inked: Vec<u32>) -> Self {
            Self {
                inked,
                renders: AtomicUsize::new(0),
            }
        }
    }

    impl PageRasterizer for FakeRasterizer {
        fn render(&self, _path: &Path, ordinal: u32, _scale: f32) -> Result<DynamicImage, IngestError> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            let value = if self.inked.contains(&ordinal) { 30 } else { 255 };
            Ok(DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([value]))))
        }
    }

    struct FailingPage;

    impl PdfExtractor for FailingPage {
        fn extract_pages(&self, _path: &Path) -> Result<Vec<PageText>, IngestError> {
            Ok(vec![
                PageText {
                    number: 1,
                    text: None,
                },
                PageText {
                    number: 2,
                    text: Some("Readable page with plenty of text".to_string()),
                },
            ])
        }
    }

    #[test]
    fn lopdf_reads_text_per_page() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("manual.pdf");
        write_test_pdf(&path, &["Crimp height inspection procedure", "", "Torque values"])?;

        let pages = LopdfExtractor.extract_pages(&path)?;
        assert_eq!(pages.len(), 3);
        assert!(pages[0]
            .text
            .as_deref()
            .is_some_and(|text| text.contains("Crimp height")));
        assert!(pages[1].text.as_deref().is_some_and(|text| text.trim().is_empty()));
        Ok(())
    }

    #[test]
    fn unreadable_document_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"%PDF-1.4\n%broken")?;

        let result = PageExtractor::default().extract(&path, "broken", None);
        assert!(matches!(result, Err(IngestError::PdfParse(_))));
        Ok(())
    }

    #[test]
    fn blank_pages_are_flagged_and_images_written() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("manual.pdf");
        write_test_pdf(&path, &["Crimp height inspection procedure", "", "Fig 1"])?;

        let extractor = PageExtractor::default()
            .with_rasterizer(Arc::new(FakeRasterizer::new(vec![3])))
            .with_image_dir(dir.path().join("images"));
        let document = extractor.extract(&path, "manual", None)?;

        assert_eq!(document.total_pages, 3);
        assert_eq!(document.blank_ordinals(), vec![2]);
        assert!(document.pages[0]
            .image_ref
            .as_ref()
            .is_some_and(|image| image.ends_with("manual_page_1.png") && image.exists()));
        assert!(document.pages[1].image_ref.is_none());
        assert!(!document.pages[2].is_blank);
        Ok(())
    }

    #[test]
    fn page_cap_keeps_total_page_count() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("manual.pdf");
        write_test_pdf(&path, &["First page text here", "Second page text here", "Third page text"])?;

        let document = PageExtractor::default().extract(&path, "manual", Some(2))?;
        assert_eq!(document.total_pages, 3);
        assert_eq!(document.pages.len(), 2);
        Ok(())
    }

    #[test]
    fn undecodable_page_is_blank_not_fatal() -> Result<(), Box<dyn std::error::Error>> {
        let extractor = PageExtractor::new(Arc::new(FailingPage));
        let document = extractor.extract(Path::new("unused.pdf"), "unused", None)?;
        assert_eq!(document.blank_ordinals(), vec![1]);
        assert_eq!(document.content_pages().count(), 1);
        Ok(())
    }
}
