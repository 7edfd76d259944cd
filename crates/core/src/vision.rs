use crate::cache::{ArtifactKind, CachedArtifact, PageCache};
use crate::cost::{CostAccountant, TokenUsage};
use crate::error::ModelError;
use crate::llm::{looks_like_refusal, ChatModel, ChatRequest};
use crate::models::{DocumentFingerprint, Page};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You transcribe pages of technical training material. \
Reproduce every piece of text on the page in reading order as markdown, render tables \
as markdown tables, and describe diagrams, drawings and photos in enough detail that \
the page can be understood without the image. Keep symbols, dimensions and tolerances \
exactly as printed.";

const MIN_FALLBACK_CHARS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VisionArtifact {
    text: String,
    usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageAnalysis {
    pub ordinal: u32,
    pub text: String,
    pub from_cache: bool,
}

pub struct PageAnalyzer {
    model: Arc<dyn ChatModel>,
    cache: PageCache,
    costs: Arc<CostAccountant>,
    max_tokens: u32,
}

impl PageAnalyzer {
    pub fn new(model: Arc<dyn ChatModel>, cache: PageCache, costs: Arc<CostAccountant>) -> Self {
        Self {
            model,
            cache,
            costs,
            max_tokens: 2_000,
        }
    }

    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    /// Returns `Ok(None)` when the model declined the page and the page has
    /// no usable text layer to fall back on.
    pub async fn analyze(
        &self,
        document: &DocumentFingerprint,
        page: &Page,
    ) -> Result<Option<PageAnalysis>, ModelError> {
        if let Some(hit) = self
            .cache
            .load::<VisionArtifact>(ArtifactKind::Vision, &document.checksum, page.ordinal)
            .await
        {
            debug!(document_id = %document.document_id, page = page.ordinal, "vision cache hit");
            return Ok(Some(PageAnalysis {
                ordinal: page.ordinal,
                text: hit.value.text,
                from_cache: true,
            }));
        }

        let image_png = match &page.image_ref {
            Some(path) => match tokio::fs::read(path).await {
                Ok(bytes) => Some(bytes),
                Err(error) => {
                    warn!(page = page.ordinal, path = %path.display(), %error, "page image unreadable, sending text only");
                    None
                }
            },
            None => None,
        };

        let request = ChatRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: format!(
                "Page {} of \"{}\".\n\nExtracted text layer (may be empty or garbled):\n{}",
                page.ordinal, document.document_title, page.raw_text
            ),
            image_png,
            max_tokens: self.max_tokens,
            temperature: 0.1,
        };

        let response = self.model.complete(&request).await?;
        self.costs.record(self.model.model_id(), response.usage);

        let text = response.text.trim().to_string();
        if text.is_empty() || looks_like_refusal(&text) {
            return Ok(self.fallback_to_text_layer(page));
        }

        let artifact = CachedArtifact {
            document_id: document.document_id.clone(),
            page: page.ordinal,
            model: self.model.model_id().to_string(),
            created_at: Utc::now(),
            value: VisionArtifact {
                text: text.clone(),
                usage: response.usage,
            },
        };
        if let Err(error) = self
            .cache
            .store(ArtifactKind::Vision, &document.checksum, &artifact)
            .await
        {
            warn!(page = page.ordinal, %error, "vision artifact not cached");
        }

        info!(
            document_id = %document.document_id,
            page = page.ordinal,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "page analyzed"
        );
        Ok(Some(PageAnalysis {
            ordinal: page.ordinal,
            text,
            from_cache: false,
        }))
    }

    fn fallback_to_text_layer(&self, page: &Page) -> Option<PageAnalysis> {
        let raw = page.raw_text.trim();
        if raw.chars().count() >= MIN_FALLBACK_CHARS {
            warn!(page = page.ordinal, "model declined page, using extracted text");
            Some(PageAnalysis {
                ordinal: page.ordinal,
                text: raw.to_string(),
                from_cache: false,
            })
        } else {
            warn!(page = page.ordinal, "model declined page without usable text, skipping");
            None
        }
    }
}
