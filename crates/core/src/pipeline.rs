use crate::cache::PageCache;
use crate::chunking::split_two_tier;
use crate::cost::{CostAccountant, CostReport};
use crate::embeddings::Embedder;
use crate::enrich::{HeuristicTagger, MetadataEnricher};
use crate::error::IngestError;
use crate::extractor::PageExtractor;
use crate::ingest::document_fingerprint;
use crate::llm::ChatModel;
use crate::models::{
    ChildChunk, DocumentFingerprint, EnrichedPage, IngestionOptions, MetadataMode, Page,
    ParentChunk,
};
use crate::store::HierarchicalStore;
use crate::vision::PageAnalyzer;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct IngestionRun {
    pub run_id: Uuid,
    pub document_id: String,
    pub source_file: String,
    pub unchanged: bool,
    pub total_pages: u32,
    pub pages_processed: u32,
    pub blank_pages: Vec<u32>,
    pub skipped_pages: Vec<u32>,
    pub parents_written: usize,
    pub children_written: usize,
    pub cost: CostReport,
    pub cost_report_path: Option<PathBuf>,
}

enum PageOutcome {
    Enriched(EnrichedPage),
    Declined,
    Failed(String),
}

#[derive(Default)]
struct EmbeddedChunks {
    parents: Vec<ParentChunk>,
    children: Vec<ChildChunk>,
    vectors: Vec<Vec<f32>>,
    failed_batches: usize,
}

pub struct IngestionPipeline {
    extractor: PageExtractor,
    vision: Arc<dyn ChatModel>,
    metadata_model: Option<Arc<dyn ChatModel>>,
    embedder: Arc<dyn Embedder>,
    store: HierarchicalStore,
    cache_dir: PathBuf,
    report_dir: Option<PathBuf>,
    options: IngestionOptions,
    recreated: bool,
}

impl IngestionPipeline {
    pub fn new(
        extractor: PageExtractor,
        vision: Arc<dyn ChatModel>,
        embedder: Arc<dyn Embedder>,
        store: HierarchicalStore,
        cache_dir: impl Into<PathBuf>,
        options: IngestionOptions,
    ) -> Result<Self, IngestError> {
        if embedder.dimensions() != store.dimensions() {
            return Err(IngestError::InvalidArgument(format!(
                "embedder {} produces {} dimensions, collection {} expects {}",
                embedder.model_id(),
                embedder.dimensions(),
                store.name(),
                store.dimensions()
            )));
        }
        if options.concurrency == 0 {
            return Err(IngestError::InvalidArgument(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if options.embed_batch_size == 0 {
            return Err(IngestError::InvalidArgument(
                "embed batch size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            extractor,
            vision,
            metadata_model: None,
            embedder,
            store,
            cache_dir: cache_dir.into(),
            report_dir: None,
            options,
            recreated: false,
        })
    }

    pub fn with_metadata_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.metadata_model = Some(model);
        self
    }

    pub fn with_report_dir(mut self, report_dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(report_dir.into());
        self
    }

    pub fn store(&self) -> &HierarchicalStore {
        &self.store
    }

    pub fn into_store(self) -> HierarchicalStore {
        self.store
    }

    pub async fn ingest_document(&mut self, path: &Path) -> Result<IngestionRun, IngestError> {
        let started = Instant::now();
        let owned = path.to_path_buf();
        let fingerprint = tokio::task::spawn_blocking(move || document_fingerprint(&owned))
            .await
            .map_err(|error| IngestError::Task(error.to_string()))??;

        if self.options.force_recreate && !self.recreated {
            let epoch = self.store.recreate().await?;
            self.recreated = true;
            info!(collection = self.store.name(), epoch, "collection recreated, page cache invalidated");
        } else if self.store.should_skip_reprocessing(&fingerprint).await? {
            info!(
                document_id = %fingerprint.document_id,
                source = %fingerprint.document_title,
                "document unchanged, skipping"
            );
            return Ok(self.unchanged_run(&fingerprint, started));
        }

        let extractor = self.extractor.clone();
        let owned = path.to_path_buf();
        let stem = fingerprint.stem();
        let max_pages = self.options.max_pages;
        let extracted = tokio::task::spawn_blocking(move || extractor.extract(&owned, &stem, max_pages))
            .await
            .map_err(|error| IngestError::Task(error.to_string()))??;

        let costs = Arc::new(CostAccountant::new());
        let cache = PageCache::new(&self.cache_dir, self.store.epoch());
        let analyzer = Arc::new(PageAnalyzer::new(
            Arc::clone(&self.vision),
            cache.clone(),
            Arc::clone(&costs),
        ));
        let mut enricher = MetadataEnricher::heuristic(HeuristicTagger::new()?, cache, Arc::clone(&costs));
        if self.options.metadata_mode == MetadataMode::Model {
            if let Some(model) = &self.metadata_model {
                enricher = enricher.with_model(Arc::clone(model));
            }
        }

        let document = Arc::new(fingerprint);
        let content_pages = extracted.content_pages().cloned().collect::<Vec<_>>();
        let content_ordinals = content_pages.iter().map(|page| page.ordinal).collect::<Vec<_>>();
        let (enriched, failed_pages) = self
            .analyze_pages(&document, content_pages, analyzer, Arc::new(enricher))
            .await;

        let processed = enriched.iter().map(|page| page.ordinal).collect::<HashSet<_>>();
        let skipped_pages = content_ordinals
            .into_iter()
            .filter(|ordinal| !processed.contains(ordinal))
            .collect::<Vec<_>>();

        let mut parents = Vec::new();
        let mut children = Vec::new();
        for page in &enriched {
            let (page_parents, page_children) = split_two_tier(&document, page, &self.options)?;
            parents.extend(page_parents);
            children.extend(page_children);
        }

        let embedded = self.embed_children(parents, children).await;
        let failures = failed_pages + embedded.failed_batches;
        // Earlier chunks of this document are replaced, unless this run has
        // nothing usable to put in their place.
        if embedded.children.is_empty() && failures > 0 {
            warn!(
                document_id = %document.document_id,
                failures,
                "no chunks produced, keeping previously stored chunks"
            );
        } else {
            self.store.remove_document(&document.document_id).await?;
        }
        let summary = self
            .store
            .insert(&embedded.parents, &embedded.children, &embedded.vectors)
            .await?;

        // A document with failed pages is left unrecorded so the next run retries it.
        if failures == 0 {
            self.store
                .record_document(&document, processed.len() as u32, summary.children_written)
                .await?;
        } else {
            warn!(
                document_id = %document.document_id,
                failed_pages,
                failed_batches = embedded.failed_batches,
                "document partially ingested, it will be reprocessed next run"
            );
        }

        let report = costs.report(
            &document.document_id,
            &document.document_title,
            self.vision.model_id(),
            extracted.total_pages,
            processed.len() as u32,
            started.elapsed(),
        );
        let cost_report_path = self.write_cost_report(&document, &report).await;

        info!(
            document_id = %document.document_id,
            source = %document.document_title,
            pages = processed.len(),
            blank = extracted.blank_ordinals().len(),
            skipped = skipped_pages.len(),
            parents = summary.parents_written,
            children = summary.children_written,
            cost_usd = report.total_cost_usd,
            "document ingested"
        );

        Ok(IngestionRun {
            run_id: Uuid::new_v4(),
            document_id: document.document_id.clone(),
            source_file: document.document_title.clone(),
            unchanged: false,
            total_pages: extracted.total_pages,
            pages_processed: processed.len() as u32,
            blank_pages: extracted.blank_ordinals(),
            skipped_pages,
            parents_written: summary.parents_written,
            children_written: summary.children_written,
            cost: report,
            cost_report_path,
        })
    }

    async fn analyze_pages(
        &self,
        document: &Arc<DocumentFingerprint>,
        pages: Vec<Page>,
        analyzer: Arc<PageAnalyzer>,
        enricher: Arc<MetadataEnricher>,
    ) -> (Vec<EnrichedPage>, usize) {
        let permits = Arc::new(Semaphore::new(self.options.concurrency));
        let mut tasks = JoinSet::new();

        for page in pages {
            let permits = Arc::clone(&permits);
            let analyzer = Arc::clone(&analyzer);
            let enricher = Arc::clone(&enricher);
            let document = Arc::clone(document);

            tasks.spawn(async move {
                let ordinal = page.ordinal;
                let _permit = match permits.acquire().await {
                    Ok(permit) => permit,
                    Err(error) => return (ordinal, PageOutcome::Failed(error.to_string())),
                };

                match analyzer.analyze(&document, &page).await {
                    Ok(Some(analysis)) => {
                        let metadata = enricher.enrich(&document, ordinal, &analysis.text).await;
                        let enriched = EnrichedPage {
                            ordinal,
                            text: analysis.text,
                            image_ref: page.image_ref.clone(),
                            metadata,
                        };
                        (ordinal, PageOutcome::Enriched(enriched))
                    }
                    Ok(None) => (ordinal, PageOutcome::Declined),
                    Err(error) => (ordinal, PageOutcome::Failed(error.to_string())),
                }
            });
        }

        let mut enriched = Vec::new();
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, PageOutcome::Enriched(page))) => enriched.push(page),
                Ok((ordinal, PageOutcome::Declined)) => {
                    debug!(page = ordinal, "page declined without fallback text");
                }
                Ok((ordinal, PageOutcome::Failed(reason))) => {
                    warn!(page = ordinal, %reason, "page analysis failed, skipping page");
                    failed += 1;
                }
                Err(error) => {
                    warn!(%error, "page task aborted");
                    failed += 1;
                }
            }
        }

        enriched.sort_by_key(|page| page.ordinal);
        (enriched, failed)
    }

    /// Children of a failed batch are dropped, and so is any parent left
    /// without children.
    async fn embed_children(&self, mut parents: Vec<ParentChunk>, children: Vec<ChildChunk>) -> EmbeddedChunks {
        let mut embedded = EmbeddedChunks::default();

        for batch in children.chunks(self.options.embed_batch_size) {
            let texts = batch
                .iter()
                .map(|child| child.content.clone())
                .collect::<Vec<_>>();
            match self.embedder.embed_batch(&texts).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    embedded.children.extend(batch.iter().cloned());
                    embedded.vectors.extend(vectors);
                }
                Ok(vectors) => {
                    warn!(expected = batch.len(), got = vectors.len(), "embedding batch truncated, skipping");
                    embedded.failed_batches += 1;
                }
                Err(error) => {
                    warn!(model = self.embedder.model_id(), size = batch.len(), %error, "embedding batch failed, skipping");
                    embedded.failed_batches += 1;
                }
            }
        }

        let kept_children = embedded
            .children
            .iter()
            .map(|child| child.id.clone())
            .collect::<HashSet<_>>();
        let kept_parents = embedded
            .children
            .iter()
            .map(|child| child.parent_id.clone())
            .collect::<HashSet<_>>();
        parents.retain(|parent| kept_parents.contains(&parent.id));
        for parent in &mut parents {
            parent.child_ids.retain(|id| kept_children.contains(id));
        }
        embedded.parents = parents;
        embedded
    }

    async fn write_cost_report(&self, document: &DocumentFingerprint, report: &CostReport) -> Option<PathBuf> {
        let report_dir = self.report_dir.as_ref()?;
        let target = report_dir.join(format!("{}_cost_report.json", document.stem()));

        let written = async {
            let body = serde_json::to_vec_pretty(report)?;
            tokio::fs::create_dir_all(report_dir).await?;
            tokio::fs::write(&target, body).await?;
            Ok::<_, IngestError>(())
        }
        .await;

        match written {
            Ok(()) => Some(target),
            Err(error) => {
                warn!(path = %target.display(), %error, "cost report not written");
                None
            }
        }
    }

    fn unchanged_run(&self, document: &DocumentFingerprint, started: Instant) -> IngestionRun {
        let report = CostAccountant::new().report(
            &document.document_id,
            &document.document_title,
            self.vision.model_id(),
            0,
            0,
            started.elapsed(),
        );
        IngestionRun {
            run_id: Uuid::new_v4(),
            document_id: document.document_id.clone(),
            source_file: document.document_title.clone(),
            unchanged: true,
            total_pages: 0,
            pages_processed: 0,
            blank_pages: Vec::new(),
            skipped_pages: Vec::new(),
            parents_written: 0,
            children_written: 0,
            cost: report,
            cost_report_path: None,
        }
    }
}
