pub mod cache;
pub mod chunking;
pub mod config;
pub mod cost;
pub mod embeddings;
pub mod enrich;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod raster;
pub mod retriever;
pub mod store;
pub mod stores;
pub mod traits;
pub mod vision;

pub use cache::{ArtifactKind, CachedArtifact, PageCache};
pub use chunking::{normalize_page_text, split_recursive, split_two_tier, ChunkingConfig};
pub use config::RagConfig;
pub use cost::{calculate_cost, CostAccountant, CostRecord, CostReport, TokenUsage};
pub use embeddings::{
    embed_query_or_zero, CharacterNgramEmbedder, Embedder, OpenAiEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use enrich::{HeuristicTagger, MetadataEnricher};
pub use error::{ConfigError, IngestError, ModelError, SearchError};
pub use extractor::{LopdfExtractor, PageExtractor, PageText, PdfExtractor};
pub use ingest::{
    discover_pdf_files, document_fingerprint, ingest_best_effort, resolve_targets,
    IngestionReport, SkippedPdf,
};
pub use llm::{ChatModel, ChatRequest, ChatResponse, OpenAiChatModel, RetryPolicy};
pub use models::{
    ChildChunk, ChunkMetadata, ContentType, Difficulty, DocumentFingerprint, EnrichedPage,
    IngestionOptions, MetadataMode, Page, ParentChunk, RetrievalResult, SourceMetadata,
};
pub use pipeline::{IngestionPipeline, IngestionRun};
#[cfg(feature = "pdfium")]
pub use raster::PdfiumRasterizer;
pub use raster::{BlankPolicy, PageRasterizer};
pub use retriever::{RetrievalOutcome, Retriever};
pub use store::{CollectionState, CollectionStatus, HierarchicalStore, ParentLookup};
pub use stores::{InMemoryBackend, QdrantStore};
pub use traits::{PayloadFilter, VectorBackend};
pub use vision::{PageAnalysis, PageAnalyzer};
