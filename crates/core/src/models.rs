use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFingerprint {
    pub document_id: String,
    pub document_title: String,
    pub source_path: String,
    pub checksum: String,
    pub ingested_at: DateTime<Utc>,
}

impl DocumentFingerprint {
    pub fn stem(&self) -> String {
        std::path::Path::new(&self.document_title)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.document_title)
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub ordinal: u32,
    pub raw_text: String,
    pub is_blank: bool,
    pub image_ref: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub pages: Vec<Page>,
    pub total_pages: u32,
}

impl ExtractedDocument {
    pub fn content_pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.iter().filter(|page| !page.is_blank)
    }

    pub fn blank_ordinals(&self) -> Vec<u32> {
        self.pages
            .iter()
            .filter(|page| page.is_blank)
            .map(|page| page.ordinal)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Procedure,
    Definition,
    Table,
    Diagram,
    Image,
    Specification,
    Introduction,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Procedure => "procedure",
            ContentType::Definition => "definition",
            ContentType::Table => "table",
            ContentType::Diagram => "diagram",
            ContentType::Image => "image",
            ContentType::Specification => "specification",
            ContentType::Introduction => "introduction",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "procedure" => Some(ContentType::Procedure),
            "definition" => Some(ContentType::Definition),
            "table" => Some(ContentType::Table),
            "diagram" => Some(ContentType::Diagram),
            "image" => Some(ContentType::Image),
            "specification" => Some(ContentType::Specification),
            "introduction" => Some(ContentType::Introduction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Basic,
    Intermediate,
    Advanced,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Basic => "basic",
            Difficulty::Intermediate => "intermediate",
            Difficulty::Advanced => "advanced",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "basic" => Some(Difficulty::Basic),
            "intermediate" => Some(Difficulty::Intermediate),
            "advanced" => Some(Difficulty::Advanced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSource {
    Heuristic,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub topic: String,
    pub sub_topic: String,
    pub content_type: ContentType,
    pub difficulty: Difficulty,
    pub keywords: Vec<String>,
    pub technical_symbols: Vec<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
    pub source: MetadataSource,
}

#[derive(Debug, Clone)]
pub struct EnrichedPage {
    pub ordinal: u32,
    pub text: String,
    pub image_ref: Option<PathBuf>,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParentChunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub topic: String,
    pub page_range: (u32, u32),
    pub image_refs: Vec<String>,
    pub child_ids: Vec<String>,
    pub source_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildChunk {
    pub id: String,
    pub parent_id: String,
    pub document_id: String,
    pub content: String,
    pub topic: String,
    pub sub_topic: String,
    pub content_type: ContentType,
    pub difficulty: Difficulty,
    pub keywords: Vec<String>,
    pub technical_symbols: Vec<String>,
    pub source_page: u32,
    pub source_file: String,
    pub image_ref: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceMetadata {
    pub point_id: u64,
    pub parent_id: Option<String>,
    pub document_id: Option<String>,
    pub source_file: String,
    pub source_page: u32,
    pub topic: String,
    pub sub_topic: String,
    pub content_type: String,
    pub keywords: Vec<String>,
    pub image_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalResult {
    pub child_content: String,
    pub parent_content: String,
    pub similarity_score: f32,
    pub relevance_reason: String,
    pub source: SourceMetadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetadataMode {
    Heuristic,
    Model,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub max_pages: Option<u32>,
    pub force_recreate: bool,
    pub metadata_mode: MetadataMode,
    pub concurrency: usize,
    pub parent_chunk_chars: usize,
    pub parent_overlap_chars: usize,
    pub child_chunk_chars: usize,
    pub child_overlap_chars: usize,
    pub embed_batch_size: usize,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            max_pages: None,
            force_recreate: false,
            metadata_mode: MetadataMode::Model,
            concurrency: 2,
            parent_chunk_chars: 1_500,
            parent_overlap_chars: 150,
            child_chunk_chars: 400,
            child_overlap_chars: 50,
            embed_batch_size: 50,
        }
    }
}
