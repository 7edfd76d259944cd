use crate::error::ConfigError;
use crate::models::{IngestionOptions, MetadataMode};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RagConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_collection")]
    pub collection: String,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    #[serde(default = "default_vision_model")]
    pub metadata_model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_ingest_timeout")]
    pub ingest_timeout: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_query_timeout")]
    pub query_timeout: Duration,

    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,

    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub max_pages: Option<u32>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_parent_chars")]
    pub parent_chunk_chars: usize,

    #[serde(default = "default_parent_overlap")]
    pub parent_overlap_chars: usize,

    #[serde(default = "default_child_chars")]
    pub child_chunk_chars: usize,

    #[serde(default = "default_child_overlap")]
    pub child_overlap_chars: usize,

    #[serde(default = "default_white_ratio")]
    pub blank_white_ratio: f32,

    #[serde(default = "default_brightness")]
    pub blank_brightness: u8,

    #[serde(default = "default_metadata_mode")]
    pub metadata_mode: MetadataMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_fallback_scan")]
    pub fallback_scan_limit: usize,
}

fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}

fn default_collection() -> String {
    "training_docs".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_vision_model() -> String {
    "gpt-4o".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-large".to_string()
}

fn default_embedding_dimensions() -> usize {
    3072
}

fn default_ingest_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retries() -> usize {
    3
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("outputs/cache")
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("outputs/images")
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("outputs/reports")
}

fn default_concurrency() -> usize {
    2
}

fn default_batch_size() -> usize {
    50
}

fn default_parent_chars() -> usize {
    1_500
}

fn default_parent_overlap() -> usize {
    150
}

fn default_child_chars() -> usize {
    400
}

fn default_child_overlap() -> usize {
    50
}

fn default_white_ratio() -> f32 {
    0.95
}

fn default_brightness() -> u8 {
    240
}

fn default_metadata_mode() -> MetadataMode {
    MetadataMode::Model
}

fn default_top_k() -> usize {
    3
}

fn default_fallback_scan() -> usize {
    256
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            qdrant_url: default_qdrant_url(),
            api_key: None,
            collection: default_collection(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            vision_model: default_vision_model(),
            metadata_model: default_vision_model(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            ingest_timeout: default_ingest_timeout(),
            query_timeout: default_query_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            image_dir: default_image_dir(),
            report_dir: default_report_dir(),
            concurrency: default_concurrency(),
            max_pages: None,
            batch_size: default_batch_size(),
            parent_chunk_chars: default_parent_chars(),
            parent_overlap_chars: default_parent_overlap(),
            child_chunk_chars: default_child_chars(),
            child_overlap_chars: default_child_overlap(),
            blank_white_ratio: default_white_ratio(),
            blank_brightness: default_brightness(),
            metadata_mode: default_metadata_mode(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            fallback_scan_limit: default_fallback_scan(),
        }
    }
}

impl RagConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = non_empty("QDRANT_URL") {
            self.backend.qdrant_url = value;
        }
        if let Some(value) = non_empty("QDRANT_API_KEY") {
            self.backend.api_key = Some(value);
        }
        if let Some(value) = non_empty("RAG_COLLECTION") {
            self.backend.collection = value;
        }
        if let Some(value) = non_empty("OPENAI_API_KEY") {
            self.models.api_key = Some(value);
        }
        if let Some(value) = non_empty("OPENAI_BASE_URL") {
            self.models.base_url = value;
        }
        if let Some(value) = non_empty("VISION_MODEL") {
            self.models.vision_model = value;
        }
        if let Some(value) = non_empty("METADATA_MODEL") {
            self.models.metadata_model = value;
        }
        if let Some(value) = non_empty("EMBEDDING_MODEL") {
            self.models.embedding_model = value;
        }
        if let Some(value) = non_empty("EMBEDDING_DIMENSIONS").and_then(|raw| raw.parse().ok()) {
            self.models.embedding_dimensions = value;
        }
        if let Some(value) = non_empty("RAG_CACHE_DIR") {
            self.pipeline.cache_dir = PathBuf::from(value);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.collection.trim().is_empty() {
            return Err(ConfigError::Invalid("collection name is empty".to_string()));
        }
        if self.models.embedding_dimensions == 0 {
            return Err(ConfigError::Invalid(
                "embedding_dimensions must be positive".to_string(),
            ));
        }
        if self.pipeline.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".to_string()));
        }
        if self.pipeline.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".to_string()));
        }

        let tiers = [
            ("parent", self.pipeline.parent_chunk_chars, self.pipeline.parent_overlap_chars),
            ("child", self.pipeline.child_chunk_chars, self.pipeline.child_overlap_chars),
        ];
        for (tier, size, overlap) in tiers {
            if size == 0 || overlap >= size {
                return Err(ConfigError::Invalid(format!(
                    "{tier} chunk size {size} must be positive and larger than overlap {overlap}"
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.pipeline.blank_white_ratio) {
            return Err(ConfigError::Invalid(format!(
                "blank_white_ratio {} is outside [0, 1]",
                self.pipeline.blank_white_ratio
            )));
        }

        Ok(())
    }

    pub fn ingestion_options(&self) -> IngestionOptions {
        IngestionOptions {
            max_pages: self.pipeline.max_pages,
            force_recreate: false,
            metadata_mode: self.pipeline.metadata_mode,
            concurrency: self.pipeline.concurrency,
            parent_chunk_chars: self.pipeline.parent_chunk_chars,
            parent_overlap_chars: self.pipeline.parent_overlap_chars,
            child_chunk_chars: self.pipeline.child_chunk_chars,
            child_overlap_chars: self.pipeline.child_overlap_chars,
            embed_batch_size: self.pipeline.batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_toml_keeps_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let config: RagConfig = toml::from_str(
            r#"
            [backend]
            collection = "crimping"

            [models]
            query_timeout = 3
            "#,
        )?;

        assert_eq!(config.backend.collection, "crimping");
        assert_eq!(config.backend.qdrant_url, "http://localhost:6333");
        assert_eq!(config.models.query_timeout, Duration::from_secs(3));
        assert_eq!(config.models.ingest_timeout, Duration::from_secs(60));
        assert_eq!(config.pipeline.concurrency, 2);
        assert_eq!(config.retrieval.top_k, 3);
        Ok(())
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RAG_COLLECTION", "from_env"),
            ("EMBEDDING_DIMENSIONS", "1536"),
            ("OPENAI_API_KEY", "   "),
        ]);
        let mut config = RagConfig::default();
        config.apply_env(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.backend.collection, "from_env");
        assert_eq!(config.models.embedding_dimensions, 1536);
        assert!(config.models.api_key.is_none());
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let mut config = RagConfig::default();
        config.pipeline.child_overlap_chars = 400;
        assert!(config.validate().is_err());

        config.pipeline.child_overlap_chars = 50;
        assert!(config.validate().is_ok());
    }
}
