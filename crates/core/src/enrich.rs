use crate::cache::{ArtifactKind, CachedArtifact, PageCache};
use crate::cost::CostAccountant;
use crate::error::{IngestError, ModelError};
use crate::llm::{looks_like_refusal, ChatModel, ChatRequest};
use crate::models::{ChunkMetadata, ContentType, DocumentFingerprint, Difficulty, MetadataSource};
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_TOPIC: &str = "General";
const MAX_KEYWORDS: usize = 10;
const MAX_SYMBOLS: usize = 5;
const SUB_TOPIC_CHARS: usize = 50;
const PROMPT_TEXT_CHARS: usize = 2_000;

const TOPIC_PATTERNS: &[(&str, &[&str])] = &[
    ("Crimping", &["crimp", "terminal", "壓接", "端子"]),
    ("Part Drawings", &["part drawing", "component", "supplier", "iqc", "零件圖", "零件", "供應商"]),
    ("Assembly Drawings", &["assembly", "finished product", "bom", "成品圖", "成品", "組裝"]),
    ("Drawing Symbols", &["symbol", "φ", "diameter", "thickness", "符號", "直徑", "厚度"]),
    ("Wiring Diagrams", &["wiring", "pin", "connector", "circuit", "線位圖", "連接器", "電路"]),
    ("Drawing Validity", &["valid drawing", "inspection stamp", "approval stamp", "revision", "有效圖面", "檢驗章", "發行版本"]),
    ("Tolerance Standards", &["tolerance", "max", "min", "specification", "公差", "規格", "標準"]),
];

const CONTENT_TYPE_PATTERNS: &[(ContentType, &[&str])] = &[
    (ContentType::Procedure, &["step", "procedure", "how to", "method", "步驟", "流程", "如何", "方法", "程序"]),
    (ContentType::Definition, &["definition", "is defined", "refers to", "means", "是什麼", "定義", "意思", "含義"]),
    (ContentType::Diagram, &["diagram", "drawing", "figure", "fig.", "示意圖", "圖面"]),
    (ContentType::Image, &["photo", "picture", "照片", "圖片"]),
    (ContentType::Specification, &["specification", "tolerance", "rated", "規格", "公差"]),
    (ContentType::Introduction, &["introduction", "overview", "purpose", "介紹", "概述", "目的"]),
];

const TECHNICAL_TERMS: &[&str] = &[
    "process", "quality", "inspection", "standard", "specification", "tolerance", "procedure",
    "製程", "品質", "檢驗", "標準", "規格", "流程", "工序",
];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "with", "this", "that", "from", "into", "onto", "was", "were",
    "has", "have", "not", "but", "its", "all", "any", "can", "may", "must", "shall", "will",
    "of", "to", "in", "on", "at", "by", "or", "an", "as", "is", "be", "it",
    "的", "是", "在", "有", "和", "與", "或", "但", "如果", "因為", "所以",
];

pub const EXTRA_FIELDS: &[&str] = &[
    "document_section",
    "equipment_mentioned",
    "materials_mentioned",
    "processes_mentioned",
    "standards_mentioned",
    "measurement_units",
    "safety_requirements",
    "quality_criteria",
    "application_area",
    "target_audience",
    "importance_level",
];

#[derive(Debug, Clone)]
pub struct HeuristicTagger {
    word: Regex,
    abbreviation: Regex,
    quantity: Regex,
    tolerance: Regex,
}

impl HeuristicTagger {
    pub fn new() -> Result<Self, IngestError> {
        Ok(Self {
            word: Regex::new(r"\w+")?,
            abbreviation: Regex::new(r"\b[A-Z]{2,}\b")?,
            quantity: Regex::new(r"\d+(?:\.\d+)?[a-zA-Zμ]+")?,
            tolerance: Regex::new(r"[Φ±]\d+(?:\.\d+)?")?,
        })
    }

    pub fn tag(&self, text: &str) -> ChunkMetadata {
        let topic = identify_topic(text);
        ChunkMetadata {
            sub_topic: sub_topic(text),
            content_type: identify_content_type(text),
            difficulty: difficulty(text),
            keywords: self.keywords(text),
            technical_symbols: self.technical_symbols(text),
            topic,
            extra: BTreeMap::new(),
            source: MetadataSource::Heuristic,
        }
    }

    pub fn keywords(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.word
            .find_iter(text)
            .map(|word| word.as_str())
            .filter(|word| word.chars().count() >= 2)
            .filter(|word| !word.chars().all(|c| c.is_ascii_digit() || c == '_'))
            .filter(|word| !STOPWORDS.contains(&word.to_lowercase().as_str()))
            .filter(|word| seen.insert(word.to_lowercase()))
            .take(MAX_KEYWORDS)
            .map(str::to_string)
            .collect()
    }

    pub fn technical_symbols(&self, text: &str) -> Vec<String> {
        let mut matches = self
            .abbreviation
            .find_iter(text)
            .chain(self.tolerance.find_iter(text))
            .chain(self.quantity.find_iter(text))
            .map(|symbol| (symbol.start(), symbol.as_str()))
            .collect::<Vec<_>>();
        matches.sort_by_key(|(start, _)| *start);

        let mut seen = HashSet::new();
        matches
            .into_iter()
            .map(|(_, symbol)| symbol)
            .filter(|symbol| seen.insert(*symbol))
            .take(MAX_SYMBOLS)
            .map(str::to_string)
            .collect()
    }
}

pub fn identify_topic(text: &str) -> String {
    let lowered = text.to_lowercase();
    TOPIC_PATTERNS
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|pattern| lowered.contains(pattern)))
        .map(|(topic, _)| topic.to_string())
        .unwrap_or_else(|| DEFAULT_TOPIC.to_string())
}

pub fn identify_content_type(text: &str) -> ContentType {
    if text.contains('|') || text.contains("---") {
        return ContentType::Table;
    }
    let lowered = text.to_lowercase();
    CONTENT_TYPE_PATTERNS
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|pattern| lowered.contains(pattern)))
        .map(|(content_type, _)| *content_type)
        .unwrap_or(ContentType::Definition)
}

pub fn difficulty(text: &str) -> Difficulty {
    let lowered = text.to_lowercase();
    let terms = TECHNICAL_TERMS
        .iter()
        .filter(|term| lowered.contains(*term))
        .count();
    let length = text.chars().count();

    if terms >= 3 || length > 500 {
        Difficulty::Advanced
    } else if terms >= 1 || length > 200 {
        Difficulty::Intermediate
    } else {
        Difficulty::Basic
    }
}

pub fn sub_topic(text: &str) -> String {
    let flattened = text.trim().replace('\n', " ");
    let head = flattened.chars().take(SUB_TOPIC_CHARS).collect::<String>();
    if head.chars().count() < flattened.chars().count() {
        format!("{}...", head.trim_end())
    } else {
        head
    }
}

pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

pub fn merge_model_metadata(
    heuristic: ChunkMetadata,
    answer: &Value,
) -> Result<ChunkMetadata, ModelError> {
    let object = answer
        .as_object()
        .ok_or_else(|| ModelError::Malformed("metadata answer is not a JSON object".to_string()))?;

    let text_field = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    let list_field = |key: &str, limit: usize| {
        object.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .take(limit)
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
    };

    let extra = EXTRA_FIELDS
        .iter()
        .filter_map(|key| {
            let value = object.get(*key)?;
            let empty = value.is_null()
                || value.as_str().is_some_and(|text| text.trim().is_empty())
                || value.as_array().is_some_and(Vec::is_empty);
            (!empty).then(|| (key.to_string(), value.clone()))
        })
        .collect();

    Ok(ChunkMetadata {
        topic: text_field("topic").unwrap_or(heuristic.topic),
        sub_topic: text_field("sub_topic").unwrap_or(heuristic.sub_topic),
        content_type: text_field("content_type")
            .and_then(|label| ContentType::parse(&label))
            .unwrap_or(heuristic.content_type),
        difficulty: text_field("difficulty_level")
            .or_else(|| text_field("difficulty"))
            .and_then(|label| Difficulty::parse(&label))
            .unwrap_or(heuristic.difficulty),
        keywords: list_field("keywords", MAX_KEYWORDS)
            .filter(|keywords| !keywords.is_empty())
            .unwrap_or(heuristic.keywords),
        technical_symbols: list_field("technical_symbols", MAX_SYMBOLS)
            .filter(|symbols| !symbols.is_empty())
            .unwrap_or(heuristic.technical_symbols),
        extra,
        source: MetadataSource::Model,
    })
}

fn metadata_prompt(page: u32, text: &str) -> String {
    let excerpt = text.chars().take(PROMPT_TEXT_CHARS).collect::<String>();
    format!(
        "Analyze page {page} of a technical document and return one JSON object with these keys:\n\
         topic, sub_topic, content_type (one of procedure, definition, table, diagram, image, \
         specification, introduction), keywords (array), difficulty_level (basic, intermediate \
         or advanced), technical_symbols (array), document_section, equipment_mentioned (array), \
         materials_mentioned (array), processes_mentioned (array), standards_mentioned (array), \
         measurement_units (array), safety_requirements (array), quality_criteria (array), \
         application_area, target_audience, importance_level (high, medium or low).\n\n\
         Content:\n{excerpt}"
    )
}

pub struct MetadataEnricher {
    tagger: HeuristicTagger,
    model: Option<Arc<dyn ChatModel>>,
    cache: PageCache,
    costs: Arc<CostAccountant>,
}

impl MetadataEnricher {
    pub fn heuristic(tagger: HeuristicTagger, cache: PageCache, costs: Arc<CostAccountant>) -> Self {
        Self {
            tagger,
            model: None,
            cache,
            costs,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Never fails: every model problem degrades to the heuristic tags.
    pub async fn enrich(&self, document: &DocumentFingerprint, page: u32, text: &str) -> ChunkMetadata {
        let heuristic = self.tagger.tag(text);
        let Some(model) = &self.model else {
            return heuristic;
        };

        if let Some(hit) = self
            .cache
            .load::<ChunkMetadata>(ArtifactKind::Metadata, &document.checksum, page)
            .await
        {
            debug!(document_id = %document.document_id, page, "metadata cache hit");
            return hit.value;
        }

        match self.ask_model(model.as_ref(), page, text, heuristic.clone()).await {
            Ok(metadata) => {
                let artifact = CachedArtifact {
                    document_id: document.document_id.clone(),
                    page,
                    model: model.model_id().to_string(),
                    created_at: Utc::now(),
                    value: metadata.clone(),
                };
                if let Err(error) = self
                    .cache
                    .store(ArtifactKind::Metadata, &document.checksum, &artifact)
                    .await
                {
                    warn!(page, %error, "metadata artifact not cached");
                }
                metadata
            }
            Err(error) => {
                warn!(document_id = %document.document_id, page, %error, "model metadata unavailable, using heuristics");
                heuristic
            }
        }
    }

    async fn ask_model(
        &self,
        model: &dyn ChatModel,
        page: u32,
        text: &str,
        heuristic: ChunkMetadata,
    ) -> Result<ChunkMetadata, ModelError> {
        let request = ChatRequest {
            system: "You extract structured metadata from engineering and manufacturing documents. \
                     Answer with JSON only."
                .to_string(),
            prompt: metadata_prompt(page, text),
            image_png: None,
            max_tokens: 1_000,
            temperature: 0.1,
        };

        let response = model.complete(&request).await?;
        self.costs.record(model.model_id(), response.usage);

        if looks_like_refusal(&response.text) {
            return Err(ModelError::Malformed("model declined metadata request".to_string()));
        }
        let json = extract_json_object(&response.text)
            .ok_or_else(|| ModelError::Malformed("no JSON object in metadata answer".to_string()))?;
        let answer: Value = serde_json::from_str(json)
            .map_err(|error| ModelError::Malformed(error.to_string()))?;
        merge_model_metadata(heuristic, &answer)
    }
}
