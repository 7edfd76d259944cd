use crate::error::IngestError;
use crate::models::{ChildChunk, DocumentFingerprint, EnrichedPage, IngestionOptions, ParentChunk};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

const SEPARATORS: [&str; 11] = [
    "\n\n", "\n", "。", "！", "？", "；", ". ", "! ", "? ", " ", "",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl ChunkingConfig {
    pub fn parent(options: &IngestionOptions) -> Self {
        Self {
            max_chars: options.parent_chunk_chars,
            overlap_chars: options.parent_overlap_chars,
        }
    }

    pub fn child(options: &IngestionOptions) -> Self {
        Self {
            max_chars: options.child_chunk_chars,
            overlap_chars: options.child_overlap_chars,
        }
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if self.overlap_chars >= self.max_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than chunk size {}",
                self.overlap_chars, self.max_chars
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkTier {
    Parent,
    Child,
}

impl ChunkTier {
    fn tag(&self) -> &'static [u8] {
        match self {
            ChunkTier::Parent => b"parent",
            ChunkTier::Child => b"child",
        }
    }
}

pub fn normalize_page_text(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.replace('\u{a0}', " ").replace("\r\n", "\n").lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        normalized.push_str(line);
        normalized.push('\n');
    }
    normalized.trim().to_string()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

pub fn split_recursive(text: &str, config: ChunkingConfig) -> Vec<String> {
    split_with(text, &SEPARATORS, config)
}

fn split_with(text: &str, separators: &[&str], config: ChunkingConfig) -> Vec<String> {
    let position = separators
        .iter()
        .position(|separator| separator.is_empty() || text.contains(separator))
        .unwrap_or(separators.len().saturating_sub(1));
    let separator = separators.get(position).copied().unwrap_or("");
    let remaining = separators.get(position + 1..).unwrap_or(&[]);

    let pieces: Vec<String> = if separator.is_empty() {
        text.chars().map(String::from).collect()
    } else {
        text.split_inclusive(separator).map(str::to_string).collect()
    };

    let mut chunks = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    for piece in pieces {
        if char_len(&piece) <= config.max_chars {
            pending.push(piece);
            continue;
        }

        if !pending.is_empty() {
            chunks.extend(merge_pieces(&pending, config));
            pending.clear();
        }
        if remaining.is_empty() {
            chunks.push(piece.trim().to_string());
        } else {
            chunks.extend(split_with(&piece, remaining, config));
        }
    }
    if !pending.is_empty() {
        chunks.extend(merge_pieces(&pending, config));
    }

    chunks.retain(|chunk| !chunk.is_empty());
    chunks
}

fn merge_pieces(pieces: &[String], config: ChunkingConfig) -> Vec<String> {
    let mut merged = Vec::new();
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for piece in pieces {
        let length = char_len(piece);
        if total + length > config.max_chars && !window.is_empty() {
            push_window(&mut merged, &window);
            while total > config.overlap_chars || (total + length > config.max_chars && total > 0) {
                match window.pop_front() {
                    Some(front) => total -= char_len(front),
                    None => break,
                }
            }
        }
        window.push_back(piece);
        total += length;
    }
    push_window(&mut merged, &window);
    merged
}

fn push_window(merged: &mut Vec<String>, window: &VecDeque<&str>) {
    let text = window.iter().copied().collect::<String>();
    let text = text.trim();
    if !text.is_empty() {
        merged.push(text.to_string());
    }
}

/// Cuts one enriched page into parents, then each parent into children.
/// Every child carries its parent's id and the page's metadata.
pub fn split_two_tier(
    document: &DocumentFingerprint,
    page: &EnrichedPage,
    options: &IngestionOptions,
) -> Result<(Vec<ParentChunk>, Vec<ChildChunk>), IngestError> {
    let parent_config = ChunkingConfig::parent(options);
    let child_config = ChunkingConfig::child(options);
    parent_config.validate()?;
    child_config.validate()?;

    let text = normalize_page_text(&page.text);
    if text.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let image_ref = page
        .image_ref
        .as_ref()
        .map(|path| path.display().to_string());
    let metadata = &page.metadata;

    let mut parents = Vec::new();
    let mut children = Vec::new();
    let mut child_index = 0u64;

    for (parent_index, parent_text) in split_recursive(&text, parent_config).into_iter().enumerate() {
        let parent_id = make_chunk_id(
            ChunkTier::Parent,
            &document.document_id,
            page.ordinal,
            parent_index as u64,
            &parent_text,
        );

        let mut child_ids = Vec::new();
        for child_text in split_recursive(&parent_text, child_config) {
            let id = make_chunk_id(
                ChunkTier::Child,
                &document.document_id,
                page.ordinal,
                child_index,
                &child_text,
            );
            child_index += 1;
            child_ids.push(id.clone());
            children.push(ChildChunk {
                id,
                parent_id: parent_id.clone(),
                document_id: document.document_id.clone(),
                content: child_text,
                topic: metadata.topic.clone(),
                sub_topic: metadata.sub_topic.clone(),
                content_type: metadata.content_type,
                difficulty: metadata.difficulty,
                keywords: metadata.keywords.clone(),
                technical_symbols: metadata.technical_symbols.clone(),
                source_page: page.ordinal,
                source_file: document.document_title.clone(),
                image_ref: image_ref.clone(),
                extra: metadata.extra.clone(),
            });
        }

        parents.push(ParentChunk {
            id: parent_id,
            document_id: document.document_id.clone(),
            content: parent_text,
            topic: metadata.topic.clone(),
            page_range: (page.ordinal, page.ordinal),
            image_refs: image_ref.iter().cloned().collect(),
            child_ids,
            source_file: document.document_title.clone(),
        });
    }

    Ok((parents, children))
}

fn make_chunk_id(tier: ChunkTier, document_id: &str, page: u32, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tier.tag());
    hasher.update(document_id.as_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, ContentType, Difficulty, MetadataSource};
    use std::collections::{BTreeMap, HashSet};
    use std::path::PathBuf;

    fn document() -> DocumentFingerprint {
        DocumentFingerprint {
            document_id: "doc-1".to_string(),
            document_title: "manual.pdf".to_string(),
            source_path: "/tmp/manual.pdf".to_string(),
            checksum: "checksum".to_string(),
            ingested_at: chrono::Utc::now(),
        }
    }

    fn enriched(ordinal: u32, text: &str) -> EnrichedPage {
        EnrichedPage {
            ordinal,
            text: text.to_string(),
            image_ref: Some(PathBuf::from("outputs/images/manual_page_1.png")),
            metadata: ChunkMetadata {
                topic: "Crimping".to_string(),
                sub_topic: "Crimp height".to_string(),
                content_type: ContentType::Procedure,
                difficulty: Difficulty::Basic,
                keywords: vec!["crimp".to_string()],
                technical_symbols: Vec::new(),
                extra: BTreeMap::new(),
                source: MetadataSource::Heuristic,
            },
        }
    }

    fn long_text(sentences: usize) -> String {
        (0..sentences)
            .map(|index| format!("Sentence number {index} describes a step. "))
            .collect()
    }

    #[test]
    fn short_page_yields_one_parent_and_one_child() -> Result<(), IngestError> {
        let (parents, children) = split_two_tier(
            &document(),
            &enriched(1, "Crimp height inspection procedure"),
            &IngestionOptions::default(),
        )?;

        assert_eq!(parents.len(), 1);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].parent_id, parents[0].id);
        assert_eq!(parents[0].child_ids, vec![children[0].id.clone()]);
        assert_eq!(parents[0].image_refs, vec!["outputs/images/manual_page_1.png".to_string()]);
        assert_eq!(children[0].topic, "Crimping");
        Ok(())
    }

    #[test]
    fn long_page_respects_both_granularities() -> Result<(), IngestError> {
        let options = IngestionOptions::default();
        let (parents, children) = split_two_tier(&document(), &enriched(4, &long_text(200)), &options)?;

        assert!(parents.len() > 1);
        assert!(children.len() > parents.len());
        assert!(parents.iter().all(|parent| parent.content.chars().count() <= options.parent_chunk_chars));
        assert!(children.iter().all(|child| child.content.chars().count() <= options.child_chunk_chars));

        let parent_ids = parents.iter().map(|parent| parent.id.as_str()).collect::<HashSet<_>>();
        assert!(children.iter().all(|child| parent_ids.contains(child.parent_id.as_str())));

        let child_ids = children.iter().map(|child| child.id.as_str()).collect::<HashSet<_>>();
        assert_eq!(child_ids.len(), children.len());
        assert!(child_ids.is_disjoint(&parent_ids));
        Ok(())
    }

    #[test]
    fn consecutive_windows_overlap() {
        let config = ChunkingConfig {
            max_chars: 400,
            overlap_chars: 50,
        };
        let chunks = split_recursive(&long_text(40), config);

        assert!(chunks.len() > 1);
        let head = chunks[1].chars().take(20).collect::<String>();
        assert!(chunks[0].contains(&head));
    }

    #[test]
    fn cjk_sentences_split_on_full_stops() {
        let config = ChunkingConfig {
            max_chars: 12,
            overlap_chars: 0,
        };
        let chunks = split_recursive("壓接高度需量測。端子拉力需測試。線徑需確認。", config);
        assert_eq!(chunks, vec!["壓接高度需量測。", "端子拉力需測試。", "線徑需確認。"]);
    }

    #[test]
    fn unbroken_text_falls_back_to_characters() {
        let config = ChunkingConfig {
            max_chars: 10,
            overlap_chars: 2,
        };
        let chunks = split_recursive(&"x".repeat(25), config);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 10));
        assert_eq!(chunks[0], "x".repeat(10));
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let options = IngestionOptions {
            child_chunk_chars: 50,
            child_overlap_chars: 50,
            ..IngestionOptions::default()
        };
        let result = split_two_tier(&document(), &enriched(1, "text"), &options);
        assert!(matches!(result, Err(IngestError::InvalidChunkConfig(_))));
    }

    #[test]
    fn page_text_keeps_paragraphs() {
        let normalized = normalize_page_text("Title  \r\n\r\n\r\n\r\nBody\u{a0}text\n");
        assert_eq!(normalized, "Title\n\nBody text");
    }
}
