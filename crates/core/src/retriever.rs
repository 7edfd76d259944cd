use crate::embeddings::{embed_query_or_zero, Embedder};
use crate::error::SearchError;
use crate::models::{RetrievalResult, SourceMetadata};
use crate::store::{HierarchicalStore, ParentLookup, StoredChild};
use crate::traits::PayloadFilter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const MIN_SIMILARITY: f32 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalOutcome {
    NoData,
    Ranked(Vec<RetrievalResult>),
    /// Vector search gave nothing usable; results come from a term-overlap
    /// scan with synthetic scores.
    Fallback(Vec<RetrievalResult>),
}

impl RetrievalOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RetrievalOutcome::NoData => "no_data",
            RetrievalOutcome::Ranked(_) => "ranked",
            RetrievalOutcome::Fallback(_) => "fallback",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "outcome": self.label(),
            "results": self.results(),
        })
    }

    pub fn results(&self) -> &[RetrievalResult] {
        match self {
            RetrievalOutcome::NoData => &[],
            RetrievalOutcome::Ranked(results) | RetrievalOutcome::Fallback(results) => results,
        }
    }

    pub fn into_results(self) -> Vec<RetrievalResult> {
        match self {
            RetrievalOutcome::NoData => Vec::new(),
            RetrievalOutcome::Ranked(results) | RetrievalOutcome::Fallback(results) => results,
        }
    }
}

pub fn similarity_from_distance(distance: f32) -> f32 {
    (1.0 - distance).clamp(MIN_SIMILARITY, 1.0)
}

fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|term| term.chars().count() >= 2)
        .filter(|term| seen.insert(term.to_string()))
        .map(str::to_string)
        .collect()
}

fn keyword_overlap(terms: &[String], child: &StoredChild) -> usize {
    let content = child.content.to_lowercase();
    terms.iter().filter(|term| content.contains(term.as_str())).count()
}

fn topic_matches(query: &str, terms: &[String], topic: &str) -> bool {
    let topic = topic.trim().to_lowercase();
    if topic.is_empty() {
        return false;
    }
    query.to_lowercase().contains(&topic)
        || terms
            .iter()
            .filter(|term| term.chars().count() >= 3)
            .any(|term| topic.contains(term.as_str()))
}

pub fn relevance_reason(similarity: f32, query: &str, child: &StoredChild) -> String {
    let terms = query_terms(query);
    let mut reasons = vec![if similarity > 0.7 {
        "high relevance"
    } else if similarity > 0.4 {
        "medium relevance"
    } else {
        "low relevance"
    }];

    let query_lower = query.to_lowercase();
    let keyword_hit = keyword_overlap(&terms, child) > 0
        || child
            .keywords
            .iter()
            .any(|keyword| !keyword.trim().is_empty() && query_lower.contains(&keyword.to_lowercase()));
    if keyword_hit {
        reasons.push("keyword matched");
    }
    if topic_matches(query, &terms, &child.topic) {
        reasons.push("topic matched");
    }
    reasons.join("; ")
}

fn source_metadata(point_id: u64, child: &StoredChild) -> SourceMetadata {
    SourceMetadata {
        point_id,
        parent_id: child.parent_id.clone(),
        document_id: child.document_id.clone(),
        source_file: child.source_file.clone(),
        source_page: child.source_page,
        topic: child.topic.clone(),
        sub_topic: child.sub_topic.clone(),
        content_type: child.content_type.clone(),
        keywords: child.keywords.clone(),
        image_ref: child.image_ref.clone(),
    }
}

pub struct Retriever {
    store: Arc<HierarchicalStore>,
    embedder: Arc<dyn Embedder>,
    query_timeout: Duration,
    fallback_scan_limit: usize,
}

impl Retriever {
    pub fn new(store: Arc<HierarchicalStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            query_timeout: Duration::from_secs(5),
            fallback_scan_limit: 256,
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_fallback_scan_limit(mut self, limit: usize) -> Self {
        self.fallback_scan_limit = limit.max(1);
        self
    }

    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<RetrievalOutcome, SearchError> {
        if query.trim().is_empty() {
            return Err(SearchError::Request("query is empty".to_string()));
        }
        if k == 0 {
            return Err(SearchError::Request("top_k must be positive".to_string()));
        }
        if !self.store.has_data().await? {
            return Ok(RetrievalOutcome::NoData);
        }

        let vector = embed_query_or_zero(self.embedder.as_ref(), query, self.query_timeout).await;
        if vector.iter().all(|value| *value == 0.0) {
            debug!("query vector is degenerate, using fallback ranking");
            return self.fallback(query, k, filter).await;
        }

        let ranked = match self.ranked(query, &vector, k, filter).await {
            Ok(ranked) => ranked,
            Err(error) => {
                warn!(collection = self.store.name(), %error, "vector search failed, using fallback ranking");
                return self.fallback(query, k, filter).await;
            }
        };
        if ranked.is_empty() {
            return self.fallback(query, k, filter).await;
        }

        info!(collection = self.store.name(), k, returned = ranked.len(), "retrieval complete");
        Ok(RetrievalOutcome::Ranked(ranked))
    }

    async fn ranked(
        &self,
        query: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<RetrievalResult>, SearchError> {
        let mut hits = self.store.search(vector, k, filter).await?;
        hits.sort_by(|left, right| {
            left.distance
                .total_cmp(&right.distance)
                .then(left.point_id.cmp(&right.point_id))
        });

        let mut emitted = HashSet::new();
        let mut results = Vec::new();
        for hit in hits {
            if results.len() >= k {
                break;
            }
            let dedup_key = hit
                .child
                .parent_id
                .clone()
                .unwrap_or_else(|| format!("point:{}", hit.point_id));
            if !emitted.insert(dedup_key) {
                continue;
            }

            let parent_content = match &hit.child.parent_id {
                Some(parent_id) => match self.store.resolve_parent(parent_id).await {
                    Ok(ParentLookup::Found(parent)) => parent.content,
                    Ok(ParentLookup::UseChildContent) => hit.child.content.clone(),
                    Err(error) => {
                        warn!(parent_id = %parent_id, %error, "parent lookup failed, using child content");
                        hit.child.content.clone()
                    }
                },
                None => hit.child.content.clone(),
            };

            let similarity = similarity_from_distance(hit.distance);
            results.push(RetrievalResult {
                relevance_reason: relevance_reason(similarity, query, &hit.child),
                child_content: hit.child.content.clone(),
                parent_content,
                similarity_score: similarity,
                source: source_metadata(hit.point_id, &hit.child),
            });
        }
        Ok(results)
    }

    async fn fallback(
        &self,
        query: &str,
        k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<RetrievalOutcome, SearchError> {
        let scanned = self
            .store
            .scan_children(filter, self.fallback_scan_limit)
            .await?;
        if scanned.is_empty() {
            return Ok(RetrievalOutcome::NoData);
        }

        let terms = query_terms(query);
        let mut scored = scanned
            .into_iter()
            .map(|(point_id, child)| (keyword_overlap(&terms, &child), point_id, child))
            .collect::<Vec<_>>();
        scored.sort_by(|left, right| right.0.cmp(&left.0).then(left.1.cmp(&right.1)));

        let results = scored
            .into_iter()
            .take(k)
            .enumerate()
            .map(|(rank, (_, point_id, child))| {
                let similarity = (1.0 - 0.1 * rank as f32).max(MIN_SIMILARITY);
                RetrievalResult {
                    relevance_reason: format!(
                        "fallback ranking; {}",
                        relevance_reason(similarity, query, &child)
                    ),
                    parent_content: child.content.clone(),
                    child_content: child.content.clone(),
                    similarity_score: similarity,
                    source: source_metadata(point_id, &child),
                }
            })
            .collect::<Vec<_>>();

        info!(collection = self.store.name(), k, returned = results.len(), "fallback retrieval complete");
        Ok(RetrievalOutcome::Fallback(results))
    }
}
