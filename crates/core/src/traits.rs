use crate::error::SearchError;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct PointRecord {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// A search hit. `distance` is `1 - cosine similarity`, so smaller is closer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: u64,
    pub distance: f32,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoint {
    pub id: u64,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrollPage {
    pub points: Vec<StoredPoint>,
    pub next_offset: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionInfo {
    pub points_count: Option<u64>,
    pub vectors_count: Option<u64>,
}

impl CollectionInfo {
    pub fn stored_points(&self) -> u64 {
        self.points_count
            .unwrap_or(0)
            .max(self.vectors_count.unwrap_or(0))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadFilter {
    pub must: Vec<(String, Value)>,
}

impl PayloadFilter {
    pub fn matching(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            must: vec![(key.into(), value.into())],
        }
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.must.push((key.into(), value.into()));
        self
    }

    pub fn matches(&self, payload: &Value) -> bool {
        self.must.iter().all(|(key, expected)| {
            let pointer = format!("/{}", key.replace('.', "/"));
            payload.pointer(&pointer) == Some(expected)
        })
    }
}

#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn collection_exists(&self, collection: &str) -> Result<bool, SearchError>;

    async fn create_collection(&self, collection: &str, dimensions: usize) -> Result<(), SearchError>;

    async fn delete_collection(&self, collection: &str) -> Result<(), SearchError>;

    async fn collection_info(&self, collection: &str) -> Result<CollectionInfo, SearchError>;

    async fn upsert(&self, collection: &str, points: &[PointRecord]) -> Result<(), SearchError>;

    async fn delete_points(&self, collection: &str, filter: &PayloadFilter) -> Result<(), SearchError>;

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>, SearchError>;

    async fn retrieve(&self, collection: &str, ids: &[u64]) -> Result<Vec<StoredPoint>, SearchError>;

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        limit: usize,
        offset: Option<u64>,
    ) -> Result<ScrollPage, SearchError>;
}
