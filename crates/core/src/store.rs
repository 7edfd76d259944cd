//! A logical collection `N` lives in two backend collections: `N_children`
//! holds one embedded point per child chunk, `N_parents` holds parent chunks
//! plus bookkeeping records under a one-dimensional placeholder vector.
//! Payloads carry `schema_version`; version 1 is the legacy flat layout.

use crate::error::SearchError;
use crate::models::{ChildChunk, DocumentFingerprint, ParentChunk};
use crate::traits::{PayloadFilter, PointRecord, VectorBackend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SCHEMA_VERSION: u64 = 2;
pub const WRITE_BATCH_SIZE: usize = 50;
const PLACEHOLDER_DIMENSIONS: usize = 1;
const SCROLL_PAGE: usize = 256;
const ID_SCAN_LIMIT: usize = 100_000;

const KIND_CHILD: &str = "child";
const KIND_PARENT: &str = "parent";
const KIND_DOCUMENT: &str = "document";
const KIND_EPOCH: &str = "epoch";
const KIND_WATERMARK: &str = "child_watermark";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionState {
    Absent,
    Empty,
    Populated,
}

impl fmt::Display for CollectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CollectionState::Absent => "absent",
            CollectionState::Empty => "empty",
            CollectionState::Populated => "populated",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatus {
    pub collection: String,
    pub state: CollectionState,
    pub child_points: u64,
    pub parent_points: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertSummary {
    pub parents_written: usize,
    pub children_written: usize,
    pub first_child_point: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredChild {
    pub schema_version: u64,
    pub chunk_id: Option<String>,
    pub parent_id: Option<String>,
    pub document_id: Option<String>,
    pub content: String,
    pub topic: String,
    pub sub_topic: String,
    pub content_type: String,
    pub keywords: Vec<String>,
    pub source_file: String,
    pub source_page: u32,
    pub image_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildHit {
    pub point_id: u64,
    pub distance: f32,
    pub child: StoredChild,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParentLookup {
    Found(ParentChunk),
    UseChildContent,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChildPayloadV2 {
    schema_version: u64,
    kind: String,
    chunk_id: String,
    document: DocumentSection,
    taxonomy: TaxonomySection,
    content: ContentSection,
    lineage: Lineage,
    #[serde(default)]
    image_path: Option<String>,
    #[serde(default)]
    extra: BTreeMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DocumentSection {
    id: String,
    source_file: String,
    page_num: u32,
    content_type: String,
    difficulty_level: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaxonomySection {
    topic: String,
    sub_topic: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    technical_symbols: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContentSection {
    text: String,
    length: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Lineage {
    parent_id: String,
}

#[derive(Debug, Deserialize)]
struct ChildPayloadV1 {
    #[serde(default)]
    chunk_id: Option<String>,
    #[serde(default)]
    page_num: u32,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    sub_topic: String,
    content: String,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    keywords: Value,
    #[serde(default)]
    image_path: Option<String>,
    #[serde(default)]
    source_filename: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ParentPayload {
    schema_version: u64,
    kind: String,
    #[serde(flatten)]
    parent: ParentChunk,
}

#[derive(Debug, Serialize, Deserialize)]
struct DocumentRecord {
    schema_version: u64,
    kind: String,
    document_id: String,
    checksum: String,
    source_file: String,
    ingested_at: DateTime<Utc>,
    pages_processed: u32,
    children: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct EpochRecord {
    schema_version: u64,
    kind: String,
    epoch: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkRecord {
    schema_version: u64,
    kind: String,
    max_child_id: u64,
}

pub fn encode_child(child: &ChildChunk) -> Result<Value, SearchError> {
    let payload = ChildPayloadV2 {
        schema_version: SCHEMA_VERSION,
        kind: KIND_CHILD.to_string(),
        chunk_id: child.id.clone(),
        document: DocumentSection {
            id: child.document_id.clone(),
            source_file: child.source_file.clone(),
            page_num: child.source_page,
            content_type: child.content_type.as_str().to_string(),
            difficulty_level: child.difficulty.as_str().to_string(),
        },
        taxonomy: TaxonomySection {
            topic: child.topic.clone(),
            sub_topic: child.sub_topic.clone(),
            keywords: child.keywords.clone(),
            technical_symbols: child.technical_symbols.clone(),
        },
        content: ContentSection {
            text: child.content.clone(),
            length: child.content.chars().count(),
        },
        lineage: Lineage {
            parent_id: child.parent_id.clone(),
        },
        image_path: child.image_ref.clone(),
        extra: child.extra.clone(),
    };
    Ok(serde_json::to_value(payload)?)
}

pub fn decode_child(payload: &Value) -> Result<StoredChild, SearchError> {
    let version = payload
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1);

    match version {
        1 => {
            let legacy: ChildPayloadV1 = serde_json::from_value(payload.clone())?;
            let keywords = match legacy.keywords {
                Value::Array(items) => items
                    .into_iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect(),
                Value::String(text) if !text.trim().is_empty() => text
                    .split([',', '，'])
                    .map(|word| word.trim().to_string())
                    .filter(|word| !word.is_empty())
                    .collect(),
                _ => Vec::new(),
            };
            Ok(StoredChild {
                schema_version: 1,
                chunk_id: legacy.chunk_id,
                parent_id: None,
                document_id: None,
                content: legacy.content,
                topic: legacy.topic,
                sub_topic: legacy.sub_topic,
                content_type: legacy.content_type,
                keywords,
                source_file: legacy.source_filename.unwrap_or_default(),
                source_page: legacy.page_num,
                image_ref: legacy.image_path.filter(|path| !path.is_empty()),
            })
        }
        2 => {
            let current: ChildPayloadV2 = serde_json::from_value(payload.clone())?;
            Ok(StoredChild {
                schema_version: 2,
                chunk_id: Some(current.chunk_id),
                parent_id: Some(current.lineage.parent_id).filter(|id| !id.is_empty()),
                document_id: Some(current.document.id),
                content: current.content.text,
                topic: current.taxonomy.topic,
                sub_topic: current.taxonomy.sub_topic,
                content_type: current.document.content_type,
                keywords: current.taxonomy.keywords,
                source_file: current.document.source_file,
                source_page: current.document.page_num,
                image_ref: current.image_path,
            })
        }
        other => Err(SearchError::UnsupportedSchema(other)),
    }
}

fn derived_point_id(namespace: &str, key: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) & (i64::MAX as u64)
}

fn placeholder(id: u64, payload: Value) -> PointRecord {
    PointRecord {
        id,
        vector: vec![1.0; PLACEHOLDER_DIMENSIONS],
        payload,
    }
}

pub struct HierarchicalStore {
    backend: Arc<dyn VectorBackend>,
    name: String,
    dimensions: usize,
    epoch: u64,
}

impl HierarchicalStore {
    pub async fn open(
        backend: Arc<dyn VectorBackend>,
        name: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, SearchError> {
        let mut store = Self::attach(backend, name, dimensions).await?;
        store.ensure_tiers().await?;
        store.epoch = store.read_epoch().await?;
        Ok(store)
    }

    /// Binds to the collection without creating anything, for read-only
    /// commands that must be able to report an absent collection.
    pub async fn attach(
        backend: Arc<dyn VectorBackend>,
        name: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, SearchError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(SearchError::Request("collection name is empty".to_string()));
        }
        if dimensions == 0 {
            return Err(SearchError::Request("embedding dimensions must be positive".to_string()));
        }

        let mut store = Self {
            backend,
            name,
            dimensions,
            epoch: 0,
        };
        if store.backend.collection_exists(&store.parents_collection()).await? {
            store.epoch = store.read_epoch().await?;
        }
        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children_collection(&self) -> String {
        format!("{}_children", self.name)
    }

    pub fn parents_collection(&self) -> String {
        format!("{}_parents", self.name)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn ensure_tiers(&self) -> Result<(), SearchError> {
        let children = self.children_collection();
        if !self.backend.collection_exists(&children).await? {
            info!(collection = %children, dimensions = self.dimensions, "creating child index");
            self.backend.create_collection(&children, self.dimensions).await?;
        }

        let parents = self.parents_collection();
        if !self.backend.collection_exists(&parents).await? {
            info!(collection = %parents, "creating parent store");
            self.backend
                .create_collection(&parents, PLACEHOLDER_DIMENSIONS)
                .await?;
        }
        Ok(())
    }

    async fn read_epoch(&self) -> Result<u64, SearchError> {
        let id = derived_point_id(KIND_EPOCH, &self.name);
        let found = self.backend.retrieve(&self.parents_collection(), &[id]).await?;
        Ok(found
            .into_iter()
            .find_map(|point| serde_json::from_value::<EpochRecord>(point.payload).ok())
            .filter(|record| record.kind == KIND_EPOCH)
            .map(|record| record.epoch)
            .unwrap_or(0))
    }

    async fn write_epoch(&self, epoch: u64) -> Result<(), SearchError> {
        let record = EpochRecord {
            schema_version: SCHEMA_VERSION,
            kind: KIND_EPOCH.to_string(),
            epoch,
        };
        let point = placeholder(derived_point_id(KIND_EPOCH, &self.name), serde_json::to_value(record)?);
        self.backend.upsert(&self.parents_collection(), &[point]).await
    }

    async fn read_watermark(&self) -> Result<u64, SearchError> {
        let id = derived_point_id(KIND_WATERMARK, &self.name);
        let found = self.backend.retrieve(&self.parents_collection(), &[id]).await?;
        Ok(found
            .into_iter()
            .find_map(|point| serde_json::from_value::<WatermarkRecord>(point.payload).ok())
            .filter(|record| record.kind == KIND_WATERMARK)
            .map(|record| record.max_child_id)
            .unwrap_or(0))
    }

    async fn write_watermark(&self, max_child_id: u64) -> Result<(), SearchError> {
        let record = WatermarkRecord {
            schema_version: SCHEMA_VERSION,
            kind: KIND_WATERMARK.to_string(),
            max_child_id,
        };
        let point = placeholder(derived_point_id(KIND_WATERMARK, &self.name), serde_json::to_value(record)?);
        self.backend.upsert(&self.parents_collection(), &[point]).await
    }

    async fn count(&self, collection: &str) -> Result<u64, SearchError> {
        match self.backend.collection_info(collection).await {
            Ok(info) => Ok(info.stored_points()),
            Err(SearchError::NotReady(_)) => Ok(0),
            Err(error) => Err(error),
        }
    }

    pub async fn has_data(&self) -> Result<bool, SearchError> {
        Ok(self.count(&self.children_collection()).await? > 0)
    }

    pub async fn state(&self) -> Result<CollectionState, SearchError> {
        let children = self.backend.collection_exists(&self.children_collection()).await?;
        let parents = self.backend.collection_exists(&self.parents_collection()).await?;
        if !children && !parents {
            return Ok(CollectionState::Absent);
        }
        if self.has_data().await? {
            Ok(CollectionState::Populated)
        } else {
            Ok(CollectionState::Empty)
        }
    }

    pub async fn status(&self) -> Result<CollectionStatus, SearchError> {
        Ok(CollectionStatus {
            collection: self.name.clone(),
            state: self.state().await?,
            child_points: self.count(&self.children_collection()).await?,
            parent_points: self.count(&self.parents_collection()).await?,
            epoch: self.epoch,
        })
    }

    /// Highest child id ever handed out: the persisted watermark, or a
    /// bounded scan for collections written before it existed. Ids of
    /// removed documents are never reused.
    async fn max_child_id(&self) -> Result<u64, SearchError> {
        let children = self.children_collection();
        let mut max_id = self.read_watermark().await?;
        let mut scanned = 0usize;
        let mut offset = None;

        loop {
            let page = self
                .backend
                .scroll(&children, None, SCROLL_PAGE, offset)
                .await?;
            scanned += page.points.len();
            if let Some(highest) = page.points.iter().map(|point| point.id).max() {
                max_id = max_id.max(highest);
            }

            match page.next_offset {
                Some(next) if scanned < ID_SCAN_LIMIT => offset = Some(next),
                Some(_) => {
                    let floor = self.count(&children).await?;
                    warn!(collection = %children, scanned, floor, "id scan truncated");
                    return Ok(max_id.max(floor));
                }
                None => return Ok(max_id),
            }
        }
    }

    /// Parents are written before children so no child is ever visible
    /// without its parent.
    pub async fn insert(
        &self,
        parents: &[ParentChunk],
        children: &[ChildChunk],
        vectors: &[Vec<f32>],
    ) -> Result<InsertSummary, SearchError> {
        if children.len() != vectors.len() {
            return Err(SearchError::Request(format!(
                "vector count {} doesn't match child count {}",
                vectors.len(),
                children.len()
            )));
        }
        if let Some(vector) = vectors.iter().find(|vector| vector.len() != self.dimensions) {
            return Err(SearchError::Request(format!(
                "embedding dimension {} != {}",
                vector.len(),
                self.dimensions
            )));
        }

        let parent_points = parents
            .iter()
            .map(|parent| -> Result<PointRecord, SearchError> {
                let payload = ParentPayload {
                    schema_version: SCHEMA_VERSION,
                    kind: KIND_PARENT.to_string(),
                    parent: parent.clone(),
                };
                Ok(placeholder(
                    derived_point_id(KIND_PARENT, &parent.id),
                    serde_json::to_value(payload)?,
                ))
            })
            .collect::<Result<Vec<_>, SearchError>>()?;

        let parents_collection = self.parents_collection();
        for batch in parent_points.chunks(WRITE_BATCH_SIZE) {
            self.backend.upsert(&parents_collection, batch).await?;
        }

        let first_id = self.max_child_id().await? + 1;
        let child_points = children
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(offset, (child, vector))| -> Result<PointRecord, SearchError> {
                Ok(PointRecord {
                    id: first_id + offset as u64,
                    vector: vector.clone(),
                    payload: encode_child(child)?,
                })
            })
            .collect::<Result<Vec<_>, SearchError>>()?;

        let children_collection = self.children_collection();
        for batch in child_points.chunks(WRITE_BATCH_SIZE) {
            self.backend.upsert(&children_collection, batch).await?;
        }
        if !children.is_empty() {
            self.write_watermark(first_id + children.len() as u64 - 1).await?;
        }

        debug!(
            collection = %self.name,
            parents = parents.len(),
            children = children.len(),
            first_id,
            "chunks written"
        );
        Ok(InsertSummary {
            parents_written: parents.len(),
            children_written: children.len(),
            first_child_point: (!children.is_empty()).then_some(first_id),
        })
    }

    /// Deletes the parents and children a previous run wrote for this
    /// document. Legacy children carry no document id and are left alone.
    pub async fn remove_document(&self, document_id: &str) -> Result<(), SearchError> {
        self.backend
            .delete_points(
                &self.children_collection(),
                &PayloadFilter::matching("document.id", document_id),
            )
            .await?;
        self.backend
            .delete_points(
                &self.parents_collection(),
                &PayloadFilter::matching("kind", KIND_PARENT).and("document_id", document_id),
            )
            .await?;
        debug!(collection = %self.name, document_id, "previous chunks removed");
        Ok(())
    }

    pub async fn record_document(
        &self,
        document: &DocumentFingerprint,
        pages_processed: u32,
        children: usize,
    ) -> Result<(), SearchError> {
        let record = DocumentRecord {
            schema_version: SCHEMA_VERSION,
            kind: KIND_DOCUMENT.to_string(),
            document_id: document.document_id.clone(),
            checksum: document.checksum.clone(),
            source_file: document.document_title.clone(),
            ingested_at: document.ingested_at,
            pages_processed,
            children,
        };
        let point = placeholder(
            derived_point_id(KIND_DOCUMENT, &document.document_id),
            serde_json::to_value(record)?,
        );
        self.backend.upsert(&self.parents_collection(), &[point]).await
    }

    pub async fn should_skip_reprocessing(&self, document: &DocumentFingerprint) -> Result<bool, SearchError> {
        if !self.has_data().await? {
            return Ok(false);
        }
        let id = derived_point_id(KIND_DOCUMENT, &document.document_id);
        let found = self.backend.retrieve(&self.parents_collection(), &[id]).await?;
        Ok(found.into_iter().any(|point| {
            serde_json::from_value::<DocumentRecord>(point.payload)
                .map(|record| record.kind == KIND_DOCUMENT && record.checksum == document.checksum)
                .unwrap_or(false)
        }))
    }

    pub async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ChildHit>, SearchError> {
        let hits = self
            .backend
            .search(&self.children_collection(), vector, k.saturating_mul(2), filter)
            .await?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| match decode_child(&hit.payload) {
                Ok(child) => Some(ChildHit {
                    point_id: hit.id,
                    distance: hit.distance,
                    child,
                }),
                Err(error) => {
                    warn!(point = hit.id, %error, "skipping undecodable child");
                    None
                }
            })
            .collect())
    }

    pub async fn resolve_parent(&self, parent_id: &str) -> Result<ParentLookup, SearchError> {
        let id = derived_point_id(KIND_PARENT, parent_id);
        let found = self.backend.retrieve(&self.parents_collection(), &[id]).await?;
        let parent = found.into_iter().find_map(|point| {
            serde_json::from_value::<ParentPayload>(point.payload)
                .ok()
                .filter(|payload| payload.kind == KIND_PARENT && payload.parent.id == parent_id)
                .map(|payload| payload.parent)
        });

        Ok(match parent {
            Some(parent) => ParentLookup::Found(parent),
            None => {
                debug!(parent_id, "parent missing, falling back to child content");
                ParentLookup::UseChildContent
            }
        })
    }

    pub async fn scan_children(
        &self,
        filter: Option<&PayloadFilter>,
        limit: usize,
    ) -> Result<Vec<(u64, StoredChild)>, SearchError> {
        let children = self.children_collection();
        let mut collected = Vec::new();
        let mut offset = None;

        while collected.len() < limit {
            let page = self
                .backend
                .scroll(&children, filter, SCROLL_PAGE.min(limit - collected.len()), offset)
                .await?;
            for point in page.points {
                match decode_child(&point.payload) {
                    Ok(child) => collected.push((point.id, child)),
                    Err(error) => warn!(point = point.id, %error, "skipping undecodable child"),
                }
            }
            match page.next_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        collected.truncate(limit);
        Ok(collected)
    }

    pub async fn children_of(&self, parent_id: &str) -> Result<Vec<StoredChild>, SearchError> {
        let filter = PayloadFilter::matching("lineage.parent_id", parent_id);
        Ok(self
            .scan_children(Some(&filter), usize::MAX)
            .await?
            .into_iter()
            .map(|(_, child)| child)
            .collect())
    }

    pub async fn drop_collection(&self) -> Result<(), SearchError> {
        self.backend.delete_collection(&self.children_collection()).await?;
        self.backend.delete_collection(&self.parents_collection()).await?;
        info!(collection = %self.name, "collection dropped");
        Ok(())
    }

    pub async fn recreate(&mut self) -> Result<u64, SearchError> {
        let persisted = if self.backend.collection_exists(&self.parents_collection()).await? {
            self.read_epoch().await?
        } else {
            self.epoch
        };
        let next = persisted.max(self.epoch) + 1;
        self.drop_collection().await?;
        self.ensure_tiers().await?;
        self.write_epoch(next).await?;
        self.epoch = next;
        info!(collection = %self.name, epoch = next, "collection recreated");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentType, Difficulty};
    use crate::stores::memory::tests::UnreliableBackend;
    use crate::stores::InMemoryBackend;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn fingerprint(checksum: &str) -> DocumentFingerprint {
        DocumentFingerprint {
            document_id: "doc-1".to_string(),
            document_title: "manual.pdf".to_string(),
            source_path: "/tmp/manual.pdf".to_string(),
            checksum: checksum.to_string(),
            ingested_at: Utc::now(),
        }
    }

    fn parent(id: &str, content: &str) -> ParentChunk {
        ParentChunk {
            id: id.to_string(),
            document_id: "doc-1".to_string(),
            content: content.to_string(),
            topic: "Crimping".to_string(),
            page_range: (1, 1),
            image_refs: Vec::new(),
            child_ids: Vec::new(),
            source_file: "manual.pdf".to_string(),
        }
    }

    fn child(id: &str, parent_id: &str, content: &str) -> ChildChunk {
        ChildChunk {
            id: id.to_string(),
            parent_id: parent_id.to_string(),
            document_id: "doc-1".to_string(),
            content: content.to_string(),
            topic: "Crimping".to_string(),
            sub_topic: "Crimp height".to_string(),
            content_type: ContentType::Procedure,
            difficulty: Difficulty::Basic,
            keywords: vec!["crimp".to_string()],
            technical_symbols: Vec::new(),
            source_page: 1,
            source_file: "manual.pdf".to_string(),
            image_ref: None,
            extra: BTreeMap::new(),
        }
    }

    async fn open(backend: Arc<InMemoryBackend>) -> Result<HierarchicalStore, SearchError> {
        HierarchicalStore::open(backend, "manuals", 2).await
    }

    #[tokio::test]
    async fn open_creates_both_tiers() -> Result<(), SearchError> {
        let backend = Arc::new(InMemoryBackend::new());
        let store = open(backend.clone()).await?;

        assert!(backend.collection_exists("manuals_children").await?);
        assert!(backend.collection_exists("manuals_parents").await?);
        assert_eq!(store.state().await?, CollectionState::Empty);
        assert!(!store.has_data().await?);
        assert_eq!(store.epoch(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn incremental_inserts_continue_the_id_space() -> Result<(), SearchError> {
        let backend = Arc::new(InMemoryBackend::new());
        let store = open(backend.clone()).await?;

        let first = store
            .insert(
                &[parent("p-1", "parent one")],
                &[child("c-1", "p-1", "one"), child("c-2", "p-1", "two")],
                &[vec![1.0, 0.0], vec![0.0, 1.0]],
            )
            .await?;
        let second = store
            .insert(&[parent("p-2", "parent two")], &[child("c-3", "p-2", "three")], &[vec![1.0, 1.0]])
            .await?;

        assert_eq!(first.first_child_point, Some(1));
        assert_eq!(second.first_child_point, Some(3));
        let status = store.status().await?;
        assert_eq!(status.child_points, 3);
        // two parents plus the id watermark
        assert_eq!(status.parent_points, 3);
        assert_eq!(status.state, CollectionState::Populated);
        Ok(())
    }

    #[tokio::test]
    async fn large_inserts_are_batched_and_counted() -> Result<(), SearchError> {
        let store = open(Arc::new(InMemoryBackend::new())).await?;
        let children = (0..120)
            .map(|index| child(&format!("c-{index}"), "p-1", "text"))
            .collect::<Vec<_>>();
        let vectors = vec![vec![1.0, 0.0]; 120];

        let summary = store.insert(&[parent("p-1", "p")], &children, &vectors).await?;
        assert_eq!(summary.children_written, 120);
        assert_eq!(store.status().await?.child_points, 120);
        assert_eq!(store.children_of("p-1").await?.len(), 120);
        Ok(())
    }

    #[tokio::test]
    async fn parent_resolution_falls_back_on_miss() -> Result<(), SearchError> {
        let store = open(Arc::new(InMemoryBackend::new())).await?;
        store
            .insert(&[parent("p-1", "full parent text")], &[child("c-1", "p-1", "one")], &[vec![1.0, 0.0]])
            .await?;

        match store.resolve_parent("p-1").await? {
            ParentLookup::Found(parent) => assert_eq!(parent.content, "full parent text"),
            ParentLookup::UseChildContent => panic!("parent should resolve"),
        }
        assert_eq!(store.resolve_parent("dangling").await?, ParentLookup::UseChildContent);
        Ok(())
    }

    #[tokio::test]
    async fn search_over_fetches_twice_k() -> Result<(), SearchError> {
        let store = open(Arc::new(InMemoryBackend::new())).await?;
        let children = (0..10)
            .map(|index| child(&format!("c-{index}"), "p-1", "text"))
            .collect::<Vec<_>>();
        store
            .insert(&[parent("p-1", "p")], &children, &vec![vec![1.0, 0.0]; 10])
            .await?;

        let hits = store.search(&[1.0, 0.0], 3, None).await?;
        assert_eq!(hits.len(), 6);
        assert_eq!(hits[0].child.parent_id.as_deref(), Some("p-1"));
        Ok(())
    }

    #[tokio::test]
    async fn reprocessing_is_skipped_only_for_identical_content() -> Result<(), SearchError> {
        let store = open(Arc::new(InMemoryBackend::new())).await?;
        assert!(!store.should_skip_reprocessing(&fingerprint("sum-a")).await?);

        store
            .insert(&[parent("p-1", "p")], &[child("c-1", "p-1", "one")], &[vec![1.0, 0.0]])
            .await?;
        store.record_document(&fingerprint("sum-a"), 1, 1).await?;

        assert!(store.should_skip_reprocessing(&fingerprint("sum-a")).await?);
        assert!(!store.should_skip_reprocessing(&fingerprint("sum-b")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn recreate_bumps_the_persisted_epoch() -> Result<(), SearchError> {
        let backend = Arc::new(InMemoryBackend::new());
        let mut store = open(backend.clone()).await?;
        store
            .insert(&[parent("p-1", "p")], &[child("c-1", "p-1", "one")], &[vec![1.0, 0.0]])
            .await?;

        assert_eq!(store.recreate().await?, 1);
        assert!(!store.has_data().await?);

        let reopened = open(backend).await?;
        assert_eq!(reopened.epoch(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn recreate_stops_when_the_epoch_cannot_be_read() -> Result<(), SearchError> {
        let backend = Arc::new(UnreliableBackend::default());
        let mut store = HierarchicalStore::open(backend.clone(), "manuals", 2).await?;
        store
            .insert(&[parent("p-1", "p")], &[child("c-1", "p-1", "one")], &[vec![1.0, 0.0]])
            .await?;

        backend.lookup_down.store(true, Ordering::SeqCst);
        assert!(matches!(
            store.recreate().await,
            Err(SearchError::BackendResponse { .. })
        ));
        assert_eq!(store.epoch(), 0);
        assert!(store.has_data().await?);
        Ok(())
    }

    #[tokio::test]
    async fn attach_does_not_create_tiers() -> Result<(), SearchError> {
        let backend = Arc::new(InMemoryBackend::new());
        let store = HierarchicalStore::attach(backend.clone(), "manuals", 2).await?;

        assert_eq!(store.state().await?, CollectionState::Absent);
        assert!(!store.has_data().await?);
        assert!(!backend.collection_exists("manuals_children").await?);
        Ok(())
    }

    #[tokio::test]
    async fn drop_leaves_collection_absent() -> Result<(), SearchError> {
        let store = open(Arc::new(InMemoryBackend::new())).await?;
        store.drop_collection().await?;
        assert_eq!(store.state().await?, CollectionState::Absent);
        assert_eq!(store.status().await?.child_points, 0);
        Ok(())
    }

    #[test]
    fn legacy_flat_payload_decodes_without_lineage() -> Result<(), SearchError> {
        let child = decode_child(&json!({
            "page_num": 7,
            "topic": "Drawing Symbols",
            "sub_topic": "Diameter",
            "content": "Φ marks a diameter",
            "content_type": "definition",
            "keywords": "Φ, diameter",
            "chunk_id": "legacy-1",
            "image_path": ""
        }))?;

        assert_eq!(child.schema_version, 1);
        assert_eq!(child.parent_id, None);
        assert_eq!(child.source_page, 7);
        assert_eq!(child.keywords, vec!["Φ", "diameter"]);
        assert_eq!(child.image_ref, None);
        Ok(())
    }

    #[test]
    fn current_payload_round_trips_lineage() -> Result<(), SearchError> {
        let payload = encode_child(&child("c-1", "p-9", "content"))?;
        assert_eq!(payload.pointer("/lineage/parent_id"), Some(&json!("p-9")));
        assert_eq!(payload.pointer("/document/difficulty_level"), Some(&json!("basic")));

        let decoded = decode_child(&payload)?;
        assert_eq!(decoded.parent_id.as_deref(), Some("p-9"));
        assert_eq!(decoded.content_type, "procedure");
        Ok(())
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let result = decode_child(&json!({ "schema_version": 7, "content": "x" }));
        assert!(matches!(result, Err(SearchError::UnsupportedSchema(7))));
    }

    #[tokio::test]
    async fn removing_a_document_keeps_ids_unique() -> Result<(), SearchError> {
        let backend = Arc::new(InMemoryBackend::new());
        let store = open(backend.clone()).await?;
        let mut other = child("c-9", "p-9", "other document");
        other.document_id = "doc-2".to_string();
        let mut other_parent = parent("p-9", "other parent");
        other_parent.document_id = "doc-2".to_string();

        store
            .insert(
                &[parent("p-1", "first"), other_parent],
                &[child("c-1", "p-1", "one"), child("c-2", "p-1", "two"), other],
                &[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]],
            )
            .await?;
        store.remove_document("doc-1").await?;

        assert_eq!(store.resolve_parent("p-1").await?, ParentLookup::UseChildContent);
        assert!(matches!(store.resolve_parent("p-9").await?, ParentLookup::Found(_)));
        let left = store.scan_children(None, 10).await?;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].0, 3);

        let again = store
            .insert(&[parent("p-1", "first")], &[child("c-1", "p-1", "one")], &[vec![1.0, 0.0]])
            .await?;
        assert_eq!(again.first_child_point, Some(4));
        Ok(())
    }
}
