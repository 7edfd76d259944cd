use crate::error::SearchError;
use crate::traits::{
    CollectionInfo, PayloadFilter, PointRecord, ScoredPoint, ScrollPage, StoredPoint, VectorBackend,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

const BACKEND: &str = "memory";

#[derive(Debug)]
struct Collection {
    dimensions: usize,
    points: BTreeMap<u64, (Vec<f32>, Value)>,
}

#[derive(Debug, Default)]
pub struct InMemoryBackend {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn missing(collection: &str) -> SearchError {
        SearchError::NotReady(format!("collection {collection} does not exist"))
    }
}

fn cosine(left: &[f32], right: &[f32]) -> f32 {
    let dot = left.iter().zip(right).map(|(a, b)| a * b).sum::<f32>();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm * right_norm)
}

#[async_trait]
impl VectorBackend for InMemoryBackend {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool, SearchError> {
        Ok(self.collections.read().contains_key(collection))
    }

    async fn create_collection(&self, collection: &str, dimensions: usize) -> Result<(), SearchError> {
        let mut collections = self.collections.write();
        if collections.contains_key(collection) {
            return Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("collection {collection} already exists"),
            });
        }
        collections.insert(
            collection.to_string(),
            Collection {
                dimensions,
                points: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), SearchError> {
        self.collections.write().remove(collection);
        Ok(())
    }

    async fn collection_info(&self, collection: &str) -> Result<CollectionInfo, SearchError> {
        let collections = self.collections.read();
        let found = collections
            .get(collection)
            .ok_or_else(|| Self::missing(collection))?;
        let count = found.points.len() as u64;
        Ok(CollectionInfo {
            points_count: Some(count),
            vectors_count: Some(count),
        })
    }

    async fn upsert(&self, collection: &str, points: &[PointRecord]) -> Result<(), SearchError> {
        let mut collections = self.collections.write();
        let found = collections
            .get_mut(collection)
            .ok_or_else(|| Self::missing(collection))?;

        if let Some(bad) = points.iter().find(|point| point.vector.len() != found.dimensions) {
            return Err(SearchError::Request(format!(
                "point {} has {} dimensions, collection {collection} expects {}",
                bad.id,
                bad.vector.len(),
                found.dimensions
            )));
        }

        for point in points {
            found
                .points
                .insert(point.id, (point.vector.clone(), point.payload.clone()));
        }
        Ok(())
    }

    async fn delete_points(&self, collection: &str, filter: &PayloadFilter) -> Result<(), SearchError> {
        if let Some(found) = self.collections.write().get_mut(collection) {
            found.points.retain(|_, (_, payload)| !filter.matches(payload));
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>, SearchError> {
        let collections = self.collections.read();
        let found = collections
            .get(collection)
            .ok_or_else(|| Self::missing(collection))?;

        let mut hits = found
            .points
            .iter()
            .filter(|(_, (_, payload))| filter.map_or(true, |filter| filter.matches(payload)))
            .map(|(id, (stored, payload))| ScoredPoint {
                id: *id,
                distance: 1.0 - cosine(vector, stored),
                payload: payload.clone(),
            })
            .collect::<Vec<_>>();

        hits.sort_by(|left, right| {
            left.distance
                .total_cmp(&right.distance)
                .then(left.id.cmp(&right.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn retrieve(&self, collection: &str, ids: &[u64]) -> Result<Vec<StoredPoint>, SearchError> {
        let collections = self.collections.read();
        let found = collections
            .get(collection)
            .ok_or_else(|| Self::missing(collection))?;

        Ok(ids
            .iter()
            .filter_map(|id| {
                found.points.get(id).map(|(_, payload)| StoredPoint {
                    id: *id,
                    payload: payload.clone(),
                })
            })
            .collect())
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        limit: usize,
        offset: Option<u64>,
    ) -> Result<ScrollPage, SearchError> {
        let collections = self.collections.read();
        let found = collections
            .get(collection)
            .ok_or_else(|| Self::missing(collection))?;

        let mut matching = found
            .points
            .range(offset.unwrap_or(0)..)
            .filter(|(_, (_, payload))| filter.map_or(true, |filter| filter.matches(payload)))
            .map(|(id, (_, payload))| StoredPoint {
                id: *id,
                payload: payload.clone(),
            });

        let points = matching.by_ref().take(limit).collect::<Vec<_>>();
        let next_offset = matching.next().map(|point| point.id);
        Ok(ScrollPage {
            points,
            next_offset,
        })
    }
}
