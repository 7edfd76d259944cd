use crate::error::SearchError;
use crate::traits::{
    CollectionInfo, PayloadFilter, PointRecord, ScoredPoint, ScrollPage, StoredPoint, VectorBackend,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

const BACKEND: &str = "qdrant";

pub struct QdrantStore {
    endpoint: String,
    client: Client,
}

impl QdrantStore {
    pub fn new(endpoint: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self, SearchError> {
        let endpoint = Url::parse(endpoint)?.as_str().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        if let Some(key) = api_key.map(str::trim).filter(|key| !key.is_empty()) {
            let value = HeaderValue::from_str(key)
                .map_err(|_| SearchError::Request("qdrant api key is not a valid header".to_string()))?;
            headers.insert("api-key", value);
        }

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self { endpoint, client })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/collections/{}", self.endpoint, collection)
    }

    async fn checked(response: Response) -> Result<Value, SearchError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("{status}: {body}"),
            });
        }
        Ok(response.json().await?)
    }
}

fn filter_json(filter: &PayloadFilter) -> Value {
    let must = filter
        .must
        .iter()
        .map(|(key, value)| json!({ "key": key, "match": { "value": value } }))
        .collect::<Vec<_>>();
    json!({ "must": must })
}

fn point_id(value: &Value) -> Option<u64> {
    let id = value.pointer("/id")?;
    match id.as_u64() {
        Some(id) => Some(id),
        None => {
            debug!(%id, "skipping point with non-numeric id");
            None
        }
    }
}

fn payload_of(value: &Value) -> Value {
    value.pointer("/payload").cloned().unwrap_or(Value::Null)
}

#[async_trait]
impl VectorBackend for QdrantStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool, SearchError> {
        let response = self.client.get(self.collection_url(collection)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: status.to_string(),
            }),
        }
    }

    async fn create_collection(&self, collection: &str, dimensions: usize) -> Result<(), SearchError> {
        let response = self
            .client
            .put(self.collection_url(collection))
            .json(&json!({
                "vectors": { "size": dimensions, "distance": "Cosine" },
            }))
            .send()
            .await?;
        Self::checked(response).await?;
        Ok(())
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), SearchError> {
        let response = self.client.delete(self.collection_url(collection)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::checked(response).await?;
        Ok(())
    }

    async fn collection_info(&self, collection: &str) -> Result<CollectionInfo, SearchError> {
        let response = self.client.get(self.collection_url(collection)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SearchError::NotReady(format!("collection {collection} does not exist")));
        }
        let parsed = Self::checked(response).await?;
        Ok(CollectionInfo {
            points_count: parsed.pointer("/result/points_count").and_then(Value::as_u64),
            vectors_count: parsed.pointer("/result/vectors_count").and_then(Value::as_u64),
        })
    }

    async fn upsert(&self, collection: &str, points: &[PointRecord]) -> Result<(), SearchError> {
        if points.is_empty() {
            return Ok(());
        }

        let points = points
            .iter()
            .map(|point| {
                json!({
                    "id": point.id,
                    "vector": point.vector,
                    "payload": point.payload,
                })
            })
            .collect::<Vec<_>>();

        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url(collection)))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        Self::checked(response).await?;
        Ok(())
    }

    async fn delete_points(&self, collection: &str, filter: &PayloadFilter) -> Result<(), SearchError> {
        let response = self
            .client
            .post(format!("{}/points/delete?wait=true", self.collection_url(collection)))
            .json(&json!({ "filter": filter_json(filter) }))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::checked(response).await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>, SearchError> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            body["filter"] = filter_json(filter);
        }

        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url(collection)))
            .json(&body)
            .send()
            .await?;
        let parsed = Self::checked(response).await?;

        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(hits
            .iter()
            .filter_map(|hit| {
                let score = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0) as f32;
                Some(ScoredPoint {
                    id: point_id(hit)?,
                    distance: 1.0 - score,
                    payload: payload_of(hit),
                })
            })
            .collect())
    }

    async fn retrieve(&self, collection: &str, ids: &[u64]) -> Result<Vec<StoredPoint>, SearchError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/points", self.collection_url(collection)))
            .json(&json!({ "ids": ids, "with_payload": true, "with_vector": false }))
            .send()
            .await?;
        let parsed = Self::checked(response).await?;

        Ok(parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .map(|points| {
                points
                    .iter()
                    .filter_map(|point| {
                        Some(StoredPoint {
                            id: point_id(point)?,
                            payload: payload_of(point),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        limit: usize,
        offset: Option<u64>,
    ) -> Result<ScrollPage, SearchError> {
        let mut body = json!({
            "limit": limit,
            "with_payload": true,
            "with_vector": false,
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        if let Some(filter) = filter {
            body["filter"] = filter_json(filter);
        }

        let response = self
            .client
            .post(format!("{}/points/scroll", self.collection_url(collection)))
            .json(&body)
            .send()
            .await?;
        let parsed = Self::checked(response).await?;

        let points = parsed
            .pointer("/result/points")
            .and_then(Value::as_array)
            .map(|points| {
                points
                    .iter()
                    .filter_map(|point| {
                        Some(StoredPoint {
                            id: point_id(point)?,
                            payload: payload_of(point),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ScrollPage {
            points,
            next_offset: parsed
                .pointer("/result/next_page_offset")
                .and_then(Value::as_u64),
        })
    }
}
