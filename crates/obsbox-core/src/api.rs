//! Client side of the discovery/query API. The pipeline is only a producer
//! here; the API itself is an external collaborator.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure; the caller may retry.
    #[error("api request failed: {0}")]
    Http(String),
    #[error("api rejected request with status {0}")]
    Status(u16),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Http(_) => true,
            ApiError::Status(code) => *code >= 500,
        }
    }
}

/// Collection metadata pushed at metadata-publish time.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionMeta {
    pub id: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub bbox: [f64; 4],
    pub links: Vec<String>,
    pub id_field: String,
    pub time_field: String,
}

#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    async fn setup_collection(&self, meta: &CollectionMeta) -> Result<(), ApiError>;
    async fn upsert_items(&self, collection_id: &str, items: &[Value]) -> Result<(), ApiError>;
    async fn delete_collection(&self, collection_id: &str) -> Result<(), ApiError>;
}

/// SensorThings-style backend: entities are POSTed to the collection
/// endpoint named by the last dotted component of the collection id.
pub struct SensorThingsBackend {
    http: reqwest::Client,
    url: String,
}

impl SensorThingsBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
        }
    }

    fn collection_url(&self, collection_id: &str) -> String {
        let leaf = collection_id.rsplit('.').next().unwrap_or(collection_id);
        format!("{}/{leaf}", self.url)
    }

    async fn post(&self, url: &str, body: &Value) -> Result<(), ApiError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| ApiError::Http(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ApiError::Status(status.as_u16()))
        }
    }
}

#[async_trait]
impl DiscoveryBackend for SensorThingsBackend {
    async fn setup_collection(&self, meta: &CollectionMeta) -> Result<(), ApiError> {
        let body = serde_json::to_value(meta).map_err(|err| ApiError::Http(err.to_string()))?;
        self.post(&self.collection_url(&meta.id), &body).await
    }

    async fn upsert_items(&self, collection_id: &str, items: &[Value]) -> Result<(), ApiError> {
        let url = self.collection_url(collection_id);
        for item in items {
            self.post(&url, item).await?;
        }
        Ok(())
    }

    async fn delete_collection(&self, collection_id: &str) -> Result<(), ApiError> {
        let response = self
            .http
            .delete(self.collection_url(collection_id))
            .send()
            .await
            .map_err(|err| ApiError::Http(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ApiError::Status(status.as_u16()))
        }
    }
}

/// In-memory backend for tests and dry runs.
#[derive(Default)]
pub struct MemoryBackend {
    collections: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self, collection_id: &str) -> Vec<Value> {
        self.collections
            .lock()
            .expect("backend lock poisoned")
            .get(collection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn collection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .collections
            .lock()
            .expect("backend lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl DiscoveryBackend for MemoryBackend {
    async fn setup_collection(&self, meta: &CollectionMeta) -> Result<(), ApiError> {
        self.collections
            .lock()
            .expect("backend lock poisoned")
            .entry(meta.id.clone())
            .or_default();
        Ok(())
    }

    async fn upsert_items(&self, collection_id: &str, items: &[Value]) -> Result<(), ApiError> {
        self.collections
            .lock()
            .expect("backend lock poisoned")
            .entry(collection_id.to_string())
            .or_default()
            .extend(items.iter().cloned());
        Ok(())
    }

    async fn delete_collection(&self, collection_id: &str) -> Result<(), ApiError> {
        self.collections
            .lock()
            .expect("backend lock poisoned")
            .remove(collection_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_url_uses_last_dotted_component() {
        let backend = SensorThingsBackend::new("http://api.local/v1.1/");
        assert_eq!(
            backend.collection_url("iow.demo.Observations"),
            "http://api.local/v1.1/Observations"
        );
        assert_eq!(backend.collection_url("Things"), "http://api.local/v1.1/Things");
    }

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        assert!(ApiError::Http("connection refused".into()).is_transient());
        assert!(ApiError::Status(503).is_transient());
        assert!(!ApiError::Status(400).is_transient());
    }

    #[tokio::test]
    async fn memory_backend_tracks_collections_and_items() {
        let backend = MemoryBackend::new();
        let meta = CollectionMeta {
            id: "iow.demo.Observations".into(),
            title: "Observations".into(),
            description: "test".into(),
            keywords: vec![],
            bbox: [-180.0, -90.0, 180.0, 90.0],
            links: vec![],
            id_field: "id".into(),
            time_field: "resultTime".into(),
        };
        backend.setup_collection(&meta).await.unwrap();
        backend
            .upsert_items("iow.demo.Observations", &[serde_json::json!({"id": 1})])
            .await
            .unwrap();
        assert_eq!(backend.items("iow.demo.Observations").len(), 1);
        backend.delete_collection("iow.demo.Observations").await.unwrap();
        assert!(backend.collection_ids().is_empty());
    }
}
