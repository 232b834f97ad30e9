//! Abstractions over S3-compatible storage backends holding raw deposits and
//! published artifacts.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            bucket: "obsbox-public".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum BucketError {
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Transport-level failure; the caller may retry.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("sdk error: {0}")]
    Sdk(String),
    #[error("object not found: {0}")]
    NotFound(String),
}

impl BucketError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BucketError::Unavailable(_))
    }

    fn from_sdk<E, R>(err: SdkError<E, R>) -> Self
    where
        E: fmt::Display,
    {
        match err {
            SdkError::ServiceError(service_err) => Self::Sdk(service_err.err().to_string()),
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
                Self::Unavailable(err.to_string())
            }
            other => Self::Sdk(other.to_string()),
        }
    }
}

#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), BucketError>;
    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError>;
    async fn delete_object(&self, key: &str) -> Result<(), BucketError>;
}

#[derive(Clone)]
pub struct S3BucketStore {
    client: Client,
    bucket: String,
}

impl S3BucketStore {
    pub async fn new(config: BucketConfig) -> Result<Self, BucketError> {
        if config.bucket.is_empty() {
            return Err(BucketError::Configuration(
                "bucket name cannot be empty".into(),
            ));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(access_key, secret_key, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(credentials));
        }

        let shared_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = Client::from_conf(builder.build());
        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }
}

#[async_trait]
impl BucketStore for S3BucketStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<(), BucketError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(content_type)
            .send()
            .await
            .map_err(BucketError::from_sdk)?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| match &err {
                SdkError::ServiceError(service_err)
                    if service_err.err().to_string().contains("NoSuchKey") =>
                {
                    BucketError::NotFound(key.to_string())
                }
                _ => BucketError::from_sdk(err),
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|err| BucketError::Sdk(err.to_string()))?;
        Ok(Bytes::from(data.into_bytes()))
    }

    async fn delete_object(&self, key: &str) -> Result<(), BucketError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(BucketError::from_sdk)?;
        Ok(())
    }
}

/// In-memory store used by tests and local dry runs. `fail_next_puts` makes
/// the next N put calls report `Unavailable` to exercise retry paths.
#[derive(Default)]
pub struct MemoryBucketStore {
    objects: Mutex<HashMap<String, Bytes>>,
    fail_next_puts: AtomicUsize,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_puts(&self, count: usize) {
        self.fail_next_puts.store(count, Ordering::SeqCst);
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().expect("bucket lock poisoned").len()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .expect("bucket lock poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<(), BucketError> {
        let remaining = self.fail_next_puts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next_puts.store(remaining - 1, Ordering::SeqCst);
            return Err(BucketError::Unavailable("injected failure".into()));
        }
        self.objects
            .lock()
            .expect("bucket lock poisoned")
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
        self.objects
            .lock()
            .expect("bucket lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| BucketError::NotFound(key.to_string()))
    }

    async fn delete_object(&self, key: &str) -> Result<(), BucketError> {
        self.objects
            .lock()
            .expect("bucket lock poisoned")
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BucketError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips_objects() {
        let store = MemoryBucketStore::new();
        store
            .put_object("a/b.geojson", Bytes::from_static(b"{}"), "application/geo+json")
            .await
            .unwrap();
        let fetched = store.get_object("a/b.geojson").await.unwrap();
        assert_eq!(fetched, Bytes::from_static(b"{}"));
        assert_eq!(store.object_count(), 1);
    }

    #[tokio::test]
    async fn memory_store_reports_missing_objects() {
        let store = MemoryBucketStore::new();
        let err = store.get_object("nope").await.unwrap_err();
        assert!(matches!(err, BucketError::NotFound(_)));
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_bounded() {
        let store = MemoryBucketStore::new();
        store.fail_next_puts(1);
        let err = store
            .put_object("k", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        store
            .put_object("k", Bytes::from_static(b"x"), "text/plain")
            .await
            .unwrap();
    }
}
