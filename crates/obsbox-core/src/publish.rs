//! Writes transformed records to public object storage under deterministic,
//! content-addressable keys. Idempotent keys replace mutual exclusion: a
//! rewrite of identical content is a no-op, a rewrite of different content
//! is a conflict and signals a determinism bug upstream.

use std::sync::Arc;

use obsbox_bucket::{BucketError, BucketStore};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::RetryPolicy;
use crate::types::{content_hash, StorageRef, TransformedRecord};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("storage unavailable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: String },
    /// The key already holds different content. Never overwritten.
    #[error("conflict at key '{key}': existing content differs")]
    Conflict { key: String },
    #[error("storage error: {0}")]
    Storage(#[from] BucketError),
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Unavailable { .. })
    }
}

pub struct StoragePublisher {
    bucket: Arc<dyn BucketStore>,
    retry: RetryPolicy,
}

impl StoragePublisher {
    pub fn new(bucket: Arc<dyn BucketStore>, retry: RetryPolicy) -> Self {
        Self { bucket, retry }
    }

    pub fn key_for(dataset_id: &str, record: &TransformedRecord) -> String {
        format!(
            "{dataset_id}/{}.{}",
            record.record_id,
            record.format.extension()
        )
    }

    pub async fn publish(
        &self,
        dataset_id: &str,
        record: &TransformedRecord,
    ) -> Result<StorageRef, PublishError> {
        let key = Self::key_for(dataset_id, record);

        match self.get_with_retry(&key).await? {
            Some(existing) => {
                if content_hash(&existing) == content_hash(&record.payload) {
                    debug!(key, "artifact already published, skipping write");
                    return Ok(StorageRef {
                        key,
                        already_present: true,
                    });
                }
                error!(key, "existing artifact differs from reprocessed content");
                return Err(PublishError::Conflict { key });
            }
            None => {}
        }

        let mut attempt = 0u32;
        loop {
            match self
                .bucket
                .put_object(&key, record.payload.clone(), record.format.content_type())
                .await
            {
                Ok(()) => {
                    return Ok(StorageRef {
                        key,
                        already_present: false,
                    })
                }
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(PublishError::Unavailable {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    let delay = self.retry.delay(attempt - 1);
                    warn!(key, attempt, delay_ms = delay.as_millis() as u64, error = %err,
                        "storage write failed, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(PublishError::Storage(err)),
            }
        }
    }

    async fn get_with_retry(&self, key: &str) -> Result<Option<bytes::Bytes>, PublishError> {
        let mut attempt = 0u32;
        loop {
            match self.bucket.get_object(key).await {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(BucketError::NotFound(_)) => return Ok(None),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(PublishError::Unavailable {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    tokio::time::sleep(self.retry.delay(attempt - 1)).await;
                }
                Err(err) => return Err(PublishError::Storage(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{record_id, OutputFormat};
    use bytes::Bytes;
    use obsbox_bucket::MemoryBucketStore;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn record(payload: &'static [u8]) -> TransformedRecord {
        TransformedRecord {
            record_id: record_id("ds", "hash", 0),
            payload: Bytes::from_static(payload),
            format: OutputFormat::Geojson,
            location: None,
            observed_at: None,
        }
    }

    #[test]
    fn keys_are_deterministic() {
        let a = StoragePublisher::key_for("iow.demo.Observations", &record(b"{}"));
        let b = StoragePublisher::key_for("iow.demo.Observations", &record(b"{}"));
        assert_eq!(a, b);
        assert!(a.starts_with("iow.demo.Observations/"));
        assert!(a.ends_with(".geojson"));
    }

    #[tokio::test]
    async fn republishing_identical_content_is_a_noop() {
        let bucket = Arc::new(MemoryBucketStore::new());
        let publisher = StoragePublisher::new(bucket.clone(), fast_retry());

        let first = publisher.publish("ds", &record(b"{\"a\":1}")).await.unwrap();
        assert!(!first.already_present);
        let second = publisher.publish("ds", &record(b"{\"a\":1}")).await.unwrap();
        assert!(second.already_present);
        assert_eq!(first.key, second.key);
        assert_eq!(bucket.object_count(), 1);
    }

    #[tokio::test]
    async fn divergent_content_at_same_key_is_a_conflict() {
        let bucket = Arc::new(MemoryBucketStore::new());
        let publisher = StoragePublisher::new(bucket, fast_retry());

        publisher.publish("ds", &record(b"{\"a\":1}")).await.unwrap();
        let err = publisher.publish("ds", &record(b"{\"a\":2}")).await.unwrap_err();
        assert!(matches!(err, PublishError::Conflict { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let bucket = Arc::new(MemoryBucketStore::new());
        bucket.fail_next_puts(2);
        let publisher = StoragePublisher::new(bucket.clone(), fast_retry());

        let storage_ref = publisher.publish("ds", &record(b"{}")).await.unwrap();
        assert!(!storage_ref.already_present);
        assert_eq!(bucket.object_count(), 1);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let bucket = Arc::new(MemoryBucketStore::new());
        bucket.fail_next_puts(10);
        let publisher = StoragePublisher::new(bucket, fast_retry());

        let err = publisher.publish("ds", &record(b"{}")).await.unwrap_err();
        assert!(matches!(err, PublishError::Unavailable { attempts: 3, .. }));
        assert!(err.is_transient());
    }
}
