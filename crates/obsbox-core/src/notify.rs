//! Builds and publishes one notification message per published artifact.
//! Delivery is at-least-once; past the retry budget the message is parked in
//! the dead-letter queue and the pipeline proceeds.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use geojson::{Geometry, Value as GeoValue};
use obsbox_pubsub::{DeadLetterError, DeadLetterQueue, PubSubClient};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::registry::DatasetDescriptor;
use crate::types::{StorageRef, TransformedRecord};

pub const NOTIFICATION_SEGMENT: &str = "notification";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("dead letter queue failed: {0}")]
    DeadLetter(#[from] DeadLetterError),
    #[error("notification could not be serialized: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integrity {
    pub method: String,
    #[serde(rename = "hashValue")]
    pub hash_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
    pub rel: String,
    #[serde(rename = "type")]
    pub media_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationProperties {
    pub pubtime: DateTime<Utc>,
    pub data_id: String,
    pub integrity: Integrity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    pub properties: NotificationProperties,
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitOutcome {
    Published(Uuid),
    DeadLettered(Uuid),
}

impl EmitOutcome {
    pub fn message_id(&self) -> Uuid {
        match self {
            EmitOutcome::Published(id) | EmitOutcome::DeadLettered(id) => *id,
        }
    }
}

pub struct NotificationEmitter {
    bus: Arc<dyn PubSubClient>,
    dead_letter: Arc<dyn DeadLetterQueue>,
    retry: RetryPolicy,
    /// Base URL prefixed to storage keys in `links[].href`.
    public_url: String,
}

impl NotificationEmitter {
    pub fn new(
        bus: Arc<dyn PubSubClient>,
        dead_letter: Arc<dyn DeadLetterQueue>,
        retry: RetryPolicy,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            dead_letter,
            retry,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn notification_topic(descriptor: &DatasetDescriptor) -> String {
        descriptor
            .target_topic
            .child(NOTIFICATION_SEGMENT)
            .expect("notification segment is a valid topic segment")
            .to_string()
    }

    pub fn build_message(
        &self,
        descriptor: &DatasetDescriptor,
        record: &TransformedRecord,
        storage_ref: &StorageRef,
        pubtime: DateTime<Utc>,
    ) -> NotificationMessage {
        NotificationMessage {
            id: Uuid::new_v4(),
            kind: "Feature".to_string(),
            geometry: record
                .location
                .map(|(lon, lat)| Geometry::new(GeoValue::Point(vec![lon, lat]))),
            properties: NotificationProperties {
                pubtime,
                data_id: format!("{}/{}", descriptor.dataset_id, record.record_id),
                integrity: Integrity {
                    method: "blake3".to_string(),
                    hash_value: crate::types::content_hash(&record.payload),
                },
            },
            links: vec![Link {
                href: format!("{}/{}", self.public_url, storage_ref.key),
                rel: "canonical".to_string(),
                media_type: record.format.content_type().to_string(),
            }],
        }
    }

    /// Publishes the message, retrying transient bus failures with backoff.
    /// Exhausting the budget parks the payload in the dead-letter queue; the
    /// artifact it announces stays published.
    pub async fn emit(
        &self,
        descriptor: &DatasetDescriptor,
        record: &TransformedRecord,
        storage_ref: &StorageRef,
    ) -> Result<EmitOutcome, NotifyError> {
        let message = self.build_message(descriptor, record, storage_ref, Utc::now());
        let topic = Self::notification_topic(descriptor);
        let payload = serde_json::to_vec(&message)?;

        let mut attempt = 0u32;
        loop {
            match self.bus.publish(&topic, payload.clone()).await {
                Ok(()) => {
                    debug!(topic, message_id = %message.id, "notification published");
                    return Ok(EmitOutcome::Published(message.id));
                }
                Err(err) if err.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt - 1);
                    warn!(topic, attempt, error = %err, "notification publish failed, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(topic, message_id = %message.id, error = %err,
                        "retry budget exhausted, dead-lettering notification");
                    self.dead_letter.store(&topic, &payload).await?;
                    return Ok(EmitOutcome::DeadLettered(message.id));
                }
            }
        }
    }
}
