//! Event-driven entry point: decodes storage events off the bus, dedupes
//! replays, and fans work out to a bounded pool. Events are partitioned by
//! the leading segment of their storage key, so deposits for one dataset
//! directory always process in arrival order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use obsbox_bucket::{BucketError, BucketStore};
use obsbox_pubsub::InboundMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::error::PipelineError;
use crate::pipeline::{IngestHints, Pipeline};
use crate::types::RawDeposit;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("event payload is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("bucket notification carries no object key")]
    MissingKey,
}

/// A normalized object-created event. The native form is the compact JSON
/// the storage layer emits; MinIO-style bucket notifications are accepted
/// and normalized on decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    pub key: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl StorageEvent {
    /// Decodes an event payload. Returns `Ok(None)` for recognized but
    /// irrelevant events (deletions, lifecycle noise).
    pub fn decode(payload: &[u8]) -> Result<Option<StorageEvent>, DispatchError> {
        let value: Value = serde_json::from_slice(payload)?;
        if value.get("key").is_some() {
            return Ok(Some(serde_json::from_value(value)?));
        }

        let name = value
            .get("EventName")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if !name.starts_with("s3:ObjectCreated:") {
            return Ok(None);
        }
        let full_key = value
            .get("Key")
            .and_then(|v| v.as_str())
            .ok_or(DispatchError::MissingKey)?;
        // MinIO prefixes the bucket name; the object key starts after it.
        let key = full_key
            .split_once('/')
            .map(|(_, rest)| rest)
            .unwrap_or(full_key)
            .to_string();
        Ok(Some(StorageEvent {
            event_id: None,
            key,
            content_hash: None,
            timestamp: None,
        }))
    }

    /// Identity used for replay suppression and receipts.
    pub fn dedup_key(&self) -> String {
        match (&self.event_id, &self.content_hash) {
            (Some(id), _) => id.clone(),
            (None, Some(hash)) => format!("{}@{hash}", self.key),
            (None, None) => self.key.clone(),
        }
    }

    /// Leading path segment of the storage key, used as the template hint
    /// and the worker partition key.
    pub fn dataset_dir(&self) -> &str {
        self.key.split('/').next().unwrap_or(&self.key)
    }
}

/// Sliding window of recently seen event identities.
pub struct DedupWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns true when the identity has not been seen within the window.
    pub fn insert(&mut self, identity: &str) -> bool {
        if self.seen.contains(identity) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(identity.to_string());
        self.order.push_back(identity.to_string());
        true
    }

    /// Forgets an identity so a redelivery is admitted again. Used when an
    /// admitted event could not actually be queued.
    pub fn remove(&mut self, identity: &str) -> bool {
        if !self.seen.remove(identity) {
            return false;
        }
        if let Some(position) = self.order.iter().position(|seen| seen == identity) {
            self.order.remove(position);
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptState {
    Pending,
    Succeeded,
    /// Terminal failure; the event will not be retried.
    Failed,
    /// Shed at admission: queue full or duplicate.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub event_id: String,
    pub state: ReceiptState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Queued,
    Duplicate,
    /// Load shed: the partition's queue is full.
    Shed,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_depth: usize,
    pub dedup_window: usize,
    pub max_event_attempts: u32,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 64,
            dedup_window: 512,
            max_event_attempts: 3,
            retry: RetryPolicy::default(),
        }
    }
}

type Receipts = Arc<Mutex<HashMap<String, DeliveryReceipt>>>;

pub struct Dispatcher {
    senders: Vec<mpsc::Sender<StorageEvent>>,
    dedup: Mutex<DedupWindow>,
    receipts: Receipts,
    workers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn start(
        pipeline: Arc<Pipeline>,
        source: Arc<dyn BucketStore>,
        config: DispatcherConfig,
    ) -> Self {
        let worker_count = config.workers.max(1);
        let receipts: Receipts = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown, _) = watch::channel(false);

        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel::<StorageEvent>(config.queue_depth.max(1));
            senders.push(tx);
            workers.push(tokio::spawn(worker_loop(
                index,
                rx,
                shutdown.subscribe(),
                pipeline.clone(),
                source.clone(),
                config.max_event_attempts,
                config.retry.clone(),
                receipts.clone(),
            )));
        }

        Self {
            senders,
            dedup: Mutex::new(DedupWindow::new(config.dedup_window)),
            receipts,
            workers,
            shutdown,
        }
    }

    fn partition_for(&self, event: &StorageEvent) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        event.dataset_dir().hash(&mut hasher);
        (hasher.finish() as usize) % self.senders.len()
    }

    /// Admits one event: replays inside the dedup window are dropped, and a
    /// full partition queue sheds the event rather than blocking the bus.
    pub fn dispatch(&self, event: StorageEvent) -> DispatchOutcome {
        let identity = event.dedup_key();
        {
            let mut dedup = self.dedup.lock().expect("dedup lock poisoned");
            if !dedup.insert(&identity) {
                debug!(event = %identity, "duplicate event suppressed");
                return DispatchOutcome::Duplicate;
            }
        }

        self.record(&identity, ReceiptState::Pending, 0, None);
        let partition = self.partition_for(&event);
        match self.senders[partition].try_send(event) {
            Ok(()) => DispatchOutcome::Queued,
            Err(err) => {
                warn!(event = %identity, partition, "queue full, shedding event");
                // A shed event was never processed; the upstream redelivery
                // must not be suppressed as a duplicate.
                self.dedup
                    .lock()
                    .expect("dedup lock poisoned")
                    .remove(&identity);
                self.record(&identity, ReceiptState::Rejected, 0, Some(err.to_string()));
                DispatchOutcome::Shed
            }
        }
    }

    /// Bridges the bus subscription into the pool until the channel closes.
    pub async fn consume(&self, mut rx: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = rx.recv().await {
            match StorageEvent::decode(&message.payload) {
                Ok(Some(event)) => {
                    self.dispatch(event);
                }
                Ok(None) => debug!(topic = %message.topic, "ignoring irrelevant storage event"),
                Err(err) => warn!(topic = %message.topic, error = %err, "undecodable storage event"),
            }
        }
    }

    pub fn receipt(&self, event_id: &str) -> Option<DeliveryReceipt> {
        self.receipts
            .lock()
            .expect("receipt lock poisoned")
            .get(event_id)
            .cloned()
    }

    /// Drops receipts last updated before the cutoff.
    pub fn prune_receipts(&self, older_than: DateTime<Utc>) -> usize {
        let mut receipts = self.receipts.lock().expect("receipt lock poisoned");
        let before = receipts.len();
        receipts.retain(|_, receipt| receipt.updated_at >= older_than);
        before - receipts.len()
    }

    fn record(&self, event_id: &str, state: ReceiptState, attempts: u32, error: Option<String>) {
        record_receipt(&self.receipts, event_id, state, attempts, error);
    }

    /// Stops accepting work and waits for in-flight events up to the grace
    /// period. Queued events past the deadline are abandoned.
    pub async fn shutdown(mut self, grace: Duration) {
        self.senders.clear();
        let workers = std::mem::take(&mut self.workers);
        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("shutdown grace period elapsed, abandoning queued events");
            let _ = self.shutdown.send(true);
        }
    }
}

fn record_receipt(
    receipts: &Receipts,
    event_id: &str,
    state: ReceiptState,
    attempts: u32,
    error: Option<String>,
) {
    receipts.lock().expect("receipt lock poisoned").insert(
        event_id.to_string(),
        DeliveryReceipt {
            event_id: event_id.to_string(),
            state,
            attempts,
            last_error: error,
            updated_at: Utc::now(),
        },
    );
}

#[derive(Debug, Error)]
enum WorkerError {
    #[error("failed to fetch deposit: {0}")]
    Fetch(#[from] BucketError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl WorkerError {
    fn is_transient(&self) -> bool {
        match self {
            WorkerError::Fetch(err) => err.is_transient(),
            WorkerError::Pipeline(err) => err.is_transient(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    index: usize,
    mut rx: mpsc::Receiver<StorageEvent>,
    mut shutdown: watch::Receiver<bool>,
    pipeline: Arc<Pipeline>,
    source: Arc<dyn BucketStore>,
    max_attempts: u32,
    retry: RetryPolicy,
    receipts: Receipts,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let identity = event.dedup_key();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match process_event(&pipeline, &source, &event).await {
                Ok(()) => {
                    record_receipt(&receipts, &identity, ReceiptState::Succeeded, attempts, None);
                    break;
                }
                Err(err) if err.is_transient() && attempts < max_attempts => {
                    let delay = retry.delay(attempts - 1);
                    warn!(worker = index, event = %identity, attempts, error = %err,
                        "transient failure, retrying event");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(worker = index, event = %identity, attempts, error = %err,
                        "event processing failed");
                    record_receipt(
                        &receipts,
                        &identity,
                        ReceiptState::Failed,
                        attempts,
                        Some(err.to_string()),
                    );
                    break;
                }
            }
        }
    }
    debug!(worker = index, "worker stopped");
}

async fn process_event(
    pipeline: &Pipeline,
    source: &Arc<dyn BucketStore>,
    event: &StorageEvent,
) -> Result<(), WorkerError> {
    let bytes = source.get_object(&event.key).await?;
    let deposit = RawDeposit::new(
        event.key.clone(),
        bytes,
        event.timestamp.unwrap_or_else(Utc::now),
    );
    let hints = IngestHints::template(event.dataset_dir());
    let report = pipeline.ingest(&deposit, &hints).await?;
    info!(
        dataset = %report.dataset_id,
        deposit = %deposit.key,
        published = report.published.len(),
        "event processed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryBackend;
    use crate::notify::NotificationEmitter;
    use crate::publish::StoragePublisher;
    use crate::registry::{DatasetDescriptor, DatasetRegistry, TransformKind};
    use crate::topic::Topic;
    use crate::transform::TransformContext;
    use crate::types::{BoundingBox, OutputFormat};
    use crate::validate::Validator;
    use async_trait::async_trait;
    use bytes::Bytes;
    use obsbox_bucket::MemoryBucketStore;
    use obsbox_pubsub::{MemoryDeadLetterQueue, MemoryPubSub};

    #[test]
    fn decodes_native_and_minio_events() {
        let native = br#"{"key":"gauges/2024.geojson","contentHash":"abc","eventId":"e-1"}"#;
        let event = StorageEvent::decode(native).unwrap().unwrap();
        assert_eq!(event.key, "gauges/2024.geojson");
        assert_eq!(event.dedup_key(), "e-1");
        assert_eq!(event.dataset_dir(), "gauges");

        let minio =
            br#"{"EventName":"s3:ObjectCreated:Put","Key":"obsbox-incoming/gauges/2024.geojson"}"#;
        let event = StorageEvent::decode(minio).unwrap().unwrap();
        assert_eq!(event.key, "gauges/2024.geojson");

        let delete = br#"{"EventName":"s3:ObjectRemoved:Delete","Key":"obsbox-incoming/x"}"#;
        assert!(StorageEvent::decode(delete).unwrap().is_none());

        assert!(StorageEvent::decode(b"not json").is_err());
    }

    #[test]
    fn dedup_window_is_bounded() {
        let mut window = DedupWindow::new(2);
        assert!(window.insert("a"));
        assert!(!window.insert("a"));
        assert!(window.insert("b"));
        // "a" evicted once capacity rolls over.
        assert!(window.insert("c"));
        assert!(window.insert("a"));
    }

    #[test]
    fn removed_identities_are_admitted_again() {
        let mut window = DedupWindow::new(4);
        assert!(window.insert("a"));
        assert!(window.remove("a"));
        assert!(!window.remove("a"));
        assert!(window.insert("a"));
        assert!(!window.insert("a"));
    }

    fn descriptor() -> DatasetDescriptor {
        DatasetDescriptor {
            dataset_id: "gauges".to_string(),
            template: "gauges".to_string(),
            transform: TransformKind::GeojsonToRecord,
            mapping: None,
            target_topic: Topic::parse("iow/gauges/geojson/data").unwrap(),
            bounds: BoundingBox::WORLD,
            temporal: None,
            output_format: OutputFormat::Json,
            sequence: 0,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn pipeline(bus: Arc<MemoryPubSub>, public: Arc<MemoryBucketStore>) -> Arc<Pipeline> {
        let registry = Arc::new(DatasetRegistry::new());
        registry.register(descriptor());
        Arc::new(Pipeline::new(
            registry,
            Validator::default(),
            StoragePublisher::new(public, fast_retry()),
            NotificationEmitter::new(
                bus,
                Arc::new(MemoryDeadLetterQueue::new()),
                fast_retry(),
                "https://data.example.org",
            ),
            Arc::new(MemoryBackend::new()),
            TransformContext::default(),
        ))
    }

    fn feature() -> &'static [u8] {
        br#"{"type":"Feature","geometry":{"type":"Point","coordinates":[-120.0,44.0]},"properties":{"value":1.5}}"#
    }

    #[tokio::test]
    async fn event_flows_from_dispatch_to_publication() {
        let source = Arc::new(MemoryBucketStore::new());
        source
            .put_object("gauges/day1.geojson", Bytes::from_static(feature()), "application/geo+json")
            .await
            .unwrap();
        let public = Arc::new(MemoryBucketStore::new());
        let bus = Arc::new(MemoryPubSub::new());

        let dispatcher = Dispatcher::start(
            pipeline(bus.clone(), public.clone()),
            source,
            DispatcherConfig {
                workers: 2,
                queue_depth: 8,
                ..DispatcherConfig::default()
            },
        );

        let event = StorageEvent::decode(br#"{"key":"gauges/day1.geojson","eventId":"e-1"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(dispatcher.dispatch(event), DispatchOutcome::Queued);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(public.object_count(), 1);
        assert_eq!(bus.published().len(), 1);

        let receipt = dispatcher.receipt("e-1").unwrap();
        assert_eq!(receipt.state, ReceiptState::Succeeded);
        assert_eq!(receipt.attempts, 1);

        dispatcher.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn replayed_events_are_suppressed() {
        let source = Arc::new(MemoryBucketStore::new());
        source
            .put_object("gauges/day1.geojson", Bytes::from_static(feature()), "application/geo+json")
            .await
            .unwrap();
        let public = Arc::new(MemoryBucketStore::new());
        let bus = Arc::new(MemoryPubSub::new());

        let dispatcher = Dispatcher::start(
            pipeline(bus.clone(), public.clone()),
            source,
            DispatcherConfig::default(),
        );

        let payload = br#"{"key":"gauges/day1.geojson","eventId":"e-1"}"#;
        let first = StorageEvent::decode(payload).unwrap().unwrap();
        let second = StorageEvent::decode(payload).unwrap().unwrap();
        assert_eq!(dispatcher.dispatch(first), DispatchOutcome::Queued);
        assert_eq!(dispatcher.dispatch(second), DispatchOutcome::Duplicate);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bus.published().len(), 1);
        dispatcher.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn same_dataset_events_process_in_arrival_order() {
        let day1: &[u8] = br#"{"type":"Feature","geometry":{"type":"Point","coordinates":[-120.0,44.0]},"properties":{"value":1.0}}"#;
        let day2: &[u8] = br#"{"type":"Feature","geometry":{"type":"Point","coordinates":[-120.0,44.0]},"properties":{"value":2.0}}"#;

        let source = Arc::new(MemoryBucketStore::new());
        source
            .put_object("gauges/day1.geojson", Bytes::from_static(day1), "application/geo+json")
            .await
            .unwrap();
        source
            .put_object("gauges/day2.geojson", Bytes::from_static(day2), "application/geo+json")
            .await
            .unwrap();
        let public = Arc::new(MemoryBucketStore::new());
        let bus = Arc::new(MemoryPubSub::new());

        let dispatcher = Dispatcher::start(
            pipeline(bus.clone(), public.clone()),
            source,
            DispatcherConfig::default(),
        );

        for (id, key) in [("e-1", "gauges/day1.geojson"), ("e-2", "gauges/day2.geojson")] {
            let event = StorageEvent {
                event_id: Some(id.to_string()),
                key: key.to_string(),
                content_hash: None,
                timestamp: None,
            };
            assert_eq!(dispatcher.dispatch(event), DispatchOutcome::Queued);
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let published = bus.published();
        assert_eq!(published.len(), 2);

        // The first notification announces the record derived from day1.
        let first: crate::notify::NotificationMessage =
            serde_json::from_slice(&published[0].1).unwrap();
        let expected = crate::types::record_id("gauges", &crate::types::content_hash(day1), 0);
        assert!(first.properties.data_id.ends_with(&expected.to_string()));
        dispatcher.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn unknown_dataset_is_a_terminal_failure() {
        let source = Arc::new(MemoryBucketStore::new());
        source
            .put_object("mystery/file.geojson", Bytes::from_static(feature()), "application/geo+json")
            .await
            .unwrap();
        let bus = Arc::new(MemoryPubSub::new());
        let public = Arc::new(MemoryBucketStore::new());

        let dispatcher = Dispatcher::start(
            pipeline(bus.clone(), public.clone()),
            source,
            DispatcherConfig::default(),
        );

        let event = StorageEvent::decode(br#"{"key":"mystery/file.geojson","eventId":"e-2"}"#)
            .unwrap()
            .unwrap();
        dispatcher.dispatch(event);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let receipt = dispatcher.receipt("e-2").unwrap();
        assert_eq!(receipt.state, ReceiptState::Failed);
        assert_eq!(receipt.attempts, 1);
        assert!(receipt.last_error.unwrap().contains("mystery"));
        assert_eq!(public.object_count(), 0);
        dispatcher.shutdown(Duration::from_millis(200)).await;
    }

    /// Source bucket whose reads stall, to hold a worker busy.
    struct SlowBucket {
        inner: MemoryBucketStore,
        delay: Duration,
    }

    #[async_trait]
    impl BucketStore for SlowBucket {
        async fn put_object(
            &self,
            key: &str,
            bytes: Bytes,
            content_type: &str,
        ) -> Result<(), BucketError> {
            self.inner.put_object(key, bytes, content_type).await
        }

        async fn get_object(&self, key: &str) -> Result<Bytes, BucketError> {
            tokio::time::sleep(self.delay).await;
            self.inner.get_object(key).await
        }

        async fn delete_object(&self, key: &str) -> Result<(), BucketError> {
            self.inner.delete_object(key).await
        }
    }

    #[tokio::test]
    async fn full_partition_queue_sheds_load() {
        let slow = SlowBucket {
            inner: MemoryBucketStore::new(),
            delay: Duration::from_millis(200),
        };
        slow.inner
            .put_object("gauges/day1.geojson", Bytes::from_static(feature()), "application/geo+json")
            .await
            .unwrap();
        let bus = Arc::new(MemoryPubSub::new());
        let public = Arc::new(MemoryBucketStore::new());

        let dispatcher = Dispatcher::start(
            pipeline(bus, public),
            Arc::new(slow),
            DispatcherConfig {
                workers: 1,
                queue_depth: 1,
                ..DispatcherConfig::default()
            },
        );

        let mut outcomes = Vec::new();
        for i in 0..4 {
            let event = StorageEvent {
                event_id: Some(format!("e-{i}")),
                key: "gauges/day1.geojson".to_string(),
                content_hash: None,
                timestamp: None,
            };
            outcomes.push(dispatcher.dispatch(event));
        }
        assert!(outcomes.contains(&DispatchOutcome::Shed));

        for (i, outcome) in outcomes.iter().enumerate() {
            if *outcome == DispatchOutcome::Shed {
                let receipt = dispatcher.receipt(&format!("e-{i}")).unwrap();
                assert_eq!(receipt.state, ReceiptState::Rejected);
            }
        }
        dispatcher.shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn shed_events_are_admitted_again_on_redelivery() {
        let slow = SlowBucket {
            inner: MemoryBucketStore::new(),
            delay: Duration::from_millis(50),
        };
        slow.inner
            .put_object("gauges/day1.geojson", Bytes::from_static(feature()), "application/geo+json")
            .await
            .unwrap();
        let bus = Arc::new(MemoryPubSub::new());
        let public = Arc::new(MemoryBucketStore::new());

        let dispatcher = Dispatcher::start(
            pipeline(bus, public),
            Arc::new(slow),
            DispatcherConfig {
                workers: 1,
                queue_depth: 1,
                ..DispatcherConfig::default()
            },
        );

        let event = |id: &str| StorageEvent {
            event_id: Some(id.to_string()),
            key: "gauges/day1.geojson".to_string(),
            content_hash: None,
            timestamp: None,
        };

        let mut shed_id = None;
        for i in 0..4 {
            let id = format!("e-{i}");
            if dispatcher.dispatch(event(&id)) == DispatchOutcome::Shed {
                shed_id = Some(id);
                break;
            }
        }
        let shed_id = shed_id.expect("queue never filled");

        // Let the backlog drain, then redeliver the shed event: it must be
        // admitted and processed, not suppressed as a duplicate.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(dispatcher.dispatch(event(&shed_id)), DispatchOutcome::Queued);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let receipt = dispatcher.receipt(&shed_id).unwrap();
        assert_eq!(receipt.state, ReceiptState::Succeeded);

        dispatcher.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn receipts_can_be_pruned() {
        let source = Arc::new(MemoryBucketStore::new());
        let bus = Arc::new(MemoryPubSub::new());
        let public = Arc::new(MemoryBucketStore::new());
        let dispatcher = Dispatcher::start(
            pipeline(bus, public),
            source,
            DispatcherConfig::default(),
        );

        let event = StorageEvent {
            event_id: Some("e-old".to_string()),
            key: "gauges/x.geojson".to_string(),
            content_hash: None,
            timestamp: None,
        };
        dispatcher.dispatch(event);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(dispatcher.prune_receipts(Utc::now() - chrono::Duration::hours(1)), 0);
        assert_eq!(dispatcher.prune_receipts(Utc::now() + chrono::Duration::hours(1)), 1);
        assert!(dispatcher.receipt("e-old").is_none());
        dispatcher.shutdown(Duration::from_millis(100)).await;
    }
}
