//! Stage orchestration for one deposit: resolve, transform, validate,
//! publish, upsert to the discovery API, notify. The same entry point
//! serves the event-driven dispatcher and synchronous batch runs.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{CollectionMeta, DiscoveryBackend};
use crate::error::PipelineError;
use crate::notify::{EmitOutcome, NotificationEmitter};
use crate::publish::{PublishError, StoragePublisher};
use crate::registry::{DatasetDescriptor, DatasetRegistry, ResolveHint};
use crate::transform::{transform_for, TransformContext};
use crate::types::{RawDeposit, StorageRef, TransformedRecord};
use crate::validate::Validator;

#[derive(Debug, Clone, Default)]
pub struct IngestHints {
    pub template: String,
    pub resolve: ResolveHint,
}

impl IngestHints {
    pub fn template(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            resolve: ResolveHint::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RejectedRecord {
    pub record_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub dataset_id: String,
    pub total_rows: usize,
    pub skipped_rows: usize,
    pub published: Vec<StorageRef>,
    pub rejected: Vec<RejectedRecord>,
    pub notifications: Vec<Uuid>,
    pub dead_lettered: usize,
}

pub struct Pipeline {
    registry: Arc<DatasetRegistry>,
    validator: Validator,
    publisher: StoragePublisher,
    emitter: NotificationEmitter,
    backend: Arc<dyn DiscoveryBackend>,
    transform_ctx: TransformContext,
}

impl Pipeline {
    pub fn new(
        registry: Arc<DatasetRegistry>,
        validator: Validator,
        publisher: StoragePublisher,
        emitter: NotificationEmitter,
        backend: Arc<dyn DiscoveryBackend>,
        transform_ctx: TransformContext,
    ) -> Self {
        Self {
            registry,
            validator,
            publisher,
            emitter,
            backend,
            transform_ctx,
        }
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    /// Registers descriptors and provisions their collections on the
    /// discovery API. Used by the metadata-publish path.
    pub async fn register_datasets(
        &self,
        descriptors: Vec<DatasetDescriptor>,
    ) -> Result<usize, PipelineError> {
        let count = descriptors.len();
        for descriptor in descriptors {
            let meta = CollectionMeta {
                id: descriptor.dataset_id.clone(),
                title: descriptor.dataset_id.clone(),
                description: format!("records produced by template '{}'", descriptor.template),
                keywords: vec!["observation".to_string()],
                bbox: [
                    descriptor.bounds.min_lon,
                    descriptor.bounds.min_lat,
                    descriptor.bounds.max_lon,
                    descriptor.bounds.max_lat,
                ],
                links: Vec::new(),
                id_field: "id".to_string(),
                time_field: "resultTime".to_string(),
            };
            self.backend.setup_collection(&meta).await?;
            self.registry.register(descriptor);
        }
        Ok(count)
    }

    /// Runs the full pipeline for one deposit. Per-record validation and
    /// conflict failures are reported, not fatal; transform failures and
    /// exhausted infrastructure retries terminate the invocation.
    pub async fn ingest(
        &self,
        deposit: &RawDeposit,
        hints: &IngestHints,
    ) -> Result<IngestReport, PipelineError> {
        let descriptor = self.registry.resolve(&hints.template, &hints.resolve)?;
        let transform = transform_for(descriptor.transform);
        let output = transform.run(deposit, &descriptor, &self.transform_ctx)?;

        let mut report = IngestReport {
            dataset_id: descriptor.dataset_id.clone(),
            total_rows: output.total_rows,
            skipped_rows: output.skipped_rows,
            ..IngestReport::default()
        };

        let now = Utc::now();
        let mut accepted: Vec<(TransformedRecord, StorageRef)> = Vec::new();
        for record in output.records {
            if let Err(err) = self.validator.validate(&record, &descriptor, now) {
                warn!(record_id = %record.record_id, error = %err, "record rejected");
                report.rejected.push(RejectedRecord {
                    record_id: record.record_id,
                    reason: err.to_string(),
                });
                continue;
            }

            match self.publisher.publish(&descriptor.dataset_id, &record).await {
                Ok(storage_ref) => accepted.push((record, storage_ref)),
                Err(err @ PublishError::Conflict { .. }) => {
                    report.rejected.push(RejectedRecord {
                        record_id: record.record_id,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }

        if !accepted.is_empty() {
            let items: Vec<Value> = accepted
                .iter()
                .filter_map(|(record, _)| serde_json::from_slice(&record.payload).ok())
                .collect();
            self.backend
                .upsert_items(&descriptor.dataset_id, &items)
                .await?;
        }

        for (record, storage_ref) in &accepted {
            match self.emitter.emit(&descriptor, record, storage_ref).await? {
                EmitOutcome::Published(id) => report.notifications.push(id),
                EmitOutcome::DeadLettered(id) => {
                    report.notifications.push(id);
                    report.dead_lettered += 1;
                }
            }
            report.published.push(storage_ref.clone());
        }

        info!(
            dataset = %report.dataset_id,
            deposit = %deposit.key,
            published = report.published.len(),
            skipped = report.skipped_rows,
            rejected = report.rejected.len(),
            dead_lettered = report.dead_lettered,
            "deposit processed"
        );
        Ok(report)
    }
}
