use thiserror::Error;

use crate::api::ApiError;
use crate::notify::NotifyError;
use crate::publish::PublishError;
use crate::registry::UnknownDataset;
use crate::topic::InvalidTopic;
use crate::transform::TransformError;

/// Errors that terminate one pipeline invocation. Per-record validation
/// failures are not here: they are reported in the ingest report and never
/// abort the batch.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    InvalidTopic(#[from] InvalidTopic),

    #[error(transparent)]
    UnknownDataset(#[from] UnknownDataset),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Notify(#[from] NotifyError),
}

impl PipelineError {
    /// Transient infrastructure failures may be retried by the dispatcher;
    /// everything else is terminal for the event.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Publish(err) => err.is_transient(),
            PipelineError::Api(err) => err.is_transient(),
            _ => false,
        }
    }
}
