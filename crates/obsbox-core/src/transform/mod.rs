//! Converts raw deposits into standardized records. The kind set is closed;
//! the implementation for a dataset is selected once from its descriptor,
//! not re-resolved per record.

mod record;
mod tabular;

pub use record::GeojsonToRecord;
pub use tabular::CsvToGeojson;

use thiserror::Error;

use crate::registry::{DatasetDescriptor, TransformKind};
use crate::types::{RawDeposit, TransformedRecord};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("{skipped} of {total} rows failed required-field checks (threshold {threshold})")]
    SkipRatioExceeded {
        skipped: usize,
        total: usize,
        threshold: f64,
    },
}

#[derive(Debug, Clone)]
pub struct TransformContext {
    /// A deposit fails outright once skipped/total exceeds this ratio.
    pub skip_ratio_threshold: f64,
}

impl Default for TransformContext {
    fn default() -> Self {
        Self {
            skip_ratio_threshold: 0.5,
        }
    }
}

#[derive(Debug, Default)]
pub struct TransformOutput {
    pub records: Vec<TransformedRecord>,
    pub skipped_rows: usize,
    pub total_rows: usize,
}

/// All transforms are deterministic: identical input bytes and descriptor
/// always produce identical output bytes and record ids.
pub trait Transform: Send + Sync {
    fn kind(&self) -> TransformKind;
    fn run(
        &self,
        deposit: &RawDeposit,
        descriptor: &DatasetDescriptor,
        ctx: &TransformContext,
    ) -> Result<TransformOutput, TransformError>;
}

pub fn transform_for(kind: TransformKind) -> &'static dyn Transform {
    match kind {
        TransformKind::CsvToGeojson => &CsvToGeojson,
        TransformKind::GeojsonToRecord => &GeojsonToRecord,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_their_transforms() {
        assert_eq!(
            transform_for(TransformKind::CsvToGeojson).kind(),
            TransformKind::CsvToGeojson
        );
        assert_eq!(
            transform_for(TransformKind::GeojsonToRecord).kind(),
            TransformKind::GeojsonToRecord
        );
    }
}
