//! Per-record sanity checks applied between transform and publish. Failures
//! are reported per record; the valid subset of a batch still publishes.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::registry::DatasetDescriptor;
use crate::types::{OutputFormat, TransformedRecord};

#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    #[error("geometry ({lon}, {lat}) outside dataset bounds")]
    GeometryOutOfBounds { lon: f64, lat: f64 },
    #[error("timestamp {observed} outside freshness window")]
    StaleTimestamp { observed: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct Validator {
    /// Margin in degrees added to the dataset bounds on every side.
    pub bounds_tolerance_deg: f64,
    pub staleness_window: Duration,
    pub clock_skew: Duration,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            bounds_tolerance_deg: 0.5,
            staleness_window: Duration::days(30),
            clock_skew: Duration::minutes(5),
        }
    }
}

impl Validator {
    pub fn validate(
        &self,
        record: &TransformedRecord,
        descriptor: &DatasetDescriptor,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        self.check_schema(record, descriptor)?;

        if let Some((lon, lat)) = record.location {
            let allowed = descriptor.bounds.expanded(self.bounds_tolerance_deg);
            if !allowed.contains(lon, lat) {
                return Err(ValidationError::GeometryOutOfBounds { lon, lat });
            }
        }

        if let Some(observed) = record.observed_at {
            if observed < now - self.staleness_window || observed > now + self.clock_skew {
                return Err(ValidationError::StaleTimestamp { observed });
            }
        }

        Ok(())
    }

    fn check_schema(
        &self,
        record: &TransformedRecord,
        descriptor: &DatasetDescriptor,
    ) -> Result<(), ValidationError> {
        if record.format != descriptor.output_format {
            return Err(ValidationError::SchemaViolation(format!(
                "record format {:?} does not match declared {:?}",
                record.format, descriptor.output_format
            )));
        }

        let value: serde_json::Value = serde_json::from_slice(&record.payload)
            .map_err(|err| ValidationError::SchemaViolation(format!("payload is not JSON: {err}")))?;
        let object = value
            .as_object()
            .ok_or_else(|| ValidationError::SchemaViolation("payload is not an object".into()))?;

        match record.format {
            OutputFormat::Geojson => {
                if object.get("type").and_then(|t| t.as_str()) != Some("Feature") {
                    return Err(ValidationError::SchemaViolation(
                        "GeoJSON payload is not a Feature".into(),
                    ));
                }
                if !object.get("properties").map(|p| p.is_object()).unwrap_or(false) {
                    return Err(ValidationError::SchemaViolation(
                        "Feature has no properties object".into(),
                    ));
                }
            }
            OutputFormat::Json => {
                if object.get("id").is_none() {
                    return Err(ValidationError::SchemaViolation(
                        "discovery record has no id".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}
