use bytes::Bytes;
use chrono::{DateTime, Utc};
use geojson::{Feature, GeoJson, JsonObject, JsonValue, Value as GeoValue};

use crate::registry::{DatasetDescriptor, TransformKind};
use crate::transform::{Transform, TransformContext, TransformError, TransformOutput};
use crate::types::{record_id, OutputFormat, RawDeposit, TransformedRecord};

/// Re-encodes an interchange GeoJSON payload into queryable discovery
/// records: geometry plus scalar properties, one record per feature. A
/// structurally invalid envelope is fatal for the deposit.
pub struct GeojsonToRecord;

fn scalar_properties(properties: Option<&JsonObject>) -> JsonObject {
    let mut scalars = JsonObject::new();
    if let Some(properties) = properties {
        for (key, value) in properties {
            match value {
                JsonValue::String(_) | JsonValue::Number(_) | JsonValue::Bool(_) => {
                    scalars.insert(key.clone(), value.clone());
                }
                _ => {}
            }
        }
    }
    scalars
}

fn point_location(feature: &Feature) -> Option<(f64, f64)> {
    match feature.geometry.as_ref().map(|g| &g.value) {
        Some(GeoValue::Point(coords)) if coords.len() >= 2 => Some((coords[0], coords[1])),
        _ => None,
    }
}

fn observed_time(properties: &JsonObject) -> Option<DateTime<Utc>> {
    for key in ["resultTime", "phenomenonTime", "pubtime"] {
        if let Some(JsonValue::String(raw)) = properties.get(key) {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                return Some(parsed.with_timezone(&Utc));
            }
        }
    }
    None
}

impl Transform for GeojsonToRecord {
    fn kind(&self) -> TransformKind {
        TransformKind::GeojsonToRecord
    }

    fn run(
        &self,
        deposit: &RawDeposit,
        descriptor: &DatasetDescriptor,
        _ctx: &TransformContext,
    ) -> Result<TransformOutput, TransformError> {
        let text = std::str::from_utf8(&deposit.bytes).map_err(|_| {
            TransformError::UnsupportedEncoding("deposit is not valid UTF-8".to_string())
        })?;
        let parsed: GeoJson = text
            .parse()
            .map_err(|err| TransformError::MalformedInput(format!("{err}")))?;

        let features = match parsed {
            GeoJson::Feature(feature) => vec![feature],
            GeoJson::FeatureCollection(collection) => collection.features,
            GeoJson::Geometry(_) => {
                return Err(TransformError::SchemaMismatch(
                    "bare geometry carries no properties".to_string(),
                ))
            }
        };

        let mut output = TransformOutput::default();
        for (ordinal, feature) in features.into_iter().enumerate() {
            output.total_rows += 1;
            let id = record_id(&descriptor.dataset_id, &deposit.content_hash, ordinal);
            let properties = scalar_properties(feature.properties.as_ref());
            let observed = observed_time(&properties);
            let location = point_location(&feature);

            let mut record = JsonObject::new();
            record.insert("id".to_string(), JsonValue::from(id.to_string()));
            record.insert(
                "geometry".to_string(),
                feature
                    .geometry
                    .as_ref()
                    .map(|g| serde_json::to_value(g).unwrap_or(JsonValue::Null))
                    .unwrap_or(JsonValue::Null),
            );
            record.insert("properties".to_string(), JsonValue::Object(properties));

            let payload = serde_json::to_vec(&record)
                .map_err(|err| TransformError::MalformedInput(err.to_string()))?;
            output.records.push(TransformedRecord {
                record_id: id,
                payload: Bytes::from(payload),
                format: OutputFormat::Json,
                location,
                observed_at: observed,
            });
        }

        if output.records.is_empty() {
            return Err(TransformError::MalformedInput(
                "feature collection is empty".to_string(),
            ));
        }
        Ok(output)
    }
}
