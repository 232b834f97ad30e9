use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use csv::StringRecord;
use geojson::{Feature, Geometry, JsonObject, JsonValue, Value as GeoValue};
use tracing::debug;

use crate::registry::{ColumnMapping, DatasetDescriptor, TransformKind};
use crate::transform::{Transform, TransformContext, TransformError, TransformOutput};
use crate::types::{record_id, OutputFormat, RawDeposit, TransformedRecord};

/// Applies the descriptor's column mapping to each CSV row, emitting one
/// GeoJSON feature per usable row. Rows failing required-field checks are
/// skipped and counted, not fatal, until the skip ratio threshold.
pub struct CsvToGeojson;

struct ColumnIndexes {
    id: usize,
    time: usize,
    longitude: Option<usize>,
    latitude: Option<usize>,
    values: Vec<(String, usize)>,
}

impl ColumnIndexes {
    fn locate(headers: &StringRecord, mapping: &ColumnMapping) -> Result<Self, TransformError> {
        let find = |name: &str| headers.iter().position(|h| h == name);
        let missing =
            |name: &str| TransformError::SchemaMismatch(format!("missing column '{name}'"));

        let id = find(&mapping.id_column).ok_or_else(|| missing(&mapping.id_column))?;
        let time = find(&mapping.time_column).ok_or_else(|| missing(&mapping.time_column))?;
        let longitude = match &mapping.longitude_column {
            Some(name) => Some(find(name).ok_or_else(|| missing(name))?),
            None => None,
        };
        let latitude = match &mapping.latitude_column {
            Some(name) => Some(find(name).ok_or_else(|| missing(name))?),
            None => None,
        };
        let mut values = Vec::with_capacity(mapping.value_columns.len());
        for name in &mapping.value_columns {
            values.push((name.clone(), find(name).ok_or_else(|| missing(name))?));
        }
        Ok(Self {
            id,
            time,
            longitude,
            latitude,
            values,
        })
    }
}

fn parse_time(raw: &str, format: Option<&str>) -> Option<DateTime<Utc>> {
    match format {
        Some(fmt) => NaiveDateTime::parse_from_str(raw, fmt)
            .ok()
            .map(|naive| naive.and_utc()),
        None => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

fn build_row(
    row: &StringRecord,
    columns: &ColumnIndexes,
    mapping: &ColumnMapping,
) -> Option<(JsonObject, Option<(f64, f64)>, DateTime<Utc>)> {
    let identifier = row.get(columns.id)?.trim();
    if identifier.is_empty() {
        return None;
    }
    let observed = parse_time(row.get(columns.time)?.trim(), mapping.time_format.as_deref())?;

    let location = match (columns.longitude, columns.latitude) {
        (Some(lon_idx), Some(lat_idx)) => {
            let lon = row.get(lon_idx)?.trim().parse::<f64>().ok()?;
            let lat = row.get(lat_idx)?.trim().parse::<f64>().ok()?;
            Some((lon, lat))
        }
        _ => None,
    };

    let mut properties = JsonObject::new();
    properties.insert("identifier".to_string(), JsonValue::from(identifier));
    properties.insert(
        "resultTime".to_string(),
        JsonValue::from(observed.to_rfc3339()),
    );
    for (name, index) in &columns.values {
        let value = row.get(*index)?.trim().parse::<f64>().ok()?;
        properties.insert(name.clone(), JsonValue::from(value));
    }

    Some((properties, location, observed))
}

impl Transform for CsvToGeojson {
    fn kind(&self) -> TransformKind {
        TransformKind::CsvToGeojson
    }

    fn run(
        &self,
        deposit: &RawDeposit,
        descriptor: &DatasetDescriptor,
        ctx: &TransformContext,
    ) -> Result<TransformOutput, TransformError> {
        let mapping = descriptor.mapping.as_ref().ok_or_else(|| {
            TransformError::SchemaMismatch("descriptor declares no column mapping".to_string())
        })?;

        let text = std::str::from_utf8(&deposit.bytes).map_err(|_| {
            TransformError::UnsupportedEncoding("deposit is not valid UTF-8".to_string())
        })?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());
        let headers = reader
            .headers()
            .map_err(|err| TransformError::MalformedInput(err.to_string()))?
            .clone();
        let columns = ColumnIndexes::locate(&headers, mapping)?;

        let mut output = TransformOutput::default();
        for result in reader.records() {
            let ordinal = output.total_rows;
            output.total_rows += 1;
            let row = match result {
                Ok(row) => row,
                Err(err) => {
                    debug!(row = ordinal, error = %err, "unreadable row skipped");
                    output.skipped_rows += 1;
                    continue;
                }
            };
            let Some((properties, location, observed)) = build_row(&row, &columns, mapping) else {
                output.skipped_rows += 1;
                continue;
            };

            let id = record_id(&descriptor.dataset_id, &deposit.content_hash, ordinal);
            let feature = Feature {
                bbox: None,
                geometry: location
                    .map(|(lon, lat)| Geometry::new(GeoValue::Point(vec![lon, lat]))),
                id: Some(geojson::feature::Id::String(id.to_string())),
                properties: Some(properties),
                foreign_members: None,
            };
            let payload = serde_json::to_vec(&feature)
                .map_err(|err| TransformError::MalformedInput(err.to_string()))?;

            output.records.push(TransformedRecord {
                record_id: id,
                payload: Bytes::from(payload),
                format: OutputFormat::Geojson,
                location,
                observed_at: Some(observed),
            });
        }

        if output.total_rows == 0 {
            return Err(TransformError::MalformedInput(
                "deposit contains no data rows".to_string(),
            ));
        }
        let ratio = output.skipped_rows as f64 / output.total_rows as f64;
        if ratio > ctx.skip_ratio_threshold {
            return Err(TransformError::SkipRatioExceeded {
                skipped: output.skipped_rows,
                total: output.total_rows,
                threshold: ctx.skip_ratio_threshold,
            });
        }

        Ok(output)
    }
}
