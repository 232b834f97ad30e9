//! Per-dataset descriptors and hint-driven resolution.
//!
//! The registry never fetches metadata itself; the metadata-publish path
//! hands it descriptors (parsed from the data-mapping file) and ingest
//! resolves against an immutable snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topic::Topic;
use crate::types::{BoundingBox, OutputFormat, TemporalBounds};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformKind {
    CsvToGeojson,
    GeojsonToRecord,
}

/// Declarative column mapping applied by the tabular transform. A row is
/// usable only when the identifier, timestamp, and every value column are
/// present and parseable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub id_column: String,
    pub time_column: String,
    /// strftime format; RFC 3339 when absent.
    #[serde(default)]
    pub time_format: Option<String>,
    #[serde(default)]
    pub longitude_column: Option<String>,
    #[serde(default)]
    pub latitude_column: Option<String>,
    pub value_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub dataset_id: String,
    /// Template hint key this descriptor answers to.
    pub template: String,
    pub transform: TransformKind,
    #[serde(default)]
    pub mapping: Option<ColumnMapping>,
    pub target_topic: Topic,
    pub bounds: BoundingBox,
    #[serde(default)]
    pub temporal: Option<TemporalBounds>,
    pub output_format: OutputFormat,
    /// Registration order, assigned by the registry.
    #[serde(skip)]
    pub sequence: u64,
}

#[derive(Debug, Clone, Error)]
#[error("no dataset registered for template hint '{hint}'")]
pub struct UnknownDataset {
    pub hint: String,
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("data mapping file is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("dataset '{dataset}' uses the tabular transform but declares no column mapping")]
    MissingMapping { dataset: String },
}

/// Spatial/temporal context accompanying a template hint at ingest time.
#[derive(Debug, Clone, Default)]
pub struct ResolveHint {
    pub bbox: Option<BoundingBox>,
    pub time: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct RegistrySnapshot {
    descriptors: Vec<Arc<DatasetDescriptor>>,
}

/// Read-mostly registry. Mutations build a fresh snapshot and swap it in;
/// `resolve` clones the current `Arc` and ranks without holding the lock, so
/// in-flight resolutions never observe a partial update.
#[derive(Default)]
pub struct DatasetRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    sequence: AtomicU64,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, mut descriptor: DatasetDescriptor) {
        descriptor.sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.snapshot.write().expect("registry lock poisoned");
        let mut descriptors = guard.descriptors.clone();
        descriptors.retain(|d| d.dataset_id != descriptor.dataset_id);
        descriptors.push(Arc::new(descriptor));
        *guard = Arc::new(RegistrySnapshot { descriptors });
    }

    pub fn unregister(&self, dataset_id: &str) -> bool {
        let mut guard = self.snapshot.write().expect("registry lock poisoned");
        let before = guard.descriptors.len();
        let descriptors: Vec<_> = guard
            .descriptors
            .iter()
            .filter(|d| d.dataset_id != dataset_id)
            .cloned()
            .collect();
        let removed = descriptors.len() != before;
        *guard = Arc::new(RegistrySnapshot { descriptors });
        removed
    }

    pub fn descriptors(&self) -> Vec<Arc<DatasetDescriptor>> {
        self.current().descriptors.clone()
    }

    fn current(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().expect("registry lock poisoned").clone()
    }

    /// Best-match resolution: an exact template match outranks a dataset-id
    /// match; among those, descriptors whose declared bounds contain the
    /// hint score higher; remaining ties break by most recent registration.
    pub fn resolve(
        &self,
        template_hint: &str,
        hint: &ResolveHint,
    ) -> Result<Arc<DatasetDescriptor>, UnknownDataset> {
        let snapshot = self.current();
        snapshot
            .descriptors
            .iter()
            .filter_map(|descriptor| {
                let template_rank = if descriptor.template == template_hint {
                    2u8
                } else if descriptor.dataset_id == template_hint {
                    1
                } else {
                    return None;
                };
                let mut bounds_rank = 0u8;
                if let Some(bbox) = &hint.bbox {
                    if descriptor.bounds.contains_box(bbox) {
                        bounds_rank += 1;
                    }
                }
                if let (Some(time), Some(temporal)) = (hint.time, &descriptor.temporal) {
                    if temporal.contains(time) {
                        bounds_rank += 1;
                    }
                }
                Some((template_rank, bounds_rank, descriptor.sequence, descriptor))
            })
            .max_by_key(|(template_rank, bounds_rank, sequence, _)| {
                (*template_rank, *bounds_rank, *sequence)
            })
            .map(|(_, _, _, descriptor)| descriptor.clone())
            .ok_or_else(|| UnknownDataset {
                hint: template_hint.to_string(),
            })
    }
}

#[derive(Debug, Deserialize)]
struct MappingFile {
    #[serde(default)]
    datasets: Vec<DatasetDescriptor>,
}

/// Parses the TOML data-mapping file the metadata-publish path maintains.
pub fn parse_mapping_file(contents: &str) -> Result<Vec<DatasetDescriptor>, MappingError> {
    let file: MappingFile = toml::from_str(contents)?;
    for descriptor in &file.datasets {
        if descriptor.transform == TransformKind::CsvToGeojson && descriptor.mapping.is_none() {
            return Err(MappingError::MissingMapping {
                dataset: descriptor.dataset_id.clone(),
            });
        }
    }
    Ok(file.datasets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(dataset: &str, template: &str, bounds: BoundingBox) -> DatasetDescriptor {
        DatasetDescriptor {
            dataset_id: dataset.to_string(),
            template: template.to_string(),
            transform: TransformKind::GeojsonToRecord,
            mapping: None,
            target_topic: Topic::parse(&format!("iow/{dataset}/geojson/data")).unwrap(),
            bounds,
            temporal: None,
            output_format: OutputFormat::Geojson,
            sequence: 0,
        }
    }

    fn oregon() -> BoundingBox {
        BoundingBox {
            min_lon: -124.6,
            min_lat: 41.9,
            max_lon: -116.4,
            max_lat: 46.3,
        }
    }

    #[test]
    fn unknown_hint_is_an_error() {
        let registry = DatasetRegistry::new();
        registry.register(descriptor("a", "t", BoundingBox::WORLD));
        let err = registry.resolve("missing", &ResolveHint::default()).unwrap_err();
        assert_eq!(err.hint, "missing");
    }

    #[test]
    fn exact_template_match_outranks_dataset_id_match() {
        let registry = DatasetRegistry::new();
        registry.register(descriptor("gauges", "other-template", BoundingBox::WORLD));
        registry.register(descriptor("wells", "gauges", BoundingBox::WORLD));
        let resolved = registry.resolve("gauges", &ResolveHint::default()).unwrap();
        assert_eq!(resolved.dataset_id, "wells");
    }

    #[test]
    fn bounds_containment_breaks_template_ties() {
        let registry = DatasetRegistry::new();
        registry.register(descriptor("regional", "obs", oregon()));
        registry.register(descriptor("global", "obs", BoundingBox::WORLD));

        let hint = ResolveHint {
            bbox: Some(BoundingBox {
                min_lon: -123.0,
                min_lat: 43.0,
                max_lon: -120.0,
                max_lat: 45.0,
            }),
            time: None,
        };
        // Both contain the hint box; most-recently-registered wins.
        let resolved = registry.resolve("obs", &hint).unwrap();
        assert_eq!(resolved.dataset_id, "global");

        let outside = ResolveHint {
            bbox: Some(BoundingBox {
                min_lon: 10.0,
                min_lat: 10.0,
                max_lon: 11.0,
                max_lat: 11.0,
            }),
            time: None,
        };
        // Only the global descriptor contains this one.
        let resolved = registry.resolve("obs", &outside).unwrap();
        assert_eq!(resolved.dataset_id, "global");
    }

    #[test]
    fn reregistration_replaces_and_wins_ties() {
        let registry = DatasetRegistry::new();
        registry.register(descriptor("a", "obs", BoundingBox::WORLD));
        registry.register(descriptor("b", "obs", BoundingBox::WORLD));
        assert_eq!(
            registry.resolve("obs", &ResolveHint::default()).unwrap().dataset_id,
            "b"
        );

        registry.register(descriptor("a", "obs", BoundingBox::WORLD));
        assert_eq!(registry.descriptors().len(), 2);
        assert_eq!(
            registry.resolve("obs", &ResolveHint::default()).unwrap().dataset_id,
            "a"
        );

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert_eq!(
            registry.resolve("obs", &ResolveHint::default()).unwrap().dataset_id,
            "b"
        );
    }

    #[test]
    fn resolution_works_on_a_snapshot() {
        let registry = DatasetRegistry::new();
        registry.register(descriptor("a", "obs", BoundingBox::WORLD));
        let before = registry.descriptors();
        registry.register(descriptor("b", "obs", BoundingBox::WORLD));
        // The clone taken before the update is unaffected.
        assert_eq!(before.len(), 1);
        assert_eq!(registry.descriptors().len(), 2);
    }

    #[test]
    fn parses_mapping_file() {
        let toml = r#"
            [[datasets]]
            dataset_id = "iow.demo.Observations"
            template = "usbr-observations-csv"
            transform = "csv-to-geojson"
            target_topic = "iow/iow.demo.Observations/geojson/data"
            bounds = { min_lon = -124.6, min_lat = 41.9, max_lon = -116.4, max_lat = 46.3 }
            output_format = "geojson"

            [datasets.mapping]
            id_column = "station"
            time_column = "datetime"
            longitude_column = "lon"
            latitude_column = "lat"
            value_columns = ["value"]
        "#;
        let descriptors = parse_mapping_file(toml).unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].dataset_id, "iow.demo.Observations");
        assert_eq!(descriptors[0].transform, TransformKind::CsvToGeojson);
    }

    #[test]
    fn tabular_mapping_is_required() {
        let toml = r#"
            [[datasets]]
            dataset_id = "x"
            template = "t"
            transform = "csv-to-geojson"
            target_topic = "iow/x/geojson/data"
            bounds = { min_lon = -180.0, min_lat = -90.0, max_lon = 180.0, max_lat = 90.0 }
            output_format = "geojson"
        "#;
        assert!(matches!(
            parse_mapping_file(toml),
            Err(MappingError::MissingMapping { .. })
        ));
    }
}
