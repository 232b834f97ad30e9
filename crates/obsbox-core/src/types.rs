//! Data model shared across the pipeline stages.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic record ids (UUID v5).
const RECORD_NAMESPACE: Uuid = Uuid::from_u128(0x8f1c_d1a4_0b6e_4b5f_9a27_3c55_e0d2_714b);

/// A raw data file deposited in object storage, transient for the duration
/// of one pipeline invocation.
#[derive(Debug, Clone)]
pub struct RawDeposit {
    pub key: String,
    pub bytes: Bytes,
    pub content_hash: String,
    pub arrived_at: DateTime<Utc>,
}

impl RawDeposit {
    pub fn new(key: impl Into<String>, bytes: Bytes, arrived_at: DateTime<Utc>) -> Self {
        let content_hash = content_hash(&bytes);
        Self {
            key: key.into(),
            bytes,
            content_hash,
            arrived_at,
        }
    }
}

/// Blake3 hex digest of a payload.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Deterministic record id: identical (dataset, source bytes, ordinal)
/// always yields the same id, which makes republishing idempotent.
pub fn record_id(dataset_id: &str, source_hash: &str, ordinal: usize) -> Uuid {
    let name = format!("{dataset_id}/{source_hash}/{ordinal}");
    Uuid::new_v5(&RECORD_NAMESPACE, name.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Geojson,
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Geojson => "geojson",
            OutputFormat::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Geojson => "application/geo+json",
            OutputFormat::Json => "application/json",
        }
    }
}

/// One standardized record produced by a transform.
#[derive(Debug, Clone)]
pub struct TransformedRecord {
    pub record_id: Uuid,
    pub payload: Bytes,
    pub format: OutputFormat,
    /// (longitude, latitude) when the record carries a point geometry.
    pub location: Option<(f64, f64)>,
    pub observed_at: Option<DateTime<Utc>>,
}

/// Where a published artifact landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRef {
    pub key: String,
    /// True when the key already held identical content (idempotent no-op).
    pub already_present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub const WORLD: BoundingBox = BoundingBox {
        min_lon: -180.0,
        min_lat: -90.0,
        max_lon: 180.0,
        max_lat: 90.0,
    };

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    pub fn contains_box(&self, other: &BoundingBox) -> bool {
        self.contains(other.min_lon, other.min_lat) && self.contains(other.max_lon, other.max_lat)
    }

    /// Bounding box grown by `margin` degrees on every side, clamped to the
    /// valid coordinate range.
    pub fn expanded(&self, margin: f64) -> BoundingBox {
        BoundingBox {
            min_lon: (self.min_lon - margin).max(-180.0),
            min_lat: (self.min_lat - margin).max(-90.0),
            max_lon: (self.max_lon + margin).min(180.0),
            max_lat: (self.max_lat + margin).min(90.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemporalBounds {
    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TemporalBounds {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        if let Some(begin) = self.begin {
            if instant < begin {
                return false;
            }
        }
        if let Some(end) = self.end {
            if instant > end {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ids_are_deterministic() {
        let a = record_id("iow.demo.Observations", "abc123", 0);
        let b = record_id("iow.demo.Observations", "abc123", 0);
        assert_eq!(a, b);
        assert_ne!(a, record_id("iow.demo.Observations", "abc123", 1));
        assert_ne!(a, record_id("other.dataset", "abc123", 0));
    }

    #[test]
    fn deposit_hash_matches_content_hash() {
        let deposit = RawDeposit::new("k", Bytes::from_static(b"payload"), Utc::now());
        assert_eq!(deposit.content_hash, content_hash(b"payload"));
    }

    #[test]
    fn bounding_box_containment_and_expansion() {
        let bbox = BoundingBox {
            min_lon: -124.0,
            min_lat: 42.0,
            max_lon: -116.0,
            max_lat: 46.5,
        };
        assert!(bbox.contains(-120.0, 44.0));
        assert!(!bbox.contains(-120.0, 47.0));
        assert!(bbox.expanded(1.0).contains(-120.0, 47.0));
        assert!(BoundingBox::WORLD.contains_box(&bbox));
        assert_eq!(BoundingBox::WORLD.expanded(5.0), BoundingBox::WORLD);
    }

    #[test]
    fn temporal_bounds_are_inclusive() {
        let begin = "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let end = "2024-12-31T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let bounds = TemporalBounds {
            begin: Some(begin),
            end: Some(end),
        };
        assert!(bounds.contains(begin));
        assert!(bounds.contains(end));
        assert!(!bounds.contains(end + chrono::Duration::seconds(1)));
        let open = TemporalBounds {
            begin: None,
            end: None,
        };
        assert!(open.contains(begin));
    }
}
