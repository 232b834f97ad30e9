//! Hierarchical topic addressing shared by the storage-event subscription
//! and the notification publisher.

use std::fmt;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Interchange formats the taxonomy admits.
pub const FORMATS: &[&str] = &["csv", "geojson"];

/// Resource kinds the taxonomy admits.
pub const RESOURCE_KINDS: &[&str] = &["data", "metadata", "notification"];

#[derive(Debug, Clone, Error)]
#[error("invalid topic '{topic}': {reason}")]
pub struct InvalidTopic {
    pub topic: String,
    pub reason: String,
}

impl InvalidTopic {
    fn new(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

/// An immutable sequence of path segments. Equality is segment-wise, which
/// with the constrained alphabet coincides with string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    segments: Vec<String>,
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

impl Topic {
    pub fn parse(input: &str) -> Result<Self, InvalidTopic> {
        if input.is_empty() {
            return Err(InvalidTopic::new(input, "topic is empty"));
        }
        let segments: Vec<String> = input.split('/').map(str::to_string).collect();
        for segment in &segments {
            if segment == "+" || segment == "#" {
                return Err(InvalidTopic::new(
                    input,
                    "wildcards are not allowed in a concrete topic",
                ));
            }
            if !valid_segment(segment) {
                return Err(InvalidTopic::new(
                    input,
                    format!("segment '{segment}' contains characters outside [a-zA-Z0-9._-]"),
                ));
            }
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns a new topic with `segment` appended.
    pub fn child(&self, segment: &str) -> Result<Topic, InvalidTopic> {
        if !valid_segment(segment) {
            return Err(InvalidTopic::new(
                segment,
                "segment contains characters outside [a-zA-Z0-9._-]",
            ));
        }
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Topic { segments })
    }

    /// Broker wildcard matching: `+` matches exactly one segment, `#`
    /// matches any suffix (including the empty one) and is only honoured as
    /// the final pattern segment.
    pub fn matches(&self, pattern: &str) -> bool {
        let pattern_segments: Vec<&str> = pattern.split('/').collect();
        let mut index = 0;
        for (position, pat) in pattern_segments.iter().enumerate() {
            match *pat {
                "#" => return position == pattern_segments.len() - 1,
                "+" => {
                    if index >= self.segments.len() {
                        return false;
                    }
                    index += 1;
                }
                literal => {
                    if self.segments.get(index).map(String::as_str) != Some(literal) {
                        return false;
                    }
                    index += 1;
                }
            }
        }
        index == self.segments.len()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Topic::parse(&raw).map_err(D::Error::custom)
    }
}

/// Four-segment taxonomy view of a topic:
/// `{centre-id}/{dataset-id}/{format}/{resource-kind}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetTopic {
    pub centre: String,
    pub dataset: String,
    pub format: String,
    pub resource: String,
}

impl DatasetTopic {
    pub fn from_topic(topic: &Topic) -> Result<Self, InvalidTopic> {
        let segments = topic.segments();
        if segments.len() != 4 {
            return Err(InvalidTopic::new(
                topic.to_string(),
                format!("expected 4 segments, got {}", segments.len()),
            ));
        }
        if !FORMATS.contains(&segments[2].as_str()) {
            return Err(InvalidTopic::new(
                topic.to_string(),
                format!("unknown format '{}'", segments[2]),
            ));
        }
        if !RESOURCE_KINDS.contains(&segments[3].as_str()) {
            return Err(InvalidTopic::new(
                topic.to_string(),
                format!("unknown resource kind '{}'", segments[3]),
            ));
        }
        Ok(Self {
            centre: segments[0].clone(),
            dataset: segments[1].clone(),
            format: segments[2].clone(),
            resource: segments[3].clone(),
        })
    }

    pub fn to_topic(&self) -> Topic {
        Topic {
            segments: vec![
                self.centre.clone(),
                self.dataset.clone(),
                self.format.clone(),
                self.resource.clone(),
            ],
        }
    }
}
