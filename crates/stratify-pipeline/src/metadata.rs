//! Typed metadata accumulated across pipeline stages.
//!
//! Every stage appends keys describing what it produced; keys are never
//! deleted, so the final result carries the full history of the run.
//! Re-running a stage on a branch overwrites only that stage's own keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Well-known metadata keys emitted by the built-in stages.
pub mod keys {
    /// Source image width in pixels.
    pub const WIDTH: &str = "width";
    /// Source image height in pixels.
    pub const HEIGHT: &str = "height";
    /// Achieved superpixel count (may be below the requested count).
    pub const SUPERPIXEL_COUNT: &str = "superpixelCount";
    /// Cluster count after the most recent cluster or merge stage.
    pub const CLUSTER_COUNT: &str = "clusterCount";
    /// Seed the clustering stage was run with.
    pub const CLUSTER_SEED: &str = "clusterSeed";
    /// Threshold of the most recently applied merge stage.
    pub const MERGE_THRESHOLD: &str = "mergeThreshold";
}

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Text.
    Str(String),
    /// Boolean flag.
    Bool(bool),
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for MetadataValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Conversion from a stored [`MetadataValue`] into a concrete type.
///
/// Lookups are type-checked: asking for the wrong type yields `None`
/// rather than a coercion or a panic.
pub trait FromMetadata: Sized {
    /// Extract `Self` from a value of the matching variant.
    fn from_value(value: &MetadataValue) -> Option<Self>;
}

impl FromMetadata for i64 {
    fn from_value(value: &MetadataValue) -> Option<Self> {
        match value {
            MetadataValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromMetadata for f64 {
    fn from_value(value: &MetadataValue) -> Option<Self> {
        match value {
            MetadataValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromMetadata for String {
    fn from_value(value: &MetadataValue) -> Option<Self> {
        match value {
            MetadataValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromMetadata for bool {
    fn from_value(value: &MetadataValue) -> Option<Self> {
        match value {
            MetadataValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// An ordered string-keyed map of [`MetadataValue`]s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata(BTreeMap<String, MetadataValue>);

impl Metadata {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a key.
    pub fn insert(&mut self, key: &str, value: impl Into<MetadataValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Type-checked lookup: `None` if the key is absent or holds a
    /// different variant.
    #[must_use]
    pub fn get<T: FromMetadata>(&self, key: &str) -> Option<T> {
        self.0.get(key).and_then(T::from_value)
    }

    /// The raw stored value for a key.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    /// Whether a key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
