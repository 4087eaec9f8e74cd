//! The user-facing data model: raw vectors and their attached metadata.
//!
//! `Metadata` is an ordered list of key/value pairs, which is what
//! [`crate::metadata_index`] and the database's filter predicates are
//! built around.

use serde::{Deserialize, Serialize};

/// A fixed-dimension embedding.
///
/// Dimension is not tracked on the type itself — the owning [`crate::Database`]
/// enforces it against every insert and query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vector {
    pub data: Vec<f32>,
}

impl Vector {
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    pub fn dim(&self) -> usize {
        self.data.len()
    }

    /// Normalise this vector to unit length in place.
    pub fn normalize(&mut self) {
        crate::distance::normalize(&mut self.data);
    }

    /// Return a normalised copy, leaving `self` untouched.
    pub fn normalized(&self) -> Self {
        let mut copy = self.clone();
        copy.normalize();
        copy
    }

    pub fn magnitude(&self) -> f32 {
        crate::distance::magnitude(&self.data)
    }
}

impl From<Vec<f32>> for Vector {
    fn from(data: Vec<f32>) -> Self {
        Self::new(data)
    }
}

impl AsRef<[f32]> for Vector {
    fn as_ref(&self) -> &[f32] {
        &self.data
    }
}

/// An ordered list of `(key, value)` string pairs attached to a vector.
///
/// Order is preserved as inserted so `iter` is predictable, but lookups are
/// linear — metadata entries are small in practice (a handful of tags per
/// vector) and [`crate::metadata_index::MetadataIndex`] is what makes
/// filtering by key/value scale, not this type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata(Vec<(String, String)>);

impl Metadata {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert or overwrite the value for `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut m = Metadata::new();
        for (k, v) in iter {
            m.set(k, v);
        }
        m
    }
}

/// A predicate evaluated against a vector's [`Metadata`] during search.
///
/// Covers the equality and existence checks named in §4.3/§4.7; composite
/// filters are built by combining these with `And`/`Or`.
#[derive(Debug, Clone)]
pub enum MetadataFilter {
    Equals { key: String, value: String },
    Exists { key: String },
    NotExists { key: String },
    And(Vec<MetadataFilter>),
    Or(Vec<MetadataFilter>),
}

impl MetadataFilter {
    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            MetadataFilter::Equals { key, value } => metadata.get(key) == Some(value.as_str()),
            MetadataFilter::Exists { key } => metadata.contains_key(key),
            MetadataFilter::NotExists { key } => !metadata.contains_key(key),
            MetadataFilter::And(fs) => fs.iter().all(|f| f.matches(metadata)),
            MetadataFilter::Or(fs) => fs.iter().any(|f| f.matches(metadata)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_normalize_produces_unit_magnitude() {
        let mut v = Vector::new(vec![3.0, 4.0, 0.0]);
        v.normalize();
        assert!((v.magnitude() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn vector_normalized_leaves_original_untouched() {
        let v = Vector::new(vec![3.0, 4.0, 0.0]);
        let n = v.normalized();
        assert!((n.magnitude() - 1.0).abs() < 1e-6);
        assert_eq!(v.data, vec![3.0, 4.0, 0.0]);
    }

    #[test]
    fn metadata_set_overwrites_existing_key_in_place() {
        let mut m = Metadata::new();
        m.set("tenant", "a");
        m.set("region", "eu");
        m.set("tenant", "b");
        assert_eq!(m.get("tenant"), Some("b"));
        assert_eq!(
            m.iter().collect::<Vec<_>>(),
            vec![("tenant", "b"), ("region", "eu")]
        );
    }

    #[test]
    fn metadata_remove_returns_previous_value() {
        let mut m = Metadata::new();
        m.set("k", "v");
        assert_eq!(m.remove("k"), Some("v".to_string()));
        assert!(!m.contains_key("k"));
    }

    #[test]
    fn filter_equals_matches_exact_value() {
        let mut m = Metadata::new();
        m.set("tenant", "acme");
        let f = MetadataFilter::Equals {
            key: "tenant".into(),
            value: "acme".into(),
        };
        assert!(f.matches(&m));
    }

    #[test]
    fn filter_and_requires_all_subfilters() {
        let mut m = Metadata::new();
        m.set("tenant", "acme");
        let f = MetadataFilter::And(vec![
            MetadataFilter::Exists { key: "tenant".into() },
            MetadataFilter::Exists { key: "missing".into() },
        ]);
        assert!(!f.matches(&m));
    }

    #[test]
    fn filter_or_requires_any_subfilter() {
        let mut m = Metadata::new();
        m.set("tenant", "acme");
        let f = MetadataFilter::Or(vec![
            MetadataFilter::Exists { key: "missing".into() },
            MetadataFilter::Equals {
                key: "tenant".into(),
                value: "acme".into(),
            },
        ]);
        assert!(f.matches(&m));
    }
}
