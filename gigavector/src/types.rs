//! Shared identifiers and result types used across the storage and index layers.

use crate::vector::Metadata;
use serde::{Deserialize, Serialize};

/// Unique, monotonically-increasing identifier for a stored vector.
///
/// A vector id equals its row index in the primary store and is never
/// reused, even after the row is soft-deleted.
pub type VectorId = u64;

/// One candidate returned from a nearest-neighbour search.
///
/// `distance` is always normalised so that lower means more similar,
/// regardless of the configured [`crate::DistanceMetric`] — callers never
/// have to special-case similarity metrics. See `DistanceMetric::rank` for
/// how this normalisation is computed.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: VectorId,
    pub distance: f32,
    pub metadata: Option<Metadata>,
}

impl SearchResult {
    pub fn new(id: VectorId, distance: f32) -> Self {
        Self {
            id,
            distance,
            metadata: None,
        }
    }

    pub fn with_metadata(id: VectorId, distance: f32, metadata: Metadata) -> Self {
        Self {
            id,
            distance,
            metadata: Some(metadata),
        }
    }
}

impl PartialEq for SearchResult {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && (self.distance - other.distance).abs() < f32::EPSILON
    }
}

impl Eq for SearchResult {}

impl PartialOrd for SearchResult {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchResult {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Which ANN index backs a database instance.
///
/// Mirrors the `index_type` discriminant in the snapshot and WAL headers:
/// `0` is reserved for a flat/KD-tree variant this crate does not
/// implement, `1` is HNSW, `2` is IVF-PQ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexKind {
    Hnsw(crate::hnsw::HnswConfig),
    IvfPq(crate::ivfpq::IvfPqConfig),
}

impl IndexKind {
    pub fn discriminant(&self) -> u32 {
        match self {
            IndexKind::Hnsw(_) => 1,
            IndexKind::IvfPq(_) => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_result_orders_by_distance_then_id() {
        let mut results = vec![
            SearchResult::new(2, 0.5),
            SearchResult::new(1, 0.5),
            SearchResult::new(3, 0.1),
        ];
        results.sort();
        assert_eq!(results[0].id, 3);
        assert_eq!(results[1].id, 1);
        assert_eq!(results[2].id, 2);
    }

    #[test]
    fn index_kind_discriminants_match_snapshot_header() {
        assert_eq!(IndexKind::Hnsw(Default::default()).discriminant(), 1);
        assert_eq!(
            IndexKind::IvfPq(crate::ivfpq::IvfPqConfig::default()).discriminant(),
            2
        );
    }
}
