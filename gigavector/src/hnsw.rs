//! HNSW (Hierarchical Navigable Small World) index.
//!
//! A multi-layer proximity graph: layer 0 holds every live vector, higher
//! layers hold a geometrically-shrinking subset. Search greedily descends
//! from the entry point down to layer 1, then runs a bounded beam at layer
//! 0. Soft-deleted nodes stay in the graph as bridges — only a `rebuild()`
//! discards them.

use crate::vector::{Metadata, MetadataFilter};
use crate::{DistanceMetric, Error, Result, SearchResult, VectorId};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Tuning knobs for graph construction and search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Max bidirectional links per node per layer above 0 (`M`).
    pub max_connections: usize,
    /// Max links at layer 0, conventionally `2 * M`.
    pub max_connections_layer0: usize,
    /// Candidate beam width during construction.
    pub ef_construction: usize,
    /// Candidate beam width during search.
    pub ef_search: usize,
    /// Hard cap on the number of layers a node may occupy.
    pub max_level: usize,
    /// `1 / ln(M)`, the geometric-distribution scale for level assignment.
    pub level_multiplier: f64,
    /// Cache a 1-bit-per-dimension sign quantisation on each node for a
    /// cheap Hamming pre-filter before the exact metric is used.
    pub use_binary_quantization: bool,
    /// When binary quantisation is enabled, re-score this many top
    /// candidates with the exact metric before returning. `0` disables
    /// rerank (results stay ranked by Hamming distance).
    pub quant_rerank: usize,
    /// Multiplier applied to `ef_search` when a metadata filter is active,
    /// widening the beam (ACORN-style) so post-filtering doesn't starve
    /// recall.
    pub acorn_expansion: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        let m = 16;
        Self {
            max_connections: m,
            max_connections_layer0: m * 2,
            ef_construction: 200,
            ef_search: 50,
            max_level: 16,
            level_multiplier: 1.0 / (m as f64).ln(),
            use_binary_quantization: false,
            quant_rerank: 0,
            acorn_expansion: 4,
        }
    }
}

impl HnswConfig {
    pub fn fast() -> Self {
        let m = 8;
        Self {
            max_connections: m,
            max_connections_layer0: m * 2,
            ef_construction: 100,
            ef_search: 25,
            max_level: 16,
            level_multiplier: 1.0 / (m as f64).ln(),
            use_binary_quantization: false,
            quant_rerank: 0,
            acorn_expansion: 4,
        }
    }

    pub fn high_quality() -> Self {
        let m = 32;
        Self {
            max_connections: m,
            max_connections_layer0: m * 2,
            ef_construction: 400,
            ef_search: 200,
            max_level: 16,
            level_multiplier: 1.0 / (m as f64).ln(),
            use_binary_quantization: false,
            quant_rerank: 0,
            acorn_expansion: 4,
        }
    }
}

#[derive(Debug, Clone)]
struct HnswNode {
    level: usize,
    deleted: bool,
    /// `connections[layer]` holds neighbour ids present at that layer, in
    /// no particular order; callers that need rank order re-sort.
    connections: Vec<Vec<VectorId>>,
}

impl HnswNode {
    fn new(level: usize) -> Self {
        Self {
            level,
            deleted: false,
            connections: (0..=level).map(|_| Vec::new()).collect(),
        }
    }
}

fn sign_bits(v: &[f32]) -> Vec<u64> {
    let words = v.len().div_ceil(64);
    let mut bits = vec![0u64; words];
    for (i, &x) in v.iter().enumerate() {
        if x > 0.0 {
            bits[i / 64] |= 1 << (i % 64);
        }
    }
    bits
}

fn hamming(a: &[u64], b: &[u64]) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

pub struct HnswIndex {
    config: HnswConfig,
    metric: DistanceMetric,
    dim: usize,
    nodes: HashMap<VectorId, HnswNode>,
    vectors: HashMap<VectorId, Vec<f32>>,
    metadata: HashMap<VectorId, Metadata>,
    quant: HashMap<VectorId, Vec<u64>>,
    entry_point: Option<VectorId>,
    max_layer: usize,
}

impl HnswIndex {
    pub fn new(config: HnswConfig, metric: DistanceMetric, dim: usize) -> Self {
        Self {
            config,
            metric,
            dim,
            nodes: HashMap::new(),
            vectors: HashMap::new(),
            metadata: HashMap::new(),
            quant: HashMap::new(),
            entry_point: None,
            max_layer: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert `id` with its vector payload and metadata into the graph.
    pub fn insert(&mut self, id: VectorId, vector: &[f32], metadata: Metadata) -> Result<()> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }

        self.vectors.insert(id, vector.to_vec());
        self.metadata.insert(id, metadata);
        if self.config.use_binary_quantization {
            self.quant.insert(id, sign_bits(vector));
        }

        let level = self.select_layer();
        let mut node = HnswNode::new(level);

        if self.entry_point.is_none() {
            self.entry_point = Some(id);
            self.max_layer = level;
            self.nodes.insert(id, node);
            return Ok(());
        }

        let entry_id = self.entry_point.expect("checked above");
        let mut current_nearest = vec![entry_id];

        for layer in (level + 1..=self.max_layer).rev() {
            current_nearest = self.search_layer(vector, &current_nearest, 1, layer)?;
        }

        for layer in (0..=level.min(self.max_layer)).rev() {
            let candidates =
                self.search_layer(vector, &current_nearest, self.config.ef_construction, layer)?;

            let m = if layer == 0 {
                self.config.max_connections_layer0
            } else {
                self.config.max_connections
            };

            let neighbors = self.select_neighbors(&candidates, m, vector)?;

            for &neighbor_id in &neighbors {
                node.connections[layer].push(neighbor_id);

                // Preserve the documented "skip the edge" defect rather
                // than re-pruning: a neighbour already at capacity simply
                // does not receive the back-edge.
                if let Some(neighbor) = self.nodes.get_mut(&neighbor_id)
                    && layer < neighbor.connections.len()
                    && neighbor.connections[layer].len() < m
                    && !neighbor.connections[layer].contains(&id)
                {
                    neighbor.connections[layer].push(id);
                }
            }

            current_nearest = candidates;
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(id);
        }

        self.nodes.insert(id, node);
        Ok(())
    }

    /// Replace the payload for `id` without restructuring the graph.
    pub fn update(&mut self, id: VectorId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        if !self.nodes.contains_key(&id) {
            return Err(Error::NotFound(id));
        }
        self.vectors.insert(id, vector.to_vec());
        if self.config.use_binary_quantization {
            self.quant.insert(id, sign_bits(vector));
        }
        Ok(())
    }

    pub fn update_metadata(&mut self, id: VectorId, metadata: Metadata) -> Result<()> {
        if !self.nodes.contains_key(&id) {
            return Err(Error::NotFound(id));
        }
        self.metadata.insert(id, metadata);
        Ok(())
    }

    /// Soft-delete: the node stays in the graph as a bridge, hidden from
    /// search results, until a [`Self::rebuild`].
    pub fn delete(&mut self, id: VectorId) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NotFound(id))?;
        node.deleted = true;
        Ok(())
    }

    pub fn is_deleted(&self, id: VectorId) -> Result<bool> {
        Ok(self.nodes.get(&id).ok_or(Error::NotFound(id))?.deleted)
    }

    /// Every id, live and tombstoned, in ascending order with its vector,
    /// metadata, and tombstone bit. Used by the database façade to
    /// reconstruct the primary columnar store after loading a snapshot,
    /// since the HNSW serialised form is the only copy of the payload on
    /// disk.
    pub fn iter_all(&self) -> Vec<(VectorId, Vec<f32>, Metadata, bool)> {
        let mut ids: Vec<VectorId> = self.nodes.keys().copied().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| {
                let node = &self.nodes[&id];
                (
                    id,
                    self.vectors.get(&id).cloned().unwrap_or_default(),
                    self.metadata.get(&id).cloned().unwrap_or_default(),
                    node.deleted,
                )
            })
            .collect()
    }

    /// Discard every soft-deleted node by re-inserting every live vector,
    /// in vector-id order, into a fresh graph. Never triggered implicitly.
    pub fn rebuild(&mut self) -> Result<()> {
        let mut live: Vec<(VectorId, Vec<f32>, Metadata)> = self
            .nodes
            .iter()
            .filter(|(_, n)| !n.deleted)
            .filter_map(|(id, _)| {
                Some((
                    *id,
                    self.vectors.get(id)?.clone(),
                    self.metadata.get(id).cloned().unwrap_or_default(),
                ))
            })
            .collect();
        live.sort_by_key(|(id, _, _)| *id);

        let mut fresh = HnswIndex::new(self.config.clone(), self.metric, self.dim);
        for (id, vector, metadata) in live {
            fresh.insert(id, &vector, metadata)?;
        }
        *self = fresh;
        Ok(())
    }

    /// Top-`k` nearest neighbours to `query`, optionally filtered by
    /// metadata. The beam itself never short-circuits on the filter — it
    /// is only applied when assembling the returned results — so recall
    /// does not collapse when the filter is selective.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>> {
        if query.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        if self.entry_point.is_none() {
            return Ok(Vec::new());
        }
        let entry_id = self.entry_point.expect("checked above");
        let mut current_nearest = vec![entry_id];

        for layer in (1..=self.max_layer).rev() {
            current_nearest = self.search_layer(query, &current_nearest, 1, layer)?;
        }

        let ef = if filter.is_some() {
            self.config.ef_search.max(k) * self.config.acorn_expansion.max(1)
        } else {
            self.config.ef_search.max(k)
        };
        current_nearest = self.search_layer(query, &current_nearest, ef, 0)?;

        let quant_query = if self.config.use_binary_quantization {
            Some(sign_bits(query))
        } else {
            None
        };

        let mut scored: Vec<(f32, VectorId)> = current_nearest
            .into_iter()
            .filter(|id| !self.nodes.get(id).map(|n| n.deleted).unwrap_or(true))
            .filter(|id| {
                filter
                    .map(|f| self.metadata.get(id).map(|m| f.matches(m)).unwrap_or(false))
                    .unwrap_or(true)
            })
            .filter_map(|id| {
                let vector = self.vectors.get(&id)?;
                let rank = if let Some(qq) = &quant_query {
                    hamming(qq, self.quant.get(&id)?) as f32
                } else {
                    self.metric.rank(query, vector).ok()?
                };
                Some((rank, id))
            })
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        if self.config.use_binary_quantization && self.config.quant_rerank > 0 {
            let top = self.config.quant_rerank.min(scored.len());
            let mut rescored: Vec<(f32, VectorId)> = scored[..top]
                .iter()
                .filter_map(|(_, id)| {
                    let vector = self.vectors.get(id)?;
                    Some((self.metric.rank(query, vector).ok()?, *id))
                })
                .collect();
            rescored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            scored = rescored;
        }

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(dist, id)| {
                SearchResult::with_metadata(id, dist, self.metadata.get(&id).cloned().unwrap_or_default())
            })
            .collect())
    }

    /// Every live (and, unless filtered, matching) vector within `radius`
    /// of `query`, up to `max_results`.
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        max_results: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>> {
        if query.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        if self.entry_point.is_none() {
            return Ok(Vec::new());
        }
        let entry_id = self.entry_point.expect("checked above");
        let mut current_nearest = vec![entry_id];
        for layer in (1..=self.max_layer).rev() {
            current_nearest = self.search_layer(query, &current_nearest, 1, layer)?;
        }
        let wide = self.config.ef_search.max(max_results) * 4;
        current_nearest = self.search_layer(query, &current_nearest, wide, 0)?;

        let mut results: Vec<SearchResult> = current_nearest
            .into_iter()
            .filter(|id| !self.nodes.get(id).map(|n| n.deleted).unwrap_or(true))
            .filter(|id| {
                filter
                    .map(|f| self.metadata.get(id).map(|m| f.matches(m)).unwrap_or(false))
                    .unwrap_or(true)
            })
            .filter_map(|id| {
                let vector = self.vectors.get(&id)?;
                let dist = self.metric.rank(query, vector).ok()?;
                (dist <= radius).then(|| {
                    SearchResult::with_metadata(id, dist, self.metadata.get(&id).cloned().unwrap_or_default())
                })
            })
            .collect();
        results.sort();
        results.truncate(max_results);
        Ok(results)
    }

    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[VectorId],
        num_to_return: usize,
        layer: usize,
    ) -> Result<Vec<VectorId>> {
        let mut visited = std::collections::HashSet::new();
        let mut candidates: BinaryHeap<Reverse<(OrderedFloat, VectorId)>> = BinaryHeap::new();
        let mut nearest: BinaryHeap<(OrderedFloat, VectorId)> = BinaryHeap::new();

        for &ep in entry_points {
            if visited.insert(ep) {
                let dist = self.rank_to(query, ep)?;
                candidates.push(Reverse((OrderedFloat(dist), ep)));
                nearest.push((OrderedFloat(dist), ep));
            }
        }

        while let Some(Reverse((OrderedFloat(current_dist), current_id))) = candidates.pop() {
            if let Some(&(OrderedFloat(farthest_dist), _)) = nearest.peek()
                && current_dist > farthest_dist
                && nearest.len() >= num_to_return
            {
                break;
            }

            if let Some(node) = self.nodes.get(&current_id)
                && layer < node.connections.len()
            {
                for &neighbor_id in &node.connections[layer] {
                    if visited.insert(neighbor_id) {
                        let dist = self.rank_to(query, neighbor_id)?;
                        if nearest.len() < num_to_return
                            || dist < nearest.peek().map(|(OrderedFloat(d), _)| *d).unwrap_or(f32::MAX)
                        {
                            candidates.push(Reverse((OrderedFloat(dist), neighbor_id)));
                            nearest.push((OrderedFloat(dist), neighbor_id));
                            if nearest.len() > num_to_return {
                                nearest.pop();
                            }
                        }
                    }
                }
            }
        }

        let mut result: Vec<_> = nearest.into_iter().collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result.into_iter().map(|(_, id)| id).collect())
    }

    fn select_neighbors(&self, candidates: &[VectorId], m: usize, query: &[f32]) -> Result<Vec<VectorId>> {
        if candidates.len() <= m {
            let mut out = candidates.to_vec();
            out.sort();
            return Ok(out);
        }
        let mut scored: Vec<_> = candidates
            .iter()
            .map(|&id| {
                let dist = self.rank_to(query, id).unwrap_or(f32::MAX);
                (OrderedFloat(dist), id)
            })
            .collect();
        scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(scored.into_iter().take(m).map(|(_, id)| id).collect())
    }

    fn rank_to(&self, query: &[f32], id: VectorId) -> Result<f32> {
        let vector = self.vectors.get(&id).ok_or(Error::NotFound(id))?;
        self.metric.rank(query, vector)
    }

    fn select_layer(&self) -> usize {
        let uniform: f64 = rand::random();
        let level = (-uniform.ln() * self.config.level_multiplier).floor() as usize;
        level.min(self.config.max_level)
    }

    /// Two-pass binary serialisation: node payloads first, then per-layer
    /// connectivity, matching the on-disk HNSW form in §6.
    pub fn serialize(&self) -> Vec<u8> {
        let mut ids: Vec<VectorId> = self.nodes.keys().copied().collect();
        ids.sort();

        let mut out = Vec::new();
        out.extend_from_slice(&(self.config.max_connections as u32).to_le_bytes());
        out.extend_from_slice(&(self.config.ef_construction as u32).to_le_bytes());
        out.extend_from_slice(&(self.config.ef_search as u32).to_le_bytes());
        out.extend_from_slice(&(self.config.max_level as u32).to_le_bytes());
        out.extend_from_slice(&(ids.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.entry_point.unwrap_or(u64::MAX).to_le_bytes());

        // Pass 1: node payloads.
        for &id in &ids {
            let node = &self.nodes[&id];
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&(node.level as u32).to_le_bytes());
            out.push(node.deleted as u8);
            let vector = &self.vectors[&id];
            for x in vector {
                out.extend_from_slice(&x.to_le_bytes());
            }
            let metadata = self.metadata.get(&id).cloned().unwrap_or_default();
            out.extend_from_slice(&(metadata.len() as u32).to_le_bytes());
            for (k, v) in metadata.iter() {
                out.extend_from_slice(&(k.len() as u32).to_le_bytes());
                out.extend_from_slice(k.as_bytes());
                out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                out.extend_from_slice(v.as_bytes());
            }
        }

        // Pass 2: connectivity.
        for &id in &ids {
            let node = &self.nodes[&id];
            for layer in 0..=node.level {
                let neighbours = &node.connections[layer];
                out.extend_from_slice(&(neighbours.len() as u32).to_le_bytes());
                for &n in neighbours {
                    out.extend_from_slice(&n.to_le_bytes());
                }
            }
        }

        out
    }

    pub fn deserialize(bytes: &[u8], metric: DistanceMetric, dim: usize) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let max_connections = r.u32()? as usize;
        let ef_construction = r.u32()? as usize;
        let ef_search = r.u32()? as usize;
        let max_level = r.u32()? as usize;
        let count = r.u64()? as usize;
        let entry_raw = r.u64()?;

        let config = HnswConfig {
            max_connections,
            max_connections_layer0: max_connections * 2,
            ef_construction,
            ef_search,
            max_level,
            level_multiplier: 1.0 / (max_connections.max(2) as f64).ln(),
            use_binary_quantization: false,
            quant_rerank: 0,
            acorn_expansion: 4,
        };

        let mut index = HnswIndex::new(config, metric, dim);
        index.entry_point = if entry_raw == u64::MAX { None } else { Some(entry_raw) };

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = r.u64()?;
            let level = r.u32()? as usize;
            let deleted = r.u8()? != 0;
            let mut vector = Vec::with_capacity(dim);
            for _ in 0..dim {
                vector.push(r.f32()?);
            }
            let meta_count = r.u32()?;
            let mut metadata = Metadata::new();
            for _ in 0..meta_count {
                let klen = r.u32()? as usize;
                let key = r.str(klen)?;
                let vlen = r.u32()? as usize;
                let value = r.str(vlen)?;
                metadata.set(key, value);
            }
            index.max_layer = index.max_layer.max(level);
            index.vectors.insert(id, vector);
            index.metadata.insert(id, metadata);
            index.nodes.insert(
                id,
                HnswNode {
                    level,
                    deleted,
                    connections: (0..=level).map(|_| Vec::new()).collect(),
                },
            );
            ids.push(id);
        }

        for &id in &ids {
            let level = index.nodes[&id].level;
            let mut layers = Vec::with_capacity(level + 1);
            for _ in 0..=level {
                let n = r.u32()? as usize;
                let mut neighbours = Vec::with_capacity(n);
                for _ in 0..n {
                    neighbours.push(r.u64()?);
                }
                layers.push(neighbours);
            }
            index.nodes.get_mut(&id).expect("just inserted").connections = layers;
        }

        Ok(index)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::CorruptSnapshot("truncated HNSW index bytes".into()));
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn str(&mut self, len: usize) -> Result<String> {
        String::from_utf8(self.take(len)?.to_vec())
            .map_err(|_| Error::CorruptSnapshot("non-UTF8 metadata in HNSW index bytes".into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedFloat(f32);

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = HnswConfig::default();
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.max_connections_layer0, 32);
        assert_eq!(config.ef_search, 50);
    }

    #[test]
    fn insert_and_search_finds_self() {
        let mut index = HnswIndex::new(HnswConfig::fast(), DistanceMetric::Cosine, 3);
        index.insert(1, &[1.0, 0.0, 0.0], Metadata::new()).unwrap();
        index.insert(2, &[0.9, 0.1, 0.0], Metadata::new()).unwrap();
        index.insert(3, &[0.0, 1.0, 0.0], Metadata::new()).unwrap();

        let results = index.search(&[1.0, 0.0, 0.0], 3, None).unwrap();
        assert!(!results.is_empty());
        assert!(results.iter().any(|r| r.id == 1));
        assert_eq!(results[0].id, 1);
    }

    #[test]
    fn soft_delete_hides_node_but_keeps_graph_structure() {
        let mut index = HnswIndex::new(HnswConfig::fast(), DistanceMetric::Euclidean, 2);
        index.insert(1, &[1.0, 0.0], Metadata::new()).unwrap();
        index.insert(2, &[0.0, 1.0], Metadata::new()).unwrap();

        index.delete(1).unwrap();
        assert!(index.is_deleted(1).unwrap());
        assert_eq!(index.len(), 2); // node still present

        let results = index.search(&[1.0, 0.0], 2, None).unwrap();
        assert!(!results.iter().any(|r| r.id == 1));
    }

    #[test]
    fn rebuild_drops_soft_deleted_nodes() {
        let mut index = HnswIndex::new(HnswConfig::fast(), DistanceMetric::Euclidean, 2);
        index.insert(1, &[1.0, 0.0], Metadata::new()).unwrap();
        index.insert(2, &[0.0, 1.0], Metadata::new()).unwrap();
        index.delete(1).unwrap();
        index.rebuild().unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.search(&[1.0, 0.0], 2, None).unwrap().iter().all(|r| r.id != 1));
    }

    #[test]
    fn filter_restricts_results_to_matching_metadata() {
        let mut index = HnswIndex::new(HnswConfig::fast(), DistanceMetric::Euclidean, 2);
        let mut tag_x = Metadata::new();
        tag_x.set("tag", "x");
        let mut tag_y = Metadata::new();
        tag_y.set("tag", "y");
        index.insert(1, &[1.0, 0.0], tag_x).unwrap();
        index.insert(2, &[1.01, 0.0], tag_y).unwrap();

        let filter = MetadataFilter::Equals {
            key: "tag".into(),
            value: "x".into(),
        };
        let results = index.search(&[1.0, 0.0], 10, Some(&filter)).unwrap();
        assert!(results.iter().all(|r| r.id == 1));
    }

    #[test]
    fn round_trip_serialize_preserves_search_behaviour() {
        let mut index = HnswIndex::new(HnswConfig::fast(), DistanceMetric::Cosine, 3);
        let mut meta = Metadata::new();
        meta.set("tag", "x");
        index.insert(1, &[1.0, 0.0, 0.0], meta).unwrap();
        index.insert(2, &[0.0, 1.0, 0.0], Metadata::new()).unwrap();

        let bytes = index.serialize();
        let restored = HnswIndex::deserialize(&bytes, DistanceMetric::Cosine, 3).unwrap();

        assert_eq!(restored.len(), index.len());
        let results = restored.search(&[1.0, 0.0, 0.0], 1, None).unwrap();
        assert_eq!(results[0].id, 1);
        assert_eq!(restored.metadata.get(&1).unwrap().get("tag"), Some("x"));
    }

    #[test]
    fn range_search_respects_radius_and_max_results() {
        let mut index = HnswIndex::new(HnswConfig::fast(), DistanceMetric::Euclidean, 2);
        index.insert(1, &[0.0, 0.0], Metadata::new()).unwrap();
        index.insert(2, &[0.1, 0.0], Metadata::new()).unwrap();
        index.insert(3, &[10.0, 0.0], Metadata::new()).unwrap();

        let results = index.range_search(&[0.0, 0.0], 1.0, 10, None).unwrap();
        assert!(results.iter().all(|r| r.distance <= 1.0));
        assert!(results.iter().any(|r| r.id == 1));
        assert!(!results.iter().any(|r| r.id == 3));
    }
}
