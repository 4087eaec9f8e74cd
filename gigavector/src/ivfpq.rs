//! IVF-PQ: coarse k-means partitioning plus residual product quantisation.
//!
//! Coarse centroids route a vector to one of `nlist` posting lists;
//! within a list each vector is compressed to `m` product-quantisation
//! codes. Search ranks a handful of probed lists with a precomputed
//! look-up table, then rerank the top candidates against the exact
//! stored payload.

use crate::vector::{Metadata, MetadataFilter};
use crate::{DistanceMetric, Error, Result, SearchResult, VectorId};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfPqConfig {
    /// Number of coarse (inverted-list) centroids.
    pub nlist: usize,
    /// Number of sub-quantisers; `dim` must be divisible by this.
    pub m: usize,
    /// Bits per PQ code (codebook has `2^nbits` codewords per sub-quantiser).
    pub nbits: usize,
    /// Posting lists probed per query.
    pub nprobe: usize,
    /// Lloyd iterations used to train coarse centroids and codebooks.
    pub train_iters: usize,
    /// Candidates reranked against the exact metric after LUT scoring.
    pub default_rerank: usize,
    /// L2-normalise vectors before coarse assignment and PQ training,
    /// approximating cosine similarity with an L2-trained index.
    pub use_cosine: bool,
    /// Multiplier on `k` for the oversampled candidate heap before rerank.
    pub oversampling_factor: usize,
}

impl Default for IvfPqConfig {
    fn default() -> Self {
        Self {
            nlist: 64,
            m: 8,
            nbits: 8,
            nprobe: 4,
            train_iters: 15,
            default_rerank: 32,
            use_cosine: false,
            oversampling_factor: 1,
        }
    }
}

impl IvfPqConfig {
    pub fn codebook_size(&self) -> usize {
        1 << self.nbits
    }
}

struct Entry {
    id: VectorId,
    vector: Vec<f32>,
    metadata: Metadata,
    deleted: bool,
}

/// One posting list: array-of-structures entries plus a parallel
/// structure-of-arrays code buffer (`codes[j * capacity + e]`) for
/// cache-friendly LUT accumulation during search.
struct ListData {
    entries: Vec<Entry>,
    codes: Vec<u8>,
    capacity: usize,
    m: usize,
}

impl ListData {
    fn new(m: usize) -> Self {
        Self {
            entries: Vec::new(),
            codes: Vec::new(),
            capacity: 0,
            m,
        }
    }

    fn grow(&mut self, min_capacity: usize) {
        if min_capacity <= self.capacity {
            return;
        }
        let new_capacity = min_capacity.max(self.capacity * 2).max(16);
        let mut new_codes = vec![0u8; new_capacity * self.m];
        for j in 0..self.m {
            for e in 0..self.entries.len() {
                new_codes[j * new_capacity + e] = self.codes[j * self.capacity + e];
            }
        }
        self.codes = new_codes;
        self.capacity = new_capacity;
    }

    fn push(&mut self, entry: Entry, codes: &[u8]) {
        let e = self.entries.len();
        self.grow(e + 1);
        for (j, &c) in codes.iter().enumerate() {
            self.codes[j * self.capacity + e] = c;
        }
        self.entries.push(entry);
    }

    fn code(&self, j: usize, e: usize) -> u8 {
        self.codes[j * self.capacity + e]
    }

    fn set_code(&mut self, j: usize, e: usize, value: u8) {
        self.codes[j * self.capacity + e] = value;
    }

    /// Removes the entry at `entry_idx` by swapping the last entry into its
    /// place and compacting the trailing code columns the same way. Returns
    /// the id that now occupies `entry_idx`, if any entry was moved there.
    fn swap_remove(&mut self, entry_idx: usize) -> Option<VectorId> {
        let last = self.entries.len() - 1;
        self.entries.swap_remove(entry_idx);
        if entry_idx != last {
            for j in 0..self.m {
                let moved = self.codes[j * self.capacity + last];
                self.codes[j * self.capacity + entry_idx] = moved;
            }
        }
        self.entries.get(entry_idx).map(|e| e.id)
    }
}

struct TrainedState {
    centroids: Vec<Vec<f32>>,
    codebooks: Vec<Vec<Vec<f32>>>, // [sub-quantiser][codeword][subdim]
}

pub struct IvfPqIndex {
    config: IvfPqConfig,
    metric: DistanceMetric,
    dim: usize,
    sub_dim: usize,
    state: RwLock<Option<TrainedState>>,
    lists: Vec<Mutex<ListData>>,
    id_index: Mutex<HashMap<VectorId, (usize, usize)>>,
}

impl IvfPqIndex {
    pub fn new(config: IvfPqConfig, metric: DistanceMetric, dim: usize) -> Result<Self> {
        if config.m == 0 || dim % config.m != 0 {
            return Err(Error::InvalidArgument(format!(
                "dim {dim} is not divisible by m {}",
                config.m
            )));
        }
        let sub_dim = dim / config.m;
        let lists = (0..config.nlist).map(|_| Mutex::new(ListData::new(config.m))).collect();
        Ok(Self {
            config,
            metric,
            dim,
            sub_dim,
            state: RwLock::new(None),
            lists,
            id_index: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_trained(&self) -> bool {
        self.state.read().is_some()
    }

    fn maybe_normalize(&self, v: &[f32]) -> Vec<f32> {
        let mut out = v.to_vec();
        if self.config.use_cosine {
            crate::distance::normalize(&mut out);
        }
        out
    }

    /// One-shot training on `samples`. Requires at least
    /// `max(nlist, 2^nbits, m)` vectors.
    pub fn train(&self, samples: &[Vec<f32>]) -> Result<()> {
        let min_samples = self.config.nlist.max(self.config.codebook_size()).max(self.config.m);
        if samples.len() < min_samples {
            return Err(Error::InvalidArgument(format!(
                "training requires at least {min_samples} samples, got {}",
                samples.len()
            )));
        }
        for s in samples {
            if s.len() != self.dim {
                return Err(Error::DimensionMismatch {
                    expected: self.dim,
                    actual: s.len(),
                });
            }
        }

        let data: Vec<Vec<f32>> = samples.iter().map(|v| self.maybe_normalize(v)).collect();

        let centroids = kmeans(&data, self.config.nlist, self.config.train_iters);

        let mut codebooks = Vec::with_capacity(self.config.m);
        for j in 0..self.config.m {
            let slices: Vec<Vec<f32>> = data
                .iter()
                .map(|v| v[j * self.sub_dim..(j + 1) * self.sub_dim].to_vec())
                .collect();
            codebooks.push(kmeans(&slices, self.config.codebook_size(), self.config.train_iters));
        }

        *self.state.write() = Some(TrainedState { centroids, codebooks });
        tracing::debug!(nlist = self.config.nlist, m = self.config.m, "ivf-pq training complete");
        Ok(())
    }

    fn encode(&self, trained: &TrainedState, vector: &[f32]) -> (usize, Vec<u8>) {
        let list_idx = nearest_centroid(&trained.centroids, vector);
        let residual: Vec<f32> = vector
            .iter()
            .zip(&trained.centroids[list_idx])
            .map(|(a, b)| a - b)
            .collect();
        let mut codes = Vec::with_capacity(self.config.m);
        for j in 0..self.config.m {
            let slice = &residual[j * self.sub_dim..(j + 1) * self.sub_dim];
            codes.push(nearest_centroid(&trained.codebooks[j], slice) as u8);
        }
        (list_idx, codes)
    }

    pub fn insert(&self, id: VectorId, vector: &[f32], metadata: Metadata) -> Result<()> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        let guard = self.state.read();
        let trained = guard.as_ref().ok_or(Error::NotTrained)?;
        let normalized = self.maybe_normalize(vector);
        let (list_idx, codes) = self.encode(trained, &normalized);
        drop(guard);

        let mut list = self.lists[list_idx].lock();
        let entry_idx = list.entries.len();
        list.push(
            Entry {
                id,
                vector: normalized,
                metadata,
                deleted: false,
            },
            &codes,
        );
        drop(list);

        self.id_index.lock().insert(id, (list_idx, entry_idx));
        Ok(())
    }

    /// Replaces the vector in place: recomputes the coarse assignment and PQ
    /// codes, and either overwrites the existing slot (assignment unchanged)
    /// or moves the entry to its new list, never leaving a stale row behind.
    pub fn update(&self, id: VectorId, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        let guard = self.state.read();
        let trained = guard.as_ref().ok_or(Error::NotTrained)?;
        let normalized = self.maybe_normalize(vector);
        let (new_list_idx, new_codes) = self.encode(trained, &normalized);
        drop(guard);

        let mut id_index = self.id_index.lock();
        let (old_list_idx, old_entry_idx) = id_index.get(&id).copied().ok_or(Error::NotFound(id))?;

        if old_list_idx == new_list_idx {
            let mut list = self.lists[old_list_idx].lock();
            list.entries[old_entry_idx].vector = normalized;
            for (j, &c) in new_codes.iter().enumerate() {
                list.set_code(j, old_entry_idx, c);
            }
            return Ok(());
        }

        let (metadata, deleted) = {
            let old_list = self.lists[old_list_idx].lock();
            let entry = &old_list.entries[old_entry_idx];
            (entry.metadata.clone(), entry.deleted)
        };

        let moved_id = {
            let mut old_list = self.lists[old_list_idx].lock();
            old_list.swap_remove(old_entry_idx)
        };
        if let Some(moved_id) = moved_id {
            id_index.insert(moved_id, (old_list_idx, old_entry_idx));
        }

        let new_entry_idx = {
            let mut new_list = self.lists[new_list_idx].lock();
            let idx = new_list.entries.len();
            new_list.push(
                Entry {
                    id,
                    vector: normalized,
                    metadata,
                    deleted,
                },
                &new_codes,
            );
            idx
        };
        id_index.insert(id, (new_list_idx, new_entry_idx));
        Ok(())
    }

    pub fn update_metadata(&self, id: VectorId, metadata: Metadata) -> Result<()> {
        let (list_idx, entry_idx) = self
            .id_index
            .lock()
            .get(&id)
            .copied()
            .ok_or(Error::NotFound(id))?;
        let mut list = self.lists[list_idx].lock();
        list.entries[entry_idx].metadata = metadata;
        Ok(())
    }

    pub fn delete(&self, id: VectorId) -> Result<()> {
        let (list_idx, entry_idx) = self
            .id_index
            .lock()
            .get(&id)
            .copied()
            .ok_or(Error::NotFound(id))?;
        let mut list = self.lists[list_idx].lock();
        list.entries[entry_idx].deleted = true;
        Ok(())
    }

    pub fn is_deleted(&self, id: VectorId) -> Result<bool> {
        let (list_idx, entry_idx) = self
            .id_index
            .lock()
            .get(&id)
            .copied()
            .ok_or(Error::NotFound(id))?;
        Ok(self.lists[list_idx].lock().entries[entry_idx].deleted)
    }

    /// Every entry, live and tombstoned, across all lists, in ascending id
    /// order. Used by the database façade to reconstruct the primary
    /// columnar store after loading a snapshot, since each list's entries
    /// carry the only on-disk copy of the payload.
    pub fn iter_all(&self) -> Vec<(VectorId, Vec<f32>, Metadata, bool)> {
        let mut out = Vec::new();
        for list in &self.lists {
            let list = list.lock();
            for entry in &list.entries {
                out.push((entry.id, entry.vector.clone(), entry.metadata.clone(), entry.deleted));
            }
        }
        out.sort_by_key(|(id, _, _, _)| *id);
        out
    }

    fn get_metadata(&self, id: VectorId) -> Result<Metadata> {
        let (list_idx, entry_idx) = self
            .id_index
            .lock()
            .get(&id)
            .copied()
            .ok_or(Error::NotFound(id))?;
        Ok(self.lists[list_idx].lock().entries[entry_idx].metadata.clone())
    }

    /// Coarse centroids ranked by L2 distance to `query`, nearest first.
    fn probe_lists(&self, trained: &TrainedState, query: &[f32], nprobe: usize) -> Vec<usize> {
        let mut heap: BinaryHeap<(OrderedFloat, usize)> = BinaryHeap::new();
        for (idx, centroid) in trained.centroids.iter().enumerate() {
            let d = crate::distance::l2(query, centroid);
            if heap.len() < nprobe {
                heap.push((OrderedFloat(d), idx));
            } else if let Some(&(OrderedFloat(worst), _)) = heap.peek()
                && d < worst
            {
                heap.pop();
                heap.push((OrderedFloat(d), idx));
            }
        }
        let mut out: Vec<_> = heap.into_iter().map(|(_, idx)| idx).collect();
        out.sort();
        out
    }

    fn build_lut(&self, trained: &TrainedState, query: &[f32]) -> Vec<Vec<f32>> {
        (0..self.config.m)
            .map(|j| {
                let slice = &query[j * self.sub_dim..(j + 1) * self.sub_dim];
                trained.codebooks[j]
                    .iter()
                    .map(|codeword| match self.metric {
                        DistanceMetric::Cosine => 1.0 - crate::distance::cosine(slice, codeword),
                        _ => crate::distance::l2(slice, codeword),
                    })
                    .collect()
            })
            .collect()
    }

    fn estimate(&self, lut: &[Vec<f32>], list: &ListData, e: usize) -> f32 {
        let m = self.config.m;
        let mut total = 0.0f32;
        let mut j = 0;
        while j + 4 <= m {
            #[cfg(target_arch = "x86_64")]
            if j + 8 < m {
                let next_e = e.min(list.entries.len().saturating_sub(1));
                unsafe {
                    std::arch::x86_64::_mm_prefetch::<{ std::arch::x86_64::_MM_HINT_T0 }>(
                        list.codes[(j + 4) * list.capacity + next_e..].as_ptr() as *const i8,
                    );
                }
            }
            total += lut[j][list.code(j, e) as usize];
            total += lut[j + 1][list.code(j + 1, e) as usize];
            total += lut[j + 2][list.code(j + 2, e) as usize];
            total += lut[j + 3][list.code(j + 3, e) as usize];
            j += 4;
        }
        while j < m {
            total += lut[j][list.code(j, e) as usize];
            j += 1;
        }
        total
    }

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
        let guard = self.state.read();
        let trained = guard.as_ref().ok_or(Error::NotTrained)?;
        let query = self.maybe_normalize(query);

        let probed = self.probe_lists(trained, &query, self.config.nprobe);
        let lut = self.build_lut(trained, &query);

        let oversample_k = k.max(k * self.config.oversampling_factor.max(1));
        let mut heap: BinaryHeap<(OrderedFloat, VectorId)> = BinaryHeap::new();
        let mut by_id: HashMap<VectorId, f32> = HashMap::new();

        for list_idx in probed {
            let list = self.lists[list_idx].lock();
            for e in 0..list.entries.len() {
                let entry = &list.entries[e];
                if entry.deleted {
                    continue;
                }
                if let Some(f) = filter
                    && !f.matches(&entry.metadata)
                {
                    continue;
                }
                let est = self.estimate(&lut, &list, e);
                by_id.insert(entry.id, est);
                if heap.len() < oversample_k {
                    heap.push((OrderedFloat(est), entry.id));
                } else if let Some(&(OrderedFloat(worst), _)) = heap.peek()
                    && est < worst
                {
                    heap.pop();
                    heap.push((OrderedFloat(est), entry.id));
                }
            }
        }

        let mut candidates: Vec<VectorId> = heap.into_iter().map(|(_, id)| id).collect();
        candidates.sort_by(|a, b| {
            by_id[a].partial_cmp(&by_id[b]).unwrap_or(std::cmp::Ordering::Equal)
        });

        let rerank_n = self.config.default_rerank.max(k).min(candidates.len());
        let mut results: Vec<SearchResult> = candidates[..rerank_n]
            .iter()
            .filter_map(|&id| {
                let (list_idx, entry_idx) = *self.id_index.lock().get(&id)?;
                let list = self.lists[list_idx].lock();
                let entry = &list.entries[entry_idx];
                let dist = self.metric.rank(&query, &entry.vector).ok()?;
                Some(SearchResult::with_metadata(id, dist, entry.metadata.clone()))
            })
            .collect();
        results.sort();
        results.truncate(k);
        Ok(results)
    }

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
        let guard = self.state.read();
        let trained = guard.as_ref().ok_or(Error::NotTrained)?;
        let query = self.maybe_normalize(query);

        let probed = self.probe_lists(trained, &query, self.config.nprobe);
        let lut = self.build_lut(trained, &query);

        let mut candidates: Vec<(f32, VectorId)> = Vec::new();
        for list_idx in probed {
            let list = self.lists[list_idx].lock();
            for e in 0..list.entries.len() {
                let entry = &list.entries[e];
                if entry.deleted {
                    continue;
                }
                if let Some(f) = filter
                    && !f.matches(&entry.metadata)
                {
                    continue;
                }
                let est = self.estimate(&lut, &list, e);
                if est <= radius {
                    candidates.push((est, entry.id));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(max_results * 2);

        let mut results: Vec<SearchResult> = candidates
            .into_iter()
            .filter_map(|(_, id)| {
                let (list_idx, entry_idx) = *self.id_index.lock().get(&id)?;
                let list = self.lists[list_idx].lock();
                let entry = &list.entries[entry_idx];
                let dist = self.metric.rank(&query, &entry.vector).ok()?;
                (dist <= radius).then(|| SearchResult::with_metadata(id, dist, entry.metadata.clone()))
            })
            .collect();
        results.sort();
        results.truncate(max_results);
        Ok(results)
    }

    /// Header, trained codebooks (if any), then each list's entries. The
    /// trailing CRC32 is appended by the caller (the snapshot writer in
    /// `db.rs`), not here, so this index's bytes can be embedded inside a
    /// larger framed snapshot without double-checksumming.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.dim as u32).to_le_bytes());
        out.extend_from_slice(&(self.config.nlist as u32).to_le_bytes());
        out.extend_from_slice(&(self.config.m as u32).to_le_bytes());
        out.extend_from_slice(&(self.config.nbits as u32).to_le_bytes());
        out.extend_from_slice(&(self.config.nprobe as u32).to_le_bytes());
        out.extend_from_slice(&(self.config.train_iters as u32).to_le_bytes());
        out.extend_from_slice(&(self.config.default_rerank as u32).to_le_bytes());
        out.push(self.config.use_cosine as u8);
        out.extend_from_slice(&(self.config.oversampling_factor as u32).to_le_bytes());

        let guard = self.state.read();
        out.push(guard.is_some() as u8);
        if let Some(trained) = guard.as_ref() {
            for centroid in &trained.centroids {
                for x in centroid {
                    out.extend_from_slice(&x.to_le_bytes());
                }
            }
            for codebook in &trained.codebooks {
                for codeword in codebook {
                    for x in codeword {
                        out.extend_from_slice(&x.to_le_bytes());
                    }
                }
            }
        }
        drop(guard);

        for list in &self.lists {
            let list = list.lock();
            out.extend_from_slice(&(list.entries.len() as u32).to_le_bytes());
            for (e, entry) in list.entries.iter().enumerate() {
                out.extend_from_slice(&entry.id.to_le_bytes());
                out.push(entry.deleted as u8);
                for j in 0..self.config.m {
                    out.push(list.code(j, e));
                }
                for x in &entry.vector {
                    out.extend_from_slice(&x.to_le_bytes());
                }
                out.extend_from_slice(&(entry.metadata.len() as u32).to_le_bytes());
                for (k, v) in entry.metadata.iter() {
                    out.extend_from_slice(&(k.len() as u32).to_le_bytes());
                    out.extend_from_slice(k.as_bytes());
                    out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    out.extend_from_slice(v.as_bytes());
                }
            }
        }

        out
    }

    pub fn deserialize(bytes: &[u8], metric: DistanceMetric) -> Result<Self> {
        let mut r = IvfPqReader::new(bytes);
        let dim = r.u32()? as usize;
        let nlist = r.u32()? as usize;
        let m = r.u32()? as usize;
        let nbits = r.u32()? as usize;
        let nprobe = r.u32()? as usize;
        let train_iters = r.u32()? as usize;
        let default_rerank = r.u32()? as usize;
        let use_cosine = r.u8()? != 0;
        let oversampling_factor = r.u32()? as usize;

        let config = IvfPqConfig {
            nlist,
            m,
            nbits,
            nprobe,
            train_iters,
            default_rerank,
            use_cosine,
            oversampling_factor,
        };
        let index = IvfPqIndex::new(config, metric, dim)?;

        let trained_flag = r.u8()? != 0;
        if trained_flag {
            let mut centroids = Vec::with_capacity(nlist);
            for _ in 0..nlist {
                let mut c = Vec::with_capacity(dim);
                for _ in 0..dim {
                    c.push(r.f32()?);
                }
                centroids.push(c);
            }
            let codebook_size = index.config.codebook_size();
            let mut codebooks = Vec::with_capacity(m);
            for _ in 0..m {
                let mut codebook = Vec::with_capacity(codebook_size);
                for _ in 0..codebook_size {
                    let mut codeword = Vec::with_capacity(index.sub_dim);
                    for _ in 0..index.sub_dim {
                        codeword.push(r.f32()?);
                    }
                    codebook.push(codeword);
                }
                codebooks.push(codebook);
            }
            *index.state.write() = Some(TrainedState { centroids, codebooks });
        }

        for list_idx in 0..nlist {
            let entry_count = r.u32()? as usize;
            let mut list = index.lists[list_idx].lock();
            for _ in 0..entry_count {
                let id = r.u64()?;
                let deleted = r.u8()? != 0;
                let mut codes = Vec::with_capacity(m);
                for _ in 0..m {
                    codes.push(r.u8()?);
                }
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
                let entry_idx = list.entries.len();
                list.push(
                    Entry {
                        id,
                        vector,
                        metadata,
                        deleted,
                    },
                    &codes,
                );
                drop(list);
                index.id_index.lock().insert(id, (list_idx, entry_idx));
                list = index.lists[list_idx].lock();
            }
        }

        Ok(index)
    }
}

struct IvfPqReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> IvfPqReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::CorruptSnapshot("truncated IVF-PQ index bytes".into()));
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
            .map_err(|_| Error::CorruptSnapshot("non-UTF8 metadata in IVF-PQ index bytes".into()))
    }
}

fn nearest_centroid(centroids: &[Vec<f32>], v: &[f32]) -> usize {
    centroids
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            crate::distance::l2(v, a)
                .partial_cmp(&crate::distance::l2(v, b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

/// Lloyd's algorithm, first-`k` initialisation, fixed iteration count. The
/// per-point nearest-centroid assignment is the expensive step and is
/// independent per point, so it's split across rayon's pool and reduced
/// back into one set of sums/counts per iteration.
fn kmeans(data: &[Vec<f32>], k: usize, iters: usize) -> Vec<Vec<f32>> {
    let dim = data[0].len();
    let mut centroids: Vec<Vec<f32>> = data.iter().take(k).cloned().collect();
    while centroids.len() < k {
        centroids.push(data[centroids.len() % data.len()].clone());
    }

    for _ in 0..iters {
        let zero = || (vec![vec![0.0f32; dim]; k], vec![0usize; k]);
        let (sums, counts) = data
            .par_iter()
            .fold(zero, |(mut sums, mut counts), v| {
                let idx = nearest_centroid(&centroids, v);
                counts[idx] += 1;
                for (s, x) in sums[idx].iter_mut().zip(v.iter()) {
                    *s += x;
                }
                (sums, counts)
            })
            .reduce(zero, |(mut sums_a, counts_a), (sums_b, counts_b)| {
                let mut counts_a = counts_a;
                for idx in 0..k {
                    counts_a[idx] += counts_b[idx];
                    for (a, b) in sums_a[idx].iter_mut().zip(sums_b[idx].iter()) {
                        *a += b;
                    }
                }
                (sums_a, counts_a)
            });

        for idx in 0..k {
            if counts[idx] > 0 {
                for (c, s) in centroids[idx].iter_mut().zip(sums[idx].iter()) {
                    *c = s / counts[idx] as f32;
                }
            }
        }
    }

    centroids
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
