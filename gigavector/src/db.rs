//! The embedded database façade: ties the primary store, the chosen ANN
//! index, the metadata inverted index, the write-ahead log, and the MVCC
//! conditional-mutation layer together behind one reader-writer lock.
//!
//! Readers (search, `get_version`, plain reads) run concurrently; writers
//! (insert, delete, update, conditional mutation, save, WAL replay) take
//! the lock exclusively: writes are totally ordered by write-lock
//! acquisition, and the WAL record order mirrors that total order.

use crate::hnsw::HnswIndex;
use crate::ivfpq::IvfPqIndex;
use crate::metadata_index::MetadataIndex;
use crate::mvcc::{ConditionalManager, MutationCondition, MutationOutcome};
use crate::storage::VectorStorage;
use crate::vector::{Metadata, MetadataFilter};
use crate::wal::{WalRecord, WriteAheadLog};
use crate::{DistanceMetric, Error, IndexKind, Result, SearchResult, VectorId};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"GVDB";
const CURRENT_SNAPSHOT_VERSION: u32 = 3;

/// One batched conditional write, as accepted by [`Database::batch_update`].
pub enum ConditionalItem {
    UpdateVector {
        id: VectorId,
        vector: Vec<f32>,
        conditions: Vec<MutationCondition>,
    },
    UpdateMetadata {
        id: VectorId,
        metadata: Metadata,
        conditions: Vec<MutationCondition>,
    },
    Delete {
        id: VectorId,
        conditions: Vec<MutationCondition>,
    },
}

/// The live ANN index backing a [`Database`]. A thin dispatcher so the
/// façade can hold either variant without the caller juggling an enum of
/// its own.
enum Index {
    Hnsw(HnswIndex),
    IvfPq(IvfPqIndex),
}

impl Index {
    fn from_kind(kind: IndexKind, metric: DistanceMetric, dim: usize) -> Result<Self> {
        match kind {
            IndexKind::Hnsw(config) => Ok(Index::Hnsw(HnswIndex::new(config, metric, dim))),
            IndexKind::IvfPq(config) => Ok(Index::IvfPq(IvfPqIndex::new(config, metric, dim)?)),
        }
    }

    fn discriminant(&self) -> u32 {
        match self {
            Index::Hnsw(_) => 1,
            Index::IvfPq(_) => 2,
        }
    }

    /// Both current backends apply a metadata filter inside their own beam
    /// rather than returning a superset, so the façade's post-filter
    /// oversampling path below is reserved for a future index type that
    /// cannot do pushdown.
    fn supports_filter_pushdown(&self) -> bool {
        true
    }

    fn insert(&mut self, id: VectorId, vector: &[f32], metadata: Metadata) -> Result<()> {
        match self {
            Index::Hnsw(h) => h.insert(id, vector, metadata),
            Index::IvfPq(p) => p.insert(id, vector, metadata),
        }
    }

    fn update(&mut self, id: VectorId, vector: &[f32]) -> Result<()> {
        match self {
            Index::Hnsw(h) => h.update(id, vector),
            Index::IvfPq(p) => p.update(id, vector),
        }
    }

    fn update_metadata(&mut self, id: VectorId, metadata: Metadata) -> Result<()> {
        match self {
            Index::Hnsw(h) => h.update_metadata(id, metadata),
            Index::IvfPq(p) => p.update_metadata(id, metadata),
        }
    }

    fn delete(&mut self, id: VectorId) -> Result<()> {
        match self {
            Index::Hnsw(h) => h.delete(id),
            Index::IvfPq(p) => p.delete(id),
        }
    }

    fn search(&self, query: &[f32], k: usize, filter: Option<&MetadataFilter>) -> Result<Vec<SearchResult>> {
        match self {
            Index::Hnsw(h) => h.search(query, k, filter),
            Index::IvfPq(p) => p.search(query, k, filter),
        }
    }

    fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        max_results: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>> {
        match self {
            Index::Hnsw(h) => h.range_search(query, radius, max_results, filter),
            Index::IvfPq(p) => p.range_search(query, radius, max_results, filter),
        }
    }

    fn iter_all(&self) -> Vec<(VectorId, Vec<f32>, Metadata, bool)> {
        match self {
            Index::Hnsw(h) => h.iter_all(),
            Index::IvfPq(p) => p.iter_all(),
        }
    }

    fn serialize(&self) -> Vec<u8> {
        match self {
            Index::Hnsw(h) => h.serialize(),
            Index::IvfPq(p) => p.serialize(),
        }
    }

    fn deserialize(bytes: &[u8], metric: DistanceMetric, dim: usize, discriminant: u32) -> Result<Self> {
        match discriminant {
            1 => Ok(Index::Hnsw(HnswIndex::deserialize(bytes, metric, dim)?)),
            2 => Ok(Index::IvfPq(IvfPqIndex::deserialize(bytes, metric)?)),
            other => Err(Error::CorruptSnapshot(format!("unknown index_type {other}"))),
        }
    }
}

struct Inner {
    dim: usize,
    metric: DistanceMetric,
    index: Index,
    storage: VectorStorage,
    metadata_index: MetadataIndex,
    cond: ConditionalManager,
    wal: Option<WriteAheadLog>,
    replaying: bool,
    path: Option<PathBuf>,
}

impl Inner {
    fn apply_record(&mut self, record: WalRecord) -> Result<()> {
        match record {
            WalRecord::Insert { id, data, metadata } => {
                let assigned = self.storage.add(&data, metadata.clone())?;
                debug_assert_eq!(assigned, id, "WAL insert id does not match storage row index");
                for (k, v) in metadata.iter() {
                    self.metadata_index.add(assigned, k, v);
                }
                self.index.insert(assigned, &data, metadata)?;
                self.cond.register(assigned, now_micros());
            }
            WalRecord::Delete { id } => {
                self.storage.mark_deleted(id)?;
                self.index.delete(id)?;
                self.metadata_index.remove_all(id);
                self.cond.mark_deleted(id, now_micros());
            }
            WalRecord::Update { id, data, metadata } => {
                self.storage.update_data(id, &data)?;
                let previous = self.storage.update_metadata(id, metadata.clone())?;
                for (k, v) in previous.iter() {
                    self.metadata_index.remove(id, k, v);
                }
                for (k, v) in metadata.iter() {
                    self.metadata_index.add(id, k, v);
                }
                self.index.update(id, &data)?;
                self.index.update_metadata(id, metadata)?;
                self.cond.bump(id, now_micros());
            }
        }
        Ok(())
    }

    fn append_unless_replaying(&mut self, record: &WalRecord) -> Result<()> {
        if self.replaying {
            return Ok(());
        }
        if let Some(wal) = self.wal.as_mut() {
            wal.append(record)?;
        }
        Ok(())
    }

    fn do_insert(&mut self, vector: Vec<f32>, metadata: Metadata) -> Result<VectorId> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        let id = self.storage.count() as VectorId;
        let record = WalRecord::Insert {
            id,
            data: vector,
            metadata,
        };
        self.append_unless_replaying(&record)?;
        self.apply_record(record)?;
        Ok(id)
    }

    fn do_delete(&mut self, id: VectorId) -> Result<()> {
        if self.storage.is_deleted(id)? {
            return Ok(());
        }
        let record = WalRecord::Delete { id };
        self.append_unless_replaying(&record)?;
        self.apply_record(record)
    }

    fn do_update_metadata(&mut self, id: VectorId, metadata: Metadata) -> Result<()> {
        let data = self.storage.get_view(id)?.to_vec();
        let record = WalRecord::Update { id, data, metadata };
        self.append_unless_replaying(&record)?;
        self.apply_record(record)
    }

    fn current_metadata(&self, id: VectorId) -> Option<Metadata> {
        self.storage.get_metadata(id).ok().cloned()
    }

    fn do_conditional_update_vector(
        &mut self,
        id: VectorId,
        vector: Vec<f32>,
        conditions: &[MutationCondition],
    ) -> Result<MutationOutcome> {
        if vector.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        let metadata = self.current_metadata(id);
        let (outcome, _) = self.cond.try_mutate(id, conditions, metadata.as_ref(), now_micros());
        if outcome != MutationOutcome::Ok {
            return Ok(outcome);
        }
        let record = WalRecord::Update {
            id,
            data: vector.clone(),
            metadata: metadata.unwrap_or_default(),
        };
        self.append_unless_replaying(&record)?;
        self.storage.update_data(id, &vector)?;
        self.index.update(id, &vector)?;
        Ok(MutationOutcome::Ok)
    }

    fn do_conditional_update_metadata(
        &mut self,
        id: VectorId,
        metadata: Metadata,
        conditions: &[MutationCondition],
    ) -> Result<MutationOutcome> {
        let current = self.current_metadata(id);
        let (outcome, _) = self.cond.try_mutate(id, conditions, current.as_ref(), now_micros());
        if outcome != MutationOutcome::Ok {
            return Ok(outcome);
        }
        let data = self.storage.get_view(id)?.to_vec();
        let record = WalRecord::Update {
            id,
            data,
            metadata: metadata.clone(),
        };
        self.append_unless_replaying(&record)?;
        let previous = self.storage.update_metadata(id, metadata.clone())?;
        for (k, v) in previous.iter() {
            self.metadata_index.remove(id, k, v);
        }
        for (k, v) in metadata.iter() {
            self.metadata_index.add(id, k, v);
        }
        self.index.update_metadata(id, metadata)?;
        Ok(MutationOutcome::Ok)
    }

    fn do_conditional_delete(&mut self, id: VectorId, conditions: &[MutationCondition]) -> Result<MutationOutcome> {
        let metadata = self.current_metadata(id);
        let (outcome, _) = self.cond.try_delete(id, conditions, metadata.as_ref(), now_micros());
        if outcome != MutationOutcome::Ok {
            return Ok(outcome);
        }
        let record = WalRecord::Delete { id };
        self.append_unless_replaying(&record)?;
        self.storage.mark_deleted(id)?;
        self.index.delete(id)?;
        self.metadata_index.remove_all(id);
        Ok(MutationOutcome::Ok)
    }
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn wal_path_for(path: &Path) -> PathBuf {
    if let Ok(dir) = std::env::var("GV_WAL_DIR") {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "gigavector".to_string());
        Path::new(&dir).join(format!("{file_name}.wal"))
    } else {
        let mut raw = path.as_os_str().to_os_string();
        raw.push(".wal");
        PathBuf::from(raw)
    }
}

/// The embedded database: open/create, insert, delete, update, search, and
/// checkpoint, all behind one reader-writer lock.
pub struct Database {
    inner: RwLock<Inner>,
}

impl Database {
    /// An in-memory instance with no backing file and no WAL. Writes are
    /// not durable; `save` must be called explicitly with a path via
    /// [`Self::save_to`] if persistence is ever wanted.
    pub fn create_in_memory(dim: usize, metric: DistanceMetric, index_kind: IndexKind) -> Result<Self> {
        let index = Index::from_kind(index_kind, metric, dim)?;
        let inner = Inner {
            dim,
            metric,
            index,
            storage: VectorStorage::new(dim),
            metadata_index: MetadataIndex::new(),
            cond: ConditionalManager::new(),
            wal: None,
            replaying: false,
            path: None,
        };
        Ok(Self { inner: RwLock::new(inner) })
    }

    /// Open the snapshot at `path`, or create a fresh one if it does not
    /// exist, then open (or create) its write-ahead log and replay it.
    pub fn open(path: impl AsRef<Path>, dim: usize, metric: DistanceMetric, index_kind: IndexKind) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let requested_discriminant = index_kind.discriminant();

        let (index, storage, metadata_index) = if path.exists() {
            Self::load_snapshot(&path, dim, metric, requested_discriminant)?
        } else {
            (
                Index::from_kind(index_kind, metric, dim)?,
                VectorStorage::new(dim),
                MetadataIndex::new(),
            )
        };

        let wal_path = wal_path_for(&path);
        let wal = WriteAheadLog::open(&wal_path, dim as u32, requested_discriminant)?;

        let mut inner = Inner {
            dim,
            metric,
            index,
            storage,
            metadata_index,
            cond: ConditionalManager::new(),
            wal: Some(wal),
            replaying: false,
            path: Some(path),
        };

        for (id, _, _, deleted) in inner.index.iter_all() {
            inner.cond.register(id, 0);
            if deleted {
                inner.cond.mark_deleted(id, 0);
            }
        }

        inner.replaying = true;
        let mut wal = inner.wal.take().expect("WAL was just opened");
        let replay_result = wal.replay(|record| inner.apply_record(record));
        inner.wal = Some(wal);
        inner.replaying = false;
        replay_result?;

        tracing::debug!(dim, "database opened");
        Ok(Self { inner: RwLock::new(inner) })
    }

    fn load_snapshot(
        path: &Path,
        dim: usize,
        metric: DistanceMetric,
        requested_discriminant: u32,
    ) -> Result<(Index, VectorStorage, MetadataIndex)> {
        let bytes = std::fs::read(path)?;
        let mut r = SnapshotReader::new(&bytes);

        let magic = r.take(4)?;
        if magic != MAGIC {
            return Err(Error::CorruptSnapshot("bad magic in snapshot header".into()));
        }
        let version = r.u32()?;
        let file_dim = r.u32()? as usize;
        if file_dim != dim {
            return Err(Error::CorruptSnapshot(format!(
                "snapshot dim {file_dim} does not match requested dim {dim}"
            )));
        }
        let count = r.u64()?;
        let index_type = if version >= 2 { r.u32()? } else { 0 };
        if index_type != requested_discriminant {
            return Err(Error::CorruptSnapshot(format!(
                "snapshot index_type {index_type} does not match requested {requested_discriminant}"
            )));
        }

        let index_bytes = if version >= 3 {
            let body_end = bytes.len().checked_sub(4).ok_or_else(|| {
                Error::CorruptSnapshot("snapshot too short for trailing CRC".into())
            })?;
            let crc_bytes: [u8; 4] = bytes[body_end..]
                .try_into()
                .map_err(|_| Error::CorruptSnapshot("truncated trailing CRC".into()))?;
            let expected = u32::from_le_bytes(crc_bytes);
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&bytes[..body_end]);
            let actual = hasher.finalize();
            if actual != expected {
                tracing::warn!(expected, actual, path = %path.display(), "snapshot crc mismatch");
                return Err(Error::CorruptSnapshot("snapshot CRC mismatch".into()));
            }
            &bytes[r.pos..body_end]
        } else {
            &bytes[r.pos..]
        };

        tracing::debug!(version, count, path = %path.display(), "loading snapshot");
        let index = Index::deserialize(index_bytes, metric, dim, requested_discriminant)?;

        let mut storage = VectorStorage::new(dim);
        let mut metadata_index = MetadataIndex::new();
        let rows = index.iter_all();
        if rows.len() as u64 != count {
            return Err(Error::CorruptSnapshot(format!(
                "snapshot header count {count} does not match {} stored rows",
                rows.len()
            )));
        }
        for (id, vector, metadata, deleted) in rows {
            let assigned = storage.add(&vector, metadata.clone())?;
            debug_assert_eq!(assigned, id);
            if deleted {
                storage.mark_deleted(assigned)?;
            } else {
                for (k, v) in metadata.iter() {
                    metadata_index.add(assigned, k, v);
                }
            }
        }

        Ok((index, storage, metadata_index))
    }

    /// Write a fresh snapshot to this database's path, then truncate the
    /// WAL. Errors if this is an in-memory instance.
    pub fn save(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let path = inner
            .path
            .clone()
            .ok_or_else(|| Error::InvalidArgument("in-memory database has no path to save to".into()))?;
        Self::write_snapshot(&inner, &path)?;
        if let Some(wal) = inner.wal.as_mut() {
            wal.reset()?;
        }
        tracing::debug!(path = %path.display(), "checkpoint complete");
        Ok(())
    }

    fn write_snapshot(inner: &Inner, path: &Path) -> Result<()> {
        let count = inner.storage.count() as u64;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&CURRENT_SNAPSHOT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(inner.dim as u32).to_le_bytes());
        bytes.extend_from_slice(&count.to_le_bytes());
        bytes.extend_from_slice(&inner.index.discriminant().to_le_bytes());
        bytes.extend_from_slice(&inner.index.serialize());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes);
        bytes.extend_from_slice(&hasher.finalize().to_le_bytes());

        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp_path = PathBuf::from(tmp);
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, path)?;
        tracing::debug!(count, bytes = bytes.len(), path = %path.display(), "wrote snapshot");
        Ok(())
    }

    /// Flush and drop the WAL handle. No implicit save — callers that want
    /// a durable checkpoint must call [`Self::save`] first. Dropping a
    /// `Database` without calling `close` has the same effect; this method
    /// exists for callers that want the teardown to be an explicit step.
    pub fn close(self) -> Result<()> {
        Ok(())
    }

    pub fn dim(&self) -> usize {
        self.inner.read().dim
    }

    pub fn metric(&self) -> DistanceMetric {
        self.inner.read().metric
    }

    pub fn len(&self) -> usize {
        self.inner.read().storage.count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().storage.is_empty()
    }

    pub fn add(&self, vector: Vec<f32>) -> Result<VectorId> {
        self.inner.write().do_insert(vector, Metadata::new())
    }

    pub fn add_with_metadata(&self, vector: Vec<f32>, metadata: Metadata) -> Result<VectorId> {
        self.inner.write().do_insert(vector, metadata)
    }

    pub fn delete_by_id(&self, id: VectorId) -> Result<()> {
        self.inner.write().do_delete(id)
    }

    pub fn update_metadata(&self, id: VectorId, metadata: Metadata) -> Result<()> {
        self.inner.write().do_update_metadata(id, metadata)
    }

    pub fn get_vector(&self, id: VectorId) -> Result<Vec<f32>> {
        Ok(self.inner.read().storage.get_view(id)?.to_vec())
    }

    pub fn get_metadata(&self, id: VectorId) -> Result<Metadata> {
        Ok(self.inner.read().storage.get_metadata(id)?.clone())
    }

    pub fn is_deleted(&self, id: VectorId) -> Result<bool> {
        self.inner.read().storage.is_deleted(id)
    }

    /// IVF-PQ only: train the coarse centroids and PQ codebooks. A no-op
    /// error for HNSW-backed databases, which never need training.
    pub fn train(&self, samples: &[Vec<f32>]) -> Result<()> {
        let inner = self.inner.read();
        match &inner.index {
            Index::IvfPq(p) => p.train(samples),
            Index::Hnsw(_) => Err(Error::InvalidArgument(
                "train() is only meaningful for an IVF-PQ-backed database".into(),
            )),
        }
    }

    pub fn search(&self, query: &[f32], k: usize, filter: Option<&MetadataFilter>) -> Result<Vec<SearchResult>> {
        if k == 0 {
            return Err(Error::InvalidArgument("k must be greater than zero".into()));
        }
        let inner = self.inner.read();
        if query.len() != inner.dim {
            return Err(Error::DimensionMismatch {
                expected: inner.dim,
                actual: query.len(),
            });
        }
        if filter.is_none() || inner.index.supports_filter_pushdown() {
            return inner.index.search(query, k, filter);
        }
        let mut results = inner.index.search(query, k * 4, None)?;
        if let Some(f) = filter {
            results.retain(|r| r.metadata.as_ref().map(|m| f.matches(m)).unwrap_or(false));
        }
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
        let inner = self.inner.read();
        if query.len() != inner.dim {
            return Err(Error::DimensionMismatch {
                expected: inner.dim,
                actual: query.len(),
            });
        }
        if filter.is_none() || inner.index.supports_filter_pushdown() {
            return inner.index.range_search(query, radius, max_results, filter);
        }
        let mut results = inner.index.range_search(query, radius, max_results * 4, None)?;
        if let Some(f) = filter {
            results.retain(|r| r.metadata.as_ref().map(|m| f.matches(m)).unwrap_or(false));
        }
        results.truncate(max_results);
        Ok(results)
    }

    /// Ids registered under the exact metadata pair `key = value`.
    pub fn query_metadata(&self, key: &str, value: &str) -> Vec<VectorId> {
        self.inner.read().metadata_index.query(key, value).to_vec()
    }

    pub fn get_version(&self, id: VectorId) -> Option<u64> {
        self.inner.read().cond.get_version(id)
    }

    pub fn conditional_update_vector(
        &self,
        id: VectorId,
        vector: Vec<f32>,
        conditions: &[MutationCondition],
    ) -> Result<MutationOutcome> {
        self.inner.write().do_conditional_update_vector(id, vector, conditions)
    }

    pub fn conditional_update_metadata(
        &self,
        id: VectorId,
        metadata: Metadata,
        conditions: &[MutationCondition],
    ) -> Result<MutationOutcome> {
        self.inner.write().do_conditional_update_metadata(id, metadata, conditions)
    }

    pub fn conditional_delete(&self, id: VectorId, conditions: &[MutationCondition]) -> Result<MutationOutcome> {
        self.inner.write().do_conditional_delete(id, conditions)
    }

    /// The idiomatic compare-and-swap: replace `id`'s vector only if its
    /// version still equals `expected_version`.
    pub fn migrate_embedding(&self, id: VectorId, new_vector: Vec<f32>, expected_version: u64) -> Result<MutationOutcome> {
        self.conditional_update_vector(id, new_vector, &[MutationCondition::VersionEq(expected_version)])
    }

    /// Apply every item under a single write-lock acquisition, returning
    /// one outcome per item in the order given.
    pub fn batch_update(&self, items: Vec<ConditionalItem>) -> Result<Vec<MutationOutcome>> {
        let mut inner = self.inner.write();
        items
            .into_iter()
            .map(|item| match item {
                ConditionalItem::UpdateVector { id, vector, conditions } => {
                    inner.do_conditional_update_vector(id, vector, &conditions)
                }
                ConditionalItem::UpdateMetadata { id, metadata, conditions } => {
                    inner.do_conditional_update_metadata(id, metadata, &conditions)
                }
                ConditionalItem::Delete { id, conditions } => inner.do_conditional_delete(id, &conditions),
            })
            .collect()
    }
}

struct SnapshotReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SnapshotReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::CorruptSnapshot("truncated snapshot header".into()));
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hnsw::HnswConfig;
    use tempfile::tempdir;

    fn unit_circle(n: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                let angle = 2.0 * std::f32::consts::PI * (i as f32) / (n as f32);
                vec![angle.cos(), angle.sin()]
            })
            .collect()
    }

    #[test]
    fn fresh_in_memory_insert_and_search_finds_nearest() {
        let db = Database::create_in_memory(3, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
        let id0 = db.add(vec![1.0, 0.0, 0.0]).unwrap();
        db.add(vec![0.0, 1.0, 0.0]).unwrap();
        db.add(vec![0.0, 0.0, 1.0]).unwrap();

        let results = db.search(&[1.0, 0.0, 0.0], 1, None).unwrap();
        assert_eq!(results[0].id, id0);
        assert!(results[0].distance < 1e-6);
    }

    #[test]
    fn insert_ids_are_monotonic_starting_at_zero() {
        let db = Database::create_in_memory(2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
        for expected in 0..5u64 {
            assert_eq!(db.add(vec![expected as f32, 0.0]).unwrap(), expected);
        }
    }

    #[test]
    fn hnsw_unit_circle_nearest_neighbour_matches_seed_scenario() {
        let db = Database::create_in_memory(2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::high_quality())).unwrap();
        for v in unit_circle(100) {
            db.add(v).unwrap();
        }
        let results = db.search(&[1.0, 0.0], 1, None).unwrap();
        assert_eq!(results[0].id, 0);
        assert!(results[0].distance < 1e-5);
    }

    #[test]
    fn metadata_filter_and_inverted_index_agree() {
        let db = Database::create_in_memory(2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
        let mut tag_x = Metadata::new();
        tag_x.set("tag", "x");
        let mut tag_y = Metadata::new();
        tag_y.set("tag", "y");
        db.add_with_metadata(vec![0.0, 0.0], tag_x.clone()).unwrap();
        db.add_with_metadata(vec![1.0, 0.0], tag_y).unwrap();
        db.add_with_metadata(vec![2.0, 0.0], tag_x).unwrap();

        let filter = MetadataFilter::Equals {
            key: "tag".into(),
            value: "x".into(),
        };
        let results = db.search(&[0.0, 0.0], 10, Some(&filter)).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(db.query_metadata("tag", "x"), vec![0, 2]);
    }

    #[test]
    fn save_close_reopen_round_trips_count_and_payloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.gv");
        {
            let db = Database::open(&path, 3, DistanceMetric::Cosine, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
            for i in 0..10u64 {
                db.add(vec![i as f32, 0.0, 1.0]).unwrap();
            }
            db.save().unwrap();
            db.close().unwrap();
        }

        let reopened = Database::open(&path, 3, DistanceMetric::Cosine, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
        assert_eq!(reopened.len(), 10);
        for i in 0..10u64 {
            assert_eq!(reopened.get_vector(i).unwrap(), vec![i as f32, 0.0, 1.0]);
        }
    }

    #[test]
    fn corrupted_snapshot_crc_fails_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.gv");
        {
            let db = Database::open(&path, 2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
            db.add(vec![1.0, 2.0]).unwrap();
            db.add(vec![3.0, 4.0]).unwrap();
            db.add(vec![5.0, 6.0]).unwrap();
            db.save().unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = Database::open(&path, 2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap_err();
        assert!(matches!(err, Error::CorruptSnapshot(_)));
    }

    #[test]
    fn conditional_update_then_repeat_conflicts_then_succeeds_with_new_version() {
        let db = Database::create_in_memory(2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
        let id = db.add(vec![1.0, 1.0]).unwrap();
        assert_eq!(db.get_version(id), Some(0));

        let outcome = db
            .conditional_update_vector(id, vec![2.0, 2.0], &[MutationCondition::VersionEq(0)])
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Ok);
        assert_eq!(db.get_version(id), Some(1));

        // The same now-stale condition must conflict on replay.
        let outcome = db
            .conditional_update_vector(id, vec![3.0, 3.0], &[MutationCondition::VersionEq(0)])
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Conflict);
        assert_eq!(db.get_version(id), Some(1));

        let outcome = db
            .conditional_update_vector(
                id,
                vec![4.0, 4.0],
                &[MutationCondition::VersionEq(1), MutationCondition::NotDeleted],
            )
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Ok);
        assert_eq!(db.get_version(id), Some(2));
        assert_eq!(db.get_vector(id).unwrap(), vec![4.0, 4.0]);
    }

    #[test]
    fn delete_hides_from_search_and_fails_not_deleted_condition() {
        let db = Database::create_in_memory(2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
        let id = db.add(vec![1.0, 1.0]).unwrap();
        db.add(vec![9.0, 9.0]).unwrap();

        db.delete_by_id(id).unwrap();
        let results = db.search(&[1.0, 1.0], 10, None).unwrap();
        assert!(!results.iter().any(|r| r.id == id));

        let outcome = db
            .conditional_update_metadata(id, Metadata::new(), &[MutationCondition::NotDeleted])
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Failed);
    }

    #[test]
    fn wal_replay_reproduces_state_without_explicit_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.gv");
        {
            let db = Database::open(&path, 2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
            db.add(vec![1.0, 2.0]).unwrap();
            db.add(vec![3.0, 4.0]).unwrap();
            db.delete_by_id(0).unwrap();
            // No save(): only the WAL records the writes.
        }

        let reopened = Database::open(&path, 2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.is_deleted(0).unwrap());
        assert_eq!(reopened.get_vector(1).unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn batch_update_applies_each_item_under_one_lock() {
        let db = Database::create_in_memory(2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
        let a = db.add(vec![1.0, 1.0]).unwrap();
        let b = db.add(vec![2.0, 2.0]).unwrap();

        let outcomes = db
            .batch_update(vec![
                ConditionalItem::UpdateVector {
                    id: a,
                    vector: vec![9.0, 9.0],
                    conditions: vec![MutationCondition::VersionEq(0)],
                },
                ConditionalItem::Delete {
                    id: b,
                    conditions: vec![MutationCondition::VersionEq(99)],
                },
            ])
            .unwrap();
        assert_eq!(outcomes[0], MutationOutcome::Ok);
        assert_eq!(outcomes[1], MutationOutcome::Conflict);
        assert_eq!(db.get_vector(a).unwrap(), vec![9.0, 9.0]);
        assert!(!db.is_deleted(b).unwrap());
    }
}
