//! Columnar primary store: a contiguous float buffer, a parallel metadata
//! array, and a parallel tombstone array, all indexed by row (= vector id).
//!
//! Rows are append-only. Deletes set a tombstone bit rather than shrinking
//! any array, so a [`VectorId`] is always a valid row index for the
//! lifetime of the store — callers check [`VectorStorage::is_deleted`]
//! before trusting a row.

use crate::vector::Metadata;
use crate::{Error, Result, VectorId};

const INITIAL_CAPACITY: usize = 1024;

/// Append-only columnar storage for `dim`-dimensional vectors.
pub struct VectorStorage {
    dim: usize,
    data: Vec<f32>,
    metadata: Vec<Metadata>,
    deleted: Vec<bool>,
    len: usize,
}

impl VectorStorage {
    pub fn new(dim: usize) -> Self {
        Self::with_capacity(dim, INITIAL_CAPACITY)
    }

    pub fn with_capacity(dim: usize, capacity: usize) -> Self {
        Self {
            dim,
            data: Vec::with_capacity(dim * capacity),
            metadata: Vec::with_capacity(capacity),
            deleted: Vec::with_capacity(capacity),
            len: 0,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of rows, live and tombstoned.
    pub fn count(&self) -> usize {
        self.len
    }

    /// Number of rows currently allocated without a reallocation.
    pub fn capacity(&self) -> usize {
        self.deleted.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a new row, returning its id. The row index doubles as the id
    /// (§3: "A vector id equals its row index").
    pub fn add(&mut self, values: &[f32], metadata: Metadata) -> Result<VectorId> {
        if values.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: values.len(),
            });
        }
        let id = self.len as VectorId;
        self.data.extend_from_slice(values);
        self.metadata.push(metadata);
        self.deleted.push(false);
        self.len += 1;
        Ok(id)
    }

    fn check_bounds(&self, id: VectorId) -> Result<usize> {
        let idx = id as usize;
        if idx >= self.len {
            return Err(Error::OutOfRange(id));
        }
        Ok(idx)
    }

    /// A view of the raw vector data for `id`, regardless of tombstone state.
    pub fn get_view(&self, id: VectorId) -> Result<&[f32]> {
        let idx = self.check_bounds(id)?;
        Ok(&self.data[idx * self.dim..(idx + 1) * self.dim])
    }

    pub fn get_metadata(&self, id: VectorId) -> Result<&Metadata> {
        let idx = self.check_bounds(id)?;
        Ok(&self.metadata[idx])
    }

    /// Overwrite the vector data for `id` in place. Does not touch the
    /// tombstone bit or metadata.
    pub fn update_data(&mut self, id: VectorId, values: &[f32]) -> Result<()> {
        if values.len() != self.dim {
            return Err(Error::DimensionMismatch {
                expected: self.dim,
                actual: values.len(),
            });
        }
        let idx = self.check_bounds(id)?;
        self.data[idx * self.dim..(idx + 1) * self.dim].copy_from_slice(values);
        Ok(())
    }

    pub fn update_metadata(&mut self, id: VectorId, metadata: Metadata) -> Result<Metadata> {
        let idx = self.check_bounds(id)?;
        Ok(std::mem::replace(&mut self.metadata[idx], metadata))
    }

    /// Mark a row deleted. Idempotent: deleting an already-deleted row is
    /// not an error (§3 lifecycle: tombstones never revert).
    pub fn mark_deleted(&mut self, id: VectorId) -> Result<()> {
        let idx = self.check_bounds(id)?;
        self.deleted[idx] = true;
        Ok(())
    }

    pub fn is_deleted(&self, id: VectorId) -> Result<bool> {
        let idx = self.check_bounds(id)?;
        Ok(self.deleted[idx])
    }

    /// Iterate over `(id, data, metadata)` for every row that is not
    /// tombstoned, in row order.
    pub fn iter_live(&self) -> impl Iterator<Item = (VectorId, &[f32], &Metadata)> {
        (0..self.len).filter_map(move |idx| {
            if self.deleted[idx] {
                None
            } else {
                Some((
                    idx as VectorId,
                    &self.data[idx * self.dim..(idx + 1) * self.dim],
                    &self.metadata[idx],
                ))
            }
        })
    }

    /// Number of rows that are not tombstoned.
    pub fn live_count(&self) -> usize {
        self.deleted.iter().filter(|d| !**d).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_assigns_ids_in_row_order() {
        let mut s = VectorStorage::new(2);
        let a = s.add(&[1.0, 2.0], Metadata::new()).unwrap();
        let b = s.add(&[3.0, 4.0], Metadata::new()).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(s.count(), 2);
    }

    #[test]
    fn add_rejects_dimension_mismatch() {
        let mut s = VectorStorage::new(3);
        let err = s.add(&[1.0, 2.0], Metadata::new()).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn get_view_out_of_range_errors() {
        let s = VectorStorage::new(2);
        let err = s.get_view(0).unwrap_err();
        assert!(matches!(err, Error::OutOfRange(0)));
    }

    #[test]
    fn mark_deleted_is_idempotent_and_excludes_from_iter_live() {
        let mut s = VectorStorage::new(2);
        let id = s.add(&[1.0, 2.0], Metadata::new()).unwrap();
        s.add(&[3.0, 4.0], Metadata::new()).unwrap();

        s.mark_deleted(id).unwrap();
        s.mark_deleted(id).unwrap(); // idempotent

        assert!(s.is_deleted(id).unwrap());
        assert_eq!(s.count(), 2); // row still counted
        assert_eq!(s.live_count(), 1);
        let live_ids: Vec<_> = s.iter_live().map(|(id, _, _)| id).collect();
        assert_eq!(live_ids, vec![1]);
    }

    #[test]
    fn update_data_overwrites_in_place_without_reassigning_id() {
        let mut s = VectorStorage::new(2);
        let id = s.add(&[1.0, 2.0], Metadata::new()).unwrap();
        s.update_data(id, &[9.0, 9.0]).unwrap();
        assert_eq!(s.get_view(id).unwrap(), &[9.0, 9.0]);
        assert_eq!(s.count(), 1);
    }

    #[test]
    fn update_metadata_returns_previous_value() {
        let mut s = VectorStorage::new(1);
        let id = s.add(&[1.0], Metadata::new()).unwrap();
        let mut new_meta = Metadata::new();
        new_meta.set("k", "v");
        let prev = s.update_metadata(id, new_meta).unwrap();
        assert!(prev.is_empty());
        assert_eq!(s.get_metadata(id).unwrap().get("k"), Some("v"));
    }
}
