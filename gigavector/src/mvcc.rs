//! Per-vector version slots and compare-and-swap style conditional mutation.
//!
//! Every vector id owns a monotonic version counter. A write that names a
//! [`MutationCondition`] is only applied if the condition holds against the
//! id's *current* state at the moment the write is serialized by the facade's
//! lock; on success the version increments and an `updated_at` timestamp (in
//! microseconds, supplied by the caller so this module stays free of a wall
//! clock dependency) is recorded.

use crate::vector::Metadata;
use crate::VectorId;
use parking_lot::RwLock;

const COND_INITIAL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    version: u64,
    updated_at: u64,
    occupied: bool,
    deleted: bool,
}

/// A predicate checked against a vector id's current version/metadata/
/// tombstone state before a conditional write is allowed to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationCondition {
    VersionEq(u64),
    VersionLt(u64),
    MetadataEq { key: String, value: String },
    MetadataExists { key: String },
    MetadataNotExists { key: String },
    NotDeleted,
}

/// Result of a conditional mutation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The condition held and the write was applied.
    Ok,
    /// A version predicate (`VersionEq`/`VersionLt`) did not hold.
    Conflict,
    /// A non-version predicate (metadata, `NotDeleted`) did not hold.
    Failed,
    /// The id has never been registered with this manager.
    NotFound,
}

impl MutationCondition {
    fn is_version_predicate(&self) -> bool {
        matches!(self, MutationCondition::VersionEq(_) | MutationCondition::VersionLt(_))
    }
}

/// Dynamic array of version slots indexed by vector id, doubling on demand
/// the way [`crate::hnsw::HnswIndex`]'s node map grows — except here the
/// table is a flat `Vec` rather than a hash map, since ids are dense row
/// indices.
pub struct ConditionalManager {
    slots: RwLock<Vec<Slot>>,
}

impl Default for ConditionalManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionalManager {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::with_capacity(COND_INITIAL_CAPACITY)),
        }
    }

    fn ensure_capacity(slots: &mut Vec<Slot>, id: VectorId) {
        let idx = id as usize;
        if idx >= slots.len() {
            slots.resize(idx + 1, Slot::default());
        }
    }

    /// Register a freshly inserted id at version 0: it becomes 1 only once
    /// the first mutation actually applies.
    pub fn register(&self, id: VectorId, at: u64) {
        let mut slots = self.slots.write();
        Self::ensure_capacity(&mut slots, id);
        slots[id as usize] = Slot {
            version: 0,
            updated_at: at,
            occupied: true,
            deleted: false,
        };
    }

    /// Current version for `id`, or `None` if never registered.
    pub fn get_version(&self, id: VectorId) -> Option<u64> {
        let slots = self.slots.read();
        slots
            .get(id as usize)
            .filter(|s| s.occupied)
            .map(|s| s.version)
    }

    fn condition_holds(
        condition: &MutationCondition,
        slot: &Slot,
        metadata: Option<&Metadata>,
    ) -> bool {
        match condition {
            MutationCondition::VersionEq(v) => slot.version == *v,
            MutationCondition::VersionLt(v) => slot.version < *v,
            MutationCondition::NotDeleted => !slot.deleted,
            MutationCondition::MetadataEq { key, value } => metadata
                .map(|m| m.get(key) == Some(value.as_str()))
                .unwrap_or(false),
            MutationCondition::MetadataExists { key } => {
                metadata.map(|m| m.contains_key(key)).unwrap_or(false)
            }
            MutationCondition::MetadataNotExists { key } => {
                metadata.map(|m| !m.contains_key(key)).unwrap_or(true)
            }
        }
    }

    /// Check `conditions` against `id`'s current state (all must hold), and
    /// if they do, bump the version and return the new value. `metadata` is
    /// whatever the caller currently has on file for `id`, needed to
    /// evaluate metadata-based conditions without this module owning
    /// storage itself.
    pub fn try_mutate(
        &self,
        id: VectorId,
        conditions: &[MutationCondition],
        metadata: Option<&Metadata>,
        at: u64,
    ) -> (MutationOutcome, Option<u64>) {
        let mut slots = self.slots.write();
        let Some(slot) = slots.get(id as usize).copied().filter(|s| s.occupied) else {
            return (MutationOutcome::NotFound, None);
        };

        if let Some(failed) = conditions
            .iter()
            .find(|c| !Self::condition_holds(c, &slot, metadata))
        {
            let outcome = if failed.is_version_predicate() {
                MutationOutcome::Conflict
            } else {
                MutationOutcome::Failed
            };
            return (outcome, Some(slot.version));
        }

        let new_version = slot.version + 1;
        slots[id as usize].version = new_version;
        slots[id as usize].updated_at = at;
        (MutationOutcome::Ok, Some(new_version))
    }

    /// Like [`Self::try_mutate`], but on success also sets the tombstone
    /// flag — the single-lock form `conditional_delete` needs so the
    /// version bump and the delete are atomic with each other.
    pub fn try_delete(
        &self,
        id: VectorId,
        conditions: &[MutationCondition],
        metadata: Option<&Metadata>,
        at: u64,
    ) -> (MutationOutcome, Option<u64>) {
        let mut slots = self.slots.write();
        let Some(slot) = slots.get(id as usize).copied().filter(|s| s.occupied) else {
            return (MutationOutcome::NotFound, None);
        };

        if let Some(failed) = conditions
            .iter()
            .find(|c| !Self::condition_holds(c, &slot, metadata))
        {
            let outcome = if failed.is_version_predicate() {
                MutationOutcome::Conflict
            } else {
                MutationOutcome::Failed
            };
            return (outcome, Some(slot.version));
        }

        let new_version = slot.version + 1;
        slots[id as usize].version = new_version;
        slots[id as usize].updated_at = at;
        slots[id as usize].deleted = true;
        (MutationOutcome::Ok, Some(new_version))
    }

    /// Unconditional mutation bump, used by plain (non-CAS) writes.
    pub fn bump(&self, id: VectorId, at: u64) -> Option<u64> {
        let mut slots = self.slots.write();
        let slot = slots.get_mut(id as usize).filter(|s| s.occupied)?;
        slot.version += 1;
        slot.updated_at = at;
        Some(slot.version)
    }

    pub fn mark_deleted(&self, id: VectorId, at: u64) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(id as usize).filter(|s| s.occupied) {
            slot.deleted = true;
            slot.version += 1;
            slot.updated_at = at;
        }
    }

    pub fn updated_at(&self, id: VectorId) -> Option<u64> {
        let slots = self.slots.read();
        slots
            .get(id as usize)
            .filter(|s| s.occupied)
            .map(|s| s.updated_at)
    }

    /// Apply every `(id, conditions)` pair under a single write-lock
    /// acquisition, returning one outcome per item in order (§4.8 batch
    /// semantics: atomically-visible per item, not all-or-nothing across
    /// the batch).
    pub fn batch_mutate(
        &self,
        items: &[(VectorId, Vec<MutationCondition>, Option<Metadata>)],
        at: u64,
    ) -> Vec<(MutationOutcome, Option<u64>)> {
        let mut slots = self.slots.write();
        items
            .iter()
            .map(|(id, conditions, metadata)| {
                let Some(slot) = slots.get(*id as usize).copied().filter(|s| s.occupied) else {
                    return (MutationOutcome::NotFound, None);
                };
                if let Some(failed) = conditions
                    .iter()
                    .find(|c| !Self::condition_holds(c, &slot, metadata.as_ref()))
                {
                    let outcome = if failed.is_version_predicate() {
                        MutationOutcome::Conflict
                    } else {
                        MutationOutcome::Failed
                    };
                    return (outcome, Some(slot.version));
                }
                let new_version = slot.version + 1;
                slots[*id as usize].version = new_version;
                slots[*id as usize].updated_at = at;
                (MutationOutcome::Ok, Some(new_version))
            })
            .collect()
    }

    /// Convenience wrapper for the common "replace the embedding if the
    /// version is still what the caller last observed" pattern.
    pub fn migrate_embedding(
        &self,
        id: VectorId,
        expected_version: u64,
        at: u64,
    ) -> (MutationOutcome, Option<u64>) {
        self.try_mutate(id, &[MutationCondition::VersionEq(expected_version)], None, at)
    }
}
