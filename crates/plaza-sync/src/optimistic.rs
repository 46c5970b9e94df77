//! Snapshot / apply / confirm-or-revert for user-initiated writes.
//!
//! 1. [`Snapshot::begin`] the write: bump the field and capture it before mutating.
//! 2. Apply the optimistic value locally.
//! 3. Issue the write.
//! 4. On success store the server's value and [`Revisions::bump`] the field.
//!    On failure call [`Snapshot::rollback`]: if any authoritative value for the
//!    field landed in the meantime it wins and nothing is restored. A later
//!    optimistic write on the same field counts as newer too.

use std::collections::HashMap;

use uuid::Uuid;

/// Fields that take optimistic writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Votes,
    Following,
    Membership,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldKey {
    pub entity: Uuid,
    pub field: Field,
}

impl FieldKey {
    pub fn new(entity: Uuid, field: Field) -> Self {
        Self { entity, field }
    }
}

/// Per-field counters, bumped whenever an authoritative value lands
/// (push event, pulled snapshot, or confirmed write).
#[derive(Debug, Default)]
pub struct Revisions {
    map: HashMap<FieldKey, u64>,
}

impl Revisions {
    pub fn current(&self, key: FieldKey) -> u64 {
        self.map.get(&key).copied().unwrap_or(0)
    }

    pub fn bump(&mut self, key: FieldKey) {
        *self.map.entry(key).or_insert(0) += 1;
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rollback<T> {
    /// Nothing newer arrived: put this value back.
    Restore(T),
    /// A newer authoritative value arrived; keep what is there.
    Superseded,
}

/// Pre-mutation value of one field plus the revision it was read at.
#[derive(Debug, Clone)]
#[must_use = "a snapshot must be resolved by rollback or dropped on success"]
pub struct Snapshot<T> {
    key: FieldKey,
    before: T,
    revision: u64,
}

impl<T> Snapshot<T> {
    pub fn capture(revisions: &Revisions, key: FieldKey, before: T) -> Self {
        Self {
            key,
            before,
            revision: revisions.current(key),
        }
    }

    /// Start an optimistic write. Earlier writes on the same field still in
    /// flight can no longer restore over this one.
    pub fn begin(revisions: &mut Revisions, key: FieldKey, before: T) -> Self {
        revisions.bump(key);
        Self::capture(revisions, key, before)
    }

    pub fn key(&self) -> FieldKey {
        self.key
    }

    pub fn before(&self) -> &T {
        &self.before
    }

    pub fn rollback(self, revisions: &Revisions) -> Rollback<T> {
        if revisions.current(self.key) != self.revision {
            Rollback::Superseded
        } else {
            Rollback::Restore(self.before)
        }
    }
}
