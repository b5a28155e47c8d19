//! Bounded, gap-free directory of live instances.

use super::InstanceId;
use crate::error::{Error, Result};

/// Live instances in attach order.
///
/// Removal shifts later entries down so the directory never has holes;
/// the first entry is what legacy single-instance callers see.
#[derive(Debug, Clone)]
pub struct InstanceDirectory {
    entries: Vec<InstanceId>,
    capacity: usize,
}

impl InstanceDirectory {
    /// Create an empty directory holding at most `capacity` instances.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `id`.
    ///
    /// # Errors
    ///
    /// [`Error::DirectoryFull`] at capacity, [`Error::AlreadyAttached`] if
    /// `id` is already present.
    pub fn insert(&mut self, id: InstanceId) -> Result<()> {
        self.check_insert(id)?;
        self.entries.push(id);
        Ok(())
    }

    /// Append `id` after a successful [`check_insert`](Self::check_insert).
    pub(crate) fn push_checked(&mut self, id: InstanceId) {
        debug_assert!(self.check_insert(id).is_ok());
        self.entries.push(id);
    }

    /// Check that [`insert`](Self::insert) would succeed.
    pub fn check_insert(&self, id: InstanceId) -> Result<()> {
        if self.contains(id) {
            return Err(Error::AlreadyAttached(id));
        }
        if self.is_full() {
            return Err(Error::DirectoryFull {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Remove `id`, compacting the remaining entries.
    pub fn remove(&mut self, id: InstanceId) -> Result<()> {
        let pos = self
            .entries
            .iter()
            .position(|&e| e == id)
            .ok_or(Error::UnknownInstance(id))?;
        self.entries.remove(pos);
        Ok(())
    }

    /// Whether `id` is present.
    pub fn contains(&self, id: InstanceId) -> bool {
        self.entries.contains(&id)
    }

    /// Entries in attach order.
    pub fn as_slice(&self) -> &[InstanceId] {
        &self.entries
    }

    /// First live instance.
    pub fn first(&self) -> Option<InstanceId> {
        self.entries.first().copied()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the directory is at capacity.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
