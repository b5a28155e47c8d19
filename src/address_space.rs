//! Guest physical address space collaborator.
//!
//! The broker never touches the guest's memory map directly. It hands each
//! host mapping to a [`GuestAddressSpace`], exactly once when a region is
//! created and exactly once when it is destroyed.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::ptr::NonNull;

/// Accepts and removes host-backed subregions of the guest address space.
pub trait GuestAddressSpace {
    /// Map `size` bytes of host memory at `host` into the guest at `guest_address`.
    fn map_region(
        &mut self,
        host: NonNull<u8>,
        guest_address: u64,
        size: u64,
        label: &str,
    ) -> Result<()>;

    /// Remove the subregion previously mapped at `guest_address`.
    fn unmap_region(&mut self, guest_address: u64, size: u64);
}

impl<T: GuestAddressSpace + ?Sized> GuestAddressSpace for Box<T> {
    fn map_region(
        &mut self,
        host: NonNull<u8>,
        guest_address: u64,
        size: u64,
        label: &str,
    ) -> Result<()> {
        (**self).map_region(host, guest_address, size, label)
    }

    fn unmap_region(&mut self, guest_address: u64, size: u64) {
        (**self).unmap_region(guest_address, size)
    }
}

/// A subregion as seen by [`RecordingAddressSpace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedWindow {
    /// Guest physical address.
    pub guest_address: u64,
    /// Length in bytes.
    pub size: u64,
    /// Label given at map time.
    pub label: String,
    /// Host virtual address backing the window.
    pub host_address: usize,
}

impl MappedWindow {
    fn last(&self) -> u64 {
        self.guest_address + (self.size - 1)
    }
}

/// Address space that only records what is mapped.
///
/// Useful when the broker runs headless (no real guest) and in tests. It
/// refuses overlapping subregions, like a flat memory map would.
#[derive(Debug, Default)]
pub struct RecordingAddressSpace {
    windows: BTreeMap<u64, MappedWindow>,
    map_calls: usize,
    unmap_calls: usize,
}

impl RecordingAddressSpace {
    /// Create an empty address space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently mapped windows, ordered by guest address.
    pub fn windows(&self) -> impl Iterator<Item = &MappedWindow> {
        self.windows.values()
    }

    /// Window mapped at exactly `guest_address`.
    pub fn window_at(&self, guest_address: u64) -> Option<&MappedWindow> {
        self.windows.get(&guest_address)
    }

    /// Whether a window starts at `guest_address`.
    pub fn is_mapped(&self, guest_address: u64) -> bool {
        self.windows.contains_key(&guest_address)
    }

    /// Number of live windows.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Total `map_region` calls accepted so far.
    pub fn map_calls(&self) -> usize {
        self.map_calls
    }

    /// Total `unmap_region` calls so far.
    pub fn unmap_calls(&self) -> usize {
        self.unmap_calls
    }
}

impl GuestAddressSpace for RecordingAddressSpace {
    fn map_region(
        &mut self,
        host: NonNull<u8>,
        guest_address: u64,
        size: u64,
        label: &str,
    ) -> Result<()> {
        let refuse = |reason: String| Error::GuestMapping {
            address: guest_address,
            size,
            reason,
        };

        if size == 0 {
            return Err(refuse("empty window".into()));
        }
        let last = guest_address
            .checked_add(size - 1)
            .ok_or_else(|| refuse("window wraps the address space".into()))?;

        // Only the closest window starting at or below `last` can overlap.
        if let Some(existing) = self.windows.range(..=last).next_back().map(|(_, w)| w) {
            if existing.last() >= guest_address {
                return Err(refuse(format!(
                    "overlaps `{}` at {:#x}+{:#x}",
                    existing.label, existing.guest_address, existing.size
                )));
            }
        }

        self.windows.insert(
            guest_address,
            MappedWindow {
                guest_address,
                size,
                label: label.to_string(),
                host_address: host.as_ptr() as usize,
            },
        );
        self.map_calls += 1;
        Ok(())
    }

    fn unmap_region(&mut self, guest_address: u64, size: u64) {
        self.unmap_calls += 1;
        match self.windows.remove(&guest_address) {
            Some(window) if window.size == size => {}
            Some(window) => tracing::warn!(
                guest_address,
                size,
                mapped_size = window.size,
                "unmapped window with mismatched size"
            ),
            None => tracing::warn!(guest_address, size, "unmap of window that is not mapped"),
        }
    }
}
