//! Region registry: deduplicated, reference-counted guest windows.
//!
//! A region is identified by its [`RegionKey`] tuple `(name, guest address,
//! size, reserved size)`. Requests for an existing tuple share the region
//! and bump its reference count; requests whose range overlaps a live
//! region with a different tuple are rejected before anything is touched.
//!
//! The pool has a fixed number of slots. A [`RegionId`] is a slot index
//! plus the generation the slot had when the region was created, so an id
//! kept past teardown is refused even after its slot has been reused.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut registry = RegionRegistry::new(16, acquirer, RecordingAddressSpace::new(), "goldfish_xtsc");
//!
//! let a = registry.acquire(RegionKey::new("ram", 0xf000_0000, 0x1000, 0))?;
//! let b = registry.acquire(RegionKey::new("ram", 0xf000_0000, 0x1000, 0))?;
//! assert_eq!(a, b);
//! assert_eq!(registry.get(a).unwrap().ref_count(), 2);
//! ```

use crate::acquirer::SegmentAcquirer;
use crate::address_space::GuestAddressSpace;
use crate::error::{Error, Result};
use crate::memory::{SharedMemorySegment, SlotBitmap};
use crate::observability::{record_regions_live, record_segment_mapped, record_segment_unmapped};
use std::fmt;
use std::ptr::NonNull;

/// Handle to a live region: slot index and slot generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId {
    slot: usize,
    generation: u64,
}

impl RegionId {
    /// Slot index in the pool.
    pub fn index(self) -> usize {
        self.slot
    }

    /// How many times the slot had been filled when this id was issued.
    pub fn generation(self) -> u64 {
        self.generation
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {} gen {}", self.slot, self.generation)
    }
}

/// Identity of a region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionKey {
    /// Base name of the backing host object (before token suffixing).
    pub name: String,
    /// Guest physical address of the window.
    pub guest_address: u64,
    /// Length of the window in bytes.
    pub size: u64,
    /// Length of the reserved (communication) sub-window.
    pub reserved_size: u64,
}

impl RegionKey {
    /// Build a key.
    pub fn new(name: impl Into<String>, guest_address: u64, size: u64, reserved_size: u64) -> Self {
        Self {
            name: name.into(),
            guest_address,
            size,
            reserved_size,
        }
    }

    /// Check the layout constraints that do not depend on other regions.
    ///
    /// # Errors
    ///
    /// Zero or unmappable size, `reserved_size > size`, or a window that
    /// runs past the top of the address space.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::InvalidSize {
                size: 0,
                reason: "size must be greater than 0",
            });
        }
        if usize::try_from(self.size).is_err() {
            return Err(Error::InvalidSize {
                size: self.size,
                reason: "size does not fit the host address space",
            });
        }
        if self.reserved_size > self.size {
            return Err(Error::ReservedExceedsSize {
                reserved_size: self.reserved_size,
                size: self.size,
            });
        }
        if self.last_address().is_none() {
            return Err(Error::AddressWrap {
                address: self.guest_address,
                size: self.size,
            });
        }
        Ok(())
    }

    /// Address of the last byte of the window, `None` if it wraps.
    pub fn last_address(&self) -> Option<u64> {
        self.guest_address.checked_add(self.size.checked_sub(1)?)
    }

    /// Whether the two windows share at least one byte.
    ///
    /// Both keys must have passed [`validate`](Self::validate).
    pub fn overlaps(&self, other: &RegionKey) -> bool {
        match (self.last_address(), other.last_address()) {
            (Some(last), Some(other_last)) => {
                self.guest_address <= other_last && other.guest_address <= last
            }
            _ => false,
        }
    }
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` at {:#x}+{:#x} (reserved {:#x})",
            self.name, self.guest_address, self.size, self.reserved_size
        )
    }
}

/// A live region: its identity, host mapping and reference count.
#[derive(Debug)]
pub struct SharedMemoryRegion {
    key: RegionKey,
    segment: SharedMemorySegment,
    ref_count: usize,
    generation: u64,
}

impl SharedMemoryRegion {
    /// The region's identity.
    pub fn key(&self) -> &RegionKey {
        &self.key
    }

    /// Base name of the backing object.
    pub fn name(&self) -> &str {
        &self.key.name
    }

    /// Effective object name the segment was opened under.
    pub fn object_name(&self) -> &str {
        self.segment.name()
    }

    /// Guest physical address.
    pub fn guest_address(&self) -> u64 {
        self.key.guest_address
    }

    /// Length in bytes.
    pub fn size(&self) -> u64 {
        self.key.size
    }

    /// Reserved sub-window length.
    pub fn reserved_size(&self) -> u64 {
        self.key.reserved_size
    }

    /// Number of device instances bound to this region.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Start of the host mapping.
    pub fn host_ptr(&self) -> NonNull<u8> {
        self.segment.as_ptr()
    }

    /// The host mapping.
    pub fn segment(&self) -> &SharedMemorySegment {
        &self.segment
    }
}

/// Fixed-capacity pool of reference-counted regions.
pub struct RegionRegistry<A> {
    slots: Vec<Option<SharedMemoryRegion>>,
    // Bumped each time the slot is filled.
    generations: Vec<u64>,
    used: SlotBitmap,
    acquirer: SegmentAcquirer,
    address_space: A,
    label: String,
}

impl<A: GuestAddressSpace> RegionRegistry<A> {
    /// Create an empty registry with `capacity` slots.
    pub fn new(
        capacity: usize,
        acquirer: SegmentAcquirer,
        address_space: A,
        label: impl Into<String>,
    ) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            generations: vec![0; capacity],
            used: SlotBitmap::new(capacity),
            acquirer,
            address_space,
            label: label.into(),
        }
    }

    /// Look up the live region for `key`.
    ///
    /// Returns the region whose tuple matches exactly, or `None` when no
    /// live region touches the requested range.
    ///
    /// # Errors
    ///
    /// [`Error::Overlap`] if the range overlaps a live region with a
    /// different tuple.
    pub fn find_existing(&self, key: &RegionKey) -> Result<Option<RegionId>> {
        for (id, region) in self.regions() {
            if region.key == *key {
                return Ok(Some(id));
            }
            if region.key.overlaps(key) {
                return Err(Error::Overlap {
                    name: key.name.clone(),
                    address: key.guest_address,
                    size: key.size,
                    existing_name: region.key.name.clone(),
                    existing_address: region.key.guest_address,
                    existing_size: region.key.size,
                });
            }
        }
        Ok(None)
    }

    /// Take a reference on the region for `key`, creating it if needed.
    ///
    /// Creating opens the backing object (waiting for the producer), maps
    /// it on the host and then into the guest. On any error the registry
    /// is left exactly as it was.
    pub fn acquire(&mut self, key: RegionKey) -> Result<RegionId> {
        key.validate()?;

        if let Some(id) = self.find_existing(&key)? {
            let region = self.slot_mut(id)?;
            region.ref_count += 1;
            tracing::debug!(region = %key, ref_count = region.ref_count, "region shared");
            return Ok(id);
        }

        let capacity = self.capacity();
        let slot = self
            .used
            .acquire_slot()
            .ok_or(Error::RegionPoolExhausted { capacity })?;

        match self.materialize(&key) {
            Ok(segment) => {
                tracing::info!(
                    region = %key,
                    object = %segment.name(),
                    slot,
                    "region mapped"
                );
                record_segment_mapped(segment.name(), key.size);
                self.generations[slot] += 1;
                let generation = self.generations[slot];
                self.slots[slot] = Some(SharedMemoryRegion {
                    key,
                    segment,
                    ref_count: 1,
                    generation,
                });
                record_regions_live(self.len());
                Ok(RegionId { slot, generation })
            }
            Err(e) => {
                self.used.release_slot(slot);
                Err(e)
            }
        }
    }

    /// Open and map the backing memory, then expose it to the guest.
    fn materialize(&mut self, key: &RegionKey) -> Result<SharedMemorySegment> {
        // `validate` guarantees the size fits usize.
        let segment = self.acquirer.acquire(&key.name, key.size as usize)?;
        self.address_space
            .map_region(segment.as_ptr(), key.guest_address, key.size, &self.label)?;
        Ok(segment)
    }

    /// Drop one reference; tear the region down when it was the last.
    ///
    /// Returns the remaining reference count.
    pub fn release(&mut self, id: RegionId) -> Result<usize> {
        let region = self.slot_mut(id)?;
        region.ref_count -= 1;
        let remaining = region.ref_count;

        if remaining > 0 {
            tracing::debug!(region = %region.key, ref_count = remaining, "region released");
            return Ok(remaining);
        }

        let region = self.slots[id.slot].take().ok_or(Error::UnknownRegion(id))?;
        self.address_space
            .unmap_region(region.key.guest_address, region.key.size);
        self.used.release_slot(id.slot);

        tracing::info!(region = %region.key, slot = id.slot, "region unmapped");
        record_segment_unmapped(region.segment.name());
        record_regions_live(self.len());
        // Dropping the region unmaps the host segment.
        drop(region);
        Ok(0)
    }

    /// The live region in slot `id`.
    pub fn get(&self, id: RegionId) -> Option<&SharedMemoryRegion> {
        self.slots
            .get(id.slot)?
            .as_ref()
            .filter(|region| region.generation == id.generation)
    }

    /// Live regions with their ids, in slot order.
    pub fn regions(&self) -> impl Iterator<Item = (RegionId, &SharedMemoryRegion)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, region)| {
                region.as_ref().map(|region| {
                    let id = RegionId {
                        slot,
                        generation: region.generation,
                    };
                    (id, region)
                })
            })
    }

    /// Number of live regions.
    pub fn len(&self) -> usize {
        self.used.count_allocated()
    }

    /// Whether no region is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.used.capacity()
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.used.count_free()
    }

    /// Label used for guest mappings.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The guest address space collaborator.
    pub fn address_space(&self) -> &A {
        &self.address_space
    }

    /// Mutable access to the guest address space collaborator.
    pub fn address_space_mut(&mut self) -> &mut A {
        &mut self.address_space
    }

    /// The segment acquirer.
    pub fn acquirer(&self) -> &SegmentAcquirer {
        &self.acquirer
    }

    fn slot_mut(&mut self, id: RegionId) -> Result<&mut SharedMemoryRegion> {
        self.slots
            .get_mut(id.slot)
            .and_then(Option::as_mut)
            .filter(|region| region.generation == id.generation)
            .ok_or(Error::UnknownRegion(id))
    }
}

impl<A> fmt::Debug for RegionRegistry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionRegistry")
            .field("capacity", &self.slots.len())
            .field("used", &self.used.count_allocated())
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquirer::{MemfdDirectory, RendezvousConfig, TokenSource};
    use crate::address_space::RecordingAddressSpace;
    use crate::error::ErrorKind;
    use std::time::Duration;

    const BASE: u64 = 0xf000_0000;

    fn registry(capacity: usize, directory: &MemfdDirectory) -> RegionRegistry<RecordingAddressSpace> {
        let config = RendezvousConfig::default()
            .with_token(TokenSource::None)
            .with_attempts(2)
            .with_interval(Duration::ZERO);
        let acquirer = SegmentAcquirer::with_opener(config, directory.clone())
            .with_sleeper(|_d: Duration| {});
        RegionRegistry::new(capacity, acquirer, RecordingAddressSpace::new(), "goldfish_xtsc")
    }

    fn published(names: &[&str]) -> MemfdDirectory {
        let directory = MemfdDirectory::new();
        for name in names {
            directory.publish(name, 0).unwrap();
        }
        directory
    }

    #[test]
    fn test_key_validation() {
        assert!(RegionKey::new("ram", BASE, 0x1000, 0x1000).validate().is_ok());
        assert!(matches!(
            RegionKey::new("ram", BASE, 0x1000, 0x1001).validate(),
            Err(Error::ReservedExceedsSize { .. })
        ));
        assert!(matches!(
            RegionKey::new("ram", u64::MAX - 0xfff, 0x2000, 0).validate(),
            Err(Error::AddressWrap { .. })
        ));
        assert!(RegionKey::new("ram", u64::MAX - 0xfff, 0x1000, 0).validate().is_ok());
        assert!(matches!(
            RegionKey::new("ram", BASE, 0, 0).validate(),
            Err(Error::InvalidSize { size: 0, .. })
        ));
    }

    #[test]
    fn test_key_overlap() {
        let a = RegionKey::new("a", 0x1000, 0x1000, 0);
        assert!(a.overlaps(&RegionKey::new("b", 0x1fff, 0x10, 0)));
        assert!(a.overlaps(&RegionKey::new("b", 0x0, 0x1001, 0)));
        assert!(!a.overlaps(&RegionKey::new("b", 0x2000, 0x10, 0)));
        assert!(!a.overlaps(&RegionKey::new("b", 0x0, 0x1000, 0)));
    }

    #[test]
    fn test_identical_requests_share_one_mapping() {
        let directory = published(&["ram"]);
        let mut registry = registry(4, &directory);
        let key = RegionKey::new("ram", BASE, 0x1000, 0);

        let first = registry.acquire(key.clone()).unwrap();
        let second = registry.acquire(key.clone()).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.get(first).unwrap().ref_count(), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.address_space().map_calls(), 1);

        assert_eq!(registry.release(first).unwrap(), 1);
        assert!(registry.address_space().is_mapped(BASE));
        assert_eq!(registry.release(first).unwrap(), 0);
        assert!(!registry.address_space().is_mapped(BASE));
        assert_eq!(registry.address_space().unmap_calls(), 1);
        assert!(registry.is_empty());
        assert_eq!(registry.available(), 4);
    }

    #[test]
    fn test_overlap_rejected_without_mutation() {
        let directory = published(&["ram"]);
        let mut registry = registry(4, &directory);
        let id = registry.acquire(RegionKey::new("ram", BASE, 0x1000, 0)).unwrap();

        let err = registry
            .acquire(RegionKey::new("ram", BASE + 0x800, 0x1000, 0))
            .unwrap_err();
        assert!(matches!(err, Error::Overlap { existing_address: BASE, .. }));
        assert_eq!(err.kind(), ErrorKind::ConfigurationConflict);

        assert_eq!(registry.get(id).unwrap().ref_count(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.address_space().map_calls(), 1);
    }

    #[test]
    fn test_same_range_different_tuple_is_overlap() {
        let directory = published(&["ram", "other"]);
        let mut registry = registry(4, &directory);
        registry.acquire(RegionKey::new("ram", BASE, 0x1000, 0)).unwrap();

        assert!(matches!(
            registry.acquire(RegionKey::new("ram", BASE, 0x1000, 0x100)),
            Err(Error::Overlap { .. })
        ));
        assert!(matches!(
            registry.acquire(RegionKey::new("other", BASE, 0x1000, 0)),
            Err(Error::Overlap { .. })
        ));
    }

    #[test]
    fn test_invalid_key_touches_nothing() {
        // Nothing published: reaching the acquirer would time out instead
        let directory = MemfdDirectory::new();
        let mut registry = registry(4, &directory);

        let err = registry
            .acquire(RegionKey::new("ram", BASE, 0x1000, 0x2000))
            .unwrap_err();
        assert!(matches!(err, Error::ReservedExceedsSize { .. }));
        assert_eq!(registry.available(), 4);
        assert_eq!(registry.address_space().map_calls(), 0);
    }

    #[test]
    fn test_pool_exhaustion() {
        let directory = published(&["a", "b", "c"]);
        let mut registry = registry(2, &directory);

        registry.acquire(RegionKey::new("a", 0x1000, 0x1000, 0)).unwrap();
        registry.acquire(RegionKey::new("b", 0x2000, 0x1000, 0)).unwrap();
        let err = registry
            .acquire(RegionKey::new("c", 0x3000, 0x1000, 0))
            .unwrap_err();
        assert!(matches!(err, Error::RegionPoolExhausted { capacity: 2 }));
        assert_eq!(err.kind(), ErrorKind::CapacityExhausted);

        // Sharing an existing region still works at capacity
        registry.acquire(RegionKey::new("a", 0x1000, 0x1000, 0)).unwrap();
    }

    #[test]
    fn test_rendezvous_failure_frees_slot() {
        let directory = MemfdDirectory::new();
        let mut registry = registry(1, &directory);

        let err = registry
            .acquire(RegionKey::new("absent", BASE, 0x1000, 0))
            .unwrap_err();
        assert!(matches!(err, Error::RendezvousTimeout { attempts: 2, .. }));
        assert_eq!(registry.available(), 1);
        assert!(registry.address_space().is_empty());
    }

    #[test]
    fn test_guest_mapping_failure_frees_slot() {
        let directory = published(&["ram"]);
        let mut registry = registry(2, &directory);

        // Occupy the guest range behind the registry's back
        registry
            .address_space_mut()
            .map_region(NonNull::dangling(), BASE, 0x1000, "rom")
            .unwrap();

        let err = registry
            .acquire(RegionKey::new("ram", BASE, 0x1000, 0))
            .unwrap_err();
        assert!(matches!(err, Error::GuestMapping { .. }));
        assert!(registry.is_empty());
        assert_eq!(registry.available(), 2);
    }

    #[test]
    fn test_release_unknown_region() {
        let directory = published(&["ram"]);
        let mut registry = registry(2, &directory);
        let id = registry.acquire(RegionKey::new("ram", BASE, 0x1000, 0)).unwrap();
        registry.release(id).unwrap();

        let err = registry.release(id).unwrap_err();
        assert!(matches!(err, Error::UnknownRegion(_)));
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert!(matches!(
            registry.release(RegionId {
                slot: 99,
                generation: 1
            }),
            Err(Error::UnknownRegion(_))
        ));
    }

    #[test]
    fn test_slot_reused_after_teardown() {
        let directory = published(&["a", "b"]);
        let mut registry = registry(1, &directory);

        let a = registry.acquire(RegionKey::new("a", 0x1000, 0x1000, 0)).unwrap();
        registry.release(a).unwrap();
        let b = registry.acquire(RegionKey::new("b", 0x1000, 0x2000, 0)).unwrap();
        assert_eq!(b.index(), a.index());
        assert_ne!(b, a);
        assert_eq!(registry.get(b).unwrap().name(), "b");
        assert_eq!(registry.get(b).unwrap().size(), 0x2000);
    }

    #[test]
    fn test_stale_id_cannot_release_reused_slot() {
        let directory = published(&["a", "b"]);
        let mut registry = registry(1, &directory);

        let a = registry.acquire(RegionKey::new("a", 0x1000, 0x1000, 0)).unwrap();
        registry.release(a).unwrap();
        let b = registry.acquire(RegionKey::new("b", 0x8000, 0x1000, 0)).unwrap();
        assert_eq!(a.index(), b.index());

        let err = registry.release(a).unwrap_err();
        assert!(matches!(err, Error::UnknownRegion(id) if id == a));
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert!(registry.get(a).is_none());

        let region = registry.get(b).unwrap();
        assert_eq!(region.ref_count(), 1);
        assert_eq!(region.name(), "b");
        assert!(registry.address_space().is_mapped(0x8000));
        assert_eq!(registry.address_space().unmap_calls(), 1);
    }

    #[test]
    fn test_host_mapping_sized_to_region() {
        let directory = published(&["ram"]);
        let mut registry = registry(1, &directory);
        let id = registry.acquire(RegionKey::new("ram", BASE, 0x3000, 0x1000)).unwrap();

        let region = registry.get(id).unwrap();
        assert_eq!(region.segment().len(), 0x3000);
        assert_eq!(region.object_name(), "ram");
        let window = registry.address_space().window_at(BASE).unwrap();
        assert_eq!(window.host_address, region.host_ptr().as_ptr() as usize);
        assert_eq!(window.label, "goldfish_xtsc");
    }
}
