//! Fixed-capacity slot bitmap for the region pool.

/// A bitmap tracking which slots of a fixed pool are in use.
///
/// Each bit represents one slot: 0 = free, 1 = allocated. The capacity is
/// fixed at construction; the bitmap never grows.
///
/// Mutation takes `&mut self`: the broker is entered from one thread at a
/// time, so no atomics are needed here.
#[derive(Debug, Clone)]
pub struct SlotBitmap {
    /// 64-bit words, least significant bit first.
    words: Box<[u64]>,
    /// Total number of slots (may be less than words.len() * 64).
    num_slots: usize,
}

impl SlotBitmap {
    /// Create a new bitmap with all slots free.
    pub fn new(num_slots: usize) -> Self {
        let num_words = num_slots.div_ceil(64);
        Self {
            words: vec![0u64; num_words].into_boxed_slice(),
            num_slots,
        }
    }

    /// Claim the lowest free slot.
    ///
    /// Returns `None` if every slot is allocated.
    pub fn acquire_slot(&mut self) -> Option<usize> {
        for (word_idx, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }

            let bit_idx = (!*word).trailing_zeros() as usize;
            let slot_idx = word_idx * 64 + bit_idx;
            if slot_idx >= self.num_slots {
                return None;
            }

            *word |= 1u64 << bit_idx;
            return Some(slot_idx);
        }

        None
    }

    /// Return a slot to the pool.
    ///
    /// # Panics
    ///
    /// Panics if `slot_idx` is out of bounds or the slot is already free.
    pub fn release_slot(&mut self, slot_idx: usize) {
        assert!(slot_idx < self.num_slots, "slot index out of bounds");
        let (word_idx, mask) = Self::locate(slot_idx);
        assert!(
            self.words[word_idx] & mask != 0,
            "slot {slot_idx} released twice"
        );
        self.words[word_idx] &= !mask;
    }

    /// Check if a slot is currently allocated.
    pub fn is_allocated(&self, slot_idx: usize) -> bool {
        if slot_idx >= self.num_slots {
            return false;
        }
        let (word_idx, mask) = Self::locate(slot_idx);
        self.words[word_idx] & mask != 0
    }

    /// Number of allocated slots.
    pub fn count_allocated(&self) -> usize {
        // Bits past num_slots are never set, so a plain popcount is exact.
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Number of free slots.
    pub fn count_free(&self) -> usize {
        self.num_slots - self.count_allocated()
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.num_slots
    }

    fn locate(slot_idx: usize) -> (usize, u64) {
        (slot_idx / 64, 1u64 << (slot_idx % 64))
    }
}
