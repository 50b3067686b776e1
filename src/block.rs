//! A typed view over the fixed block layout: one offset byte, an
//! `occupieds` bitmap word, a `runends` bitmap word, and a bit-packed slot
//! array, matching `qfblock` in the original C layout byte-for-byte.
//!
//! No bounds checks are performed in the hot paths below — callers (all of
//! them in [`crate::filter`]) must have already clamped the slot index to
//! `xnslots`, per the spec's explicit "no bounds checks in hot paths"
//! contract for this component.

use crate::bitutil;
use crate::layout::{Header, SLOTS_PER_BLOCK};
use crate::storage::Storage;

const OFFSET_BYTES: u64 = 1;
const OCCUPIEDS_BYTES: u64 = 8;
const RUNENDS_BYTES: u64 = 8;
/// Offset byte saturates here; beyond it callers must fall back to a
/// recomputation scan rather than trust the cached value.
pub const OFFSET_SATURATED: u8 = 255;

/// Borrowed view over a filter's blocks, parameterized by the header so it
/// knows `bits_per_slot` and the per-block byte stride.
pub struct BlockView<'s, 'a> {
    storage: &'s Storage<'a>,
    block_bytes: u64,
    bits_per_slot: u8,
}

/// Mutable borrowed view, same layout knowledge as [`BlockView`].
pub struct BlockViewMut<'s, 'a> {
    storage: &'s mut Storage<'a>,
    block_bytes: u64,
    bits_per_slot: u8,
}

#[inline]
fn slot_region_bit_offset(block_bytes: u64, block_idx: u64, local_slot: u64, bits_per_slot: u8) -> u64 {
    let block_byte_start = block_idx * block_bytes;
    let slots_byte_start = block_byte_start + OFFSET_BYTES + OCCUPIEDS_BYTES + RUNENDS_BYTES;
    slots_byte_start * 8 + local_slot * u64::from(bits_per_slot)
}

impl<'s, 'a> BlockView<'s, 'a> {
    /// Constructs a view from header-derived layout constants.
    pub fn new(storage: &'s Storage<'a>, header: &Header) -> Self {
        BlockView {
            storage,
            block_bytes: header.block_bytes(),
            bits_per_slot: header.bits_per_slot,
        }
    }

    #[inline]
    fn block_byte_start(&self, block_idx: u64) -> usize {
        (block_idx * self.block_bytes) as usize
    }

    /// The cached `offset` byte for `block_idx`.
    #[inline]
    pub fn offset(&self, block_idx: u64) -> u8 {
        self.storage.as_slice()[self.block_byte_start(block_idx)]
    }

    /// The raw 64-bit `occupieds` bitmap word for `block_idx`.
    #[inline]
    pub fn occupieds_word(&self, block_idx: u64) -> u64 {
        let start = self.block_byte_start(block_idx) + OFFSET_BYTES as usize;
        bitutil::get_bits(self.storage.as_slice(), start as u64 * 8, 64)
    }

    /// The raw 64-bit `runends` bitmap word for `block_idx`.
    #[inline]
    pub fn runends_word(&self, block_idx: u64) -> u64 {
        let start = self.block_byte_start(block_idx) + (OFFSET_BYTES + OCCUPIEDS_BYTES) as usize;
        bitutil::get_bits(self.storage.as_slice(), start as u64 * 8, 64)
    }

    /// Whether slot `local_slot` (0..64) within `block_idx` is a home slot.
    #[inline]
    pub fn is_occupied(&self, block_idx: u64, local_slot: u64) -> bool {
        self.occupieds_word(block_idx) & (1u64 << local_slot) != 0
    }

    /// Whether slot `local_slot` (0..64) within `block_idx` ends a run.
    #[inline]
    pub fn is_runend(&self, block_idx: u64, local_slot: u64) -> bool {
        self.runends_word(block_idx) & (1u64 << local_slot) != 0
    }

    /// Reads the packed value (remainder, counter digit, or tag+remainder)
    /// at the global slot index `s`.
    #[inline]
    pub fn get_slot(&self, s: u64) -> u64 {
        let block_idx = s / SLOTS_PER_BLOCK;
        let local = s % SLOTS_PER_BLOCK;
        let bit_off = slot_region_bit_offset(self.block_bytes, block_idx, local, self.bits_per_slot);
        bitutil::get_bits(self.storage.as_slice(), bit_off, self.bits_per_slot)
    }
}

impl<'s, 'a> BlockViewMut<'s, 'a> {
    /// Constructs a mutable view from header-derived layout constants.
    pub fn new(storage: &'s mut Storage<'a>, header: &Header) -> Self {
        BlockViewMut {
            storage,
            block_bytes: header.block_bytes(),
            bits_per_slot: header.bits_per_slot,
        }
    }

    #[inline]
    fn block_byte_start(&self, block_idx: u64) -> usize {
        (block_idx * self.block_bytes) as usize
    }

    /// Re-borrows this view as a read-only [`BlockView`].
    pub fn as_view(&self) -> BlockView<'_, 'a> {
        BlockView {
            storage: self.storage,
            block_bytes: self.block_bytes,
            bits_per_slot: self.bits_per_slot,
        }
    }

    /// The cached `offset` byte for `block_idx`.
    #[inline]
    pub fn offset(&self, block_idx: u64) -> u8 {
        self.storage.as_slice()[self.block_byte_start(block_idx)]
    }

    /// Overwrites the cached `offset` byte for `block_idx`, saturating at
    /// [`OFFSET_SATURATED`].
    #[inline]
    pub fn set_offset(&mut self, block_idx: u64, value: u64) {
        let byte = if value >= u64::from(OFFSET_SATURATED) {
            OFFSET_SATURATED
        } else {
            value as u8
        };
        let idx = self.block_byte_start(block_idx);
        self.storage.as_mut_slice()[idx] = byte;
    }

    /// The raw 64-bit `occupieds` bitmap word for `block_idx`.
    #[inline]
    pub fn occupieds_word(&self, block_idx: u64) -> u64 {
        self.as_view().occupieds_word(block_idx)
    }

    /// The raw 64-bit `runends` bitmap word for `block_idx`.
    #[inline]
    pub fn runends_word(&self, block_idx: u64) -> u64 {
        self.as_view().runends_word(block_idx)
    }

    /// Sets or clears the `occupieds` bit for `local_slot` within
    /// `block_idx`.
    #[inline]
    pub fn set_occupied(&mut self, block_idx: u64, local_slot: u64, value: bool) {
        let mut word = self.occupieds_word(block_idx);
        if value {
            word |= 1u64 << local_slot;
        } else {
            word &= !(1u64 << local_slot);
        }
        let start = self.block_byte_start(block_idx) + OFFSET_BYTES as usize;
        bitutil::set_bits(self.storage.as_mut_slice(), start as u64 * 8, 64, word);
    }

    /// Sets or clears the `runends` bit for `local_slot` within
    /// `block_idx`.
    #[inline]
    pub fn set_runend(&mut self, block_idx: u64, local_slot: u64, value: bool) {
        let mut word = self.runends_word(block_idx);
        if value {
            word |= 1u64 << local_slot;
        } else {
            word &= !(1u64 << local_slot);
        }
        let start = self.block_byte_start(block_idx) + (OFFSET_BYTES + OCCUPIEDS_BYTES) as usize;
        bitutil::set_bits(self.storage.as_mut_slice(), start as u64 * 8, 64, word);
    }

    /// Reads the packed value at the global slot index `s`.
    #[inline]
    pub fn get_slot(&self, s: u64) -> u64 {
        self.as_view().get_slot(s)
    }

    /// Writes the packed value at the global slot index `s`.
    #[inline]
    pub fn set_slot(&mut self, s: u64, val: u64) {
        let block_idx = s / SLOTS_PER_BLOCK;
        let local = s % SLOTS_PER_BLOCK;
        let bit_off = slot_region_bit_offset(self.block_bytes, block_idx, local, self.bits_per_slot);
        bitutil::set_bits(self.storage.as_mut_slice(), bit_off, self.bits_per_slot, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::HashMode;

    fn test_header() -> Header {
        Header::new(64, 18, 0, HashMode::Default, false, 0).unwrap()
    }

    #[test]
    fn test_slot_roundtrip() {
        let header = test_header();
        let mut storage = Storage::new_owned(header.blocks_size_in_bytes() as usize);
        let mut view = BlockViewMut::new(&mut storage, &header);

        view.set_slot(0, 0x3FF);
        view.set_slot(1, 0x001);
        view.set_slot(63, 0x0AB);

        assert_eq!(view.get_slot(0), 0x3FF);
        assert_eq!(view.get_slot(1), 0x001);
        assert_eq!(view.get_slot(63), 0x0AB);
    }

    #[test]
    fn test_occupied_runend_bits() {
        let header = test_header();
        let mut storage = Storage::new_owned(header.blocks_size_in_bytes() as usize);
        let mut view = BlockViewMut::new(&mut storage, &header);

        view.set_occupied(0, 5, true);
        view.set_runend(0, 7, true);

        assert!(view.is_occupied_bit(0, 5));
        assert!(view.is_runend_bit(0, 7));
        assert!(!view.is_occupied_bit(0, 6));
    }

    #[test]
    fn test_offset_saturation() {
        let header = test_header();
        let mut storage = Storage::new_owned(header.blocks_size_in_bytes() as usize);
        let mut view = BlockViewMut::new(&mut storage, &header);

        view.set_offset(0, 1000);
        assert_eq!(view.offset(0), OFFSET_SATURATED);
        view.set_offset(0, 12);
        assert_eq!(view.offset(0), 12);
    }

    impl<'s, 'a> BlockViewMut<'s, 'a> {
        fn is_occupied_bit(&self, block_idx: u64, local_slot: u64) -> bool {
            self.occupieds_word(block_idx) & (1u64 << local_slot) != 0
        }
        fn is_runend_bit(&self, block_idx: u64, local_slot: u64) -> bool {
            self.runends_word(block_idx) & (1u64 << local_slot) != 0
        }
    }
}
