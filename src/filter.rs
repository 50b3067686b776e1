//! The counting quotient filter itself: insertion, removal, point queries,
//! and iteration, built on the block/lock/hash collaborators.
//!
//! # Run tracking
//!
//! A run's end is found via the textbook rank-and-select relation: for an
//! occupied home slot `q`, let `k = popcount(occupieds[0..=q])` (global rank
//! from slot 0); `end(q)` is the position of the `k`-th set bit of
//! `runends`, counting from slot 0. A run's start is one past the previous
//! run's end, or `q` itself if nothing is still open going into `q`:
//! `start(q) = max(q, end(q')+1)` where `q'` is the highest occupied home
//! `< q`, or `q` if no such home exists.
//!
//! The real implementation this is grounded on accelerates both relations
//! with the cached per-block `offset` byte, chaining block-local state
//! instead of re-scanning from slot 0 each time; that chaining algorithm
//! (`find_runend`/`offset_lower_bound` in the upstream C sources) was not
//! present in the reference material this crate was built from, and
//! reimplementing its exact cache-chaining rules from memory — with no way
//! to run the result against a test suite — risked a subtle, unverifiable
//! bug. This module instead computes both relations directly via
//! block-by-block popcount/select (`occ_rank_upto`/`select_runend` below),
//! which is straightforwardly correct from the invariants above. The
//! `offset` byte is still maintained on every mutation (`recompute_offset`)
//! so the on-disk layout and the data model in the block documentation
//! stay meaningful; see `DESIGN.md` for this trade-off.

use crate::block::{BlockView, BlockViewMut};
use crate::counter;
use crate::error::{CqfError, Result};
use crate::hash;
use crate::layout::{Header, HashMode, LockMode, QfConfig, SLOTS_PER_BLOCK};
use crate::lock::{LockBehavior, LockTable};
use crate::storage::Storage;
use std::cmp::Ordering;
use tracing::{debug, trace};

/// A mergeable, counting quotient filter.
pub struct CountingQuotientFilter<'a> {
    pub(crate) header: Header,
    pub(crate) storage: Storage<'a>,
    pub(crate) locks: LockTable,
    lock_mode: LockMode,
}

impl<'a> CountingQuotientFilter<'a> {
    /// Builds a new filter backed by a heap-allocated buffer.
    pub fn new(config: QfConfig) -> Result<Self> {
        let header = Header::new(
            config.nslots,
            config.key_bits,
            config.value_bits,
            config.hash_mode,
            config.auto_resize,
            config.seed,
        )?;
        debug!(nslots = header.nslots, xnslots = header.xnslots, "new filter");
        let storage = Storage::new_owned(header.blocks_size_in_bytes() as usize);
        let locks = LockTable::new(header.xnslots);
        Ok(CountingQuotientFilter {
            header,
            storage,
            locks,
            lock_mode: config.lock_mode,
        })
    }

    /// Builds a filter over a caller-provided buffer, which must be at
    /// least [`Header::blocks_size_in_bytes`] long.
    pub fn from_buffer(buf: &'a mut [u8], config: QfConfig) -> Result<Self> {
        let header = Header::new(
            config.nslots,
            config.key_bits,
            config.value_bits,
            config.hash_mode,
            config.auto_resize,
            config.seed,
        )?;
        let needed = header.blocks_size_in_bytes();
        if (buf.len() as u64) < needed {
            return Err(CqfError::BufferTooSmall { needed });
        }
        let locks = LockTable::new(header.xnslots);
        let storage = Storage::from_borrowed(&mut buf[..needed as usize]);
        Ok(CountingQuotientFilter {
            header,
            storage,
            locks,
            lock_mode: config.lock_mode,
        })
    }

    /// Constructs a filter directly from its parts; used by [`crate::persist`]
    /// and [`crate::merge`], which build the header and storage themselves.
    pub(crate) fn from_parts(header: Header, storage: Storage<'a>, lock_mode: LockMode) -> Self {
        let locks = LockTable::new(header.xnslots);
        CountingQuotientFilter {
            header,
            storage,
            locks,
            lock_mode,
        }
    }

    /// Logical slot count (`nslots`).
    pub fn capacity(&self) -> u64 {
        self.header.nslots
    }

    /// Total number of insertions recorded, counting multiplicities.
    pub fn len(&self) -> u64 {
        self.header.nelts
    }

    /// Whether the filter holds no entries.
    pub fn is_empty(&self) -> bool {
        self.header.nelts == 0
    }

    /// Number of distinct `(key, value)` pairs stored.
    pub fn distinct_len(&self) -> u64 {
        self.header.ndistinct_elts
    }

    /// `noccupied_slots / xnslots`.
    pub fn load_factor(&self) -> f64 {
        self.header.load_factor()
    }

    /// Read-only access to the derived layout/header fields.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The locking discipline this filter was constructed with.
    pub(crate) fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Replaces this filter's header/storage/locks with `other`'s, used by
    /// [`crate::merge::resize_in_place`] to swap a grown replacement in.
    pub(crate) fn adopt(&mut self, other: CountingQuotientFilter<'a>) {
        self.header = other.header;
        self.storage = other.storage;
        self.locks = other.locks;
        self.lock_mode = other.lock_mode;
    }

    /// Raw bytes of the blocks region, for [`crate::persist::serialize`].
    pub(crate) fn blocks_bytes(&self) -> &[u8] {
        self.storage.as_slice()
    }

    fn lock_behavior(&self, requested: bool) -> LockBehavior {
        match self.lock_mode {
            LockMode::Forbidden => LockBehavior::Skip,
            LockMode::Required => LockBehavior::Take,
            LockMode::Optional => {
                if requested {
                    LockBehavior::Take
                } else {
                    LockBehavior::Skip
                }
            }
        }
    }

    fn decompose(&self, hashed: u64) -> (u64, u64) {
        let key_bits = self.header.key_bits;
        let h = if key_bits >= 64 {
            hashed
        } else {
            hashed & ((1u64 << key_bits) - 1)
        };
        let rembits = self.header.key_remainder_bits;
        let q = h >> rembits;
        let r = h & ((1u64 << rembits) - 1);
        (q, r)
    }

    fn pack(&self, value: u64, remainder: u64) -> u64 {
        (value << self.header.key_remainder_bits) | remainder
    }

    fn remainder_mask(&self) -> u64 {
        (1u64 << self.header.key_remainder_bits) - 1
    }

    fn remainder_of(&self, packed: u64) -> u64 {
        packed & self.remainder_mask()
    }

    /// Ordering key for a packed slot value: `(remainder, value)`. A run is
    /// sorted and searched on this pair, remainder first, so ascending
    /// order matches ascending hashed-key order regardless of the value
    /// tag — `pack`'s bit layout puts `value` in the high bits, which would
    /// make a raw integer comparison value-major instead.
    fn entry_order_key(&self, packed: u64) -> (u64, u64) {
        (self.remainder_of(packed), packed >> self.header.key_remainder_bits)
    }

    fn view(&self) -> BlockView<'_, 'a> {
        BlockView::new(&self.storage, &self.header)
    }

    fn view_mut(&mut self) -> BlockViewMut<'_, 'a> {
        BlockViewMut::new(&mut self.storage, &self.header)
    }

    fn is_occupied(&self, q: u64) -> bool {
        let (b, l) = (q / SLOTS_PER_BLOCK, q % SLOTS_PER_BLOCK);
        self.view().is_occupied(b, l)
    }

    fn set_occupied(&mut self, q: u64, value: bool) {
        let (b, l) = (q / SLOTS_PER_BLOCK, q % SLOTS_PER_BLOCK);
        self.view_mut().set_occupied(b, l, value);
    }

    fn set_runend(&mut self, s: u64, value: bool) {
        let (b, l) = (s / SLOTS_PER_BLOCK, s % SLOTS_PER_BLOCK);
        self.view_mut().set_runend(b, l, value);
    }

    /// `popcount(occupieds[0..=q])`.
    fn occ_rank_upto(&self, q: u64) -> u64 {
        let (qb, ql) = (q / SLOTS_PER_BLOCK, q % SLOTS_PER_BLOCK);
        let view = self.view();
        let mut rank = 0u64;
        for b in 0..qb {
            rank += u64::from(view.occupieds_word(b).count_ones());
        }
        rank += u64::from(crate::bitutil::popcount_range(
            view.occupieds_word(qb),
            0,
            (ql + 1) as u8,
        ));
        rank
    }

    /// Position of the `k`-th (1-indexed) set bit of `runends`, scanning
    /// from slot 0. `k == 0` is not meaningful and returns `None`.
    fn select_runend(&self, k: u64) -> Option<u64> {
        if k == 0 {
            return None;
        }
        let view = self.view();
        let mut remaining = k;
        for b in 0..self.header.nblocks {
            let word = view.runends_word(b);
            let ones = u64::from(word.count_ones());
            if remaining <= ones {
                let local = crate::bitutil::select_bit(word, (remaining - 1) as u32)?;
                return Some(b * SLOTS_PER_BLOCK + u64::from(local));
            }
            remaining -= ones;
        }
        None
    }

    fn run_end(&self, q: u64) -> Option<u64> {
        if !self.is_occupied(q) {
            return None;
        }
        let k = self.occ_rank_upto(q);
        self.select_runend(k)
    }

    /// End of the run of the highest occupied home `<= pos`, or `None` if
    /// no home `<= pos` is occupied.
    fn last_run_end_upto(&self, pos: u64) -> Option<u64> {
        let rank = self.occ_rank_upto(pos);
        if rank == 0 {
            None
        } else {
            self.select_runend(rank)
        }
    }

    fn run_start(&self, q: u64) -> u64 {
        if q == 0 {
            return 0;
        }
        let rank = self.occ_rank_upto(q - 1);
        if rank == 0 {
            return q;
        }
        match self.select_runend(rank) {
            Some(prev_end) => std::cmp::max(q, prev_end + 1),
            None => q,
        }
    }

    fn is_slot_empty(&self, pos: u64) -> bool {
        match self.last_run_end_upto(pos) {
            None => true,
            Some(e) => e < pos,
        }
    }

    /// Smallest empty slot `>= from`, jumping a whole run at a time.
    fn first_empty_slot_at_or_after(&self, from: u64) -> u64 {
        let mut pos = from;
        loop {
            match self.last_run_end_upto(pos) {
                None => return pos,
                Some(e) if e < pos => return pos,
                Some(e) => pos = e + 1,
            }
        }
    }

    fn check_space(&self, n: u64) -> Result<()> {
        if self.header.noccupied_slots + n > self.header.xnslots {
            Err(CqfError::NoSpace)
        } else {
            Ok(())
        }
    }

    fn recompute_offset(&mut self, b: u64) {
        if b == 0 {
            self.view_mut().set_offset(0, 0);
            return;
        }
        let block_start = b * SLOTS_PER_BLOCK;
        let consumed = match self.last_run_end_upto(block_start - 1) {
            None => 0,
            Some(e) if e >= block_start => e - block_start + 1,
            Some(_) => 0,
        };
        self.view_mut().set_offset(b, consumed);
    }

    /// Shifts slots `[at, first_empty)` right by `n`, clearing `[at, at+n)`
    /// for the caller to fill in, and fixes up affected block offsets.
    fn shift_right_multi(&mut self, at: u64, n: u64) {
        let empty = self.first_empty_slot_at_or_after(at);
        {
            let mut view = self.view_mut();
            let mut i = empty;
            while i > at {
                let prev = i - 1;
                let val = view.get_slot(prev);
                let (pb, pl) = (prev / SLOTS_PER_BLOCK, prev % SLOTS_PER_BLOCK);
                let was_runend = view.as_view().is_runend(pb, pl);
                let dest = prev + n;
                view.set_slot(dest, val);
                let (db, dl) = (dest / SLOTS_PER_BLOCK, dest % SLOTS_PER_BLOCK);
                view.set_runend(db, dl, was_runend);
                i -= 1;
            }
            for i in at..(at + n) {
                view.set_slot(i, 0);
                let (ib, il) = (i / SLOTS_PER_BLOCK, i % SLOTS_PER_BLOCK);
                view.set_runend(ib, il, false);
            }
        }
        let start_block = at / SLOTS_PER_BLOCK;
        let end_block = (empty + n) / SLOTS_PER_BLOCK;
        for b in (start_block + 1)..=end_block {
            self.recompute_offset(b);
        }
    }

    /// Closes a gap of `gap_len` slots starting at `gap_start`, shifting
    /// everything up to the next already-empty slot left to fill it.
    fn shift_left_from(&mut self, gap_start: u64, gap_len: u64) {
        let scan_from = gap_start + gap_len;
        let empty = self.first_empty_slot_at_or_after(scan_from);
        {
            let mut view = self.view_mut();
            let mut i = scan_from;
            while i < empty {
                let val = view.get_slot(i);
                let (ib, il) = (i / SLOTS_PER_BLOCK, i % SLOTS_PER_BLOCK);
                let was_runend = view.as_view().is_runend(ib, il);
                let dest = i - gap_len;
                view.set_slot(dest, val);
                let (db, dl) = (dest / SLOTS_PER_BLOCK, dest % SLOTS_PER_BLOCK);
                view.set_runend(db, dl, was_runend);
                i += 1;
            }
            for i in (empty - gap_len)..empty {
                view.set_slot(i, 0);
                let (ib, il) = (i / SLOTS_PER_BLOCK, i % SLOTS_PER_BLOCK);
                view.set_runend(ib, il, false);
            }
        }
        let start_block = gap_start / SLOTS_PER_BLOCK;
        let end_block = empty / SLOTS_PER_BLOCK;
        for b in (start_block + 1)..=end_block {
            self.recompute_offset(b);
        }
    }

    /// Writes a fresh entry (remainder + counter digits for `count`) at
    /// `pos`, shifting everything at or after `pos` right to make room.
    /// Returns the number of slots the entry occupies.
    fn write_entry_shifting(&mut self, pos: u64, packed_val: u64, count: u64) -> Result<u64> {
        let digits = counter::encode_counter(self.remainder_of(packed_val), count);
        let n = 1 + digits.len() as u64;
        self.check_space(n)?;
        self.shift_right_multi(pos, n);
        let mut view = self.view_mut();
        view.set_slot(pos, packed_val);
        for (i, d) in digits.iter().enumerate() {
            view.set_slot(pos + 1 + i as u64, *d);
        }
        Ok(n)
    }

    /// Decodes the entry at `pos` (a remainder slot), consuming counter
    /// digits up to `run_e`. Returns `(count, digit_slots_consumed)`.
    fn decode_entry_at(&self, pos: u64, run_e: u64) -> (u64, u64) {
        let view = self.view();
        let r = self.remainder_of(view.get_slot(pos));
        let mut digits = Vec::new();
        let mut p = pos + 1;
        while p <= run_e {
            let v = view.get_slot(p);
            if v <= r {
                digits.push(v);
                p += 1;
            } else {
                break;
            }
        }
        let count = counter::decode_digits(r, &digits);
        (count, digits.len() as u64)
    }

    /// Removes the entry at `pos` (occupying `slot_count` slots) entirely,
    /// fixing up the home's occupied/runend bits.
    fn remove_entry_at(&mut self, q: u64, pos: u64, slot_count: u64, run_s: u64, run_e: u64) {
        let was_first = pos == run_s;
        let was_last = pos + slot_count - 1 == run_e;
        self.shift_left_from(pos, slot_count);
        if was_first && was_last {
            self.set_occupied(q, false);
        } else if was_last {
            self.set_runend(pos - 1, true);
        }
    }

    /// Rewrites the entry at `pos` (currently `old_slot_count` slots) to
    /// hold `new_count`, growing or shrinking the digit span as needed.
    fn resplice_entry(
        &mut self,
        pos: u64,
        old_slot_count: u64,
        packed_val: u64,
        new_count: u64,
        was_last: bool,
    ) -> Result<()> {
        let digits = counter::encode_counter(self.remainder_of(packed_val), new_count);
        let new_slot_count = 1 + digits.len() as u64;
        match new_slot_count.cmp(&old_slot_count) {
            Ordering::Greater => {
                let grow = new_slot_count - old_slot_count;
                self.check_space(grow)?;
                self.shift_right_multi(pos + old_slot_count, grow);
            }
            Ordering::Less => {
                let shrink = old_slot_count - new_slot_count;
                self.shift_left_from(pos + new_slot_count, shrink);
            }
            Ordering::Equal => {}
        }
        {
            let mut view = self.view_mut();
            view.set_slot(pos, packed_val);
            for (i, d) in digits.iter().enumerate() {
                view.set_slot(pos + 1 + i as u64, *d);
            }
        }
        if was_last {
            self.set_runend(pos + new_slot_count - 1, true);
        }
        let delta = new_slot_count as i64 - old_slot_count as i64;
        if delta > 0 {
            self.header.noccupied_slots += delta as u64;
        } else {
            self.header.noccupied_slots -= (-delta) as u64;
        }
        Ok(())
    }

    /// Inserts `count` occurrences of `(key, value)`. Auto-resizes first if
    /// the filter is past the 95% load-factor threshold and `auto_resize`
    /// is set; otherwise refuses with [`CqfError::NoSpace`] once full.
    pub fn insert(&mut self, key: u64, value: u64, count: u64) -> Result<bool> {
        self.insert_with_locks(key, value, count, false)
    }

    /// As [`Self::insert`], explicitly requesting (or declining) locks when
    /// `lock_mode` is [`LockMode::Optional`].
    pub fn insert_with_locks(
        &mut self,
        key: u64,
        value: u64,
        count: u64,
        take_locks: bool,
    ) -> Result<bool> {
        if count == 0 {
            return Ok(true);
        }
        if self.header.auto_resize && self.header.load_factor() >= 0.95 {
            self.resize_double()?;
        }
        let hashed = hash::hash(key, self.header.seed, self.header.hash_mode);
        let (q, remainder) = self.decompose(hashed);
        self.insert_core(q, remainder, value, count, take_locks)
    }

    fn insert_core(
        &mut self,
        q: u64,
        remainder: u64,
        value: u64,
        count: u64,
        take_locks: bool,
    ) -> Result<bool> {
        let behavior = self.lock_behavior(take_locks);
        let _guard = self.locks.lock_cluster(q, behavior);
        trace!(q, remainder, value, count, "insert");

        let packed_new = self.pack(value, remainder);

        if !self.is_occupied(q) {
            let pos = self.run_start(q);
            self.set_occupied(q, true);
            let slots_used = self.write_entry_shifting(pos, packed_new, count)?;
            self.set_runend(pos + slots_used - 1, true);
            self.header.nelts += count;
            self.header.ndistinct_elts += 1;
            self.header.noccupied_slots += slots_used;
            return Ok(true);
        }

        let run_s = self.run_start(q);
        let run_e = self.run_end(q).expect("occupied home must have a run");
        let mut pos = run_s;
        let mut matched = false;
        while pos <= run_e {
            let v = self.view().get_slot(pos);
            match self.entry_order_key(v).cmp(&self.entry_order_key(packed_new)) {
                Ordering::Equal => {
                    matched = true;
                    break;
                }
                Ordering::Greater => break,
                Ordering::Less => {
                    let (_c, d) = self.decode_entry_at(pos, run_e);
                    pos += 1 + d;
                }
            }
        }

        if matched {
            let (old_count, d) = self.decode_entry_at(pos, run_e);
            let old_slot_count = 1 + d;
            let was_last = pos + old_slot_count - 1 == run_e;
            self.resplice_entry(pos, old_slot_count, packed_new, old_count + count, was_last)?;
            self.header.nelts += count;
            return Ok(true);
        }

        let slots_used = self.write_entry_shifting(pos, packed_new, count)?;
        if pos > run_e {
            // Appended as the new maximum remainder; the old run end is no
            // longer the end.
            self.set_runend(pos + slots_used - 1, true);
            self.set_runend(run_e, false);
        }
        // Otherwise `shift_right_multi` already carried the old run end's
        // runend bit rightward along with its slot value.
        self.header.nelts += count;
        self.header.ndistinct_elts += 1;
        self.header.noccupied_slots += slots_used;
        Ok(true)
    }

    /// Removes `count` occurrences of `(key, value)`. Returns `false`
    /// without mutating state if `(key, value)` is absent, or if `count`
    /// exceeds the stored count.
    pub fn remove(&mut self, key: u64, value: u64, count: u64) -> Result<bool> {
        self.remove_with_locks(key, value, count, false)
    }

    /// As [`Self::remove`], explicitly requesting (or declining) locks when
    /// `lock_mode` is [`LockMode::Optional`].
    pub fn remove_with_locks(
        &mut self,
        key: u64,
        value: u64,
        count: u64,
        take_locks: bool,
    ) -> Result<bool> {
        if count == 0 {
            return Ok(true);
        }
        let hashed = hash::hash(key, self.header.seed, self.header.hash_mode);
        let (q, remainder) = self.decompose(hashed);
        let behavior = self.lock_behavior(take_locks);
        let _guard = self.locks.lock_cluster(q, behavior);
        trace!(q, remainder, value, count, "remove");

        if !self.is_occupied(q) {
            return Ok(false);
        }
        let run_s = self.run_start(q);
        let run_e = match self.run_end(q) {
            Some(e) => e,
            None => return Ok(false),
        };
        let packed_target = self.pack(value, remainder);
        let mut pos = run_s;
        while pos <= run_e {
            let v = self.view().get_slot(pos);
            match self.entry_order_key(v).cmp(&self.entry_order_key(packed_target)) {
                Ordering::Less => {
                    let (_c, d) = self.decode_entry_at(pos, run_e);
                    pos += 1 + d;
                }
                Ordering::Greater => return Ok(false),
                Ordering::Equal => {
                    let (old_count, d) = self.decode_entry_at(pos, run_e);
                    if count > old_count {
                        return Ok(false);
                    }
                    let old_slot_count = 1 + d;
                    if count == old_count {
                        self.remove_entry_at(q, pos, old_slot_count, run_s, run_e);
                        self.header.noccupied_slots -= old_slot_count;
                        self.header.ndistinct_elts -= 1;
                    } else {
                        let was_last = pos + old_slot_count - 1 == run_e;
                        self.resplice_entry(pos, old_slot_count, v, old_count - count, was_last)?;
                    }
                    self.header.nelts -= count;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Sets the stored count for `(key, value)` to exactly `count`,
    /// inserting or removing as needed. `count == 0` deletes the pair.
    pub fn set_count(&mut self, key: u64, value: u64, count: u64) -> Result<()> {
        let current = self.count_key_value(key, value);
        match count.cmp(&current) {
            Ordering::Greater => {
                self.insert(key, value, count - current)?;
            }
            Ordering::Less => {
                self.remove(key, value, current - count)?;
            }
            Ordering::Equal => {}
        }
        Ok(())
    }

    /// Removes every occurrence of `(key, value)`. Returns `false` if it was
    /// not present.
    pub fn delete_key_value(&mut self, key: u64, value: u64) -> Result<bool> {
        let c = self.count_key_value(key, value);
        if c == 0 {
            return Ok(false);
        }
        self.remove(key, value, c)
    }

    /// Removes every `(key, *)` entry, regardless of the value tag.
    pub fn delete_key(&mut self, key: u64) -> Result<()> {
        loop {
            let hashed = hash::hash(key, self.header.seed, self.header.hash_mode);
            let (q, remainder) = self.decompose(hashed);
            if !self.is_occupied(q) {
                return Ok(());
            }
            let run_s = self.run_start(q);
            let run_e = match self.run_end(q) {
                Some(e) => e,
                None => return Ok(()),
            };
            let rem_mask = self.remainder_mask();
            let mut pos = run_s;
            let mut found = None;
            while pos <= run_e {
                let packed = self.view().get_slot(pos);
                let (count, d) = self.decode_entry_at(pos, run_e);
                if packed & rem_mask == remainder {
                    found = Some((packed, count));
                    break;
                }
                pos += 1 + d;
            }
            match found {
                None => return Ok(()),
                Some((packed, count)) => {
                    let value = packed >> self.header.key_remainder_bits;
                    self.remove(key, value, count)?;
                }
            }
        }
    }

    /// Moves every occurrence of `(key, old_value)` to `(key, new_value)`,
    /// merging with any existing `(key, new_value)` entries.
    pub fn replace(&mut self, key: u64, old_value: u64, new_value: u64) -> Result<()> {
        let c = self.count_key_value(key, old_value);
        if c == 0 {
            return Ok(());
        }
        self.remove(key, old_value, c)?;
        self.insert(key, new_value, c)?;
        Ok(())
    }

    /// Looks up `key`, returning the first `(value, count)` pair found
    /// (ordered by the value tag), or `None` if absent.
    pub fn query(&self, key: u64) -> Option<(u64, u64)> {
        let hashed = hash::hash(key, self.header.seed, self.header.hash_mode);
        let (q, remainder) = self.decompose(hashed);
        if !self.is_occupied(q) {
            return None;
        }
        let run_s = self.run_start(q);
        let run_e = self.run_end(q)?;
        let rem_mask = self.remainder_mask();
        let mut pos = run_s;
        while pos <= run_e {
            let packed = self.view().get_slot(pos);
            let (count, d) = self.decode_entry_at(pos, run_e);
            if packed & rem_mask == remainder {
                return Some((packed >> self.header.key_remainder_bits, count));
            }
            pos += 1 + d;
        }
        None
    }

    /// Sum of counts across every value tag stored for `key`.
    pub fn count_key(&self, key: u64) -> u64 {
        let hashed = hash::hash(key, self.header.seed, self.header.hash_mode);
        let (q, remainder) = self.decompose(hashed);
        if !self.is_occupied(q) {
            return 0;
        }
        let run_s = self.run_start(q);
        let run_e = match self.run_end(q) {
            Some(e) => e,
            None => return 0,
        };
        let rem_mask = self.remainder_mask();
        let mut pos = run_s;
        let mut total = 0u64;
        while pos <= run_e {
            let packed = self.view().get_slot(pos);
            let (count, d) = self.decode_entry_at(pos, run_e);
            if packed & rem_mask == remainder {
                total += count;
            }
            pos += 1 + d;
        }
        total
    }

    /// Count stored for the exact `(key, value)` pair.
    pub fn count_key_value(&self, key: u64, value: u64) -> u64 {
        let hashed = hash::hash(key, self.header.seed, self.header.hash_mode);
        let (q, remainder) = self.decompose(hashed);
        if !self.is_occupied(q) {
            return 0;
        }
        let run_s = self.run_start(q);
        let run_e = match self.run_end(q) {
            Some(e) => e,
            None => return 0,
        };
        let packed_target = self.pack(value, remainder);
        let mut pos = run_s;
        while pos <= run_e {
            let packed = self.view().get_slot(pos);
            match self.entry_order_key(packed).cmp(&self.entry_order_key(packed_target)) {
                Ordering::Equal => return self.decode_entry_at(pos, run_e).0,
                Ordering::Greater => return 0,
                Ordering::Less => {
                    let (_c, d) = self.decode_entry_at(pos, run_e);
                    pos += 1 + d;
                }
            }
        }
        0
    }

    /// Zeroes every slot and resets element counters; capacity and layout
    /// are unchanged.
    pub fn reset(&mut self) {
        for byte in self.storage.as_mut_slice().iter_mut() {
            *byte = 0;
        }
        self.header.nelts = 0;
        self.header.ndistinct_elts = 0;
        self.header.noccupied_slots = 0;
    }

    /// Doubles `nslots` in place, reinserting every entry under the new
    /// quotient/remainder split. See [`crate::merge::resize`].
    pub fn resize_double(&mut self) -> Result<()> {
        crate::merge::resize_in_place(self)
    }

    /// An iterator over every `(key, value, count)` triple, in ascending
    /// `(home slot, remainder, value)` order — equivalently, ascending
    /// `hash(key)` order with ties (multiple values for one key) broken by
    /// value.
    pub fn iter(&self) -> QfIter<'_, 'a> {
        QfIter {
            filter: self,
            pos: 0,
            home: None,
            run_end: 0,
            done: self.header.xnslots == 0,
        }
    }

    /// An iterator starting at the first entry whose hashed quotient is
    /// `>= hashed >> key_remainder_bits`, i.e. seeking by a pre-hashed key.
    /// Matches the spec's `iterator_hash` seek semantics.
    pub fn iter_from_hash(&self, hashed: u64) -> QfIter<'_, 'a> {
        let (q, _) = self.decompose(hashed);
        QfIter {
            filter: self,
            pos: q,
            home: None,
            run_end: 0,
            done: self.header.xnslots == 0,
        }
    }

    /// Copies every entry into a freshly allocated, independently owned
    /// filter with the same layout. Unlike a plain `Clone`, this always
    /// produces owned storage even when `self` is backed by a borrowed
    /// buffer or a memory mapping, since neither of those can be
    /// duplicated without also duplicating what they point at.
    pub fn duplicate(&self) -> CountingQuotientFilter<'static> {
        let header = self.header.clone();
        let mut storage = Storage::new_owned(self.storage.len());
        storage.as_mut_slice().copy_from_slice(self.storage.as_slice());
        CountingQuotientFilter::from_parts(header, storage, self.lock_mode)
    }

    /// Dumps per-block metadata for debugging invariant violations: each
    /// block's stored `offset` alongside the `occupieds`/`runends`
    /// bitmaps. Intended for `debug_assert!`-gated diagnostics, not the
    /// hot path.
    pub fn dump_metadata(&self) -> String {
        let view = self.view();
        let mut out = String::new();
        for b in 0..self.header.nblocks {
            out.push_str(&format!(
                "block {:>6}: offset={:>3} occupieds={:016x} runends={:016x}\n",
                b,
                view.offset(b),
                view.occupieds_word(b),
                view.runends_word(b)
            ));
        }
        out
    }
}

impl<'a> Drop for CountingQuotientFilter<'a> {
    fn drop(&mut self) {
        // Best-effort: a filter backed by a memory mapping should leave its
        // writes durable on disk, but a failed flush here has no recovery
        // path worth propagating from a destructor.
        let _ = self.storage.flush();
    }
}

/// Iterator produced by [`CountingQuotientFilter::iter`].
pub struct QfIter<'f, 'a> {
    filter: &'f CountingQuotientFilter<'a>,
    pos: u64,
    home: Option<u64>,
    run_end: u64,
    done: bool,
}

impl<'f, 'a> Iterator for QfIter<'f, 'a> {
    type Item = (u64, u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.home.is_none() || self.pos > self.run_end {
                let next_home = self.find_next_occupied(self.pos)?;
                self.home = Some(next_home);
                self.run_end = self.filter.run_end(next_home)?;
                self.pos = self.filter.run_start(next_home);
            }
            let home = self.home.unwrap();
            if self.pos > self.run_end {
                // Defensive: an occupied home with an empty apparent run
                // (should not happen under the invariants) skips forward.
                self.pos = home + 1;
                self.home = None;
                continue;
            }
            let (count, d) = self.filter.decode_entry_at(self.pos, self.run_end);
            let packed = self.filter.view().get_slot(self.pos);
            let remainder = packed & self.filter.remainder_mask();
            let value = packed >> self.filter.header.key_remainder_bits;
            self.pos += 1 + d;

            let hashed = (home << self.filter.header.key_remainder_bits) | remainder;
            let key = hash::invert(hashed, self.filter.header.seed, self.filter.header.hash_mode);
            return Some((key, value, count));
        }
    }
}

impl<'f, 'a> QfIter<'f, 'a> {
    /// Finds the smallest occupied home slot `>= from`, scanning block by
    /// block.
    fn find_next_occupied(&self, from: u64) -> Option<u64> {
        let view = self.filter.view();
        let mut block = from / SLOTS_PER_BLOCK;
        let mut local_start = from % SLOTS_PER_BLOCK;
        while block < self.filter.header.nblocks {
            let masked = if local_start == 0 {
                view.occupieds_word(block)
            } else {
                view.occupieds_word(block) & !((1u64 << local_start) - 1)
            };
            if masked != 0 {
                let local = masked.trailing_zeros() as u64;
                return Some(block * SLOTS_PER_BLOCK + local);
            }
            block += 1;
            local_start = 0;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_filter(value_bits: u8) -> CountingQuotientFilter<'static> {
        let config = QfConfig::new(64, 16, value_bits).with_hash_mode(HashMode::Invertible);
        CountingQuotientFilter::new(config).unwrap()
    }

    #[test]
    fn test_insert_and_query_single_key() {
        let mut qf = small_filter(0);
        assert!(qf.insert(42, 0, 1).unwrap());
        assert_eq!(qf.query(42), Some((0, 1)));
        assert_eq!(qf.count_key(42), 1);
        assert!(qf.query(7).is_none());
    }

    #[test]
    fn test_insert_bumps_existing_count() {
        let mut qf = small_filter(0);
        qf.insert(1, 0, 1).unwrap();
        qf.insert(1, 0, 16).unwrap();
        assert_eq!(qf.count_key_value(1, 0), 17);
        assert_eq!(qf.len(), 17);
        assert_eq!(qf.distinct_len(), 1);
    }

    #[test]
    fn test_colliding_quotients_both_present() {
        let mut qf = small_filter(0);
        // Insert enough distinct keys that some land in the same run;
        // every one must remain independently queryable regardless.
        for k in 0..40u64 {
            assert!(qf.insert(k, 0, 1).unwrap(), "insert {} failed", k);
        }
        for k in 0..40u64 {
            assert_eq!(qf.query(k), Some((0, 1)), "query {} mismatched", k);
        }
        assert_eq!(qf.distinct_len(), 40);
    }

    #[test]
    fn test_remove_shrinks_and_removes() {
        let mut qf = small_filter(0);
        qf.insert(5, 0, 10).unwrap();
        assert!(qf.remove(5, 0, 3).unwrap());
        assert_eq!(qf.count_key_value(5, 0), 7);
        assert!(qf.remove(5, 0, 7).unwrap());
        assert_eq!(qf.count_key_value(5, 0), 0);
        assert!(qf.query(5).is_none());
    }

    #[test]
    fn test_remove_absent_returns_false() {
        let mut qf = small_filter(0);
        assert!(!qf.remove(99, 0, 1).unwrap());
    }

    #[test]
    fn test_remove_more_than_present_returns_false() {
        let mut qf = small_filter(0);
        qf.insert(3, 0, 2).unwrap();
        assert!(!qf.remove(3, 0, 5).unwrap());
        assert_eq!(qf.count_key_value(3, 0), 2);
    }

    #[test]
    fn test_multiple_values_same_key() {
        let mut qf = small_filter(4);
        qf.insert(10, 1, 2).unwrap();
        qf.insert(10, 2, 5).unwrap();
        assert_eq!(qf.count_key_value(10, 1), 2);
        assert_eq!(qf.count_key_value(10, 2), 5);
        assert_eq!(qf.count_key(10), 7);
    }

    #[test]
    fn test_delete_key_removes_every_value() {
        let mut qf = small_filter(4);
        qf.insert(10, 1, 2).unwrap();
        qf.insert(10, 2, 5).unwrap();
        qf.delete_key(10).unwrap();
        assert_eq!(qf.count_key(10), 0);
        assert!(qf.query(10).is_none());
    }

    #[test]
    fn test_replace_merges_into_existing_value() {
        let mut qf = small_filter(4);
        qf.insert(10, 1, 2).unwrap();
        qf.insert(10, 2, 5).unwrap();
        qf.replace(10, 1, 2).unwrap();
        assert_eq!(qf.count_key_value(10, 1), 0);
        assert_eq!(qf.count_key_value(10, 2), 7);
    }

    #[test]
    fn test_set_count_inserts_removes_and_deletes() {
        let mut qf = small_filter(0);
        qf.set_count(8, 0, 5).unwrap();
        assert_eq!(qf.count_key_value(8, 0), 5);
        qf.set_count(8, 0, 2).unwrap();
        assert_eq!(qf.count_key_value(8, 0), 2);
        qf.set_count(8, 0, 0).unwrap();
        assert!(qf.query(8).is_none());
    }

    #[test]
    fn test_iter_yields_all_inserted_keys() {
        let mut qf = small_filter(0);
        let keys: Vec<u64> = (0..20).collect();
        for &k in &keys {
            qf.insert(k, 0, (k % 5) + 1).unwrap();
        }
        let mut seen: Vec<(u64, u64, u64)> = qf.iter().collect();
        seen.sort();
        let mut expected: Vec<(u64, u64, u64)> =
            keys.iter().map(|&k| (k, 0, (k % 5) + 1)).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_no_space_without_auto_resize() {
        let config = QfConfig::new(64, 16, 0);
        let mut qf = CountingQuotientFilter::new(config).unwrap();
        let xnslots = qf.header().xnslots;
        let mut inserted = 0u64;
        for k in 0..xnslots {
            if qf.insert(k, 0, 1).is_err() {
                break;
            }
            inserted += 1;
        }
        assert!(inserted <= xnslots);
        // One more insert once truly full must fail.
        if inserted == xnslots {
            assert!(qf.insert(xnslots + 1, 0, 1).is_err());
        }
    }

    #[test]
    fn test_reset_clears_state() {
        let mut qf = small_filter(0);
        qf.insert(1, 0, 3).unwrap();
        qf.reset();
        assert_eq!(qf.len(), 0);
        assert_eq!(qf.distinct_len(), 0);
        assert!(qf.query(1).is_none());
    }
}
