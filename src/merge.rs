//! Merging two filters into a third, k-way merging more than two, and
//! doubling a filter's capacity in place.
//!
//! All three operations are expressed the same way: drain one or more
//! `QfIter`s in ascending key order and reinsert into a freshly built
//! filter, relying on [`crate::filter::CountingQuotientFilter::insert`] to
//! sum counts for keys that appear in more than one input. This mirrors how
//! the teacher crate's own filters have no native "merge" and instead
//! recommend rebuilding from an iterator of elements.

use crate::error::Result;
use crate::filter::CountingQuotientFilter;
use crate::layout::{Header, QfConfig};
use crate::storage::Storage;
use std::collections::BinaryHeap;
use std::cmp::Reverse;
use tracing::debug;

/// Merges `a` and `b` into a freshly built filter with capacity for the
/// union of both. Both inputs must share `(key_bits, value_bits, hash_mode)`
/// to produce comparable hashes; `out_nslots` lets the caller size the
/// result (typically `a.capacity() + b.capacity()`, rounded up to a power
/// of two by [`crate::layout::Header`]).
pub fn merge<'a>(
    a: &CountingQuotientFilter<'_>,
    b: &CountingQuotientFilter<'_>,
    out_nslots: u64,
) -> Result<CountingQuotientFilter<'a>> {
    debug!(out_nslots, "merging two filters");
    let config = QfConfig::new(out_nslots, a.header().key_bits, a.header().value_bits)
        .with_hash_mode(a.header().hash_mode)
        .with_seed(a.header().seed);
    let mut out = CountingQuotientFilter::new(config)?;

    let mut iter_a = a.iter().peekable();
    let mut iter_b = b.iter().peekable();
    loop {
        match (iter_a.peek(), iter_b.peek()) {
            (None, None) => break,
            (Some(_), None) => {
                let (k, v, c) = iter_a.next().unwrap();
                out.insert(k, v, c)?;
            }
            (None, Some(_)) => {
                let (k, v, c) = iter_b.next().unwrap();
                out.insert(k, v, c)?;
            }
            (Some(&(ka, va, _)), Some(&(kb, vb, _))) => {
                if (ka, va) <= (kb, vb) {
                    let (k, v, c) = iter_a.next().unwrap();
                    out.insert(k, v, c)?;
                } else {
                    let (k, v, c) = iter_b.next().unwrap();
                    out.insert(k, v, c)?;
                }
            }
        }
    }
    Ok(out)
}

/// A single entry pending merge from one of `multi_merge`'s inputs.
struct HeapEntry {
    key: u64,
    value: u64,
    count: u64,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        (self.key, self.value) == (other.key, other.value)
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.key, self.value).cmp(&(other.key, other.value))
    }
}

/// Generalizes [`merge`] to any number of filters via a k-way heap merge,
/// rather than a chain of pairwise merges.
pub fn multi_merge<'a>(
    filters: &[&CountingQuotientFilter<'_>],
    out_nslots: u64,
) -> Result<CountingQuotientFilter<'a>> {
    debug!(count = filters.len(), out_nslots, "k-way merging filters");
    let first = filters.first().expect("multi_merge requires at least one input");
    let config = QfConfig::new(out_nslots, first.header().key_bits, first.header().value_bits)
        .with_hash_mode(first.header().hash_mode)
        .with_seed(first.header().seed);
    let mut out = CountingQuotientFilter::new(config)?;

    let mut iters: Vec<_> = filters.iter().map(|f| f.iter()).collect();
    let mut heap = BinaryHeap::new();
    for (i, it) in iters.iter_mut().enumerate() {
        if let Some((k, v, c)) = it.next() {
            heap.push(Reverse(HeapEntry {
                key: k,
                value: v,
                count: c,
                source: i,
            }));
        }
    }
    while let Some(Reverse(entry)) = heap.pop() {
        out.insert(entry.key, entry.value, entry.count)?;
        if let Some((k, v, c)) = iters[entry.source].next() {
            heap.push(Reverse(HeapEntry {
                key: k,
                value: v,
                count: c,
                source: entry.source,
            }));
        }
    }
    Ok(out)
}

/// Doubles `qf`'s logical slot count in place: builds a new filter at twice
/// the capacity, reinserts every entry, and swaps it in. Used by
/// [`CountingQuotientFilter::resize_double`] when `auto_resize` is set and
/// the load factor crosses 95%.
pub(crate) fn resize_in_place<'a>(qf: &mut CountingQuotientFilter<'a>) -> Result<()> {
    let entries: Vec<(u64, u64, u64)> = qf.iter().collect();
    let header = qf.header();
    let new_nslots = header.nslots * 2;
    debug!(old = header.nslots, new = new_nslots, "auto-resizing filter");
    let new_header = Header::new(
        new_nslots,
        header.key_bits,
        header.value_bits,
        header.hash_mode,
        header.auto_resize,
        header.seed,
    )?;
    let storage: Storage<'a> = Storage::new_owned(new_header.blocks_size_in_bytes() as usize);
    let mut grown = CountingQuotientFilter::from_parts(new_header, storage, qf.lock_mode());
    for (k, v, c) in entries {
        grown.insert(k, v, c)?;
    }
    qf.adopt(grown);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::HashMode;

    fn filled(keys: &[u64], nslots: u64) -> CountingQuotientFilter<'static> {
        let config = QfConfig::new(nslots, 20, 0).with_hash_mode(HashMode::Invertible);
        let mut qf = CountingQuotientFilter::new(config).unwrap();
        for &k in keys {
            qf.insert(k, 0, 1).unwrap();
        }
        qf
    }

    #[test]
    fn test_merge_unions_disjoint_keys() {
        let a = filled(&[1, 2, 3], 64);
        let b = filled(&[4, 5, 6], 64);
        let out = merge(&a, &b, 128).unwrap();
        for k in 1..=6u64 {
            assert_eq!(out.query(k), Some((0, 1)), "missing key {}", k);
        }
    }

    #[test]
    fn test_merge_sums_overlapping_keys() {
        let a = filled(&[1, 2], 64);
        let b = filled(&[2, 3], 64);
        let out = merge(&a, &b, 128).unwrap();
        assert_eq!(out.count_key_value(2, 0), 2);
        assert_eq!(out.count_key_value(1, 0), 1);
        assert_eq!(out.count_key_value(3, 0), 1);
    }

    #[test]
    fn test_multi_merge_three_filters() {
        let a = filled(&[1], 64);
        let b = filled(&[1, 2], 64);
        let c = filled(&[2, 3], 64);
        let out = multi_merge(&[&a, &b, &c], 128).unwrap();
        assert_eq!(out.count_key_value(1, 0), 2);
        assert_eq!(out.count_key_value(2, 0), 2);
        assert_eq!(out.count_key_value(3, 0), 1);
    }

    #[test]
    fn test_resize_preserves_all_entries() {
        let mut qf = filled(&(0..50).collect::<Vec<_>>(), 64);
        let before: Vec<_> = {
            let mut v = qf.iter().collect::<Vec<_>>();
            v.sort();
            v
        };
        resize_in_place(&mut qf).unwrap();
        assert!(qf.capacity() > 64);
        let after: Vec<_> = {
            let mut v = qf.iter().collect::<Vec<_>>();
            v.sort();
            v
        };
        assert_eq!(before, after);
    }
}
