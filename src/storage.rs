//! The three ownership regimes a filter's block buffer can live under.
//!
//! Mirrors the teacher crate's single-buffer-backed collections
//! (`BitstringVec` owns a `Vec<u64>`), generalized to the three regimes the
//! spec requires: the filter owns the buffer, borrows a caller-provided
//! buffer, or views a memory-mapped file. A single enum with a uniform
//! `as_slice`/`as_mut_slice` pair covers all three without duck typing.

use memmap2::MmapMut;

/// The block buffer backing a [`crate::filter::CountingQuotientFilter`].
pub enum Storage<'a> {
    /// Heap-allocated; dropped along with the filter.
    Owned(Vec<u8>),
    /// A caller-provided buffer the filter does not own.
    Borrowed(&'a mut [u8]),
    /// A memory-mapped file; the filter owns the mapping's lifetime, not
    /// the bytes underneath it.
    Mapped(MmapMut),
}

impl<'a> Storage<'a> {
    /// Allocates a new zeroed owned buffer of `len` bytes.
    pub fn new_owned(len: usize) -> Self {
        Storage::Owned(vec![0u8; len])
    }

    /// Wraps a memory-mapped file.
    pub fn from_mapped(mmap: MmapMut) -> Self {
        Storage::Mapped(mmap)
    }

    /// Wraps a caller-provided buffer without taking ownership.
    pub fn from_borrowed(buf: &'a mut [u8]) -> Self {
        Storage::Borrowed(buf)
    }

    /// Borrows the buffer immutably.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(v) => v.as_slice(),
            Storage::Borrowed(b) => b,
            Storage::Mapped(m) => m.as_ref(),
        }
    }

    /// Borrows the buffer mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Storage::Owned(v) => v.as_mut_slice(),
            Storage::Borrowed(b) => b,
            Storage::Mapped(m) => m.as_mut(),
        }
    }

    /// Length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes pending writes to disk if this storage is a memory mapping;
    /// a no-op for owned/borrowed buffers.
    pub fn flush(&self) -> std::io::Result<()> {
        if let Storage::Mapped(m) = self {
            m.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_roundtrip() {
        let mut storage = Storage::new_owned(16);
        storage.as_mut_slice()[0] = 0xAB;
        assert_eq!(storage.as_slice()[0], 0xAB);
        assert_eq!(storage.len(), 16);
    }

    #[test]
    fn test_borrowed_roundtrip() {
        let mut buf = vec![0u8; 8];
        let mut storage = Storage::from_borrowed(&mut buf);
        storage.as_mut_slice()[3] = 7;
        assert_eq!(storage.as_slice()[3], 7);
    }
}
