//! On-disk (de)serialization: a small fixed-width header followed by the
//! raw blocks region, matching the data-model note that the format is
//! `header || blocks` with no padding between them.
//!
//! `serialize` writes both through a buffered file writer (the teacher
//! crate has no file I/O of its own; this mirrors the broader pack's
//! convention of `byteorder` + `BufWriter` for binary formats). `usefile`
//! reopens a filter backed by a read-write [`memmap2::MmapMut`] over just
//! the blocks region, so mutations through the filter are reflected back to
//! disk without an explicit write-back pass.

use crate::error::{CqfError, Result};
use crate::filter::CountingQuotientFilter;
use crate::layout::{Header, HashMode, LockMode};
use crate::storage::Storage;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::MmapOptions;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

const MAGIC: &[u8; 8] = b"CQFv001\0";
const FORMAT_VERSION: u32 = 1;

/// Size in bytes of the fixed-width header written before the blocks
/// region: magic, version, hash mode tag, auto-resize flag, seed, nslots,
/// key_bits, value_bits, and the three mutable element counters.
const HEADER_LEN: u64 = 8 + 4 + 1 + 1 + 4 + 8 + 1 + 1 + 8 + 8 + 8;

fn hash_mode_tag(mode: HashMode) -> u8 {
    match mode {
        HashMode::Default => 0,
        HashMode::Invertible => 1,
        HashMode::None => 2,
    }
}

fn hash_mode_from_tag(tag: u8) -> Result<HashMode> {
    match tag {
        0 => Ok(HashMode::Default),
        1 => Ok(HashMode::Invertible),
        2 => Ok(HashMode::None),
        other => Err(CqfError::Corruption(format!("unknown hash mode tag {}", other))),
    }
}

/// Writes `qf`'s header and blocks region to `path`, truncating any
/// existing file. Returns the total number of bytes written.
pub fn serialize(qf: &CountingQuotientFilter<'_>, path: impl AsRef<Path>) -> Result<u64> {
    let header = qf.header();
    debug!(path = %path.as_ref().display(), nslots = header.nslots, "serializing filter");
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);

    w.write_all(MAGIC)?;
    w.write_u32::<LittleEndian>(FORMAT_VERSION)?;
    w.write_u8(hash_mode_tag(header.hash_mode))?;
    w.write_u8(header.auto_resize as u8)?;
    w.write_u32::<LittleEndian>(header.seed)?;
    w.write_u64::<LittleEndian>(header.nslots)?;
    w.write_u8(header.key_bits)?;
    w.write_u8(header.value_bits)?;
    w.write_u64::<LittleEndian>(header.nelts)?;
    w.write_u64::<LittleEndian>(header.ndistinct_elts)?;
    w.write_u64::<LittleEndian>(header.noccupied_slots)?;

    let blocks = qf.blocks_bytes();
    w.write_all(blocks)?;
    w.flush()?;

    Ok(HEADER_LEN + blocks.len() as u64)
}

/// Opens a filter whose blocks region is memory-mapped read-write from the
/// file at `path`. The header is validated against `MAGIC`/`FORMAT_VERSION`
/// and the derived layout (slot width, block count) before the mapping is
/// established.
pub fn usefile<'a>(path: impl AsRef<Path>, lock_mode: LockMode) -> Result<CountingQuotientFilter<'a>> {
    let path = path.as_ref();
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;

    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(CqfError::Corruption("bad magic".to_string()));
    }
    let version = file.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(CqfError::Corruption(format!(
            "unsupported format version {}",
            version
        )));
    }
    let hash_mode = hash_mode_from_tag(file.read_u8()?)?;
    let auto_resize = file.read_u8()? != 0;
    let seed = file.read_u32::<LittleEndian>()?;
    let nslots = file.read_u64::<LittleEndian>()?;
    let key_bits = file.read_u8()?;
    let value_bits = file.read_u8()?;
    let nelts = file.read_u64::<LittleEndian>()?;
    let ndistinct_elts = file.read_u64::<LittleEndian>()?;
    let noccupied_slots = file.read_u64::<LittleEndian>()?;

    let mut header = Header::new(nslots, key_bits, value_bits, hash_mode, auto_resize, seed)?;
    header.nelts = nelts;
    header.ndistinct_elts = ndistinct_elts;
    header.noccupied_slots = noccupied_slots;

    let blocks_len = header.blocks_size_in_bytes();
    let file_len = file.metadata()?.len();
    if file_len < HEADER_LEN + blocks_len {
        return Err(CqfError::Corruption(format!(
            "file too short for declared layout: have {} bytes, need {}",
            file_len,
            HEADER_LEN + blocks_len
        )));
    }

    debug!(path = %path.display(), nslots, "mapping filter from file");
    // SAFETY: the mapping is exclusive to this process's view of the file;
    // concurrent external writers would violate Rust's aliasing rules, the
    // same caveat every mmap-backed API carries.
    let mmap = unsafe {
        MmapOptions::new()
            .offset(HEADER_LEN)
            .len(blocks_len as usize)
            .map_mut(&file)?
    };
    let storage = Storage::from_mapped(mmap);
    Ok(CountingQuotientFilter::from_parts(header, storage, lock_mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::QfConfig;
    use tempfile::NamedTempFile;

    #[test]
    fn test_serialize_then_usefile_roundtrip() {
        let tmp = NamedTempFile::new().unwrap();
        let config = QfConfig::new(64, 18, 0).with_hash_mode(HashMode::Invertible);
        let mut qf = CountingQuotientFilter::new(config).unwrap();
        for k in 0..30u64 {
            qf.insert(k, 0, (k % 3) + 1).unwrap();
        }
        let written = serialize(&qf, tmp.path()).unwrap();
        assert!(written > 0);

        let reopened = usefile(tmp.path(), LockMode::Forbidden).unwrap();
        assert_eq!(reopened.len(), qf.len());
        assert_eq!(reopened.distinct_len(), qf.distinct_len());
        for k in 0..30u64 {
            assert_eq!(reopened.query(k), qf.query(k));
        }
    }

    #[test]
    fn test_usefile_rejects_bad_magic() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"not a cqf file at all").unwrap();
        assert!(usefile(tmp.path(), LockMode::Forbidden).is_err());
    }
}
