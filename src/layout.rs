//! Derives slot width, block count, and byte size from `(nslots, key_bits,
//! value_bits)`, and owns the filter's header record.

use crate::error::{CqfError, Result};

/// Number of slots held by a single block. Fixed at 64 so that each block's
/// `occupieds`/`runends` bitmaps are exactly one 64-bit word, matching the
/// packed `qfblock` layout the on-disk format is grounded on.
pub const SLOTS_PER_BLOCK: u64 = 64;

/// How a caller's key is turned into the filter's internal hash domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde_crate::Deserialize, serde_crate::Serialize),
    serde(crate = "serde_crate")
)]
pub enum HashMode {
    /// `hash(key, seed)` is applied; iteration yields the hash, not the
    /// original key.
    Default,
    /// A bijective hash is applied, so `qfi_get` can invert it back to the
    /// original key during iteration.
    Invertible,
    /// The caller has already hashed the key; it is used as-is.
    None,
}

/// Governs whether mutators take the striped spin-locks in [`crate::lock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde_crate::Deserialize, serde_crate::Serialize),
    serde(crate = "serde_crate")
)]
pub enum LockMode {
    /// Single-threaded; lock operations are no-ops.
    Forbidden,
    /// Mutators take locks only when the caller passes `true` for a given
    /// call.
    Optional,
    /// Every mutator takes locks.
    Required,
}

/// Construction-time parameters for a [`crate::filter::CountingQuotientFilter`].
#[derive(Clone, Copy, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(serde_crate::Deserialize, serde_crate::Serialize),
    serde(crate = "serde_crate")
)]
pub struct QfConfig {
    /// Logical slot count; must be a power of two `>= 2^6`.
    pub nslots: u64,
    /// Width in bits of a hashed key, at most 64.
    pub key_bits: u8,
    /// Width in bits of the caller-supplied tag packed beside each
    /// remainder.
    pub value_bits: u8,
    /// Hash domain handling.
    pub hash_mode: HashMode,
    /// Locking discipline.
    pub lock_mode: LockMode,
    /// Hash seed.
    pub seed: u32,
    /// Whether a full filter grows before refusing an insert.
    pub auto_resize: bool,
}

impl QfConfig {
    /// Constructs a config with `auto_resize` off and `hash_mode =
    /// HashMode::Default`.
    pub fn new(nslots: u64, key_bits: u8, value_bits: u8) -> Self {
        QfConfig {
            nslots,
            key_bits,
            value_bits,
            hash_mode: HashMode::Default,
            lock_mode: LockMode::Forbidden,
            seed: 0,
            auto_resize: false,
        }
    }

    /// Builder-style setter for `hash_mode`.
    pub fn with_hash_mode(mut self, hash_mode: HashMode) -> Self {
        self.hash_mode = hash_mode;
        self
    }

    /// Builder-style setter for `lock_mode`.
    pub fn with_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    /// Builder-style setter for `seed`.
    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    /// Builder-style setter for `auto_resize`.
    pub fn with_auto_resize(mut self, auto_resize: bool) -> Self {
        self.auto_resize = auto_resize;
        self
    }
}

/// The filter's persisted header prefix (spec `quotient_filter_metadata`).
#[derive(Clone, Copy, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(serde_crate::Deserialize, serde_crate::Serialize),
    serde(crate = "serde_crate")
)]
pub struct Header {
    /// Hash domain handling, fixed at construction time.
    pub hash_mode: HashMode,
    /// Whether the filter grows itself before refusing an insert.
    pub auto_resize: bool,
    /// Hash seed.
    pub seed: u32,
    /// Logical slot count (power of two).
    pub nslots: u64,
    /// Physical slot count, `nslots` plus the tail absorbing overflow runs.
    pub xnslots: u64,
    /// Width of a hashed key, in bits.
    pub key_bits: u8,
    /// Width of the caller-supplied value tag, in bits.
    pub value_bits: u8,
    /// `key_bits - log2(nslots)`.
    pub key_remainder_bits: u8,
    /// `key_remainder_bits + value_bits`.
    pub bits_per_slot: u8,
    /// `2^key_bits`, represented as a 128-bit integer.
    pub range: u128,
    /// `xnslots / SLOTS_PER_BLOCK`.
    pub nblocks: u64,
    /// Total number of (key, value) insertions, counting multiplicities.
    pub nelts: u64,
    /// Number of distinct `(key, value)` pairs stored.
    pub ndistinct_elts: u64,
    /// Number of slots holding either a remainder or a counter digit.
    pub noccupied_slots: u64,
}

impl Header {
    /// Validates `(nslots, key_bits, value_bits)` and derives a new header.
    ///
    /// `nslots` must be a power of two `>= 2^6`; `key_bits` must be at most
    /// 64; `log2(nslots) <= key_bits`.
    pub fn new(
        nslots: u64,
        key_bits: u8,
        value_bits: u8,
        hash_mode: HashMode,
        lock_mode_auto_resize: bool,
        seed: u32,
    ) -> Result<Self> {
        if nslots < 64 || !nslots.is_power_of_two() {
            return Err(CqfError::InvalidParameter(format!(
                "nslots must be a power of two >= 64, got {}",
                nslots
            )));
        }
        if key_bits == 0 || key_bits > 64 {
            return Err(CqfError::InvalidParameter(format!(
                "key_bits must be in 1..=64, got {}",
                key_bits
            )));
        }
        let quotient_bits = nslots.trailing_zeros() as u8;
        if quotient_bits > key_bits {
            return Err(CqfError::InvalidParameter(format!(
                "log2(nslots) ({}) must be <= key_bits ({})",
                quotient_bits, key_bits
            )));
        }
        let key_remainder_bits = key_bits - quotient_bits;
        let bits_per_slot = key_remainder_bits
            .checked_add(value_bits)
            .filter(|&b| b <= 64)
            .ok_or_else(|| {
                CqfError::InvalidParameter(format!(
                    "key_remainder_bits ({}) + value_bits ({}) must be <= 64",
                    key_remainder_bits, value_bits
                ))
            })?;

        let xnslots = Self::compute_xnslots(nslots);
        let nblocks = xnslots / SLOTS_PER_BLOCK;
        let range: u128 = 1u128 << key_bits;

        Ok(Header {
            hash_mode,
            auto_resize: lock_mode_auto_resize,
            seed,
            nslots,
            xnslots,
            key_bits,
            value_bits,
            key_remainder_bits,
            bits_per_slot,
            range,
            nblocks,
            nelts: 0,
            ndistinct_elts: 0,
            noccupied_slots: 0,
        })
    }

    /// `xnslots = nslots + 10*sqrt(nslots)`, rounded up to a multiple of
    /// `SLOTS_PER_BLOCK` so the tail absorbs overflow from runs whose home
    /// slot is near the end.
    fn compute_xnslots(nslots: u64) -> u64 {
        let extra = (10.0 * (nslots as f64).sqrt()).ceil() as u64;
        let raw = nslots + extra;
        let rem = raw % SLOTS_PER_BLOCK;
        if rem == 0 {
            raw
        } else {
            raw + (SLOTS_PER_BLOCK - rem)
        }
    }

    /// `log2(nslots)`, i.e. the number of quotient bits.
    pub fn quotient_bits(&self) -> u8 {
        self.nslots.trailing_zeros() as u8
    }

    /// Number of bytes a single block occupies: one offset byte, two 64-bit
    /// bitmap words, and `bits_per_slot` 64-bit words holding 64 packed
    /// slots (`64 * bits_per_slot` bits == `bits_per_slot` words).
    pub fn block_bytes(&self) -> u64 {
        1 + 8 + 8 + 8 * u64::from(self.bits_per_slot)
    }

    /// Total byte size of the blocks region (excludes the header itself).
    pub fn blocks_size_in_bytes(&self) -> u64 {
        self.nblocks * self.block_bytes()
    }

    /// Load factor, `noccupied_slots / xnslots`.
    pub fn load_factor(&self) -> f64 {
        self.noccupied_slots as f64 / self.xnslots as f64
    }
}

/// Pure function exposed for callers that want to size their own buffer
/// before calling an `init`-style constructor. Mirrors the spec's
/// `required_bytes(nslots, key_bits, value_bits) -> u64`.
pub fn required_bytes(nslots: u64, key_bits: u8, value_bits: u8) -> Result<u64> {
    let header = Header::new(nslots, key_bits, value_bits, HashMode::Default, false, 0)?;
    Ok(header.blocks_size_in_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_basic() {
        let header = Header::new(64, 18, 0, HashMode::Default, false, 0).unwrap();
        assert_eq!(header.quotient_bits(), 6);
        assert_eq!(header.key_remainder_bits, 12);
        assert_eq!(header.bits_per_slot, 12);
        assert!(header.xnslots >= header.nslots);
        assert_eq!(header.xnslots % SLOTS_PER_BLOCK, 0);
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(Header::new(100, 18, 0, HashMode::Default, false, 0).is_err());
    }

    #[test]
    fn test_rejects_quotient_bits_exceeding_key_bits() {
        // nslots=2^10 needs 10 quotient bits, more than key_bits=8
        assert!(Header::new(1024, 8, 0, HashMode::Default, false, 0).is_err());
    }

    #[test]
    fn test_required_bytes_matches_header() {
        let header = Header::new(1024, 19, 4, HashMode::Default, false, 0).unwrap();
        let bytes = required_bytes(1024, 19, 4).unwrap();
        assert_eq!(bytes, header.blocks_size_in_bytes());
    }
}
