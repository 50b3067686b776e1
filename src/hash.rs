//! The `hash(key, seed) -> u64` collaborator and its inverse.
//!
//! Spec treats `hash` as an external collaborator; this module supplies a
//! concrete default (a seeded SipHash, matching the `SipHasherBuilder` the
//! teacher crate already builds its collections on) and a concrete
//! invertible hash for `HashMode::Invertible` (the MurmurHash3 `fmix64`
//! finalizer, whose three xor-shifts by 33 bits are each exactly
//! self-inverting in one reapplication since `33 >= 64/2`, and whose two
//! multiplications invert via their precomputed modular inverse mod
//! `2^64`).

use crate::layout::HashMode;
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

const FMIX_A: u64 = 0xff51_afd7_ed55_8ccd;
const FMIX_B: u64 = 0xc4ce_b9fe_1a85_ec53;
const FMIX_A_INV: u64 = 0x4f74_430c_22a5_4005;
const FMIX_B_INV: u64 = 0x9cb4_b2f8_1293_37db;

#[inline]
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(FMIX_A);
    k ^= k >> 33;
    k = k.wrapping_mul(FMIX_B);
    k ^= k >> 33;
    k
}

#[inline]
fn fmix64_inv(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(FMIX_B_INV);
    k ^= k >> 33;
    k = k.wrapping_mul(FMIX_A_INV);
    k ^= k >> 33;
    k
}

/// Applies `hash_mode` to `key`, returning the value actually stored as a
/// quotient/remainder pair.
pub fn hash(key: u64, seed: u32, hash_mode: HashMode) -> u64 {
    match hash_mode {
        HashMode::None => key,
        HashMode::Invertible => fmix64(key ^ u64::from(seed)),
        HashMode::Default => {
            let mut hasher = SipHasher13::new_with_keys(u64::from(seed), u64::from(seed));
            hasher.write_u64(key);
            hasher.finish()
        }
    }
}

/// Recovers the original key from a hashed value, when `hash_mode ==
/// HashMode::Invertible`. Calling this under any other hash mode is a
/// caller error: `Default` is not reversible and `None` needs no recovery
/// (the stored value already is the key).
pub fn invert(hashed: u64, seed: u32, hash_mode: HashMode) -> u64 {
    match hash_mode {
        HashMode::None => hashed,
        HashMode::Invertible => fmix64_inv(hashed) ^ u64::from(seed),
        HashMode::Default => panic!("HashMode::Default hashes are not invertible"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invertible_roundtrip() {
        for key in [0u64, 1, 42, u64::MAX, 0xDEAD_BEEF, 1 << 40] {
            let seed = 0x1234_5678u32;
            let h = hash(key, seed, HashMode::Invertible);
            assert_eq!(invert(h, seed, HashMode::Invertible), key);
        }
    }

    #[test]
    fn test_none_is_identity() {
        assert_eq!(hash(42, 7, HashMode::None), 42);
        assert_eq!(invert(42, 7, HashMode::None), 42);
    }

    #[test]
    fn test_default_is_seed_sensitive() {
        let a = hash(42, 1, HashMode::Default);
        let b = hash(42, 2, HashMode::Default);
        assert_ne!(a, b);
    }
}
