//! # 160-bit identifiers
//!
//! This module defines [`InfoHash`], the identifier used for both node ids
//! and content keys in the overlay:
//!
//! - **Derivation**: `InfoHash::get(bytes)` is the SHA-1 digest of the input,
//!   so keys can be derived deterministically from names or DER blobs
//! - **Ordering**: lexicographic, so hashes sort the same on every peer
//! - **Bit access**: `bit`/`set_bit`/`common_bits` for prefix arithmetic
//!   over the 160-bit keyspace
//!
//! Bit 0 is the most significant bit of the first byte, matching the
//! big-endian prefix order used by the keyspace.

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Length of an [`InfoHash`] in bytes.
pub const HASH_LEN: usize = 20;

/// Length of an [`InfoHash`] in bits.
pub const HASH_BITS: u32 = (HASH_LEN * 8) as u32;

/// 160-bit identifier for nodes and content keys.
///
/// The all-zero hash is reserved as the "absent" sentinel (e.g. a value
/// without a recipient).
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InfoHash([u8; HASH_LEN]);

impl InfoHash {
    /// Derive a hash from arbitrary bytes (SHA-1).
    ///
    /// SHA-1 is the wire-format choice for the 160-bit digest; all peers of
    /// one network must agree on it. It is used here purely as an identifier
    /// derivation, not for collision-resistant authentication.
    pub fn get(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        Self(digest.into())
    }

    /// Derive a hash from a string key.
    pub fn get_str(key: &str) -> Self {
        Self::get(key.as_bytes())
    }

    /// A uniformly random hash.
    pub fn random() -> Self {
        let mut bytes = [0u8; HASH_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The all-zero hash.
    #[inline]
    pub const fn zero() -> Self {
        Self([0u8; HASH_LEN])
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    #[inline]
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Read bit `i`, where bit 0 is the most significant bit of byte 0.
    #[inline]
    pub fn bit(&self, i: u32) -> bool {
        debug_assert!(i < HASH_BITS);
        self.0[(i / 8) as usize] & (0x80 >> (i % 8)) != 0
    }

    /// Set bit `i` to `v`.
    #[inline]
    pub fn set_bit(&mut self, i: u32, v: bool) {
        debug_assert!(i < HASH_BITS);
        let mask = 0x80 >> (i % 8);
        if v {
            self.0[(i / 8) as usize] |= mask;
        } else {
            self.0[(i / 8) as usize] &= !mask;
        }
    }

    /// Number of identical leading bits between `a` and `b` (0..=160).
    pub fn common_bits(a: &InfoHash, b: &InfoHash) -> u32 {
        let mut bits = 0u32;
        for i in 0..HASH_LEN {
            let x = a.0[i] ^ b.0[i];
            if x == 0 {
                bits += 8;
            } else {
                bits += x.leading_zeros();
                break;
            }
        }
        bits
    }

    /// Bitwise distance to `other` in the XOR metric.
    pub fn xor(&self, other: &InfoHash) -> InfoHash {
        let mut out = [0u8; HASH_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        InfoHash(out)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != HASH_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; HASH_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InfoHash({})", &self.to_hex()[..10])
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; HASH_LEN]> for InfoHash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<InfoHash> for [u8; HASH_LEN] {
    fn from(hash: InfoHash) -> Self {
        hash.0
    }
}

impl AsRef<[u8]> for InfoHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        let a = InfoHash::get(b"hello");
        let b = InfoHash::get(b"hello");
        let c = InfoHash::get(b"hellp");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn sha1_known_vector() {
        // SHA-1("abc")
        let h = InfoHash::get(b"abc");
        assert_eq!(h.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn string_and_byte_derivation_agree() {
        assert_eq!(InfoHash::get_str("node:abc"), InfoHash::get(b"node:abc"));
    }

    #[test]
    fn random_hashes_are_distinct() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(InfoHash::random()), "random InfoHash collision");
        }
    }

    #[test]
    fn bit_roundtrip() {
        let mut h = InfoHash::zero();
        for i in [0u32, 7, 8, 63, 64, 159] {
            assert!(!h.bit(i));
            h.set_bit(i, true);
            assert!(h.bit(i));
            h.set_bit(i, false);
            assert!(!h.bit(i));
        }
        assert!(h.is_zero());
    }

    #[test]
    fn bit_zero_is_most_significant() {
        let mut h = InfoHash::zero();
        h.set_bit(0, true);
        assert_eq!(h.as_bytes()[0], 0x80);

        let mut l = InfoHash::zero();
        l.set_bit(159, true);
        assert_eq!(l.as_bytes()[19], 0x01);
        assert!(h > l, "hashes order lexicographically");
    }

    #[test]
    fn common_bits_counts_shared_prefix() {
        let a = InfoHash::zero();
        assert_eq!(InfoHash::common_bits(&a, &a), 160);

        let mut b = InfoHash::zero();
        b.set_bit(0, true);
        assert_eq!(InfoHash::common_bits(&a, &b), 0);

        let mut c = InfoHash::zero();
        c.set_bit(42, true);
        assert_eq!(InfoHash::common_bits(&a, &c), 42);
    }

    #[test]
    fn xor_is_symmetric_and_self_annihilating() {
        for _ in 0..50 {
            let a = InfoHash::random();
            let b = InfoHash::random();
            assert_eq!(a.xor(&b), b.xor(&a));
            assert!(a.xor(&a).is_zero());
        }
    }

    #[test]
    fn hex_roundtrip() {
        for _ in 0..50 {
            let h = InfoHash::random();
            let hex = h.to_hex();
            assert_eq!(hex.len(), 40);
            assert_eq!(InfoHash::from_hex(&hex).expect("hex decode failed"), h);
        }
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert!(InfoHash::from_hex("abcd").is_err());
        assert!(InfoHash::from_hex(&"a".repeat(42)).is_err());
        assert!(InfoHash::from_hex(&"g".repeat(40)).is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let h = InfoHash::random();
        let bytes = bincode::serialize(&h).expect("serialize failed");
        let back: InfoHash = bincode::deserialize(&bytes).expect("deserialize failed");
        assert_eq!(h, back);
    }
}
