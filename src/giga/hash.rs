//! Entry-name hashing for partition addressing
//!
//! Names are hashed with MurmurHash3 x64_128 (seed 0) and the first eight
//! bytes of the digest select the partition. The partition index is read
//! from the hash in bit-reversed byte order so that every split cuts the
//! key space of the overflowing partition in half. Any change here breaks
//! compatibility with existing stores and peers.

use std::io::Cursor;

/// Number of hash bytes carried in store keys and used for addressing.
pub const HASH_LEN: usize = 8;

/// The addressing prefix of an entry-name digest.
pub type NameHash = [u8; HASH_LEN];

const MURMUR_SEED: u32 = 0;

/// Hash an entry name to its 8-byte addressing prefix.
pub fn name_hash(name: &str) -> NameHash {
    // Reading from an in-memory cursor cannot fail.
    let digest = murmur3::murmur3_x64_128(&mut Cursor::new(name.as_bytes()), MURMUR_SEED)
        .unwrap_or_default();
    // The low 64 bits hold the first half of the reference digest; its
    // little-endian bytes are the canonical 8-byte prefix.
    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&(digest as u64).to_le_bytes());
    hash
}

/// Compute the partition index encoded by the low `radix` bits of a hash.
///
/// Each hash byte contributes its bits in reversed order; full bytes shift
/// by eight, a residual byte is masked down to the bits still needed.
pub fn index_from_hash(hash: &NameHash, radix: u32) -> u32 {
    debug_assert!(radix <= 8 * HASH_LEN as u32);
    let full_bytes = (radix / 8) as usize;
    let residual_bits = radix % 8;

    let mut index: u32 = 0;
    for (i, byte) in hash.iter().take(full_bytes).enumerate() {
        index += (byte.reverse_bits() as u32) << (8 * i);
    }
    if residual_bits > 0 {
        let byte = hash[full_bytes].reverse_bits() as u32;
        let mask = (1u32 << residual_bits) - 1;
        index += (byte & mask) << (8 * full_bytes);
    }
    index
}

/// Whether an entry with the given hash moves into the freshly created
/// partition `child_index` when its parent partition splits.
pub fn migrates_to(hash: &NameHash, child_index: u32) -> bool {
    let radix = super::radix_from_index(child_index);
    index_from_hash(hash, radix) == child_index
}

/// Reverse the low `bits` bits of `value`.
///
/// Used by readdir to enumerate partitions in hash order rather than
/// index order.
pub fn reverse_low_bits(value: u8, bits: u32) -> u8 {
    if bits == 0 {
        return 0;
    }
    value.reverse_bits() >> (8 - bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_hash_is_deterministic() {
        let a = name_hash("test");
        let b = name_hash("test");
        assert_eq!(a, b);
        assert_ne!(name_hash("test"), name_hash("test2"));
    }

    #[test]
    fn test_index_uses_reversed_bit_order() {
        // 0b0000_0001 reversed is 0b1000_0000, so the low radix bits come
        // from the *high* bits of the reversed byte.
        let hash = [0b0000_0001u8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(index_from_hash(&hash, 8), 0b1000_0000);
        assert_eq!(index_from_hash(&hash, 1), 0);

        let hash = [0b1000_0000u8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(index_from_hash(&hash, 1), 1);
        assert_eq!(index_from_hash(&hash, 3), 0b001);
    }

    #[test]
    fn test_index_masks_to_radix() {
        let hash = [0xFFu8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(index_from_hash(&hash, 0), 0);
        assert_eq!(index_from_hash(&hash, 1), 1);
        assert_eq!(index_from_hash(&hash, 2), 3);
        assert_eq!(index_from_hash(&hash, 3), 7);
        assert_eq!(index_from_hash(&hash, 8), 255);
    }

    #[test]
    fn test_radix_nesting() {
        // An index under radix r is the index under radix r+1 with the top
        // bit dropped: the partition tree property splits rely on.
        for name in ["a", "b", "file-17", "some longer name"] {
            let hash = name_hash(name);
            for radix in 1..=7 {
                let narrow = index_from_hash(&hash, radix);
                let wide = index_from_hash(&hash, radix + 1);
                assert_eq!(wide & ((1 << radix) - 1), narrow);
            }
        }
    }

    #[test]
    fn test_migration_status() {
        // Child 1 has radix 1: entries migrate iff their first reversed
        // bit is set.
        let stays = [0b0000_0000u8, 0, 0, 0, 0, 0, 0, 0];
        let moves = [0b1000_0000u8, 0, 0, 0, 0, 0, 0, 0];
        assert!(!migrates_to(&stays, 1));
        assert!(migrates_to(&moves, 1));
    }

    #[test]
    fn test_reverse_low_bits() {
        assert_eq!(reverse_low_bits(0, 0), 0);
        assert_eq!(reverse_low_bits(0b01, 2), 0b10);
        assert_eq!(reverse_low_bits(0b001, 3), 0b100);
        assert_eq!(reverse_low_bits(0b110, 3), 0b011);
        assert_eq!(reverse_low_bits(0xFF, 8), 0xFF);
    }
}
