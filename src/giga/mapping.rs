//! The per-directory partition mapping
//!
//! A `GigaMapping` is the header table every server and client keeps for a
//! directory: a bitmap over partition indices plus the zeroth server and
//! the cluster size at creation time. Bit `i` set means partition `i`
//! exists; the partition tree grows by splitting a set partition `p` into
//! the child `p + 2^r` for the smallest radix `r` whose child bit is still
//! clear. Bitmaps only ever gain bits, so two copies can always be
//! reconciled by OR-ing them together.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::hash::{index_from_hash, name_hash, NameHash};
use super::{BITS_PER_MAP, MAX_BMAP_LEN, MAX_PARTITIONS, MAX_PARTITIONS_PER_SERVER};

/// Serialized size of a mapping: four u32 header fields plus the packed
/// bitmap.
pub const SERIALIZED_LEN: usize = 16 + MAX_BMAP_LEN;

/// When a partition is allowed to split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Split whenever a partition overflows.
    NoBound,
    /// Never split; the directory keeps its initial partitions.
    NeverSplit,
    /// Split until every server owns its share of partitions.
    NumServersBound,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        SplitPolicy::NumServersBound
    }
}

/// Radix needed to address a partition index: the number of hash bits that
/// distinguish it from its ancestors.
pub fn radix_from_index(index: u32) -> u32 {
    match index {
        0 => 0,
        1 => 1,
        _ => 32 - index.leading_zeros(),
    }
}

/// Parent of a partition in the split tree (drop the highest set bit).
pub fn parent_index(index: u32) -> u32 {
    if index == 0 {
        return 0;
    }
    index - (1 << (31 - index.leading_zeros()))
}

/// Mapping errors surface when peers ship malformed bitmaps.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("serialized mapping has {0} bytes, expected 53")]
    BadLength(usize),

    #[error("zeroth partition bit is clear")]
    MissingZerothBit,

    #[error("server count is zero")]
    NoServers,
}

#[derive(Debug, Clone)]
pub struct GigaMapping {
    /// Inode number of the directory this mapping describes.
    pub id: u32,
    /// Server owning partition 0 and the authoritative mapping row.
    pub zeroth_server: u32,
    /// Cluster size the partition-to-server mapping is computed against.
    pub server_count: u32,
    curr_radix: u32,
    bitmap: [u8; MAX_BMAP_LEN],
}

// The radix is derived from the bitmap (a freshly initialized map carries
// the historical radix of 1 for an identical bit pattern), so equality is
// over the real state only.
impl PartialEq for GigaMapping {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.zeroth_server == other.zeroth_server
            && self.server_count == other.server_count
            && self.bitmap == other.bitmap
    }
}

impl Eq for GigaMapping {}

impl GigaMapping {
    /// A fresh mapping: only the zeroth partition exists.
    pub fn new(id: u32, zeroth_server: u32, server_count: u32) -> Self {
        let mut bitmap = [0u8; MAX_BMAP_LEN];
        bitmap[0] = 1;
        Self {
            id,
            zeroth_server,
            server_count: server_count.max(1),
            curr_radix: 1,
            bitmap,
        }
    }

    /// Current radix: the number of hash bits needed to address the
    /// highest existing partition.
    pub fn radix(&self) -> u32 {
        self.curr_radix
    }

    pub fn bit(&self, index: u32) -> bool {
        let byte = (index / BITS_PER_MAP) as usize;
        let bit = index % BITS_PER_MAP;
        byte < MAX_BMAP_LEN && self.bitmap[byte] & (1 << bit) != 0
    }

    fn set_bit(&mut self, index: u32) {
        let byte = (index / BITS_PER_MAP) as usize;
        let bit = index % BITS_PER_MAP;
        self.bitmap[byte] |= 1 << bit;
    }

    fn highest_index(&self) -> u32 {
        for byte in (0..MAX_BMAP_LEN).rev() {
            if self.bitmap[byte] != 0 {
                let bit = 7 - self.bitmap[byte].leading_zeros();
                return byte as u32 * BITS_PER_MAP + bit;
            }
        }
        0
    }

    fn refresh_radix(&mut self) {
        self.curr_radix = radix_from_index(self.highest_index());
    }

    /// Partition owning the given name hash.
    ///
    /// The index computed from the current radix may not exist yet (the
    /// tree is not complete); walk up to the nearest existing ancestor.
    pub fn partition_for_hash(&self, hash: &NameHash) -> u32 {
        let mut index = index_from_hash(hash, self.curr_radix);
        while !self.bit(index) {
            index = parent_index(index);
        }
        index
    }

    /// Partition owning the given entry name.
    pub fn partition_for_name(&self, name: &str) -> u32 {
        self.partition_for_hash(&name_hash(name))
    }

    /// Server owning a partition index.
    pub fn server_for_index(&self, index: u32) -> u32 {
        (index + self.zeroth_server) % self.server_count
    }

    /// Server owning an entry name.
    pub fn server_for_name(&self, name: &str) -> u32 {
        self.server_for_index(self.partition_for_name(name))
    }

    /// The child partition created by splitting `index`: the first clear
    /// bit among `index + 2^r` for growing radix `r`. `None` once the
    /// partition space is exhausted.
    pub fn split_child(&self, index: u32) -> Option<u32> {
        debug_assert!(self.bit(index));
        let mut radix = radix_from_index(index);
        loop {
            let child = index + (1u32 << radix);
            if child >= MAX_PARTITIONS {
                return None;
            }
            if !self.bit(child) {
                return Some(child);
            }
            radix += 1;
        }
    }

    /// Whether splitting `index` is permitted under the given policy.
    pub fn is_splittable(&self, index: u32, policy: SplitPolicy) -> bool {
        match policy {
            SplitPolicy::NeverSplit => false,
            SplitPolicy::NoBound => self.split_child(index).is_some(),
            SplitPolicy::NumServersBound => match self.split_child(index) {
                Some(child) => child < MAX_PARTITIONS_PER_SERVER * self.server_count,
                None => false,
            },
        }
    }

    /// Record a committed split: set the child bit and refresh the radix.
    pub fn mark_split_done(&mut self, child_index: u32) {
        self.set_bit(child_index);
        self.refresh_radix();
    }

    /// Merge a peer's view into this one: union of bits, largest cluster
    /// size. Bits never clear, so the merge is monotonic on both sides.
    pub fn merge(&mut self, other: &GigaMapping) {
        for (mine, theirs) in self.bitmap.iter_mut().zip(other.bitmap.iter()) {
            *mine |= theirs;
        }
        if other.server_count > self.server_count {
            self.server_count = other.server_count;
        }
        self.refresh_radix();
    }

    /// Raw bitmap bytes in the legacy 7-bits-per-byte packing.
    pub fn bitmap_bytes(&self) -> &[u8; MAX_BMAP_LEN] {
        &self.bitmap
    }

    /// Rebuild a mapping from header fields and a packed bitmap, as
    /// carried on the wire.
    pub fn from_parts(
        id: u32,
        zeroth_server: u32,
        server_count: u32,
        bitmap: &[u8],
    ) -> Result<Self, MappingError> {
        if server_count == 0 {
            return Err(MappingError::NoServers);
        }
        let mut map = Self::new(id, zeroth_server, server_count);
        let len = bitmap.len().min(MAX_BMAP_LEN);
        map.bitmap[..len].copy_from_slice(&bitmap[..len]);
        if map.bitmap[0] & 1 == 0 {
            return Err(MappingError::MissingZerothBit);
        }
        map.refresh_radix();
        Ok(map)
    }

    /// Fixed-size store/wire layout:
    /// `id | radix | zeroth_server | server_count | bitmap`, little-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SERIALIZED_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.id);
        LittleEndian::write_u32(&mut buf[4..8], self.curr_radix);
        LittleEndian::write_u32(&mut buf[8..12], self.zeroth_server);
        LittleEndian::write_u32(&mut buf[12..16], self.server_count);
        buf[16..].copy_from_slice(&self.bitmap);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, MappingError> {
        if buf.len() != SERIALIZED_LEN {
            return Err(MappingError::BadLength(buf.len()));
        }
        let id = LittleEndian::read_u32(&buf[0..4]);
        let zeroth_server = LittleEndian::read_u32(&buf[8..12]);
        let server_count = LittleEndian::read_u32(&buf[12..16]);
        // The stored radix is advisory; recompute from the bitmap.
        Self::from_parts(id, zeroth_server, server_count, &buf[16..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_mapping() {
        let map = GigaMapping::new(7, 1, 4);
        assert!(map.bit(0));
        assert!(!map.bit(1));
        assert_eq!(map.radix(), 1);
        assert_eq!(map.zeroth_server, 1);
        assert_eq!(map.server_count, 4);
    }

    #[test]
    fn test_radix_from_index() {
        assert_eq!(radix_from_index(0), 0);
        assert_eq!(radix_from_index(1), 1);
        assert_eq!(radix_from_index(2), 2);
        assert_eq!(radix_from_index(3), 2);
        assert_eq!(radix_from_index(4), 3);
        assert_eq!(radix_from_index(7), 3);
        assert_eq!(radix_from_index(8), 4);
        assert_eq!(radix_from_index(255), 8);
    }

    #[test]
    fn test_parent_index() {
        assert_eq!(parent_index(0), 0);
        assert_eq!(parent_index(1), 0);
        assert_eq!(parent_index(2), 0);
        assert_eq!(parent_index(3), 1);
        assert_eq!(parent_index(6), 2);
        assert_eq!(parent_index(5), 1);
    }

    #[test]
    fn test_split_child_walks_radix() {
        let mut map = GigaMapping::new(0, 0, 8);
        assert_eq!(map.split_child(0), Some(1));

        map.mark_split_done(1);
        // Partition 0 splits again at the next radix.
        assert_eq!(map.split_child(0), Some(2));
        assert_eq!(map.split_child(1), Some(3));

        map.mark_split_done(2);
        map.mark_split_done(3);
        assert_eq!(map.radix(), 2);
        assert_eq!(map.split_child(0), Some(4));
        assert_eq!(map.split_child(3), Some(7));
    }

    #[test]
    fn test_partition_walks_to_existing_ancestor() {
        let mut map = GigaMapping::new(0, 0, 8);
        map.mark_split_done(1);
        map.mark_split_done(2);
        // Radix is now 2 but partition 3 does not exist: a hash addressing
        // 3 must fall back to its parent 1.
        let hash = [0b1100_0000u8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(index_from_hash(&hash, 2), 3);
        assert_eq!(map.partition_for_hash(&hash), 1);

        map.mark_split_done(3);
        assert_eq!(map.partition_for_hash(&hash), 3);
    }

    #[test]
    fn test_server_for_index_applies_zeroth_offset() {
        let map = GigaMapping::new(0, 2, 4);
        assert_eq!(map.server_for_index(0), 2);
        assert_eq!(map.server_for_index(1), 3);
        assert_eq!(map.server_for_index(2), 0);
        assert_eq!(map.server_for_index(6), 0);
    }

    #[test]
    fn test_splittable_num_servers_bound() {
        let mut map = GigaMapping::new(0, 0, 2);
        // Two servers, one partition each: 0 -> 1 is allowed, further
        // splits are not.
        assert!(map.is_splittable(0, SplitPolicy::NumServersBound));
        map.mark_split_done(1);
        assert!(!map.is_splittable(0, SplitPolicy::NumServersBound));
        assert!(!map.is_splittable(1, SplitPolicy::NumServersBound));

        assert!(map.is_splittable(0, SplitPolicy::NoBound));
        assert!(!map.is_splittable(0, SplitPolicy::NeverSplit));
    }

    #[test]
    fn test_merge_is_bitwise_or() {
        let mut a = GigaMapping::new(0, 0, 2);
        let mut b = GigaMapping::new(0, 0, 4);
        a.mark_split_done(1);
        b.mark_split_done(2);

        a.merge(&b);
        assert!(a.bit(0));
        assert!(a.bit(1));
        assert!(a.bit(2));
        assert_eq!(a.server_count, 4);
        assert_eq!(a.radix(), 2);

        // Merging the other way picks up bit 1 without losing bit 2.
        b.merge(&a);
        assert!(b.bit(1));
        assert!(b.bit(2));
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut map = GigaMapping::new(42, 1, 3);
        map.mark_split_done(1);
        map.mark_split_done(2);

        let bytes = map.to_bytes();
        assert_eq!(bytes.len(), SERIALIZED_LEN);
        let back = GigaMapping::from_bytes(&bytes).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_serialized_layout_is_stable() {
        let map = GigaMapping::new(0x0102_0304, 5, 6);
        let bytes = map.to_bytes();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &[1, 0, 0, 0]); // radix
        assert_eq!(&bytes[8..12], &[5, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[6, 0, 0, 0]);
        assert_eq!(bytes[16], 1); // zeroth bit in the first bitmap byte
        assert!(bytes[17..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_seven_bit_packing() {
        let mut map = GigaMapping::new(0, 0, 256);
        // Index 7 lives in the second byte under 7-bit packing.
        map.mark_split_done(7);
        assert_eq!(map.bitmap_bytes()[1], 1);
        assert!(map.bit(7));
        assert!(!map.bit(6));

        map.mark_split_done(13);
        assert_eq!(map.bitmap_bytes()[1], 1 | (1 << 6));
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(GigaMapping::from_bytes(&[0u8; 3]).is_err());
        let zeroed = vec![0u8; SERIALIZED_LEN];
        assert!(matches!(
            GigaMapping::from_bytes(&zeroed),
            Err(MappingError::NoServers)
        ));
    }
}
