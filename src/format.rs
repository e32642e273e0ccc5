/*
 * On-disk layout constants and the small fixed-size records shared by both files:
 * the block header prefixing every node slot and every data block, and the two
 * file headers. All multi-byte fields are little-endian, decoded with `byteorder`
 * the same way the teacher crate's `array_storage.rs` decodes its node arrays.
 */
use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Branching factor. Non-root nodes carry between `ORDER/2` and `ORDER` keys.
pub(crate) const ORDER: usize = 254;

pub(crate) const NODE_TYPE_BRANCH: u8 = 0x01;
pub(crate) const NODE_TYPE_LEAF: u8 = 0x02;

/// `next` field value marking a slot/block as allocated. 32 bits wide in the
/// source, widened into this 64-bit field with zeroed high bits.
pub(crate) const MAGIC: u64 = 0x0123_4567;

/// Sentinel `size` of the free-list tail block: "free space extends to EOF".
pub(crate) const TAIL_SENTINEL: u64 = u64::MAX;

pub(crate) const MIN_BLOCK_SIZE: u64 = 32;

pub(crate) const BLOCK_HEADER_SIZE: u64 = 16;

/// 1 (type) + 1 (size) + 6 (reserved) + ORDER*8 (keys) + ORDER*8 (children) + 8 (next)
pub(crate) const NODE_PAYLOAD_SIZE: u64 = 1 + 1 + 6 + (ORDER as u64) * 8 + (ORDER as u64) * 8 + 8;
pub(crate) const NODE_SIZE: u64 = BLOCK_HEADER_SIZE + NODE_PAYLOAD_SIZE;

pub(crate) const IDX_HEADER_SIZE: u64 = 32;
pub(crate) const DAT_HEADER_SIZE: u64 = 16;

/// `{ size, next }` prefixing every index slot and every data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockHeader {
    pub size: u64,
    pub next: u64,
}

impl BlockHeader {
    pub fn decode(buf: &[u8]) -> Self {
        BlockHeader {
            size: LittleEndian::read_u64(&buf[0..8]),
            next: LittleEndian::read_u64(&buf[8..16]),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.size);
        LittleEndian::write_u64(&mut buf[8..16], self.next);
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE as usize] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE as usize];
        self.encode(&mut buf);
        buf
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.next == MAGIC
    }
}

/// `{ free_head, root, height, node_count }`, the index file's first 32 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IndexHeader {
    pub free_head: u64,
    pub root: u64,
    pub height: u64,
    pub node_count: u64,
}

impl IndexHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < IDX_HEADER_SIZE as usize {
            log::warn!("index header truncated: {} of {} bytes", buf.len(), IDX_HEADER_SIZE);
            return Err(Error::Corrupt("index header truncated".into()));
        }
        Ok(IndexHeader {
            free_head: LittleEndian::read_u64(&buf[0..8]),
            root: LittleEndian::read_u64(&buf[8..16]),
            height: LittleEndian::read_u64(&buf[16..24]),
            node_count: LittleEndian::read_u64(&buf[24..32]),
        })
    }

    pub fn to_bytes(&self) -> [u8; IDX_HEADER_SIZE as usize] {
        let mut buf = [0u8; IDX_HEADER_SIZE as usize];
        LittleEndian::write_u64(&mut buf[0..8], self.free_head);
        LittleEndian::write_u64(&mut buf[8..16], self.root);
        LittleEndian::write_u64(&mut buf[16..24], self.height);
        LittleEndian::write_u64(&mut buf[24..32], self.node_count);
        buf
    }
}

/// `{ free_head, live_count }`, the data file's first 16 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DataHeader {
    pub free_head: u64,
    pub live_count: u64,
}

impl DataHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < DAT_HEADER_SIZE as usize {
            log::warn!("data header truncated: {} of {} bytes", buf.len(), DAT_HEADER_SIZE);
            return Err(Error::Corrupt("data header truncated".into()));
        }
        Ok(DataHeader {
            free_head: LittleEndian::read_u64(&buf[0..8]),
            live_count: LittleEndian::read_u64(&buf[8..16]),
        })
    }

    pub fn to_bytes(&self) -> [u8; DAT_HEADER_SIZE as usize] {
        let mut buf = [0u8; DAT_HEADER_SIZE as usize];
        LittleEndian::write_u64(&mut buf[0..8], self.free_head);
        LittleEndian::write_u64(&mut buf[8..16], self.live_count);
        buf
    }
}

pub(crate) fn round_up_16(n: u64) -> u64 {
    (n + 15) & !15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_size_is_4096() {
        assert_eq!(4096, NODE_SIZE);
    }

    #[test]
    fn block_header_round_trips() {
        let header = BlockHeader { size: 12345, next: MAGIC };
        let bytes = header.to_bytes();
        assert_eq!(header, BlockHeader::decode(&bytes));
    }

    #[test]
    fn round_up_16_boundaries() {
        assert_eq!(0, round_up_16(0));
        assert_eq!(16, round_up_16(1));
        assert_eq!(16, round_up_16(16));
        assert_eq!(32, round_up_16(17));
    }
}
