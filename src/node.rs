/*
 * In-memory representation of a B+tree node's payload and its encoding into the
 * fixed `NODE_PAYLOAD_SIZE`-byte slot area, decoded the same way the teacher
 * crate's `array_storage.rs` decodes its node arrays: raw little-endian reads at
 * fixed byte offsets, no intermediate `serde` representation.
 */
use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::format::{NODE_PAYLOAD_SIZE, NODE_TYPE_BRANCH, NODE_TYPE_LEAF, ORDER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Branch,
    Leaf,
}

impl NodeKind {
    fn to_u8(self) -> u8 {
        match self {
            NodeKind::Branch => NODE_TYPE_BRANCH,
            NodeKind::Leaf => NODE_TYPE_LEAF,
        }
    }

    fn from_u8(b: u8) -> Result<Self> {
        match b {
            NODE_TYPE_BRANCH => Ok(NodeKind::Branch),
            NODE_TYPE_LEAF => Ok(NodeKind::Leaf),
            other => {
                log::warn!("unknown node type tag {}", other);
                Err(Error::Corrupt(format!("unknown node type tag {}", other)))
            }
        }
    }
}

/// A loaded B+tree node. `keys`/`children` are fixed-size arrays; only the first
/// `size` entries are meaningful, per Invariant 1.
#[derive(Debug, Clone)]
pub(crate) struct BpNode {
    pub kind: NodeKind,
    pub size: usize,
    pub keys: [u64; ORDER],
    pub children: [u64; ORDER],
    /// Leaf chain forward link. Unused (left zero) on branch nodes.
    pub next: u64,
}

impl BpNode {
    pub fn new_leaf() -> Self {
        BpNode {
            kind: NodeKind::Leaf,
            size: 0,
            keys: [0; ORDER],
            children: [0; ORDER],
            next: 0,
        }
    }

    pub fn new_branch() -> Self {
        BpNode {
            kind: NodeKind::Branch,
            size: 0,
            keys: [0; ORDER],
            children: [0; ORDER],
            next: 0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    pub fn is_full(&self) -> bool {
        self.size == ORDER
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < NODE_PAYLOAD_SIZE as usize {
            log::warn!("node payload truncated: {} of {} bytes", buf.len(), NODE_PAYLOAD_SIZE);
            return Err(Error::Corrupt("node payload truncated".into()));
        }
        let kind = NodeKind::from_u8(buf[0])?;
        let size = buf[1] as usize;
        if size > ORDER {
            log::warn!("node size {} exceeds ORDER", size);
            return Err(Error::Corrupt(format!("node size {} exceeds ORDER", size)));
        }

        let mut keys = [0u64; ORDER];
        let mut children = [0u64; ORDER];
        let keys_start = 8;
        let children_start = keys_start + ORDER * 8;
        let next_off = children_start + ORDER * 8;
        for i in 0..ORDER {
            keys[i] = LittleEndian::read_u64(&buf[keys_start + i * 8..keys_start + i * 8 + 8]);
            children[i] =
                LittleEndian::read_u64(&buf[children_start + i * 8..children_start + i * 8 + 8]);
        }
        let next = LittleEndian::read_u64(&buf[next_off..next_off + 8]);

        if size > 1 {
            for i in 1..size {
                if keys[i] <= keys[i - 1] {
                    log::warn!("node keys are not strictly ascending at index {}", i);
                    return Err(Error::Corrupt("node keys are not strictly ascending".into()));
                }
            }
        }

        Ok(BpNode {
            kind,
            size,
            keys,
            children,
            next,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.kind.to_u8();
        buf[1] = self.size as u8;
        for b in &mut buf[2..8] {
            *b = 0;
        }
        let keys_start = 8;
        let children_start = keys_start + ORDER * 8;
        let next_off = children_start + ORDER * 8;
        for i in 0..ORDER {
            LittleEndian::write_u64(&mut buf[keys_start + i * 8..keys_start + i * 8 + 8], self.keys[i]);
            LittleEndian::write_u64(
                &mut buf[children_start + i * 8..children_start + i * 8 + 8],
                self.children[i],
            );
        }
        LittleEndian::write_u64(&mut buf[next_off..next_off + 8], self.next);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; NODE_PAYLOAD_SIZE as usize];
        self.encode(&mut buf);
        buf
    }

    /// First index `i` with `key <= keys[i]`, or `size` if no such separator exists.
    pub fn find_ge(&self, key: u64) -> usize {
        let mut i = 0;
        while i < self.size && key > self.keys[i] {
            i += 1;
        }
        i
    }

    /// Exact-match search within a leaf, by linear scan (keys are few and adjacent).
    pub fn find_eq(&self, key: u64) -> Option<usize> {
        for i in 0..self.size {
            if self.keys[i] == key {
                return Some(i);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_leaf() -> BpNode {
        let mut node = BpNode::new_leaf();
        node.size = 3;
        node.keys[0] = 10;
        node.keys[1] = 20;
        node.keys[2] = 30;
        node.children[0] = 100;
        node.children[1] = 200;
        node.children[2] = 300;
        node.next = 999;
        node
    }

    #[test]
    fn round_trips_leaf() {
        let node = sample_leaf();
        let bytes = node.to_bytes();
        let back = BpNode::decode(&bytes).unwrap();
        assert!(back.is_leaf());
        assert_eq!(3, back.size);
        assert_eq!([10, 20, 30], &back.keys[0..3]);
        assert_eq!([100, 200, 300], &back.children[0..3]);
        assert_eq!(999, back.next);
    }

    #[test]
    fn rejects_bad_type_tag() {
        let mut buf = vec![0u8; NODE_PAYLOAD_SIZE as usize];
        buf[0] = 0xff;
        assert!(BpNode::decode(&buf).is_err());
    }

    #[test]
    fn rejects_unsorted_keys() {
        let mut node = sample_leaf();
        node.keys[1] = 5; // out of order
        let bytes = node.to_bytes();
        assert!(BpNode::decode(&bytes).is_err());
    }

    #[test]
    fn find_ge_and_find_eq() {
        let node = sample_leaf();
        assert_eq!(Some(1), node.find_eq(20));
        assert_eq!(None, node.find_eq(25));
        assert_eq!(0, node.find_ge(5));
        assert_eq!(1, node.find_ge(11));
        assert_eq!(3, node.find_ge(31));
    }
}
