/*
 * Index file: fixed-size slab allocator plus typed node read/write, per spec 4.2.
 *
 * The free list is rooted at a sentinel "tail block" whose size is TAIL_SENTINEL --
 * "free space extends to EOF" -- so alloc_node can serve both "carve a fresh slot
 * from the frontier" and "reuse a freed slot" through the same code path.
 */
use std::path::Path;

use crate::error::{Error, Result};
use crate::format::{BlockHeader, IndexHeader, IDX_HEADER_SIZE, MAGIC, NODE_PAYLOAD_SIZE, NODE_SIZE, TAIL_SENTINEL};
use crate::io::GrowableFile;
use crate::node::BpNode;
use crate::options::StoreOptions;

pub(crate) struct NodeStore {
    file: GrowableFile,
    header: IndexHeader,
}

impl NodeStore {
    pub fn open(path: &Path, options: &StoreOptions) -> Result<Self> {
        let initial_len = options
            .initial_map_size
            .max((IDX_HEADER_SIZE + NODE_SIZE) as usize);
        let (mut file, existed) = GrowableFile::open(path, initial_len, options.growth_increment)?;

        let header = if existed {
            let buf = file.read_at(0, IDX_HEADER_SIZE as usize).map_err(|_| Error::NotInitialised)?;
            IndexHeader::decode(buf).map_err(|_| Error::NotInitialised)?
        } else {
            let header = IndexHeader {
                free_head: IDX_HEADER_SIZE,
                root: 0,
                height: 0,
                node_count: 0,
            };
            file.append(&header.to_bytes())?;
            let tail = BlockHeader {
                size: TAIL_SENTINEL,
                next: 0,
            };
            file.append(&tail.to_bytes())?;
            header
        };

        log::debug!(
            "opened index file {:?} (existed={}, root={}, height={}, nodes={})",
            path,
            existed,
            header.root,
            header.height,
            header.node_count
        );

        Ok(NodeStore { file, header })
    }

    pub fn root(&self) -> u64 {
        self.header.root
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn node_count(&self) -> u64 {
        self.header.node_count
    }

    pub fn set_root(&mut self, root: u64) -> Result<()> {
        self.header.root = root;
        self.write_header()
    }

    pub fn set_height(&mut self, height: u64) -> Result<()> {
        self.header.height = height;
        self.write_header()
    }

    fn write_header(&mut self) -> Result<()> {
        self.file.write_at(0, &self.header.to_bytes())
    }

    fn read_block_header(&self, offset: u64) -> Result<BlockHeader> {
        Ok(BlockHeader::decode(self.file.read_at(offset, 16)?))
    }

    fn write_block_header(&mut self, offset: u64, header: &BlockHeader) -> Result<()> {
        self.file.write_at(offset, &header.to_bytes())
    }

    pub fn read(&self, offset: u64) -> Result<BpNode> {
        let buf = self.file.read_at(offset, NODE_PAYLOAD_SIZE as usize)?;
        BpNode::decode(buf)
    }

    pub fn write(&mut self, offset: u64, node: &BpNode) -> Result<()> {
        self.file.write_at(offset, &node.to_bytes())
    }

    /// Carves out a fresh slot (reusing a freed one if available) and writes `node`
    /// into it, returning the payload offset.
    pub fn alloc(&mut self, node: &BpNode) -> Result<u64> {
        let head = self.header.free_head;
        let header = self.read_block_header(head)?;

        let offset = head + 16;
        if header.size == NODE_PAYLOAD_SIZE {
            log::trace!("alloc_node: reusing freed slot at {}", head);
            let mut slot = header;
            slot.next = MAGIC;
            self.write_block_header(head, &slot)?;
            self.header.free_head = header.next;
        } else {
            log::trace!("alloc_node: carving slot {} from frontier", head);
            // Shrink the tail by one slot: its (unchanged) header moves forward.
            self.write_block_header(head + NODE_SIZE, &header)?;
            let slot = BlockHeader {
                size: NODE_PAYLOAD_SIZE,
                next: MAGIC,
            };
            self.write_block_header(head, &slot)?;
            self.header.free_head = head + NODE_SIZE;
        }

        self.write(offset, node)?;
        self.header.node_count += 1;
        self.write_header()?;
        Ok(offset)
    }

    /// Relinks the slot at `offset` onto the free list.
    pub fn free(&mut self, offset: u64) -> Result<()> {
        let slot_off = offset - 16;
        let mut header = self.read_block_header(slot_off)?;
        if !header.is_allocated() {
            log::warn!(
                "free_node: slot at {} is not allocated (double free or corrupt offset)",
                offset
            );
            return Err(Error::Corrupt(format!(
                "free_node: slot at {} is not allocated (double free or corrupt offset)",
                offset
            )));
        }
        header.next = self.header.free_head;
        self.write_block_header(slot_off, &header)?;
        self.header.free_head = slot_off;
        self.header.node_count -= 1;
        self.write_header()?;
        log::trace!("free_node: relinked slot {} onto free list", slot_off);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, NodeStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.idx");
        let store = NodeStore::open(&path, &StoreOptions::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn fresh_file_has_empty_header() {
        let (_dir, store) = open_store();
        assert_eq!(0, store.root());
        assert_eq!(0, store.height());
        assert_eq!(0, store.node_count());
    }

    #[test]
    fn alloc_then_free_reuses_slot() {
        let (_dir, mut store) = open_store();
        let leaf = BpNode::new_leaf();
        let off1 = store.alloc(&leaf).unwrap();
        assert_eq!(1, store.node_count());
        store.free(off1).unwrap();
        assert_eq!(0, store.node_count());
        let off2 = store.alloc(&leaf).unwrap();
        assert_eq!(off1, off2, "freed slot should be reused before growing the frontier");
    }

    #[test]
    fn double_free_is_corrupt() {
        let (_dir, mut store) = open_store();
        let leaf = BpNode::new_leaf();
        let off = store.alloc(&leaf).unwrap();
        store.free(off).unwrap();
        assert!(store.free(off).is_err());
    }

    #[test]
    fn alloc_survives_many_frontier_growths() {
        let (_dir, mut store) = open_store();
        let leaf = BpNode::new_leaf();
        let mut offsets = Vec::new();
        for _ in 0..2000 {
            offsets.push(store.alloc(&leaf).unwrap());
        }
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(offsets.len(), sorted.len(), "all allocated offsets must be distinct");
    }
}
