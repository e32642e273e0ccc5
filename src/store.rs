/*
 * Public API: a single disk-backed ordered key-value store over u64 keys, wiring
 * together the node allocator (index file) and the data allocator (data file) behind
 * the B+tree algorithms in `tree.rs`.
 */
use std::path::{Path, PathBuf};

use crate::data_store::DataStore;
use crate::error::{Error, Result};
use crate::node_store::NodeStore;
use crate::options::StoreOptions;
use crate::tree;

/// An open key-value store backed by `<basename>.idx` and `<basename>.dat`.
///
/// There is no free-standing "not yet initialised" state: a `Store` value only
/// exists once both files are open and their headers are loaded, and `destroy`
/// consumes the value so it cannot be used again afterwards.
pub struct Store {
    nodes: NodeStore,
    data: DataStore,
}

impl Store {
    /// Opens (creating if necessary) the store rooted at `basename`, i.e.
    /// `basename.idx` and `basename.dat`.
    pub fn init(basename: &Path, options: &StoreOptions) -> Result<Self> {
        let idx_path = with_extension(basename, "idx");
        let dat_path = with_extension(basename, "dat");

        if idx_path.exists() != dat_path.exists() {
            return Err(Error::NotInitialised);
        }

        let nodes = NodeStore::open(&idx_path, options)?;
        let data = DataStore::open(&dat_path, options)?;
        log::info!("store initialised at {:?}", basename);
        Ok(Store { nodes, data })
    }

    /// Inserts `key` with `value`. Returns `false` without modifying the store if
    /// `key` is already present.
    pub fn insert(&mut self, key: u64, value: &[u8]) -> Result<bool> {
        tree::insert(&mut self.nodes, &mut self.data, key, value)
    }

    /// Looks up `key`, returning a copy of its value if present.
    pub fn find(&self, key: u64) -> Result<Option<Vec<u8>>> {
        tree::find(&self.nodes, &self.data, key)
    }

    /// All `(key, value)` pairs with `start <= key < end`, in ascending key order.
    pub fn find_range(&self, start: u64, end: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        tree::find_range(&self.nodes, &self.data, start, end)
    }

    /// Removes `key`. Returns `false` without modifying the store if `key` is absent.
    pub fn erase(&mut self, key: u64) -> Result<bool> {
        tree::erase(&mut self.nodes, &mut self.data, key)
    }

    /// Replaces the value stored at `key`. Returns `false` without modifying the
    /// store if `key` is absent; implemented as an erase followed by an insert, so
    /// the value's old data block is freed rather than overwritten in place.
    pub fn update(&mut self, key: u64, value: &[u8]) -> Result<bool> {
        tree::update(&mut self.nodes, &mut self.data, key, value)
    }

    /// Number of live entries.
    pub fn len(&self) -> u64 {
        self.data.live_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes and closes the store. Consuming `self` makes a post-destroy operation
    /// a compile error rather than a runtime `NotInitialised`.
    pub fn destroy(self) -> Result<()> {
        log::info!("store destroyed ({} live entries)", self.data.live_count());
        Ok(())
    }
}

fn with_extension(basename: &Path, ext: &str) -> PathBuf {
    let mut file_name = basename
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    file_name.push(".");
    file_name.push(ext);
    basename.with_file_name(file_name)
}
