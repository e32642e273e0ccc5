/*
 * The B+tree algorithm suite: find, insert (with preemptive root split), erase
 * (with rotate/merge rebalancing), update and find_range. Every function takes the
 * node store and data store it needs explicitly rather than bundling them into a
 * shared struct, since the recursive helpers only ever need one or the other.
 *
 * Branch nodes here use a "right-biased" separator convention: `keys[i]` is the
 * largest key reachable through `children[i]`, so descending a branch means finding
 * the first `i` with `key <= keys[i]` (BpNode::find_ge). A key larger than every
 * separator in the root means the tree has never seen anything that big; on insert
 * the rightmost separator is simply bumped up to cover it.
 */
use crate::data_store::DataStore;
use crate::error::Result;
use crate::format::ORDER;
use crate::node::BpNode;
use crate::node_store::NodeStore;

pub(crate) fn find(nodes: &NodeStore, data: &DataStore, key: u64) -> Result<Option<Vec<u8>>> {
    if nodes.height() == 0 {
        return Ok(None);
    }
    match find_recursive(nodes, key, nodes.root())? {
        Some(offset) => Ok(Some(data.read(offset)?)),
        None => Ok(None),
    }
}

fn find_recursive(nodes: &NodeStore, key: u64, offset: u64) -> Result<Option<u64>> {
    let node = nodes.read(offset)?;
    if node.is_leaf() {
        Ok(node.find_eq(key).map(|i| node.children[i]))
    } else {
        let i = node.find_ge(key);
        if i == node.size {
            Ok(None)
        } else {
            find_recursive(nodes, key, node.children[i])
        }
    }
}

/// Finds the leaf that would contain `key`, or `None` if `key` exceeds every
/// separator in the tree (nothing that large has ever been inserted).
fn find_leaf_ge(nodes: &NodeStore, key: u64, offset: u64) -> Result<Option<u64>> {
    let node = nodes.read(offset)?;
    if node.size == 0 || key > node.keys[node.size - 1] {
        return Ok(None);
    }
    if node.is_leaf() {
        return Ok(Some(offset));
    }
    let i = node.find_ge(key);
    find_leaf_ge(nodes, key, node.children[i])
}

/// All `(key, value)` pairs with `start <= key < end`, in ascending order.
pub(crate) fn find_range(
    nodes: &NodeStore,
    data: &DataStore,
    start: u64,
    end: u64,
) -> Result<Vec<(u64, Vec<u8>)>> {
    let mut out = Vec::new();
    if nodes.height() == 0 || start >= end {
        return Ok(out);
    }
    let mut offset = match find_leaf_ge(nodes, start, nodes.root())? {
        Some(offset) => offset,
        None => return Ok(out),
    };
    loop {
        let leaf = nodes.read(offset)?;
        for i in 0..leaf.size {
            if leaf.keys[i] >= start && leaf.keys[i] < end {
                out.push((leaf.keys[i], data.read(leaf.children[i])?));
            }
        }
        if leaf.size == 0 || leaf.keys[leaf.size - 1] >= end || leaf.next == 0 {
            break;
        }
        offset = leaf.next;
    }
    Ok(out)
}

pub(crate) fn insert(nodes: &mut NodeStore, data: &mut DataStore, key: u64, value: &[u8]) -> Result<bool> {
    if nodes.root() == 0 {
        let mut root = BpNode::new_leaf();
        root.size = 1;
        root.keys[0] = key;
        root.children[0] = data.alloc(value)?;
        let offset = nodes.alloc(&root)?;
        nodes.set_root(offset)?;
        nodes.set_height(1)?;
        return Ok(true);
    }

    let root = nodes.read(nodes.root())?;
    if root.is_full() {
        let mut parent = BpNode::new_branch();
        parent.size = 1;
        parent.keys[0] = root.keys[ORDER - 1];
        parent.children[0] = nodes.root();
        let parent_off = nodes.alloc(&parent)?;
        nodes.set_root(parent_off)?;
        split_ith_child(nodes, parent_off, 0)?;
        nodes.set_height(nodes.height() + 1)?;
    }
    insert_nonfull(nodes, data, nodes.root(), key, value)
}

fn insert_nonfull(nodes: &mut NodeStore, data: &mut DataStore, offset: u64, key: u64, value: &[u8]) -> Result<bool> {
    let mut node = nodes.read(offset)?;

    if node.is_leaf() {
        if node.find_eq(key).is_some() {
            return Ok(false);
        }
        let pos = (0..node.size).find(|&i| key < node.keys[i]).unwrap_or(node.size);
        for j in (pos..node.size).rev() {
            node.keys[j + 1] = node.keys[j];
            node.children[j + 1] = node.children[j];
        }
        node.keys[pos] = key;
        node.children[pos] = data.alloc(value)?;
        node.size += 1;
        nodes.write(offset, &node)?;
        return Ok(true);
    }

    let mut i = node.find_ge(key);
    if i == node.size {
        i -= 1;
        node.keys[i] = key;
        nodes.write(offset, &node)?;
    }

    let child = nodes.read(node.children[i])?;
    if child.is_full() {
        split_ith_child(nodes, offset, i)?;
        node = nodes.read(offset)?;
        if key > node.keys[i] {
            i += 1;
        }
    }
    insert_nonfull(nodes, data, node.children[i], key, value)
}

fn split_ith_child(nodes: &mut NodeStore, offset: u64, i: usize) -> Result<()> {
    let mut parent = nodes.read(offset)?;
    let mut left = nodes.read(parent.children[i])?;
    let half = ORDER / 2;

    let mut right = if left.is_leaf() { BpNode::new_leaf() } else { BpNode::new_branch() };
    right.size = half;
    for j in 0..half {
        right.keys[j] = left.keys[j + half];
        right.children[j] = left.children[j + half];
    }
    if left.is_leaf() {
        right.next = left.next;
    }
    left.size = half;

    for j in (i + 1..parent.size).rev() {
        parent.children[j + 1] = parent.children[j];
    }
    let right_off = nodes.alloc(&right)?;
    parent.children[i + 1] = right_off;
    if left.is_leaf() {
        left.next = right_off;
    }

    for j in (i..parent.size).rev() {
        parent.keys[j + 1] = parent.keys[j];
    }
    parent.keys[i] = left.keys[half - 1];
    parent.size += 1;

    let left_off = parent.children[i];
    nodes.write(offset, &parent)?;
    nodes.write(left_off, &left)?;
    nodes.write(right_off, &right)?;
    log::trace!("split_ith_child: split {} into {} and {}", left_off, left_off, right_off);
    Ok(())
}

pub(crate) fn erase(nodes: &mut NodeStore, data: &mut DataStore, key: u64) -> Result<bool> {
    if nodes.root() == 0 {
        return Ok(false);
    }
    let res = erase_nonunderflow(nodes, data, nodes.root(), key)?;

    let root = nodes.read(nodes.root())?;
    if root.size == 0 {
        nodes.free(nodes.root())?;
        nodes.set_root(0)?;
        nodes.set_height(0)?;
    } else {
        let mut root = root;
        while root.size == 1 && !root.is_leaf() {
            let old_root = nodes.root();
            nodes.free(old_root)?;
            nodes.set_root(root.children[0])?;
            nodes.set_height(nodes.height() - 1)?;
            root = nodes.read(nodes.root())?;
        }
    }
    Ok(res)
}

fn erase_nonunderflow(nodes: &mut NodeStore, data: &mut DataStore, offset: u64, key: u64) -> Result<bool> {
    let mut root = nodes.read(offset)?;
    let mut i = root.find_ge(key);
    if i >= root.size {
        return Ok(false);
    }

    if root.is_leaf() {
        if root.keys[i] != key {
            return Ok(false);
        }
        data.free(root.children[i])?;
        for j in i..root.size - 1 {
            root.keys[j] = root.keys[j + 1];
            root.children[j] = root.children[j + 1];
        }
        root.size -= 1;
        nodes.write(offset, &root)?;
        return Ok(true);
    }

    let mut node = nodes.read(root.children[i])?;
    if node.size == ORDER / 2 {
        let mut underflow = true;

        if i > 0 {
            let mut left = nodes.read(root.children[i - 1])?;
            if left.size != ORDER / 2 {
                for j in (1..=ORDER / 2).rev() {
                    node.keys[j] = node.keys[j - 1];
                    node.children[j] = node.children[j - 1];
                }
                node.keys[0] = left.keys[left.size - 1];
                node.children[0] = left.children[left.size - 1];
                node.size += 1;
                nodes.write(root.children[i], &node)?;

                left.size -= 1;
                nodes.write(root.children[i - 1], &left)?;

                root.keys[i - 1] = left.keys[left.size - 1];
                nodes.write(offset, &root)?;
                underflow = false;
                log::trace!("erase: rotated from left sibling into child {}", i);
            }
        }

        if underflow && i < root.size - 1 {
            let mut right = nodes.read(root.children[i + 1])?;
            if right.size != ORDER / 2 {
                node.keys[node.size] = right.keys[0];
                node.children[node.size] = right.children[0];
                node.size += 1;
                nodes.write(root.children[i], &node)?;

                for j in 0..right.size - 1 {
                    right.keys[j] = right.keys[j + 1];
                    right.children[j] = right.children[j + 1];
                }
                right.size -= 1;
                nodes.write(root.children[i + 1], &right)?;

                root.keys[i] = node.keys[node.size - 1];
                nodes.write(offset, &root)?;
                underflow = false;
                log::trace!("erase: rotated from right sibling into child {}", i);
            }
        }

        if underflow {
            if i < root.size - 1 {
                merge_child(nodes, offset, i)?;
            } else {
                merge_child(nodes, offset, i - 1)?;
                i -= 1;
            }
            log::trace!("erase: merged child {} of node at {}", i, offset);
        }
    }

    let child_offset = nodes.read(offset)?.children[i];
    let res = erase_nonunderflow(nodes, data, child_offset, key)?;

    let mut root = nodes.read(offset)?;
    let node = nodes.read(root.children[i])?;
    if root.keys[i] != node.keys[node.size - 1] {
        root.keys[i] = node.keys[node.size - 1];
        nodes.write(offset, &root)?;
    }
    Ok(res)
}

fn merge_child(nodes: &mut NodeStore, offset: u64, i: usize) -> Result<()> {
    let mut root = nodes.read(offset)?;
    let mut left = nodes.read(root.children[i])?;
    let right = nodes.read(root.children[i + 1])?;
    let half = ORDER / 2;

    for j in 0..half {
        left.keys[j + half] = right.keys[j];
        left.children[j + half] = right.children[j];
    }
    left.size = ORDER;
    if left.is_leaf() {
        left.next = right.next;
    }
    nodes.write(root.children[i], &left)?;
    nodes.free(root.children[i + 1])?;

    root.size -= 1;
    for j in i..root.size {
        root.keys[j] = root.keys[j + 1];
    }
    for j in i + 1..root.size {
        root.children[j] = root.children[j + 1];
    }
    nodes.write(offset, &root)?;
    Ok(())
}

pub(crate) fn update(nodes: &mut NodeStore, data: &mut DataStore, key: u64, value: &[u8]) -> Result<bool> {
    if nodes.root() == 0 || find_recursive(nodes, key, nodes.root())?.is_none() {
        return Ok(false);
    }
    erase(nodes, data, key)?;
    insert(nodes, data, key, value)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::StoreOptions;
    use rand::seq::SliceRandom;
    use rand::thread_rng;
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, NodeStore, DataStore) {
        let dir = tempdir().unwrap();
        let options = StoreOptions::default();
        let nodes = NodeStore::open(&dir.path().join("t.idx"), &options).unwrap();
        let data = DataStore::open(&dir.path().join("t.dat"), &options).unwrap();
        (dir, nodes, data)
    }

    fn value_for(key: u64) -> Vec<u8> {
        format!("value-{}", key).into_bytes()
    }

    #[test]
    fn insert_then_find_roundtrips() {
        let (_dir, mut nodes, mut data) = open();
        for key in [5u64, 1, 9, 3, 7] {
            assert!(insert(&mut nodes, &mut data, key, &value_for(key)).unwrap());
        }
        for key in [5u64, 1, 9, 3, 7] {
            assert_eq!(Some(value_for(key)), find(&nodes, &data, key).unwrap());
        }
        assert_eq!(None, find(&nodes, &data, 42).unwrap());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (_dir, mut nodes, mut data) = open();
        assert!(insert(&mut nodes, &mut data, 1, b"a").unwrap());
        assert!(!insert(&mut nodes, &mut data, 1, b"b").unwrap());
        assert_eq!(Some(b"a".to_vec()), find(&nodes, &data, 1).unwrap());
    }

    #[test]
    fn erase_missing_key_is_noop() {
        let (_dir, mut nodes, mut data) = open();
        insert(&mut nodes, &mut data, 1, b"a").unwrap();
        assert!(!erase(&mut nodes, &mut data, 2).unwrap());
        assert!(erase(&mut nodes, &mut data, 1).unwrap());
        assert_eq!(None, find(&nodes, &data, 1).unwrap());
    }

    #[test]
    fn update_replaces_value_for_existing_key_only() {
        let (_dir, mut nodes, mut data) = open();
        insert(&mut nodes, &mut data, 1, b"a").unwrap();
        assert!(update(&mut nodes, &mut data, 1, b"b").unwrap());
        assert_eq!(Some(b"b".to_vec()), find(&nodes, &data, 1).unwrap());
        assert!(!update(&mut nodes, &mut data, 2, b"c").unwrap());
    }

    #[test]
    fn find_range_is_half_open_and_ordered() {
        let (_dir, mut nodes, mut data) = open();
        for key in 0u64..50 {
            insert(&mut nodes, &mut data, key, &value_for(key)).unwrap();
        }
        let range = find_range(&nodes, &data, 10, 20).unwrap();
        let keys: Vec<u64> = range.iter().map(|(k, _)| *k).collect();
        assert_eq!((10..20).collect::<Vec<_>>(), keys);
        assert!(find_range(&nodes, &data, 100, 200).unwrap().is_empty());
    }

    #[test]
    fn root_splits_past_a_single_leaf() {
        let (_dir, mut nodes, mut data) = open();
        for key in 0u64..(ORDER as u64 + 10) {
            assert!(insert(&mut nodes, &mut data, key, &value_for(key)).unwrap());
        }
        assert!(nodes.height() >= 2, "inserting past ORDER keys must grow the tree's height");
        for key in 0u64..(ORDER as u64 + 10) {
            assert_eq!(Some(value_for(key)), find(&nodes, &data, key).unwrap());
        }
    }

    #[test]
    fn shuffled_insert_and_erase_of_a_thousand_keys() {
        let (_dir, mut nodes, mut data) = open();
        let mut keys: Vec<u64> = (0..1000).collect();
        keys.shuffle(&mut thread_rng());

        for &key in &keys {
            assert!(insert(&mut nodes, &mut data, key, &value_for(key)).unwrap());
        }
        for &key in &keys {
            assert_eq!(Some(value_for(key)), find(&nodes, &data, key).unwrap());
        }

        keys.shuffle(&mut thread_rng());
        for &key in &keys {
            assert!(erase(&mut nodes, &mut data, key).unwrap());
        }
        assert_eq!(0, nodes.root(), "erasing every key must collapse the tree back to empty");
        assert_eq!(0, nodes.height());
        for &key in &keys {
            assert_eq!(None, find(&nodes, &data, key).unwrap());
        }
    }

    #[test]
    fn merge_collapses_height_and_preserves_leaf_chain() {
        let (_dir, mut nodes, mut data) = open();
        let n = (ORDER as u64) * 3;
        for key in 0..n {
            insert(&mut nodes, &mut data, key, &value_for(key)).unwrap();
        }
        let starting_height = nodes.height();

        // Erase a large contiguous run to force merges and possibly a height collapse.
        for key in 0..(n - 2) {
            assert!(erase(&mut nodes, &mut data, key).unwrap());
        }
        assert!(nodes.height() <= starting_height);

        let remaining = find_range(&nodes, &data, 0, n).unwrap();
        let keys: Vec<u64> = remaining.iter().map(|(k, _)| *k).collect();
        assert_eq!(vec![n - 2, n - 1], keys, "leaf chain must stay intact across merges");
    }
}
