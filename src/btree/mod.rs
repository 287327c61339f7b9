// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! B-tree of configurable rank `r`, arena-indexed so that the node graph
//! (parent/child cycles) doesn't need raw pointers or `Rc` cycles.
//!
//! Each node keeps parallel `keys`/`values`/`children` vectors — the
//! parallel-array representation the design notes permit as an
//! alternative to a literal alternating child-slot/key-cell list,
//! provided every invariant and the `refresh`/split/rotate/merge
//! semantics are preserved. `children.len() == keys.len() + 1` always;
//! a leaf's children are all `None`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::BTreeConfig;
use crate::index::Index;
use crate::manager::MemoryManager;
use crate::value::{persist_fresh_block, read_record, ValueLocator};

struct BNode<K> {
    keys: Vec<K>,
    values: Vec<ValueLocator>,
    children: Vec<Option<usize>>,
    parent: Option<usize>,
    parent_slot: Option<usize>,
}

impl<K> BNode<K> {
    fn empty_leaf() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            children: vec![None],
            parent: None,
            parent_slot: None,
        }
    }

    fn is_leaf(&self) -> bool {
        self.children[0].is_none()
    }
}

/// A B-tree mapping `K` to opaque byte-string values, backed by the
/// pool/segment/block storage substrate. Every value lives in a
/// brand-new, exactly-sized block — unlike the BST and skip list, the
/// B-tree never reuses a spill block across values.
pub struct BTreeIndex<K> {
    arena: Vec<Option<BNode<K>>>,
    root: usize,
    manager: Rc<RefCell<MemoryManager>>,
    config: BTreeConfig,
}

impl<K: Ord + Clone> BTreeIndex<K> {
    pub fn new(manager: Rc<RefCell<MemoryManager>>, config: BTreeConfig) -> Self {
        assert!(config.rank >= 3, "rank must be at least 3");
        Self {
            arena: vec![Some(BNode::empty_leaf())],
            root: 0,
            manager,
            config,
        }
    }

    fn node(&self, idx: usize) -> &BNode<K> {
        self.arena[idx].as_ref().expect("arena slot is alive")
    }

    fn node_mut(&mut self, idx: usize) -> &mut BNode<K> {
        self.arena[idx].as_mut().expect("arena slot is alive")
    }

    fn push_node(&mut self, node: BNode<K>) -> usize {
        self.arena.push(Some(node));
        self.arena.len() - 1
    }

    /// Recomputes `parent`/`parent_slot` back-pointers for every child of
    /// `idx`. The single hygiene operation run after any mutating splice.
    fn refresh(&mut self, idx: usize) {
        let children = self.node(idx).children.clone();
        for (slot, child) in children.iter().enumerate() {
            if let Some(c) = child {
                let child_node = self.node_mut(*c);
                child_node.parent = Some(idx);
                child_node.parent_slot = Some(slot);
            }
        }
    }

    fn materialize(&self, locator: ValueLocator) -> Vec<u8> {
        let block = self
            .manager
            .borrow()
            .block(locator.block_id)
            .expect("BTreeIndex never persists to a block the manager doesn't know about");
        read_record(&block, locator.address, self.config.value_header_len)
            .expect("BTreeIndex never writes a malformed value record")
    }

    fn find_containing(&self, key: &K) -> Option<(usize, usize)> {
        let mut idx = self.root;
        loop {
            let node = self.node(idx);
            match node.keys.binary_search(key) {
                Ok(pos) => return Some((idx, pos)),
                Err(pos) => match node.children[pos] {
                    Some(child) => idx = child,
                    None => return None,
                },
            }
        }
    }

    fn split_loop(&mut self, mut idx: usize) {
        loop {
            let size = self.node(idx).keys.len();
            if size != self.config.rank {
                break;
            }
            let parent_idx = self.node(idx).parent;
            let parent_slot = self.node(idx).parent_slot;

            let median_pos = size / 2;
            let mut node = self.arena[idx].take().expect("node being split is alive");
            let right_keys = node.keys.split_off(median_pos + 1);
            let median_key = node.keys.pop().expect("median key exists at size == rank");
            let right_values = node.values.split_off(median_pos + 1);
            let median_value = node.values.pop().expect("median value exists");
            let right_children = node.children.split_off(median_pos + 1);

            let left = BNode {
                keys: node.keys,
                values: node.values,
                children: node.children,
                parent: None,
                parent_slot: None,
            };
            let right = BNode {
                keys: right_keys,
                values: right_values,
                children: right_children,
                parent: None,
                parent_slot: None,
            };
            self.arena[idx] = Some(left);
            let right_idx = self.push_node(right);
            self.refresh(idx);
            self.refresh(right_idx);

            match (parent_idx, parent_slot) {
                (Some(parent), Some(slot)) => {
                    let p = self.node_mut(parent);
                    p.keys.insert(slot, median_key);
                    p.values.insert(slot, median_value);
                    p.children[slot] = Some(idx);
                    p.children.insert(slot + 1, Some(right_idx));
                    self.refresh(parent);
                    idx = parent;
                }
                _ => {
                    let new_root = BNode {
                        keys: vec![median_key],
                        values: vec![median_value],
                        children: vec![Some(idx), Some(right_idx)],
                        parent: None,
                        parent_slot: None,
                    };
                    let new_idx = self.push_node(new_root);
                    self.root = new_idx;
                    self.refresh(new_idx);
                    break;
                }
            }
        }
    }

    /// Descends left from `idx` to the rightmost key cell, the in-order
    /// predecessor of whatever key sits just above `idx`.
    fn predecessor_leaf(&self, mut idx: usize) -> (usize, usize) {
        loop {
            let node = self.node(idx);
            let last_key = node.keys.len() - 1;
            match node.children[last_key + 1] {
                Some(child) => idx = child,
                None => return (idx, last_key),
            }
        }
    }

    fn rotate_from_left(&mut self, working: usize, parent: usize, slot: usize, left_sibling: usize) {
        let (popped_key, popped_value, popped_child) = {
            let l = self.node_mut(left_sibling);
            (
                l.keys.pop().expect("left sibling has spare keys"),
                l.values.pop().expect("left sibling has spare values"),
                l.children.pop().expect("left sibling has spare children"),
            )
        };
        let sep_slot = slot - 1;
        let (sep_key, sep_value) = {
            let p = self.node_mut(parent);
            (
                std::mem::replace(&mut p.keys[sep_slot], popped_key),
                std::mem::replace(&mut p.values[sep_slot], popped_value),
            )
        };
        {
            let w = self.node_mut(working);
            w.keys.insert(0, sep_key);
            w.values.insert(0, sep_value);
            w.children.insert(0, popped_child);
        }
        self.refresh(left_sibling);
        self.refresh(working);
    }

    fn rotate_from_right(&mut self, working: usize, parent: usize, slot: usize, right_sibling: usize) {
        let (shifted_key, shifted_value, shifted_child) = {
            let r = self.node_mut(right_sibling);
            (r.keys.remove(0), r.values.remove(0), r.children.remove(0))
        };
        let (sep_key, sep_value) = {
            let p = self.node_mut(parent);
            (
                std::mem::replace(&mut p.keys[slot], shifted_key),
                std::mem::replace(&mut p.values[slot], shifted_value),
            )
        };
        {
            let w = self.node_mut(working);
            w.keys.push(sep_key);
            w.values.push(sep_value);
            w.children.push(shifted_child);
        }
        self.refresh(right_sibling);
        self.refresh(working);
    }

    /// Absorbs the separator at `sep_slot` and `absorbed` (which must sit
    /// immediately to the right of `survivor`) into `survivor`.
    fn merge(&mut self, survivor: usize, parent: usize, sep_slot: usize, absorbed: usize) {
        let (sep_key, sep_value) = {
            let p = self.node_mut(parent);
            let k = p.keys.remove(sep_slot);
            let v = p.values.remove(sep_slot);
            p.children.remove(sep_slot + 1);
            (k, v)
        };
        let absorbed_node = self.arena[absorbed].take().expect("absorbed node is alive");
        let survivor_node = self.node_mut(survivor);
        survivor_node.keys.push(sep_key);
        survivor_node.values.push(sep_value);
        survivor_node.keys.extend(absorbed_node.keys);
        survivor_node.values.extend(absorbed_node.values);
        survivor_node.children.extend(absorbed_node.children);
        self.refresh(survivor);
        self.refresh(parent);
    }

    /// If `parent` is the root and became empty after a merge, the sole
    /// surviving child becomes the new root. Returns the node to resume
    /// the rebalance loop at, or `None` if the loop should stop.
    fn collapse_root_if_empty(&mut self, parent: usize) -> Option<usize> {
        if parent == self.root && self.node(parent).keys.is_empty() {
            let merged = self.node(parent).children[0].expect("empty root keeps one child");
            self.root = merged;
            let node = self.node_mut(merged);
            node.parent = None;
            node.parent_slot = None;
            self.arena[parent] = None;
            None
        } else {
            Some(parent)
        }
    }

    fn rebalance_loop(&mut self, mut idx: usize) {
        let threshold = (self.config.rank + 2) / 2 - 1;
        loop {
            if idx == self.root {
                break;
            }
            let size = self.node(idx).keys.len();
            if size >= threshold {
                break;
            }
            let parent = self.node(idx).parent.expect("non-root node has a parent");
            let slot = self.node(idx).parent_slot.expect("non-root node has a parent slot");

            let left_sibling = if slot > 0 {
                self.node(parent).children[slot - 1]
            } else {
                None
            };
            let right_sibling = self.node(parent).children.get(slot + 1).copied().flatten();

            if let Some(left) = left_sibling {
                if self.node(left).keys.len() > threshold {
                    self.rotate_from_left(idx, parent, slot, left);
                    continue;
                }
            }
            if let Some(right) = right_sibling {
                if self.node(right).keys.len() > threshold {
                    self.rotate_from_right(idx, parent, slot, right);
                    continue;
                }
            }
            if let Some(left) = left_sibling {
                self.merge(left, parent, slot - 1, idx);
            } else if let Some(right) = right_sibling {
                self.merge(idx, parent, slot, right);
            } else {
                unreachable!("a non-root node always has at least one sibling");
            }
            match self.collapse_root_if_empty(parent) {
                Some(next) => idx = next,
                None => break,
            }
        }
    }

    /// Every non-root node's size falls in `[threshold, rank-1]`; every
    /// internal node's child slots are all non-null and every leaf's are
    /// all null; an in-order walk yields strictly ascending keys. Intended
    /// for tests exercising mixed insert/remove workloads.
    pub fn check_invariants(&self) -> bool {
        let threshold = (self.config.rank + 2) / 2 - 1;
        for (idx, slot) in self.arena.iter().enumerate() {
            let Some(node) = slot else { continue };
            if idx != self.root && node.keys.len() < threshold {
                return false;
            }
            if node.keys.len() > self.config.rank - 1 {
                return false;
            }
            if node.children.len() != node.keys.len() + 1 {
                return false;
            }
            let leaf = node.is_leaf();
            let children_consistent = if leaf {
                node.children.iter().all(Option::is_none)
            } else {
                node.children.iter().all(Option::is_some)
            };
            if !children_consistent {
                return false;
            }
        }
        let keys = self.keys();
        keys.windows(2).all(|w| w[0] < w[1])
    }
}

impl<K: Ord + Clone> Index<K, Vec<u8>> for BTreeIndex<K> {
    fn set(&mut self, key: K, value: Vec<u8>) {
        let locator = persist_fresh_block(&mut self.manager.borrow_mut(), &value, self.config.value_header_len)
            .expect("B-tree value persistence is infallible under correct configuration");

        let mut idx = self.root;
        loop {
            let node = self.node(idx);
            match node.keys.binary_search(&key) {
                Ok(pos) => {
                    self.node_mut(idx).values[pos] = locator;
                    return;
                }
                Err(pos) => match node.children[pos] {
                    Some(child) => idx = child,
                    None => {
                        let n = self.node_mut(idx);
                        n.keys.insert(pos, key);
                        n.values.insert(pos, locator);
                        n.children.insert(pos + 1, None);
                        self.split_loop(idx);
                        return;
                    }
                },
            }
        }
    }

    fn get(&self, key: &K) -> Option<Vec<u8>> {
        self.find_containing(key)
            .map(|(idx, pos)| self.materialize(self.node(idx).values[pos]))
    }

    fn remove(&mut self, key: &K) -> bool {
        let Some((idx, pos)) = self.find_containing(key) else {
            return false;
        };

        let working = if self.node(idx).is_leaf() {
            self.node_mut(idx).keys.remove(pos);
            self.node_mut(idx).values.remove(pos);
            self.node_mut(idx).children.remove(pos + 1);
            idx
        } else {
            let left_child = self.node(idx).children[pos].expect("internal node's slot has a child");
            let (leaf_idx, leaf_pos) = self.predecessor_leaf(left_child);
            let (pred_key, pred_value) = {
                let leaf = self.node(leaf_idx);
                (leaf.keys[leaf_pos].clone(), leaf.values[leaf_pos])
            };
            {
                let n = self.node_mut(idx);
                n.keys[pos] = pred_key;
                n.values[pos] = pred_value;
            }
            let leaf = self.node_mut(leaf_idx);
            leaf.keys.remove(leaf_pos);
            leaf.values.remove(leaf_pos);
            leaf.children.remove(leaf_pos + 1);
            leaf_idx
        };

        self.rebalance_loop(working);
        true
    }

    fn keys(&self) -> Vec<K> {
        let mut out = Vec::new();
        let mut stack: Vec<(usize, usize)> = Vec::new();
        let mut cur = Some(self.root);
        loop {
            while let Some(idx) = cur {
                stack.push((idx, 0));
                cur = self.node(idx).children[0];
            }
            loop {
                let Some((idx, pos)) = stack.pop() else {
                    return out;
                };
                let node = self.node(idx);
                if pos < node.keys.len() {
                    out.push(node.keys[pos].clone());
                    stack.push((idx, pos + 1));
                    cur = node.children[pos + 1];
                    break;
                }
            }
        }
    }

    fn key_value_pairs(&self) -> Vec<(K, Vec<u8>)> {
        let mut out = Vec::new();
        let mut stack: Vec<(usize, usize)> = Vec::new();
        let mut cur = Some(self.root);
        loop {
            while let Some(idx) = cur {
                stack.push((idx, 0));
                cur = self.node(idx).children[0];
            }
            loop {
                let Some((idx, pos)) = stack.pop() else {
                    return out;
                };
                let node = self.node(idx);
                if pos < node.keys.len() {
                    out.push((node.keys[pos].clone(), self.materialize(node.values[pos])));
                    stack.push((idx, pos + 1));
                    cur = node.children[pos + 1];
                    break;
                }
            }
        }
    }

    fn clear(&mut self) {
        self.arena = vec![Some(BNode::empty_leaf())];
        self.root = 0;
    }

    fn len(&self) -> usize {
        self.keys().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use crate::config::{ManagerConfig, PoolConfig};
    use rand::seq::SliceRandom;

    fn new_manager(dir: &std::path::Path) -> Rc<RefCell<MemoryManager>> {
        let conf = ManagerConfig {
            pool_folder: dir.join("pools"),
            block_file: dir.join("block_file"),
            block_header_len: 10,
            pool: PoolConfig {
                pool_size: 10_000,
                pool_header_len: 5,
            },
        };
        Rc::new(RefCell::new(MemoryManager::open(conf).unwrap()))
    }

    #[test]
    fn set_then_get_returns_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        let mut index: BTreeIndex<i32> = BTreeIndex::new(manager, BTreeConfig::default());
        index.set(5, b"a".to_vec());
        index.set(5, b"b".to_vec());
        assert_eq!(index.get(&5), Some(b"b".to_vec()));
        assert_eq!(index.get(&9), None);
    }

    #[test]
    fn mixed_workload_keeps_invariants_s5() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        let mut index: BTreeIndex<i32> = BTreeIndex::new(
            manager,
            BTreeConfig {
                value_header_len: 5,
                rank: 5,
            },
        );
        for k in 1..=10 {
            index.set(k, vec![k as u8]);
        }
        assert!(index.check_invariants());

        let mut order: Vec<i32> = (1..=10).collect();
        let mut rng = rand::rng();
        order.shuffle(&mut rng);

        let mut remaining: Vec<i32> = (1..=10).collect();
        for k in order {
            assert!(index.remove(&k));
            remaining.retain(|&x| x != k);
            let mut sorted_remaining = remaining.clone();
            sorted_remaining.sort_unstable();
            assert_eq!(index.keys(), sorted_remaining);
            assert!(index.check_invariants());
        }
        assert!(index.is_empty());
    }

    #[test]
    fn remove_last_key_yields_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        let mut index: BTreeIndex<i32> = BTreeIndex::new(manager, BTreeConfig::default());
        index.set(1, vec![1]);
        assert!(index.remove(&1));
        assert!(index.is_empty());
        assert_eq!(index.root, 0);
        assert!(index.node(0).is_leaf());
    }
}
