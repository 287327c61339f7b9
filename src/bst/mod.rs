// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Persistent, versioned binary search tree. Every mutation path-copies:
//! only the nodes from the root to the touched key are newly allocated,
//! everything else is shared (via [`Rc`]) with every prior version.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::config::TreeIndexConfig;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::manager::MemoryManager;
use crate::value::{persist_with_block_reuse, read_record, ValueLocator};
use crate::block::MemoryBlock;

#[derive(Debug, Clone)]
enum NodeValue {
    InMemory(Vec<u8>),
    Persisted(ValueLocator),
}

struct TreeNode<K> {
    key: K,
    value: RefCell<NodeValue>,
    left: Root<K>,
    right: Root<K>,
}

type Root<K> = Option<Rc<TreeNode<K>>>;

fn clone_value_cell(cell: &RefCell<NodeValue>) -> RefCell<NodeValue> {
    RefCell::new(cell.borrow().clone())
}

/// A persistent, versioned binary search tree mapping `K` to opaque
/// byte-string values.
pub struct BstIndex<K> {
    history: Vec<Root<K>>,
    manager: Rc<RefCell<MemoryManager>>,
    config: TreeIndexConfig,
    current_block: Option<Rc<RefCell<MemoryBlock>>>,
}

impl<K: Ord + Clone> BstIndex<K> {
    pub fn new(manager: Rc<RefCell<MemoryManager>>, config: TreeIndexConfig) -> Self {
        Self {
            history: vec![None],
            manager,
            config,
            current_block: None,
        }
    }

    fn current_root(&self) -> Root<K> {
        self.history.last().expect("history is never empty").clone()
    }

    fn materialize(&self, cell: &RefCell<NodeValue>) -> Vec<u8> {
        let snapshot = cell.borrow().clone();
        match snapshot {
            NodeValue::InMemory(bytes) => bytes,
            NodeValue::Persisted(locator) => {
                let block = self
                    .manager
                    .borrow()
                    .block(locator.block_id)
                    .expect("BstIndex never persists to a block the manager doesn't know about");
                read_record(&block, locator.address, self.config.value_header_len)
                    .expect("BstIndex never writes a malformed value record")
            }
        }
    }

    /// Breadth-first traversal of the current root; every still-in-memory
    /// value is written to the spill block and replaced in place with its
    /// locator. Does not push to `history`. Returns the number of values
    /// newly persisted.
    pub fn persist(&mut self) -> Result<usize> {
        let Some(root) = self.current_root() else {
            return Ok(0);
        };
        let mut queue = VecDeque::new();
        queue.push_back(root);
        let mut count = 0;

        while let Some(node) = queue.pop_front() {
            let is_in_memory = matches!(&*node.value.borrow(), NodeValue::InMemory(_));
            if is_in_memory {
                let payload = match &*node.value.borrow() {
                    NodeValue::InMemory(bytes) => bytes.clone(),
                    NodeValue::Persisted(_) => unreachable!(),
                };
                let locator = persist_with_block_reuse(
                    &mut self.manager.borrow_mut(),
                    &mut self.current_block,
                    &payload,
                    self.config.value_header_len,
                    self.config.allocate_scale,
                )?;
                *node.value.borrow_mut() = NodeValue::Persisted(locator);
                count += 1;
            }
            if let Some(left) = &node.left {
                queue.push_back(left.clone());
            }
            if let Some(right) = &node.right {
                queue.push_back(right.clone());
            }
        }
        log::debug!("persisted {count} BST node values");
        Ok(count)
    }

    /// Returns a fresh, independent index rooted at `history[version]`.
    pub fn checkout_version(&self, version: usize) -> Result<Self> {
        if version >= self.history.len() {
            return Err(Error::PreconditionViolation(format!(
                "checkout version {version} out of range (history has {} entries)",
                self.history.len()
            )));
        }
        Ok(Self {
            history: self.history[..=version].to_vec(),
            manager: self.manager.clone(),
            config: self.config,
            current_block: None,
        })
    }

    /// Returns a fresh, independent index rooted at `history[len-1-backoff]`.
    pub fn checkout_backoff(&self, backoff: usize) -> Result<Self> {
        if backoff >= self.history.len() {
            return Err(Error::PreconditionViolation(format!(
                "checkout backoff {backoff} out of range (history has {} entries)",
                self.history.len()
            )));
        }
        self.checkout_version(self.history.len() - 1 - backoff)
    }

    /// Number of mutations recorded, including the initial empty root.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn insert(node: &Root<K>, key: &K, value: Vec<u8>) -> Root<K> {
        match node {
            None => Some(Rc::new(TreeNode {
                key: key.clone(),
                value: RefCell::new(NodeValue::InMemory(value)),
                left: None,
                right: None,
            })),
            Some(node) => match key.cmp(&node.key) {
                std::cmp::Ordering::Equal => Some(Rc::new(TreeNode {
                    key: node.key.clone(),
                    value: RefCell::new(NodeValue::InMemory(value)),
                    left: node.left.clone(),
                    right: node.right.clone(),
                })),
                std::cmp::Ordering::Less => Some(Rc::new(TreeNode {
                    key: node.key.clone(),
                    value: clone_value_cell(&node.value),
                    left: Self::insert(&node.left, key, value),
                    right: node.right.clone(),
                })),
                std::cmp::Ordering::Greater => Some(Rc::new(TreeNode {
                    key: node.key.clone(),
                    value: clone_value_cell(&node.value),
                    left: node.left.clone(),
                    right: Self::insert(&node.right, key, value),
                })),
            },
        }
    }

    /// Detaches and returns the leftmost (key, value) pair of `node`'s
    /// subtree, path-copying the spine above it.
    fn detach_min(node: Rc<TreeNode<K>>) -> (K, RefCell<NodeValue>, Root<K>) {
        if node.left.is_none() {
            return (node.key.clone(), clone_value_cell(&node.value), node.right.clone());
        }
        let (key, value, new_left) = Self::detach_min(node.left.clone().unwrap());
        let replacement = Rc::new(TreeNode {
            key: node.key.clone(),
            value: clone_value_cell(&node.value),
            left: new_left,
            right: node.right.clone(),
        });
        (key, value, Some(replacement))
    }

    fn remove_rec(node: &Root<K>, key: &K) -> (Root<K>, bool) {
        let Some(node) = node else {
            return (None, false);
        };
        match key.cmp(&node.key) {
            std::cmp::Ordering::Less => {
                let (new_left, removed) = Self::remove_rec(&node.left, key);
                if !removed {
                    return (Some(node.clone()), false);
                }
                (
                    Some(Rc::new(TreeNode {
                        key: node.key.clone(),
                        value: clone_value_cell(&node.value),
                        left: new_left,
                        right: node.right.clone(),
                    })),
                    true,
                )
            }
            std::cmp::Ordering::Greater => {
                let (new_right, removed) = Self::remove_rec(&node.right, key);
                if !removed {
                    return (Some(node.clone()), false);
                }
                (
                    Some(Rc::new(TreeNode {
                        key: node.key.clone(),
                        value: clone_value_cell(&node.value),
                        left: node.left.clone(),
                        right: new_right,
                    })),
                    true,
                )
            }
            std::cmp::Ordering::Equal => match (&node.left, &node.right) {
                (None, None) => (None, true),
                (Some(left), None) => (Some(left.clone()), true),
                (None, Some(right)) => (Some(right.clone()), true),
                (Some(left), Some(right)) => {
                    let (succ_key, succ_value, new_right) = Self::detach_min(right.clone());
                    (
                        Some(Rc::new(TreeNode {
                            key: succ_key,
                            value: succ_value,
                            left: Some(left.clone()),
                            right: new_right,
                        })),
                        true,
                    )
                }
            },
        }
    }

    fn traverse_keys(node: &Root<K>, out: &mut Vec<K>) {
        let Some(node) = node else { return };
        let mut stack = Vec::new();
        let mut cur = Some(node.clone());
        loop {
            while let Some(n) = cur {
                stack.push(n.clone());
                cur = n.left.clone();
            }
            match stack.pop() {
                Some(n) => {
                    out.push(n.key.clone());
                    cur = n.right.clone();
                }
                None => break,
            }
        }
    }
}

impl<K: Ord + Clone> Index<K, Vec<u8>> for BstIndex<K> {
    fn set(&mut self, key: K, value: Vec<u8>) {
        let new_root = Self::insert(&self.current_root(), &key, value);
        self.history.push(new_root);
    }

    fn get(&self, key: &K) -> Option<Vec<u8>> {
        let mut cur = self.current_root();
        while let Some(node) = cur {
            match key.cmp(&node.key) {
                std::cmp::Ordering::Equal => return Some(self.materialize(&node.value)),
                std::cmp::Ordering::Less => cur = node.left.clone(),
                std::cmp::Ordering::Greater => cur = node.right.clone(),
            }
        }
        None
    }

    fn remove(&mut self, key: &K) -> bool {
        let (new_root, removed) = Self::remove_rec(&self.current_root(), key);
        if removed {
            self.history.push(new_root);
        }
        removed
    }

    fn keys(&self) -> Vec<K> {
        let mut out = Vec::new();
        Self::traverse_keys(&self.current_root(), &mut out);
        out
    }

    fn key_value_pairs(&self) -> Vec<(K, Vec<u8>)> {
        let root = self.current_root();
        let mut out = Vec::new();
        let mut stack = Vec::new();
        let mut cur = root;
        loop {
            while let Some(n) = cur {
                stack.push(n.clone());
                cur = n.left.clone();
            }
            match stack.pop() {
                Some(n) => {
                    out.push((n.key.clone(), self.materialize(&n.value)));
                    cur = n.right.clone();
                }
                None => break,
            }
        }
        out
    }

    fn clear(&mut self) {
        self.history = vec![None];
        self.current_block = None;
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

    fn new_manager(dir: &std::path::Path) -> Rc<RefCell<MemoryManager>> {
        let conf = ManagerConfig {
            pool_folder: dir.join("pools"),
            block_file: dir.join("block_file"),
            block_header_len: 10,
            pool: PoolConfig {
                pool_size: 1_000,
                pool_header_len: 5,
            },
        };
        Rc::new(RefCell::new(MemoryManager::open(conf).unwrap()))
    }

    #[test]
    fn set_then_get_returns_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        let mut index: BstIndex<i32> = BstIndex::new(manager, TreeIndexConfig::default());
        index.set(5, b"a".to_vec());
        index.set(5, b"b".to_vec());
        assert_eq!(index.get(&5), Some(b"b".to_vec()));
        assert_eq!(index.get(&6), None);
    }

    #[test]
    fn keys_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        let mut index: BstIndex<i32> = BstIndex::new(manager, TreeIndexConfig::default());
        for k in [5, 1, 9, 3, 7] {
            index.set(k, vec![k as u8]);
        }
        assert_eq!(index.keys(), vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn persist_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        let mut index: BstIndex<i32> = BstIndex::new(manager, TreeIndexConfig::default());
        index.set(1, b"one".to_vec());
        index.set(2, b"two".to_vec());
        assert_eq!(index.persist().unwrap(), 2);
        assert_eq!(index.persist().unwrap(), 0);
        assert_eq!(index.get(&1), Some(b"one".to_vec()));
        assert_eq!(index.get(&2), Some(b"two".to_vec()));
    }

    #[test]
    fn checkout_backoff_matches_scenario_s6() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        let mut index: BstIndex<i32> = BstIndex::new(manager, TreeIndexConfig::default());
        index.set(1, vec![10]);
        index.set(2, vec![8]);
        index.set(8, vec![100]);
        index.set(2, vec![4]);

        assert_eq!(index.checkout_backoff(0).unwrap().keys(), vec![1, 2, 8]);
        assert_eq!(index.checkout_backoff(2).unwrap().keys(), vec![1, 2]);
        assert_eq!(index.checkout_backoff(3).unwrap().keys(), vec![1]);

        let mut stale = index.checkout_backoff(3).unwrap();
        stale.set(2, vec![7]);
        assert_eq!(
            index.key_value_pairs(),
            vec![(1, vec![10]), (2, vec![4]), (8, vec![100])]
        );
    }

    #[test]
    fn remove_preserves_sortedness() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        let mut index: BstIndex<i32> = BstIndex::new(manager, TreeIndexConfig::default());
        for k in [5, 3, 8, 1, 4, 7, 9] {
            index.set(k, vec![k as u8]);
        }
        assert!(index.remove(&5));
        assert!(!index.remove(&5));
        assert_eq!(index.keys(), vec![1, 3, 4, 7, 8, 9]);
    }
}
