// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Probabilistic skip list with coin-flip level promotion and per-block
//! value-region compaction. Unlike the BST, values are persisted
//! immediately on `set` rather than lazily.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::block::MemoryBlock;
use crate::config::SkipListConfig;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::manager::MemoryManager;
use crate::value::{encode_record, persist_with_block_reuse, read_record, ValueLocator};

type Link<K> = Option<Rc<SkipNode<K>>>;

struct SkipNode<K> {
    key: K,
    value: RefCell<ValueLocator>,
    right: RefCell<Link<K>>,
    down: Link<K>,
}

/// A skip list mapping `K` to opaque byte-string values, backed by the
/// pool/segment/block storage substrate.
///
/// `levels[0]` is the bottom level (holds every key); `levels[levels.len()-1]`
/// is the current top level.
pub struct SkipListIndex<K> {
    levels: Vec<RefCell<Link<K>>>,
    manager: Rc<RefCell<MemoryManager>>,
    config: SkipListConfig,
    current_block: Option<Rc<RefCell<MemoryBlock>>>,
    coin_flip: RefCell<Box<dyn FnMut() -> bool>>,
}

impl<K: Ord + Clone> SkipListIndex<K> {
    pub fn new(manager: Rc<RefCell<MemoryManager>>, config: SkipListConfig) -> Self {
        Self::with_coin_flip(manager, config, Box::new(|| rand::random::<bool>()))
    }

    /// Same as [`Self::new`] but with an injected coin-flip predicate
    /// instead of a fair `rand::random` coin — used by tests that need
    /// deterministic promotion heights.
    pub(crate) fn with_coin_flip(
        manager: Rc<RefCell<MemoryManager>>,
        config: SkipListConfig,
        coin_flip: Box<dyn FnMut() -> bool>,
    ) -> Self {
        Self {
            levels: vec![RefCell::new(None)],
            manager,
            config,
            current_block: None,
            coin_flip: RefCell::new(coin_flip),
        }
    }

    pub fn height(&self) -> usize {
        self.levels.len()
    }

    fn random_level(&self) -> usize {
        let mut level = 0;
        while (self.coin_flip.borrow_mut())() {
            level += 1;
        }
        level
    }

    fn materialize(&self, locator: ValueLocator) -> Vec<u8> {
        let block = self
            .manager
            .borrow()
            .block(locator.block_id)
            .expect("SkipListIndex never persists to a block the manager doesn't know about");
        read_record(&block, locator.address, self.config.value_header_len)
            .expect("SkipListIndex never writes a malformed value record")
    }

    /// Descends from the top level, returning the predecessor at every
    /// level (`None` meaning "the level's head") and the node at level 0
    /// matching `key`, if any.
    fn locate(&self, key: &K) -> (Vec<Link<K>>, Link<K>) {
        let mut preds = vec![None; self.levels.len()];
        let mut cur_node: Link<K> = None;

        for level in (0..self.levels.len()).rev() {
            loop {
                let next = match &cur_node {
                    Some(n) => n.right.borrow().clone(),
                    None => self.levels[level].borrow().clone(),
                };
                match &next {
                    Some(n) if n.key < *key => cur_node = Some(n.clone()),
                    _ => break,
                }
            }
            preds[level] = cur_node.clone();
            if level > 0 {
                cur_node = match &cur_node {
                    Some(n) => n.down.clone(),
                    None => None,
                };
            }
        }

        let candidate = match &preds[0] {
            Some(n) => n.right.borrow().clone(),
            None => self.levels[0].borrow().clone(),
        };
        let found = candidate.filter(|n| n.key == *key);
        (preds, found)
    }

    /// Reclaims fragmentation by rewriting each block's level-0 entries
    /// in address order, starting from offset 0. Entries removed from
    /// level 0 are simply absent and their bytes are not carried forward.
    pub fn compact(&mut self) -> Result<()> {
        let mut by_block: HashMap<u64, Vec<Rc<SkipNode<K>>>> = HashMap::new();
        let mut cur = self.levels[0].borrow().clone();
        while let Some(node) = cur {
            let block_id = node.value.borrow().block_id;
            by_block.entry(block_id).or_default().push(node.clone());
            cur = node.right.borrow().clone();
        }

        for (block_id, mut nodes) in by_block {
            nodes.sort_by_key(|n| n.value.borrow().address);
            let block = self
                .manager
                .borrow()
                .block(block_id)
                .ok_or(Error::UnknownBlock(block_id))?;
            block.borrow_mut().rewind(0)?;

            let mut buffer = Vec::new();
            let mut next_address = 0u64;
            for node in &nodes {
                let old_address = node.value.borrow().address;
                let payload = read_record(&block, old_address, self.config.value_header_len)?;
                let record = encode_record(&payload, self.config.value_header_len)?;
                node.value.borrow_mut().address = next_address;
                next_address += record.len() as u64;
                buffer.extend_from_slice(&record);
                if buffer.len() >= self.config.compact_buffer_len {
                    block.borrow_mut().write(&buffer)?;
                    buffer.clear();
                }
            }
            if !buffer.is_empty() {
                block.borrow_mut().write(&buffer)?;
            }
        }
        log::debug!("compacted skip list value blocks");
        Ok(())
    }
}

impl<K: Ord + Clone> Index<K, Vec<u8>> for SkipListIndex<K> {
    fn set(&mut self, key: K, value: Vec<u8>) {
        let locator = persist_with_block_reuse(
            &mut self.manager.borrow_mut(),
            &mut self.current_block,
            &value,
            self.config.value_header_len,
            self.config.allocate_scale,
        )
        .expect("skip list value persistence is infallible under correct configuration");

        let (preds, found) = self.locate(&key);
        if let Some(found) = found {
            *found.value.borrow_mut() = locator;
            // propagate to every higher level occurrence of the same key.
            for level in 1..self.levels.len() {
                let candidate = match &preds[level] {
                    Some(n) => n.right.borrow().clone(),
                    None => self.levels[level].borrow().clone(),
                };
                match candidate {
                    Some(n) if n.key == key => *n.value.borrow_mut() = locator,
                    _ => break,
                }
            }
            return;
        }

        let target_level = self.random_level();
        let mut down: Link<K> = None;
        for level in 0..=target_level {
            if level >= self.levels.len() {
                self.levels.push(RefCell::new(None));
            }
            let new_node = Rc::new(SkipNode {
                key: key.clone(),
                value: RefCell::new(locator),
                right: RefCell::new(None),
                down: down.clone(),
            });
            let pred = preds.get(level).cloned().flatten();
            match pred {
                Some(p) => {
                    *new_node.right.borrow_mut() = p.right.borrow().clone();
                    *p.right.borrow_mut() = Some(new_node.clone());
                }
                None => {
                    *new_node.right.borrow_mut() = self.levels[level].borrow().clone();
                    *self.levels[level].borrow_mut() = Some(new_node.clone());
                }
            }
            down = Some(new_node);
        }
    }

    fn get(&self, key: &K) -> Option<Vec<u8>> {
        let (_, found) = self.locate(key);
        found.map(|n| self.materialize(*n.value.borrow()))
    }

    fn remove(&mut self, key: &K) -> bool {
        let (preds, found) = self.locate(key);
        if found.is_none() {
            return false;
        }
        for level in 0..self.levels.len() {
            let candidate = match &preds[level] {
                Some(n) => n.right.borrow().clone(),
                None => self.levels[level].borrow().clone(),
            };
            match candidate {
                Some(n) if n.key == *key => {
                    let next = n.right.borrow().clone();
                    match &preds[level] {
                        Some(p) => *p.right.borrow_mut() = next,
                        None => *self.levels[level].borrow_mut() = next,
                    }
                }
                _ => break,
            }
        }
        while self.levels.len() > 1 && self.levels.last().unwrap().borrow().is_none() {
            self.levels.pop();
        }
        true
    }

    fn keys(&self) -> Vec<K> {
        let mut out = Vec::new();
        let mut cur = self.levels[0].borrow().clone();
        while let Some(n) = cur {
            out.push(n.key.clone());
            cur = n.right.borrow().clone();
        }
        out
    }

    fn key_value_pairs(&self) -> Vec<(K, Vec<u8>)> {
        let mut out = Vec::new();
        let mut cur = self.levels[0].borrow().clone();
        while let Some(n) = cur {
            let value = self.materialize(*n.value.borrow());
            out.push((n.key.clone(), value));
            cur = n.right.borrow().clone();
        }
        out
    }

    fn clear(&mut self) {
        self.levels = vec![RefCell::new(None)];
        self.current_block = None;
    }

    fn len(&self) -> usize {
        let mut count = 0;
        let mut cur = self.levels[0].borrow().clone();
        while let Some(n) = cur {
            count += 1;
            cur = n.right.borrow().clone();
        }
        count
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

    fn always_promote_twice() -> Box<dyn FnMut() -> bool> {
        let mut calls = 0;
        Box::new(move || {
            calls += 1;
            calls <= 2
        })
    }

    #[test]
    fn set_then_get_returns_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        let mut index: SkipListIndex<i32> =
            SkipListIndex::new(manager, SkipListConfig::default());
        index.set(5, b"a".to_vec());
        index.set(5, b"b".to_vec());
        assert_eq!(index.get(&5), Some(b"b".to_vec()));
        assert_eq!(index.get(&9), None);
    }

    #[test]
    fn keys_are_sorted_with_forced_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        let mut index: SkipListIndex<i32> = SkipListIndex::with_coin_flip(
            manager,
            SkipListConfig::default(),
            always_promote_twice(),
        );
        for k in [5, 1, 9, 3, 7] {
            index.set(k, vec![k as u8]);
        }
        assert_eq!(index.keys(), vec![1, 3, 5, 7, 9]);
        assert!(index.height() >= 2);
    }

    #[test]
    fn clear_leaves_exactly_one_empty_level() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        let mut index: SkipListIndex<i32> = SkipListIndex::new(manager, SkipListConfig::default());
        index.set(1, vec![1]);
        index.set(2, vec![2]);
        index.clear();
        assert_eq!(index.height(), 1);
        assert!(index.is_empty());
    }

    #[test]
    fn compact_preserves_values_s7() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        let mut index: SkipListIndex<i32> =
            SkipListIndex::new(manager.clone(), SkipListConfig::default());
        index.set(1, b"alpha".to_vec());
        index.set(2, b"beta".to_vec());
        assert!(index.remove(&1));

        let block = manager.borrow().blocks()[0].clone();
        let free_before = block.borrow().free_memory();

        let before = index.get(&2);
        index.compact().unwrap();
        assert_eq!(index.get(&2), before);
        assert_eq!(index.keys(), vec![2]);

        let free_after = block.borrow().free_memory();
        assert!(
            free_after > free_before,
            "compact should reclaim the removed key's payload space: {free_before} -> {free_after}"
        );
    }
}
