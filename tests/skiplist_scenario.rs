// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::cell::RefCell;
use std::rc::Rc;

use spillkv::{Index, ManagerConfig, MemoryManager, PoolConfig, SkipListConfig, SkipListIndex};

fn manager(dir: &std::path::Path) -> Rc<RefCell<MemoryManager>> {
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

#[test_log::test]
fn compact_reclaims_space_without_changing_values() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());
    let mut index: SkipListIndex<i32> =
        SkipListIndex::new(mgr.clone(), SkipListConfig::default());

    index.set(1, b"alpha".to_vec());
    index.set(2, b"beta".to_vec());
    assert!(index.remove(&1));

    let block = mgr.borrow().blocks()[0].clone();
    let free_before = block.borrow().free_memory();

    let before_value = index.get(&2);
    index.compact().unwrap();

    assert_eq!(index.get(&2), before_value);
    assert_eq!(index.keys(), vec![2]);

    let free_after = block.borrow().free_memory();
    assert!(
        free_after > free_before,
        "compact should reclaim the removed key's payload space: {free_before} -> {free_after}"
    );
}

#[test_log::test]
fn insert_remove_interleaved_keeps_sorted_keys() {
    let dir = tempfile::tempdir().unwrap();
    let mut index: SkipListIndex<i32> =
        SkipListIndex::new(manager(dir.path()), SkipListConfig::default());

    for k in [5, 1, 9, 3, 7, 2, 8] {
        index.set(k, vec![k as u8]);
    }
    assert!(index.remove(&9));
    assert!(index.remove(&1));
    assert!(!index.remove(&1));

    assert_eq!(index.keys(), vec![2, 3, 5, 7, 8]);
}
