// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::cell::RefCell;
use std::rc::Rc;

use spillkv::{BstIndex, Index, ManagerConfig, MemoryManager, PoolConfig, TreeIndexConfig};

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
fn checkout_backoff_isolates_history() {
    let dir = tempfile::tempdir().unwrap();
    let mut index: BstIndex<i32> = BstIndex::new(manager(dir.path()), TreeIndexConfig::default());

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

#[test_log::test]
fn persist_survives_across_a_fresh_checkout() {
    let dir = tempfile::tempdir().unwrap();
    let mgr = manager(dir.path());
    let mut index: BstIndex<i32> = BstIndex::new(mgr, TreeIndexConfig::default());

    index.set(1, b"one".to_vec());
    index.set(2, b"two".to_vec());
    index.persist().unwrap();

    let checked_out = index.checkout_backoff(0).unwrap();
    assert_eq!(checked_out.get(&1), Some(b"one".to_vec()));
    assert_eq!(checked_out.get(&2), Some(b"two".to_vec()));
}
