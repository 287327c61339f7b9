// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! End-to-end exercises of the pool/segment/block/manager substrate
//! through the crate's public API, driven against a fresh `tempdir()`
//! per the crate's dev-dependency convention.

use spillkv::{ManagerConfig, MemoryManager, PoolConfig};

fn manager_conf(dir: &std::path::Path, pool_size: u64, pool_header_len: usize) -> ManagerConfig {
    ManagerConfig {
        pool_folder: dir.join("pools"),
        block_file: dir.join("block_file"),
        block_header_len: 10,
        pool: PoolConfig {
            pool_size,
            pool_header_len,
        },
    }
}

#[test_log::test]
fn manifest_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let conf = manager_conf(dir.path(), 10, 5);

    {
        let mut manager = MemoryManager::open(conf.clone()).unwrap();
        manager.allocate_block(8).unwrap();
    }

    let manager = MemoryManager::open(conf).unwrap();
    assert_eq!(manager.pools().len(), 2);
    let limits: Vec<u64> = manager
        .pools()
        .iter()
        .map(|p| p.borrow().allocate_limit())
        .collect();
    assert_eq!(limits, vec![0, 2]);
    assert_eq!(manager.blocks().len(), 1);
    assert_eq!(manager.blocks()[0].borrow().size(), 8);
    assert_eq!(manager.blocks()[0].borrow().used_memory(), 0);
}

#[test_log::test]
fn allocation_spans_three_pools() {
    let dir = tempfile::tempdir().unwrap();
    let conf = manager_conf(dir.path(), 10, 5);
    let mut manager = MemoryManager::open(conf).unwrap();

    manager.allocate_block(3).unwrap();
    let block = manager.allocate_block(9).unwrap();

    let described: Vec<(u32, u64, u64, u64)> = block
        .borrow()
        .segments()
        .iter()
        .map(|s| (s.pool_id(), s.start(), s.end(), s.length()))
        .collect();
    assert_eq!(described, vec![(0, 8, 10, 2), (1, 5, 10, 5), (2, 5, 7, 2)]);
}

#[test_log::test]
fn write_then_read_crosses_segment_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let conf = manager_conf(dir.path(), 10, 5);
    let mut manager = MemoryManager::open(conf).unwrap();

    let block = manager.allocate_block(9).unwrap();
    block.borrow_mut().write(b"something").unwrap();
    assert_eq!(block.borrow().read(0, 9).unwrap(), b"something");
}

#[test_log::test]
fn rewind_then_write_overwrites_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let conf = manager_conf(dir.path(), 10, 5);
    let mut manager = MemoryManager::open(conf).unwrap();

    let block = manager.allocate_block(5).unwrap();
    block.borrow_mut().write(b"hello").unwrap();
    block.borrow_mut().rewind(2).unwrap();
    block.borrow_mut().write(b"hey").unwrap();
    assert_eq!(block.borrow().read(0, 5).unwrap(), b"hehey");
}
