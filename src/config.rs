// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Numeric configuration shared by the storage substrate and the three
//! index implementations.
//!
//! Parsing an on-disk (INI-like) config file into these structs is the
//! caller's job — this crate only defines the small set of parameters
//! enumerated by the spec and ships sensible defaults.

use std::path::{Path, PathBuf};

/// Configuration for a single [`crate::pool::MemoryPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Size in bytes of each pool file.
    pub pool_size: u64,

    /// Width, in bytes, of the ASCII decimal watermark header stored at the
    /// start of every pool file. Must satisfy `pool_size > pool_header_len`.
    pub pool_header_len: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 1_000_000,
            pool_header_len: 10,
        }
    }
}

/// Configuration for a [`crate::manager::MemoryManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory holding the pool files.
    pub pool_folder: PathBuf,

    /// Path to the append-only block manifest file.
    pub block_file: PathBuf,

    /// Width, in bytes, of the ASCII decimal length prefix on each manifest record.
    pub block_header_len: usize,

    /// Configuration inherited by every pool the manager allocates.
    pub pool: PoolConfig,
}

impl ManagerConfig {
    /// Creates a manager configuration rooted at `folder`, with pools and
    /// the block manifest stored inside it.
    pub fn new<P: AsRef<Path>>(folder: P) -> Self {
        let folder = folder.as_ref();
        Self {
            pool_folder: folder.join("pools"),
            block_file: folder.join("block_file"),
            block_header_len: 10,
            pool: PoolConfig::default(),
        }
    }
}

/// Configuration for [`crate::bst::BstIndex`].
#[derive(Debug, Clone, Copy)]
pub struct TreeIndexConfig {
    /// Width of the ASCII decimal length prefix on each value record.
    pub value_header_len: usize,

    /// Multiplier applied to a value's record length when a fresh spill
    /// block must be allocated.
    pub allocate_scale: u64,
}

impl Default for TreeIndexConfig {
    fn default() -> Self {
        Self {
            value_header_len: 10,
            allocate_scale: 10,
        }
    }
}

/// Configuration for [`crate::skiplist::SkipListIndex`].
#[derive(Debug, Clone, Copy)]
pub struct SkipListConfig {
    /// Width of the ASCII decimal length prefix on each value record.
    pub value_header_len: usize,

    /// Multiplier applied to a value's record length when a fresh spill
    /// block must be allocated.
    pub allocate_scale: u64,

    /// Flush threshold (in bytes) for the buffer accumulated during `compact()`.
    pub compact_buffer_len: usize,
}

impl Default for SkipListConfig {
    fn default() -> Self {
        Self {
            value_header_len: 10,
            allocate_scale: 10,
            compact_buffer_len: 512,
        }
    }
}

/// Configuration for [`crate::btree::BTreeIndex`].
#[derive(Debug, Clone, Copy)]
pub struct BTreeConfig {
    /// Width of the ASCII decimal length prefix on each value record.
    pub value_header_len: usize,

    /// B-tree rank `r`: every non-root node holds between
    /// `ceil((r+1)/2) - 1` and `r - 1` keys.
    pub rank: usize,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            value_header_len: 10,
            rank: 5,
        }
    }
}
