// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::cell::RefCell;
use std::rc::Rc;

use crate::pool::MemoryPool;

/// A contiguous `[start, end)` byte range inside one [`MemoryPool`].
///
/// Trivial value object: a segment never outlives the pool it was carved
/// from (it holds a strong reference to it) and never changes once handed
/// out by [`MemoryPool::allocate`].
#[derive(Debug, Clone)]
pub struct MemorySegment {
    pool: Rc<RefCell<MemoryPool>>,
    start: u64,
    end: u64,
}

impl MemorySegment {
    /// Builds a segment over `[start, end)` of `pool`.
    ///
    /// Callers (only [`MemoryPool::allocate`] and manifest restoration)
    /// must uphold `end >= start`.
    pub fn new(pool: Rc<RefCell<MemoryPool>>, start: u64, end: u64) -> Self {
        debug_assert!(end >= start, "segment end must not precede start");
        Self { pool, start, end }
    }

    pub fn pool(&self) -> &Rc<RefCell<MemoryPool>> {
        &self.pool
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn length(&self) -> u64 {
        self.end - self.start
    }

    /// The owning pool's id, for manifest encoding.
    pub fn pool_id(&self) -> u32 {
        self.pool.borrow().id()
    }
}
