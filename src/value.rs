// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The disk locator stored inside any index node, and the shared
//! `[ASCII decimal length][payload]` record codec it points at.
//!
//! Two persistence strategies are grounded in the original source:
//! [`persist_with_block_reuse`] (used by the BST and skip list) keeps
//! writing into a "current" spill block, allocating a fresh one — sized
//! `scale * len` — only when the current block runs out of room.
//! [`persist_fresh_block`] (used by the B-tree) always allocates a new
//! block sized exactly to the value, matching `btree_index.py`'s
//! `TreeValue.from_value`, which has no equivalent of `MEMORY_ALLOCATE_SCALE`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::block::MemoryBlock;
use crate::error::{Error, Result};
use crate::manager::MemoryManager;

/// A `(block_id, address)` locator to a value record. Shared by every
/// index; the source names it `TreeValue` (BST, B-tree) or `NodeValue`
/// (skip list) depending on context, but the shape is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueLocator {
    pub block_id: u64,
    pub address: u64,
}

/// Encodes `payload` as `[header_len decimal digits][payload]`.
pub fn encode_record(payload: &[u8], header_len: usize) -> Result<Vec<u8>> {
    let header = format!("{:0width$}", payload.len(), width = header_len);
    if header.len() != header_len {
        return Err(Error::PreconditionViolation(format!(
            "value of {} bytes does not fit a {header_len}-digit length header",
            payload.len()
        )));
    }
    let mut out = Vec::with_capacity(header_len + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Reads the `[header][payload]` record found at `address` in `block`.
pub fn read_record(block: &Rc<RefCell<MemoryBlock>>, address: u64, header_len: usize) -> Result<Vec<u8>> {
    let header = block.borrow().read(address, header_len as u64)?;
    let len: usize = std::str::from_utf8(&header)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Corrupt(format!("unparsable value header at address {address}")))?;
    let payload = block
        .borrow()
        .read(address + header_len as u64, len as u64)?;
    if payload.len() != len {
        return Err(Error::Corrupt(format!(
            "value record at address {address} truncated: expected {len} bytes, got {}",
            payload.len()
        )));
    }
    Ok(payload)
}

/// Persists `payload` by appending to `current` (allocating a fresh block
/// sized `scale * record_len` through `manager` when there isn't enough
/// room left), returning the locator and the possibly-replaced current
/// block. Used by the BST and the skip list.
pub fn persist_with_block_reuse(
    manager: &mut MemoryManager,
    current: &mut Option<Rc<RefCell<MemoryBlock>>>,
    payload: &[u8],
    header_len: usize,
    scale: u64,
) -> Result<ValueLocator> {
    let record = encode_record(payload, header_len)?;

    let needs_fresh_block = match current {
        Some(block) => (record.len() as u64) > block.borrow().free_memory(),
        None => true,
    };
    if needs_fresh_block {
        let size = (record.len() as u64) * scale.max(1);
        let block = manager.allocate_block(size)?;
        *current = Some(block);
    }

    let block = current.as_ref().expect("current block was just ensured");
    let address = block.borrow().current_offset();
    block.borrow_mut().write(&record)?;
    Ok(ValueLocator {
        block_id: block.borrow().block_id(),
        address,
    })
}

/// Persists `payload` into a brand-new block sized exactly to the
/// encoded record, with no reuse and no scale factor. Used by the B-tree.
pub fn persist_fresh_block(
    manager: &mut MemoryManager,
    payload: &[u8],
    header_len: usize,
) -> Result<ValueLocator> {
    let record = encode_record(payload, header_len)?;
    let block = manager.allocate_block(record.len() as u64)?;
    let address = block.borrow().current_offset();
    block.borrow_mut().write(&record)?;
    Ok(ValueLocator {
        block_id: block.borrow().block_id(),
        address,
    })
}
