// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::error::{Error, Result};
use crate::pool::MemoryPool;
use crate::segment::MemorySegment;

/// A logical append-only byte sequence assembled from one or more
/// [`MemorySegment`]s, possibly spanning several pools.
///
/// Maintains a prefix-sum index over segment lengths so a logical offset
/// can be translated to a `(segment index, segment-local offset)` pair by
/// binary search, and a cursor `(segment index, segment-local offset)`
/// tracking the next byte to be written.
#[derive(Debug)]
pub struct MemoryBlock {
    block_id: u64,
    size: u64,
    segments: Vec<MemorySegment>,
    prefix_sums: Vec<u64>,
    cursor_segment: usize,
    cursor_offset: u64,
}

impl MemoryBlock {
    /// Assembles a block out of `segments`, with the cursor at the start
    /// of the first segment (a freshly allocated block is empty).
    pub fn new(block_id: u64, segments: Vec<MemorySegment>) -> Self {
        assert!(!segments.is_empty(), "a block must span at least one segment");
        let mut prefix_sums = Vec::with_capacity(segments.len());
        let mut running = 0u64;
        for s in &segments {
            running += s.length();
            prefix_sums.push(running);
        }
        let size = running;
        Self {
            block_id,
            size,
            cursor_segment: 0,
            cursor_offset: segments[0].start(),
            segments,
            prefix_sums,
        }
    }

    pub fn block_id(&self) -> u64 {
        self.block_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn segments(&self) -> &[MemorySegment] {
        &self.segments
    }

    /// Logical offset the cursor currently sits at (0-based from the
    /// start of the block).
    pub fn current_offset(&self) -> u64 {
        let before: u64 = if self.cursor_segment == 0 {
            0
        } else {
            self.prefix_sums[self.cursor_segment - 1]
        };
        before + (self.cursor_offset - self.segments[self.cursor_segment].start())
    }

    pub fn used_memory(&self) -> u64 {
        self.current_offset()
    }

    pub fn free_memory(&self) -> u64 {
        self.size - self.used_memory()
    }

    /// Writes `bytes`, advancing the cursor across segment boundaries as
    /// needed. Requires `bytes.len() <= free_memory()`.
    pub fn write(&mut self, bytes: &[u8]) -> Result<u64> {
        if bytes.len() as u64 > self.free_memory() {
            return Err(Error::PreconditionViolation(format!(
                "write of {} bytes exceeds free memory {}",
                bytes.len(),
                self.free_memory()
            )));
        }
        let mut written = 0usize;
        while written < bytes.len() {
            let segment = &self.segments[self.cursor_segment];
            let room = (segment.end() - self.cursor_offset) as usize;
            let chunk_len = room.min(bytes.len() - written);
            let chunk = &bytes[written..written + chunk_len];
            segment
                .pool()
                .borrow_mut()
                .write(self.cursor_offset, chunk)?;
            self.cursor_offset += chunk_len as u64;
            written += chunk_len;
            if self.cursor_offset == segment.end() && self.cursor_segment + 1 < self.segments.len()
            {
                self.cursor_segment += 1;
                self.cursor_offset = self.segments[self.cursor_segment].start();
            }
        }
        log::trace!("block {} wrote {written} bytes", self.block_id);
        Ok(written as u64)
    }

    /// Reads up to `length` bytes starting at logical `offset`, gathering
    /// across segment boundaries until `length` bytes are collected or the
    /// block is exhausted.
    pub fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if offset > self.size {
            return Err(Error::PreconditionViolation(format!(
                "read offset {offset} exceeds block size {}",
                self.size
            )));
        }
        let mut segment_index = self
            .prefix_sums
            .partition_point(|&total| total < offset + 1);
        if segment_index >= self.segments.len() {
            return Ok(Vec::new());
        }
        let before: u64 = if segment_index == 0 {
            0
        } else {
            self.prefix_sums[segment_index - 1]
        };
        let mut local_offset = self.segments[segment_index].start() + (offset - before);

        let mut out = Vec::with_capacity(length as usize);
        let mut remaining = length;
        while remaining > 0 && segment_index < self.segments.len() {
            let segment = &self.segments[segment_index];
            let available = segment.end() - local_offset;
            if available == 0 {
                segment_index += 1;
                if segment_index < self.segments.len() {
                    local_offset = self.segments[segment_index].start();
                }
                continue;
            }
            let take = available.min(remaining);
            let bytes = segment
                .pool()
                .borrow()
                .read(local_offset, take, false)?;
            out.extend_from_slice(&bytes);
            remaining -= bytes.len() as u64;
            if (bytes.len() as u64) < take {
                // pool watermark cut the read short; block is exhausted.
                break;
            }
            local_offset += take;
            if local_offset == segment.end() {
                segment_index += 1;
                if segment_index < self.segments.len() {
                    local_offset = self.segments[segment_index].start();
                }
            }
        }
        Ok(out)
    }

    /// Repositions the cursor to logical position `offset` for in-place
    /// overwrite (used by compaction). Does not zero any bytes.
    pub fn rewind(&mut self, offset: u64) -> Result<()> {
        if offset >= self.size {
            return Err(Error::PreconditionViolation(format!(
                "rewind offset {offset} must be < block size {}",
                self.size
            )));
        }
        let segment_index = self.prefix_sums.partition_point(|&total| total < offset + 1);
        let before: u64 = if segment_index == 0 {
            0
        } else {
            self.prefix_sums[segment_index - 1]
        };
        self.cursor_segment = segment_index;
        self.cursor_offset = self.segments[segment_index].start() + (offset - before);
        log::trace!("block {} rewound to offset {offset}", self.block_id);
        Ok(())
    }
}
