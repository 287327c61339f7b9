// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Manifest record codec: `(block_id, block_size, segments)` where each
//! segment is `(pool_id, start, end, length)`. Pools are referenced by id,
//! never by mapping handle, so the manifest can be replayed against a
//! freshly reopened set of pool files.
//!
//! The wire format is a single text line: decimal fields separated by a
//! single space, segments trailing as `pool:start:end:length` groups. It
//! is deterministic (`Eq` round-trips) and self-describing, matching the
//! teacher's `Encode`/`Decode` trait split in `coding.rs` generalized to
//! a human-auditable line instead of a packed binary layout.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    pub pool_id: u32,
    pub start: u64,
    pub end: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub block_id: u64,
    pub block_size: u64,
    pub segments: Vec<SegmentRecord>,
}

impl BlockRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut parts = vec![self.block_id.to_string(), self.block_size.to_string()];
        for s in &self.segments {
            parts.push(format!("{}:{}:{}:{}", s.pool_id, s.start, s.end, s.length));
        }
        parts.join(" ").into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::Corrupt("manifest record is not valid UTF-8".into()))?;
        let mut fields = text.split(' ');
        let block_id = fields
            .next()
            .ok_or_else(|| Error::Corrupt("manifest record missing block_id".into()))?
            .parse()
            .map_err(|_| Error::Corrupt("manifest record has invalid block_id".into()))?;
        let block_size = fields
            .next()
            .ok_or_else(|| Error::Corrupt("manifest record missing block_size".into()))?
            .parse()
            .map_err(|_| Error::Corrupt("manifest record has invalid block_size".into()))?;

        let mut segments = Vec::new();
        for field in fields {
            let mut pieces = field.split(':');
            let pool_id = pieces
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| Error::Corrupt(format!("bad segment record {field:?}")))?;
            let start = pieces
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| Error::Corrupt(format!("bad segment record {field:?}")))?;
            let end = pieces
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| Error::Corrupt(format!("bad segment record {field:?}")))?;
            let length = pieces
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| Error::Corrupt(format!("bad segment record {field:?}")))?;
            segments.push(SegmentRecord {
                pool_id,
                start,
                end,
                length,
            });
        }

        Ok(Self {
            block_id,
            block_size,
            segments,
        })
    }
}
