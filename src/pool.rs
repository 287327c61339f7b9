// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::fs::OpenOptions;
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::segment::MemorySegment;

/// A single fixed-size file, memory-mapped read-write, fronted by a
/// zero-padded decimal watermark header.
///
/// The watermark `w` is the only mutable piece of pool state: allocation
/// bumps it monotonically and rewrites the header in place. Everything
/// past the header, up to `w`, has been handed out as a segment to some
/// block; everything from `w` to `size` is unused payload space.
pub struct MemoryPool {
    id: u32,
    path: PathBuf,
    size: u64,
    header_len: usize,
    watermark: u64,
    mmap: MmapMut,
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("size", &self.size)
            .field("header_len", &self.header_len)
            .field("watermark", &self.watermark)
            .finish()
    }
}

/// Extracts the numeric id out of a `pool_<digits>` file name.
pub fn parse_pool_id(file_name: &str) -> Option<u32> {
    file_name.strip_prefix("pool_")?.parse().ok()
}

fn format_pool_file_name(id: u32) -> String {
    format!("pool_{id}")
}

impl MemoryPool {
    /// Opens (creating if absent or empty) the pool file `folder/pool_<id>`.
    pub fn open(folder: &Path, id: u32, conf: &PoolConfig) -> Result<Self> {
        let path = folder.join(format_pool_file_name(id));
        let existing_len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let watermark = if existing_len == 0 {
            file.set_len(conf.pool_size)?;
            let mut f = &file;
            f.write_all(&watermark_bytes(conf.pool_header_len as u64, conf.pool_header_len)?)?;
            log::trace!("initialized pool {id} at {path:?} (size={})", conf.pool_size);
            conf.pool_header_len as u64
        } else {
            let mut header = vec![0u8; conf.pool_header_len];
            let mut f = &file;
            f.seek(SeekFrom::Start(0))?;
            f.read_exact(&mut header)?;
            parse_watermark(&header)?
        };

        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            id,
            path,
            size: conf.pool_size,
            header_len: conf.pool_header_len,
            watermark,
            mmap,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Bytes still available to hand out (`size - watermark`).
    pub fn allocate_limit(&self) -> u64 {
        self.size - self.watermark
    }

    /// Hands out `[watermark, watermark+n)` and advances the watermark.
    pub fn allocate(self_rc: &std::rc::Rc<std::cell::RefCell<Self>>, n: u64) -> Result<MemorySegment> {
        let mut this = self_rc.borrow_mut();
        if n == 0 {
            return Err(Error::PreconditionViolation(
                "allocate requires n > 0".into(),
            ));
        }
        if this.watermark + n > this.size {
            return Err(Error::PreconditionViolation(format!(
                "allocate({n}) exceeds pool {}'s remaining capacity ({})",
                this.id,
                this.allocate_limit()
            )));
        }
        let start = this.watermark;
        let end = start + n;
        this.watermark = end;
        let header_len = this.header_len;
        this.write_watermark(header_len)?;
        log::trace!("pool {} allocated [{start}, {end})", this.id);
        drop(this);
        Ok(MemorySegment::new(self_rc.clone(), start, end))
    }

    fn write_watermark(&mut self, header_len: usize) -> Result<()> {
        let bytes = watermark_bytes(self.watermark, header_len)?;
        self.mmap[..header_len].copy_from_slice(&bytes);
        Ok(())
    }

    /// Writes `bytes` at absolute file offset `offset` (must be `>= header_len`
    /// and fit before the watermark).
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let header_len = self.header_len as u64;
        if offset < header_len {
            return Err(Error::PreconditionViolation(format!(
                "write offset {offset} precedes header ({header_len})"
            )));
        }
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or_else(|| Error::PreconditionViolation("write offset overflow".into()))?;
        if end > self.watermark {
            return Err(Error::PreconditionViolation(format!(
                "write [{offset}, {end}) exceeds watermark {}",
                self.watermark
            )));
        }
        let start = offset as usize;
        self.mmap[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Reads up to `length` bytes starting at absolute file offset `offset`,
    /// clamped to the watermark. `offset` is already absolute (header-inclusive);
    /// set `skip_header` to additionally shift by `header_len` first.
    pub fn read(&self, offset: u64, length: u64, skip_header: bool) -> Result<Vec<u8>> {
        let offset = if skip_header {
            offset + self.header_len as u64
        } else {
            offset
        };
        if offset > self.watermark {
            return Err(Error::PreconditionViolation(format!(
                "read offset {offset} exceeds watermark {}",
                self.watermark
            )));
        }
        let available = self.watermark - offset;
        let take = length.min(available) as usize;
        let start = offset as usize;
        Ok(self.mmap[start..start + take].to_vec())
    }

    /// Unmaps and removes the backing file.
    pub fn close(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}

fn watermark_bytes(value: u64, width: usize) -> Result<Vec<u8>> {
    let s = format!("{value:0width$}", width = width);
    if s.len() != width {
        return Err(Error::PreconditionViolation(format!(
            "watermark {value} does not fit in {width} decimal digits"
        )));
    }
    Ok(s.into_bytes())
}

fn parse_watermark(bytes: &[u8]) -> Result<u64> {
    let s = std::str::from_utf8(bytes)
        .map_err(|_| Error::Corrupt("pool header is not valid ASCII".into()))?;
    s.parse()
        .map_err(|_| Error::Corrupt(format!("pool header {s:?} is not a decimal watermark")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use std::rc::Rc;
    use std::cell::RefCell;

    fn open(dir: &Path, id: u32, size: u64, header: usize) -> Rc<RefCell<MemoryPool>> {
        let conf = PoolConfig {
            pool_size: size,
            pool_header_len: header,
        };
        Rc::new(RefCell::new(MemoryPool::open(dir, id, &conf).unwrap()))
    }

    #[test]
    fn create_and_reopen_preserves_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(dir.path(), 0, 10, 5);
        MemoryPool::allocate(&pool, 3).unwrap();
        assert_eq!(pool.borrow().watermark(), 8);
        drop(pool);

        let conf = PoolConfig {
            pool_size: 10,
            pool_header_len: 5,
        };
        let reopened = MemoryPool::open(dir.path(), 0, &conf).unwrap();
        assert_eq!(reopened.watermark(), 8);
        assert_eq!(reopened.allocate_limit(), 2);
    }

    #[test]
    fn allocate_rejects_zero_and_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(dir.path(), 0, 10, 5);
        assert!(MemoryPool::allocate(&pool, 0).is_err());
        assert!(MemoryPool::allocate(&pool, 6).is_err());
        assert!(MemoryPool::allocate(&pool, 5).is_ok());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(dir.path(), 0, 10, 5);
        MemoryPool::allocate(&pool, 5).unwrap();
        pool.borrow_mut().write(5, b"hello").unwrap();
        let read = pool.borrow().read(0, 5, true).unwrap();
        assert_eq!(read, b"hello");
    }

    #[test]
    fn parses_pool_id_from_file_name() {
        assert_eq!(parse_pool_id("pool_0"), Some(0));
        assert_eq!(parse_pool_id("pool_42"), Some(42));
        assert_eq!(parse_pool_id("block_file"), None);
    }
}
