// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write as _};
use std::rc::Rc;

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::manifest::{BlockRecord, SegmentRecord};
use crate::block::MemoryBlock;
use crate::pool::{self, MemoryPool};
use crate::segment::MemorySegment;

/// Bootstraps pools and blocks from a folder and a manifest file; hands
/// out new blocks, carving segments out of pools (allocating fresh pools
/// as existing ones fill up) and persisting each new block's metadata to
/// the manifest before returning it.
pub struct MemoryManager {
    pools: Vec<Rc<RefCell<MemoryPool>>>,
    pool_dict: HashMap<u32, Rc<RefCell<MemoryPool>>>,
    blocks: Vec<Rc<RefCell<MemoryBlock>>>,
    block_dict: HashMap<u64, Rc<RefCell<MemoryBlock>>>,
    next_pool_id: u32,
    next_block_id: u64,
    conf: ManagerConfig,
}

impl MemoryManager {
    /// Opens (bootstrapping if needed) the manager rooted at `conf`.
    pub fn open(conf: ManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&conf.pool_folder)?;

        let mut pool_ids: Vec<u32> = Vec::new();
        for entry in std::fs::read_dir(&conf.pool_folder)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(pool::parse_pool_id) {
                pool_ids.push(id);
            }
        }
        pool_ids.sort_unstable();

        let mut pools = Vec::with_capacity(pool_ids.len());
        let mut pool_dict = HashMap::with_capacity(pool_ids.len());
        let mut not_full: Option<Rc<RefCell<MemoryPool>>> = None;
        let mut next_pool_id = 0u32;

        for id in pool_ids {
            let pool = Rc::new(RefCell::new(MemoryPool::open(
                &conf.pool_folder,
                id,
                &conf.pool,
            )?));
            next_pool_id = next_pool_id.max(id + 1);
            pool_dict.insert(id, pool.clone());
            if pool.borrow().allocate_limit() > 0 {
                if not_full.is_some() {
                    return Err(Error::Corrupt(format!(
                        "more than one pool has remaining capacity (found extra at pool_{id})"
                    )));
                }
                not_full = Some(pool);
            } else {
                pools.push(pool);
            }
        }
        if let Some(p) = not_full {
            pools.push(p);
        }

        if !conf.block_file.exists() {
            OpenOptions::new()
                .create(true)
                .write(true)
                .open(&conf.block_file)?;
        }

        let mut blocks = Vec::new();
        let mut block_dict = HashMap::new();
        let mut next_block_id = 0u64;

        let mut file = OpenOptions::new().read(true).open(&conf.block_file)?;
        file.seek(SeekFrom::Start(0))?;
        loop {
            let mut header = vec![0u8; conf.block_header_len];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(Error::Io(e)),
            }
            let len: usize = std::str::from_utf8(&header)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Corrupt("unparsable manifest record length".into()))?;
            let mut payload = vec![0u8; len];
            file.read_exact(&mut payload)?;
            let record = BlockRecord::decode(&payload)?;

            let mut segments = Vec::with_capacity(record.segments.len());
            for s in &record.segments {
                let pool = pool_dict
                    .get(&s.pool_id)
                    .ok_or(Error::UnknownPool(s.pool_id))?
                    .clone();
                segments.push(MemorySegment::new(pool, s.start, s.end));
            }
            next_block_id = next_block_id.max(record.block_id + 1);
            let block = Rc::new(RefCell::new(MemoryBlock::new(record.block_id, segments)));
            block_dict.insert(record.block_id, block.clone());
            blocks.push(block);
        }

        log::trace!(
            "bootstrapped manager: {} pools, {} blocks",
            pools.len(),
            blocks.len()
        );

        Ok(Self {
            pools,
            pool_dict,
            blocks,
            block_dict,
            next_pool_id,
            next_block_id,
            conf,
        })
    }

    pub fn pools(&self) -> &[Rc<RefCell<MemoryPool>>] {
        &self.pools
    }

    pub fn blocks(&self) -> &[Rc<RefCell<MemoryBlock>>] {
        &self.blocks
    }

    pub fn block_dict(&self) -> &HashMap<u64, Rc<RefCell<MemoryBlock>>> {
        &self.block_dict
    }

    pub fn block(&self, id: u64) -> Option<Rc<RefCell<MemoryBlock>>> {
        self.block_dict.get(&id).cloned()
    }

    fn allocate_pool(&mut self) -> Result<Rc<RefCell<MemoryPool>>> {
        let id = self.next_pool_id;
        self.next_pool_id += 1;
        let pool = Rc::new(RefCell::new(MemoryPool::open(
            &self.conf.pool_folder,
            id,
            &self.conf.pool,
        )?));
        self.pool_dict.insert(id, pool.clone());
        self.pools.push(pool.clone());
        Ok(pool)
    }

    /// Allocates a new block spanning `size` bytes, carving segments out
    /// of the last (not-full) pool and allocating fresh pools as needed,
    /// then persists the block's metadata to the manifest.
    pub fn allocate_block(&mut self, size: u64) -> Result<Rc<RefCell<MemoryBlock>>> {
        if size == 0 {
            return Err(Error::PreconditionViolation(
                "allocate_block requires size > 0".into(),
            ));
        }

        if self.pools.is_empty() || self.pools.last().unwrap().borrow().allocate_limit() == 0 {
            self.allocate_pool()?;
        }

        let mut remaining = size;
        let mut segments = Vec::new();
        while remaining > 0 {
            let last = self.pools.last().unwrap().clone();
            let limit = last.borrow().allocate_limit();
            let take = remaining.min(limit);
            let segment = MemoryPool::allocate(&last, take)?;
            segments.push(segment);
            remaining -= take;
            if remaining > 0 {
                self.allocate_pool()?;
            }
        }

        let block_id = self.next_block_id;
        self.next_block_id += 1;
        let record = BlockRecord {
            block_id,
            block_size: size,
            segments: segments
                .iter()
                .map(|s| SegmentRecord {
                    pool_id: s.pool_id(),
                    start: s.start(),
                    end: s.end(),
                    length: s.length(),
                })
                .collect(),
        };
        self.append_manifest_record(&record)?;

        let block = Rc::new(RefCell::new(MemoryBlock::new(block_id, segments)));
        self.blocks.push(block.clone());
        self.block_dict.insert(block_id, block.clone());
        log::debug!("allocated block {block_id} ({size} bytes)");
        Ok(block)
    }

    fn append_manifest_record(&self, record: &BlockRecord) -> Result<()> {
        let payload = record.encode();
        let header_len = self.conf.block_header_len;
        let header = format!("{:0width$}", payload.len(), width = header_len);
        if header.len() != header_len {
            return Err(Error::PreconditionViolation(format!(
                "encoded manifest record length {} does not fit in {header_len} decimal digits",
                payload.len(),
            )));
        }
        let mut file = OpenOptions::new().append(true).open(&self.conf.block_file)?;
        file.write_all(header.as_bytes())?;
        file.write_all(&payload)?;
        Ok(())
    }
}
