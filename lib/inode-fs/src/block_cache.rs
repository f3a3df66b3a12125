use block_dev::{Block, SyncBlockDevice};
use lru::LruCache;
use std::num::NonZero;
use std::sync::{Mutex, MutexGuard};

use crate::Result;

struct CacheInner {
    cache: LruCache<u64, Box<Block>>,
    block_device: Box<dyn SyncBlockDevice>,
}

impl CacheInner {
    fn read(&mut self, block_no: u64) -> Result<&mut Block> {
        let block = self.cache.try_get_or_insert_mut(block_no, || {
            // Not found: read.
            let mut block = Box::new(Block::new_zeroed());
            self.block_device.read_block(block_no, &mut block)?;
            Ok::<_, crate::FsError>(block)
        })?;
        Ok(block)
    }

    fn write(&mut self, block_no: u64, block: &Block) -> Result<()> {
        if let Err(err) = self.block_device.write_block(block_no, block) {
            // Whatever made it to the device is unknown now.
            self.cache.pop(&block_no);
            return Err(err.into());
        }

        match self.cache.get_mut(&block_no) {
            Some(cached) => **cached = *block,
            None => {
                self.cache.push(block_no, Box::new(*block));
            }
        }
        Ok(())
    }
}

/// Write-through LRU block cache. Every write reaches the device before
/// the call returns; reads are served from memory when possible.
pub(crate) struct BlockCache {
    inner: Mutex<CacheInner>,
    num_blocks: u64,
}

impl BlockCache {
    pub(crate) fn new(block_device: Box<dyn SyncBlockDevice>, capacity: usize) -> Self {
        let num_blocks = block_device.num_blocks();
        Self {
            inner: Mutex::new(CacheInner {
                cache: LruCache::new(NonZero::new(capacity).unwrap_or(NonZero::<usize>::MIN)),
                block_device,
            }),
            num_blocks,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The number of blocks of the underlying device.
    pub(crate) fn device_blocks(&self) -> u64 {
        self.num_blocks
    }

    pub(crate) fn read(&self, block_no: u64, buf: &mut Block) -> Result<()> {
        let mut inner = self.lock();
        *buf = *inner.read(block_no)?;
        Ok(())
    }

    pub(crate) fn write(&self, block_no: u64, block: &Block) -> Result<()> {
        self.lock().write(block_no, block)
    }

    /// Read-modify-write of a single block, atomic with respect to other
    /// cache operations.
    pub(crate) fn update<F: FnOnce(&mut Block)>(&self, block_no: u64, f: F) -> Result<()> {
        let mut inner = self.lock();
        let mut block = *inner.read(block_no)?;
        f(&mut block);
        inner.write(block_no, &block)
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.lock().block_device.flush()?;
        Ok(())
    }
}
