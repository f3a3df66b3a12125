//! The superblock: volume geometry and the free-block list.
//!
//! Free blocks form a singly-linked LIFO list threaded through their
//! own first four bytes. The allocator itself is not synchronized; the
//! filesystem keeps it behind a mutex so allocations never interleave.

use block_dev::{BLOCK_SIZE, Block};

use crate::block_cache::BlockCache;
use crate::layout::*;
use crate::{FsError, Result};

pub(crate) struct FreeBlockAllocator {
    header: SuperblockHeader,
}

impl FreeBlockAllocator {
    /// Loads the allocator state from block 0. Fails with Corrupted if
    /// the device does not hold a volume of the device's size.
    pub(crate) fn load(cache: &BlockCache) -> Result<Self> {
        let mut block = Block::new_zeroed();
        cache.read(SUPERBLOCK_NO, &mut block)?;
        let header = SuperblockHeader::decode(&block)?;

        if header.total_blocks as u64 != cache.device_blocks().min(MAX_BLOCKS) {
            log::warn!(
                "superblock: volume has {} blocks, device {}",
                header.total_blocks,
                cache.device_blocks()
            );
            return Err(FsError::Corrupted);
        }
        if let Some(head) = header.free_list {
            if (head as u32) < first_data_block(header.total_inodes) {
                return Err(FsError::Corrupted);
            }
        }

        Ok(Self { header })
    }

    /// Lays out an empty volume with `inodes` inode records.
    pub(crate) fn format(cache: &BlockCache, inodes: u32) -> Result<Self> {
        // Each inode should be able to store at least one block of data.
        if inodes > MAX_INODES {
            log::warn!("format: {inodes} inodes requested, at most {MAX_INODES} allowed");
            return Err(FsError::InvalidArgument);
        }
        let total_blocks = cache.device_blocks().min(MAX_BLOCKS) as u32;
        let first_data = first_data_block(inodes);
        if total_blocks < 2 || first_data > total_blocks {
            return Err(FsError::InvalidArgument);
        }

        let free_list = if first_data < total_blocks {
            Some(first_data as BlockNo)
        } else {
            None
        };
        let allocator = Self {
            header: SuperblockHeader {
                total_blocks,
                total_inodes: inodes,
                free_list,
            },
        };
        allocator.sync(cache)?;

        // Inode region.
        let mut block = Block::new_zeroed();
        for inode_block in 1..first_data {
            for offset in (0..BLOCK_SIZE).step_by(INODE_SIZE) {
                InodeRecord::invalidated().encode(&mut block, offset);
            }
            cache.write(inode_block as u64, &block)?;
        }

        // Free list.
        for block_no in first_data..total_blocks {
            let next = if block_no + 1 < total_blocks {
                Some((block_no + 1) as BlockNo)
            } else {
                None
            };
            set_free_block_next(&mut block, next);
            cache.write(block_no as u64, &block)?;
        }

        log::info!(
            "format: {total_blocks} blocks, {inodes} inodes, data starts at block {first_data}"
        );
        Ok(allocator)
    }

    pub(crate) fn total_blocks(&self) -> u32 {
        self.header.total_blocks
    }

    pub(crate) fn total_inodes(&self) -> u32 {
        self.header.total_inodes
    }

    #[cfg(test)]
    pub(crate) fn free_list_head(&self) -> Option<BlockNo> {
        self.header.free_list
    }

    fn first_data_block(&self) -> u32 {
        first_data_block(self.header.total_inodes)
    }

    fn is_data_block(&self, block_no: u32) -> bool {
        block_no >= self.first_data_block() && block_no < self.header.total_blocks
    }

    /// Pops the head of the free list. The block is zeroed on disk before
    /// it is handed out, so stale bytes never leak into the new owner.
    pub(crate) fn get_next_free_block(&mut self, cache: &BlockCache) -> Result<BlockNo> {
        let Some(head) = self.header.free_list else {
            log::debug!("superblock: out of free blocks");
            return Err(FsError::OutOfSpace);
        };

        let mut block = Block::new_zeroed();
        cache.read(head as u64, &mut block)?;
        let next = match free_block_next(&block) {
            NO_BLOCK => None,
            no if no > 0 && self.is_data_block(no as u32) => Some(no as BlockNo),
            no => {
                log::error!("FS corrupted: bad freelist link {head} -> {no}");
                return Err(FsError::Corrupted);
            }
        };

        block.clear();
        cache.write(head as u64, &block)?;

        self.header.free_list = next;
        self.sync(cache)?;

        log::trace!("superblock: allocated block {head}");
        Ok(head)
    }

    /// Pushes `block_no` onto the free list.
    pub(crate) fn return_block(&mut self, cache: &BlockCache, block_no: BlockNo) -> Result<()> {
        if !self.is_data_block(block_no as u32) {
            log::warn!("superblock: refusing to free block {block_no}");
            return Err(FsError::InvalidArgument);
        }

        let mut block = Block::new_zeroed();
        set_free_block_next(&mut block, self.header.free_list);
        cache.write(block_no as u64, &block)?;

        self.header.free_list = Some(block_no);
        self.sync(cache)?;

        log::trace!("superblock: freed block {block_no}");
        Ok(())
    }

    /// Persists the metadata to block 0.
    pub(crate) fn sync(&self, cache: &BlockCache) -> Result<()> {
        let mut block = Block::new_zeroed();
        self.header.encode(&mut block);
        cache.write(SUPERBLOCK_NO, &block)
    }

    /// Walks the free list. Bounded by the volume size, so a cycle is
    /// reported as corruption instead of looping forever.
    pub(crate) fn count_free_blocks(&self, cache: &BlockCache) -> Result<u32> {
        let mut count = 0;
        let mut curr = self.header.free_list;
        let mut block = Block::new_zeroed();

        while let Some(block_no) = curr {
            count += 1;
            if count > self.header.total_blocks {
                log::error!("FS corrupted: free list cycle");
                return Err(FsError::Corrupted);
            }
            cache.read(block_no as u64, &mut block)?;
            curr = match free_block_next(&block) {
                NO_BLOCK => None,
                no if no > 0 && self.is_data_block(no as u32) => Some(no as BlockNo),
                _ => return Err(FsError::Corrupted),
            };
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_dev::MemBlockDevice;
    use std::collections::HashSet;

    fn cache(num_blocks: u64) -> BlockCache {
        BlockCache::new(Box::new(MemBlockDevice::new(num_blocks)), 16)
    }

    #[test]
    fn format_layout() {
        let cache = cache(100);
        let allocator = FreeBlockAllocator::format(&cache, 20).unwrap();
        assert_eq!(100, allocator.total_blocks());
        assert_eq!(20, allocator.total_inodes());
        assert_eq!(Some(3), allocator.free_list_head());
        assert_eq!(97, allocator.count_free_blocks(&cache).unwrap());

        let mut block = Block::new_zeroed();
        cache.read(2, &mut block).unwrap();
        let rec = InodeRecord::decode(&block, 3 * INODE_SIZE).unwrap();
        assert_eq!(InodeRecord::invalidated(), rec);

        cache.read(99, &mut block).unwrap();
        assert_eq!(-1, free_block_next(&block));
        cache.read(50, &mut block).unwrap();
        assert_eq!(51, free_block_next(&block));

        let loaded = FreeBlockAllocator::load(&cache).unwrap();
        assert_eq!(allocator.header, loaded.header);
    }

    #[test]
    fn format_rejects_bad_inode_counts() {
        let cache = cache(100);
        assert_eq!(
            Err(FsError::InvalidArgument),
            FreeBlockAllocator::format(&cache, MAX_INODES + 1).map(|_| ())
        );
        assert!(FreeBlockAllocator::format(&cache, MAX_INODES).is_ok());
        assert!(FreeBlockAllocator::format(&cache, 0).is_ok());
    }

    #[test]
    fn allocate_and_reclaim() {
        let cache = cache(40);
        let mut allocator = FreeBlockAllocator::format(&cache, 16).unwrap();
        let free = allocator.count_free_blocks(&cache).unwrap();
        assert_eq!(38, free);

        let mut issued = HashSet::new();
        for _ in 0..free {
            let block_no = allocator.get_next_free_block(&cache).unwrap();
            assert!(block_no >= 2);
            assert!(issued.insert(block_no), "block {block_no} issued twice");

            // Handed-out blocks are zeroed.
            let mut block = Block::new_zeroed();
            cache.read(block_no as u64, &mut block).unwrap();
            assert_eq!(Block::new_zeroed(), block);
        }
        assert_eq!(
            Err(FsError::OutOfSpace),
            allocator.get_next_free_block(&cache)
        );

        // LIFO reclaim.
        allocator.return_block(&cache, 7).unwrap();
        allocator.return_block(&cache, 11).unwrap();
        assert_eq!(2, allocator.count_free_blocks(&cache).unwrap());
        assert_eq!(11, allocator.get_next_free_block(&cache).unwrap());
        assert_eq!(7, allocator.get_next_free_block(&cache).unwrap());
        assert_eq!(
            Err(FsError::OutOfSpace),
            allocator.get_next_free_block(&cache)
        );

        for block_no in issued.iter() {
            allocator.return_block(&cache, *block_no).unwrap();
        }
        assert_eq!(free, allocator.count_free_blocks(&cache).unwrap());

        // The state survives a reload.
        let reloaded = FreeBlockAllocator::load(&cache).unwrap();
        assert_eq!(free, reloaded.count_free_blocks(&cache).unwrap());
    }

    #[test]
    fn return_block_validates_range() {
        let cache = cache(40);
        let mut allocator = FreeBlockAllocator::format(&cache, 16).unwrap();
        assert_eq!(
            Err(FsError::InvalidArgument),
            allocator.return_block(&cache, 0)
        );
        assert_eq!(
            Err(FsError::InvalidArgument),
            allocator.return_block(&cache, 1)
        );
        assert_eq!(
            Err(FsError::InvalidArgument),
            allocator.return_block(&cache, 40)
        );
    }

    #[test]
    fn load_rejects_unformatted_device() {
        let cache = cache(40);
        assert_eq!(
            Err(FsError::Corrupted),
            FreeBlockAllocator::load(&cache).map(|_| ())
        );
    }
}
