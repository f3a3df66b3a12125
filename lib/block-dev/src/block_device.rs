use crate::Block;
use std::io::Result;

/// Synchronous Block Device.
pub trait SyncBlockDevice: Send {
    /// The number of blocks in this device.
    fn num_blocks(&self) -> u64;

    /// Read a single block.
    fn read_block(&mut self, block_no: u64, block: &mut Block) -> Result<()>;

    /// Write a single block.
    fn write_block(&mut self, block_no: u64, block: &Block) -> Result<()>;

    /// Flush written blocks to the underlying storage.
    fn flush(&mut self) -> Result<()>;
}

impl<T: SyncBlockDevice + ?Sized> SyncBlockDevice for Box<T> {
    fn num_blocks(&self) -> u64 {
        (**self).num_blocks()
    }

    fn read_block(&mut self, block_no: u64, block: &mut Block) -> Result<()> {
        (**self).read_block(block_no, block)
    }

    fn write_block(&mut self, block_no: u64, block: &Block) -> Result<()> {
        (**self).write_block(block_no, block)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}
