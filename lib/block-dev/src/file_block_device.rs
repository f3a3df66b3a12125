use crate::BLOCK_SIZE;
use crate::Block;
use crate::SyncBlockDevice;
use camino::Utf8Path;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Result, Seek, SeekFrom, Write};

/// Block device backed by a regular file.
pub struct FileBlockDevice {
    file: File,
    num_blocks: u64,
}

impl FileBlockDevice {
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let len = file.metadata()?.len();
        if len & ((BLOCK_SIZE as u64) - 1) != 0 {
            return Err(std::io::Error::from(ErrorKind::InvalidData));
        }

        Ok(Self {
            file,
            num_blocks: len >> BLOCK_SIZE.ilog2(),
        })
    }

    pub fn create(path: &Utf8Path, num_blocks: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;

        file.set_len(num_blocks << BLOCK_SIZE.ilog2())?;

        Ok(Self { file, num_blocks })
    }
}

impl SyncBlockDevice for FileBlockDevice {
    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn read_block(&mut self, block_no: u64, block: &mut Block) -> Result<()> {
        if block_no >= self.num_blocks {
            log::debug!("Block number {block_no} out of range.");
            return Err(ErrorKind::InvalidInput.into());
        }

        self.file
            .seek(SeekFrom::Start(block_no * (BLOCK_SIZE as u64)))?;
        self.file.read_exact(block.as_bytes_mut())
    }

    fn write_block(&mut self, block_no: u64, block: &Block) -> Result<()> {
        if block_no >= self.num_blocks {
            log::debug!("Block number {block_no} out of range.");
            return Err(ErrorKind::InvalidInput.into());
        }

        self.file
            .seek(SeekFrom::Start(block_no * (BLOCK_SIZE as u64)))?;
        self.file.write_all(block.as_bytes())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()
    }
}
