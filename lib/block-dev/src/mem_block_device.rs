use crate::{Block, SyncBlockDevice};
use std::collections::HashSet;
use std::io::{ErrorKind, Result};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FaultState {
    bad_reads: HashSet<u64>,
    bad_writes: HashSet<u64>,
    fail_all_writes: bool,
}

/// Injected I/O failures of a MemBlockDevice. Clones share state, so
/// a handle kept by a test still works after the device is moved away.
#[derive(Clone, Default)]
pub struct Faults {
    state: Arc<Mutex<FaultState>>,
}

impl Faults {
    fn with<R>(&self, f: impl FnOnce(&mut FaultState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn fail_reads_of(&self, block_no: u64) {
        self.with(|s| s.bad_reads.insert(block_no));
    }

    pub fn fail_writes_of(&self, block_no: u64) {
        self.with(|s| s.bad_writes.insert(block_no));
    }

    pub fn fail_all_writes(&self, fail: bool) {
        self.with(|s| s.fail_all_writes = fail);
    }

    pub fn clear(&self) {
        self.with(|s| *s = FaultState::default());
    }

    fn read_fails(&self, block_no: u64) -> bool {
        self.with(|s| s.bad_reads.contains(&block_no))
    }

    fn write_fails(&self, block_no: u64) -> bool {
        self.with(|s| s.fail_all_writes || s.bad_writes.contains(&block_no))
    }
}

/// RAM-backed block device.
pub struct MemBlockDevice {
    blocks: Vec<Block>,
    faults: Faults,
}

impl MemBlockDevice {
    pub fn new(num_blocks: u64) -> Self {
        Self {
            blocks: vec![Block::new_zeroed(); num_blocks as usize],
            faults: Faults::default(),
        }
    }

    pub fn faults(&self) -> Faults {
        self.faults.clone()
    }

    fn check(&self, block_no: u64) -> Result<usize> {
        if block_no >= self.blocks.len() as u64 {
            log::debug!("Block number {block_no} out of range.");
            return Err(ErrorKind::InvalidInput.into());
        }
        Ok(block_no as usize)
    }
}

impl SyncBlockDevice for MemBlockDevice {
    fn num_blocks(&self) -> u64 {
        self.blocks.len() as u64
    }

    fn read_block(&mut self, block_no: u64, block: &mut Block) -> Result<()> {
        let idx = self.check(block_no)?;
        if self.faults.read_fails(block_no) {
            return Err(ErrorKind::BrokenPipe.into());
        }
        *block = self.blocks[idx];
        Ok(())
    }

    fn write_block(&mut self, block_no: u64, block: &Block) -> Result<()> {
        let idx = self.check(block_no)?;
        if self.faults.write_fails(block_no) {
            return Err(ErrorKind::BrokenPipe.into());
        }
        self.blocks[idx] = *block;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
