//! Block devices with fixed 512-byte blocks.
//!
//! Block #0 is reserved by the filesystem for its metadata; devices
//! themselves treat every block the same.

#[cfg(feature = "file-dev")]
pub mod file_block_device;

mod block_device;
mod mem_block_device;

pub use block_device::*;
pub use mem_block_device::*;

pub const BLOCK_SIZE: usize = 512;

/// A block of bytes.
#[derive(Clone, Copy)]
#[repr(C, align(512))]
pub struct Block {
    bytes: [u8; BLOCK_SIZE],
}

const _: () = assert!(core::mem::size_of::<Block>() == BLOCK_SIZE);

impl Default for Block {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let used = self.bytes.iter().rposition(|b| *b != 0).map_or(0, |pos| pos + 1);
        f.debug_struct("Block").field("used", &used).finish()
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Block {}

impl Block {
    pub const fn new_zeroed() -> Self {
        Self {
            bytes: [0; BLOCK_SIZE],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }

    pub fn get_at_offset<T: plain::Plain>(&self, offset: usize) -> &T {
        assert!(core::mem::size_of::<T>() + offset <= BLOCK_SIZE);
        plain::from_bytes(&self.bytes[offset..(offset + core::mem::size_of::<T>())])
            .expect("Bad alignment")
    }

    pub fn get_mut_at_offset<T: plain::Plain>(&mut self, offset: usize) -> &mut T {
        assert!(core::mem::size_of::<T>() + offset <= BLOCK_SIZE);
        plain::from_mut_bytes(&mut self.bytes[offset..(offset + core::mem::size_of::<T>())])
            .expect("Bad alignment")
    }

    /// Big-endian i32 at offset.
    pub fn read_i32(&self, offset: usize) -> i32 {
        let mut bytes = [0_u8; 4];
        bytes.copy_from_slice(&self.bytes[offset..(offset + 4)]);
        i32::from_be_bytes(bytes)
    }

    pub fn write_i32(&mut self, offset: usize, val: i32) {
        self.bytes[offset..(offset + 4)].copy_from_slice(&val.to_be_bytes());
    }

    /// Big-endian i16 at offset.
    pub fn read_i16(&self, offset: usize) -> i16 {
        let mut bytes = [0_u8; 2];
        bytes.copy_from_slice(&self.bytes[offset..(offset + 2)]);
        i16::from_be_bytes(bytes)
    }

    pub fn write_i16(&mut self, offset: usize, val: i16) {
        self.bytes[offset..(offset + 2)].copy_from_slice(&val.to_be_bytes());
    }
}
