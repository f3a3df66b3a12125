//! On-disk data structures.
//!
//! All integers are big-endian.
//!
//! - block 0: the superblock: `total_blocks: i32 | total_inodes: i32 |
//!   free_list: i32 | magic: u32 | crc32: u32 | zero padding`;
//! - blocks `1..=ceil(total_inodes / 16)`: inode records, 16 per block;
//! - the rest: data blocks, indirect blocks, or free blocks.
//!
//! A free block stores the number of the next free block (or -1) in
//! its first four bytes. An indirect block is an array of 256 i16 block
//! numbers, 0 meaning "unused".
use crate::{FsError, Result};
use bitflags::bitflags;
use block_dev::{BLOCK_SIZE, Block};
use crc::CRC_32_ISO_HDLC;

pub type BlockNo = u16;
pub type InodeNo = u16;

pub const INODE_SIZE: usize = 32;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
const _: () = assert!(INODES_PER_BLOCK == 16);

pub const DIRECT_POINTERS: usize = 11;
pub const INDIRECT_POINTERS: usize = BLOCK_SIZE / 2;
const _: () = assert!(INDIRECT_POINTERS == 256);

pub const MAX_FILE_SIZE: usize = (DIRECT_POINTERS + INDIRECT_POINTERS) * BLOCK_SIZE;
const _: () = assert!(MAX_FILE_SIZE == 136_704);

pub const MAX_NAME_LEN: usize = 30;

/// Each inode should be able to own at least one block.
pub const MAX_INODES: u32 = (BLOCK_SIZE / 2 - 1) as u32;

/// Block pointers are 16 bits wide.
pub const MAX_BLOCKS: u64 = i16::MAX as u64 + 1;

/// The directory lives in inode #0.
pub const DIRECTORY_INODE: InodeNo = 0;

pub(crate) const SUPERBLOCK_NO: u64 = 0;
pub(crate) const NO_BLOCK: i32 = -1;

const MAGIC: u32 = 0x1e0d_f5b1; // Just a random number.

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub(crate) fn crc32_hash(bytes: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(bytes);
    digest.finalize()
}

/// The first block that is not the superblock or an inode block.
pub(crate) const fn first_data_block(total_inodes: u32) -> u32 {
    (total_inodes as usize).div_ceil(INODES_PER_BLOCK) as u32 + 1
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SuperblockHeader {
    pub total_blocks: u32,
    pub total_inodes: u32,
    pub free_list: Option<BlockNo>,
}

impl SuperblockHeader {
    const MAGIC_OFFSET: usize = 12;
    const CRC_OFFSET: usize = 16;

    pub fn encode(&self, block: &mut Block) {
        block.clear();
        block.write_i32(0, self.total_blocks as i32);
        block.write_i32(4, self.total_inodes as i32);
        block.write_i32(8, self.free_list.map_or(NO_BLOCK, i32::from));
        block.write_i32(Self::MAGIC_OFFSET, MAGIC as i32);
        let crc32 = crc32_hash(&block.as_bytes()[0..Self::CRC_OFFSET]);
        block.write_i32(Self::CRC_OFFSET, crc32 as i32);
    }

    /// Fails with Corrupted if the block does not hold a superblock.
    pub fn decode(block: &Block) -> Result<Self> {
        if block.read_i32(Self::MAGIC_OFFSET) as u32 != MAGIC {
            return Err(FsError::Corrupted);
        }
        let crc32 = crc32_hash(&block.as_bytes()[0..Self::CRC_OFFSET]);
        if block.read_i32(Self::CRC_OFFSET) as u32 != crc32 {
            log::warn!("superblock crc32 mismatch");
            return Err(FsError::Corrupted);
        }

        let total_blocks = block.read_i32(0);
        let total_inodes = block.read_i32(4);
        let free_list = block.read_i32(8);
        if total_blocks < 2
            || (total_blocks as u64) > MAX_BLOCKS
            || total_inodes < 0
            || (total_inodes as u32) > MAX_INODES
        {
            return Err(FsError::Corrupted);
        }

        let free_list = match free_list {
            NO_BLOCK => None,
            no if no > 0 && no < total_blocks => Some(no as BlockNo),
            _ => return Err(FsError::Corrupted),
        };

        Ok(Self {
            total_blocks: total_blocks as u32,
            total_inodes: total_inodes as u32,
            free_list,
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InodeFlags: u8 {
        const READING = 0x01;
        const WRITING = 0x02;
        const DYING = 0x04;
    }
}

// The raw 32-byte record.
#[derive(Clone, Copy)]
#[repr(C)]
struct DiskInode {
    length: [u8; 4],
    ref_count: [u8; 2],
    flags: u8,
    reader_count: u8,
    direct: [[u8; 2]; DIRECT_POINTERS],
    indirect: [u8; 2],
}

unsafe impl plain::Plain for DiskInode {}

const _: () = assert!(core::mem::size_of::<DiskInode>() == INODE_SIZE);

/// The in-memory image of an inode record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InodeRecord {
    pub length: u32,
    pub ref_count: u16,
    pub flags: InodeFlags,
    pub reader_count: u8,
    pub direct: [Option<BlockNo>; DIRECT_POINTERS],
    pub indirect: Option<BlockNo>,
}

impl Default for InodeRecord {
    fn default() -> Self {
        Self::invalidated()
    }
}

fn decode_ptr(raw: [u8; 2]) -> Result<Option<BlockNo>> {
    match i16::from_be_bytes(raw) {
        // Zero is the superblock, never a valid pointer.
        -1 | 0 => Ok(None),
        no if no > 0 => Ok(Some(no as BlockNo)),
        _ => Err(FsError::Corrupted),
    }
}

fn encode_ptr(ptr: Option<BlockNo>) -> [u8; 2] {
    ptr.map_or(-1_i16, |no| no as i16).to_be_bytes()
}

impl InodeRecord {
    pub const fn invalidated() -> Self {
        Self {
            length: 0,
            ref_count: 0,
            flags: InodeFlags::empty(),
            reader_count: 0,
            direct: [None; DIRECT_POINTERS],
            indirect: None,
        }
    }

    /// The block holding the record and the record's offset in it.
    pub fn location(inumber: InodeNo) -> (u64, usize) {
        let inumber = inumber as usize;
        let block_no = (inumber / INODES_PER_BLOCK + 1) as u64;
        let offset = (inumber % INODES_PER_BLOCK) * INODE_SIZE;
        (block_no, offset)
    }

    pub fn decode(block: &Block, offset: usize) -> Result<Self> {
        let raw = block.get_at_offset::<DiskInode>(offset);

        let length = i32::from_be_bytes(raw.length);
        let ref_count = i16::from_be_bytes(raw.ref_count);
        if length < 0 || length as usize > MAX_FILE_SIZE || ref_count < 0 {
            return Err(FsError::Corrupted);
        }

        let mut direct = [None; DIRECT_POINTERS];
        for (dst, src) in direct.iter_mut().zip(raw.direct.iter()) {
            *dst = decode_ptr(*src)?;
        }

        Ok(Self {
            length: length as u32,
            ref_count: ref_count as u16,
            flags: InodeFlags::from_bits_retain(raw.flags),
            reader_count: raw.reader_count,
            direct,
            indirect: decode_ptr(raw.indirect)?,
        })
    }

    pub fn encode(&self, block: &mut Block, offset: usize) {
        let raw = block.get_mut_at_offset::<DiskInode>(offset);

        raw.length = (self.length as i32).to_be_bytes();
        raw.ref_count = (self.ref_count as i16).to_be_bytes();
        raw.flags = self.flags.bits();
        raw.reader_count = self.reader_count;
        for (dst, src) in raw.direct.iter_mut().zip(self.direct.iter()) {
            *dst = encode_ptr(*src);
        }
        raw.indirect = encode_ptr(self.indirect);
    }
}

pub(crate) fn indirect_get(block: &Block, idx: usize) -> Option<BlockNo> {
    assert!(idx < INDIRECT_POINTERS);
    let no = block.read_i16(idx * 2);
    if no > 0 { Some(no as BlockNo) } else { None }
}

pub(crate) fn indirect_set(block: &mut Block, idx: usize, block_no: BlockNo) {
    assert!(idx < INDIRECT_POINTERS);
    block.write_i16(idx * 2, block_no as i16);
}

pub(crate) fn free_block_next(block: &Block) -> i32 {
    block.read_i32(0)
}

pub(crate) fn set_free_block_next(block: &mut Block, next: Option<BlockNo>) {
    block.clear();
    block.write_i32(0, next.map_or(NO_BLOCK, i32::from));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_record_roundtrip() {
        let mut rec = InodeRecord::invalidated();
        rec.length = 5000;
        rec.ref_count = 3;
        rec.flags = InodeFlags::READING | InodeFlags::DYING;
        rec.reader_count = 2;
        rec.direct[0] = Some(17);
        rec.direct[10] = Some(32767);
        rec.indirect = Some(40);

        let mut block = Block::new_zeroed();
        for inumber in [0_u16, 5, 15] {
            let (block_no, offset) = InodeRecord::location(inumber);
            assert_eq!(1, block_no);
            rec.encode(&mut block, offset);
            assert_eq!(rec, InodeRecord::decode(&block, offset).unwrap());
        }

        let (block_no, offset) = InodeRecord::location(16);
        assert_eq!((2, 0), (block_no, offset));
        let (block_no, offset) = InodeRecord::location(37);
        assert_eq!((3, 5 * INODE_SIZE), (block_no, offset));
    }

    #[test]
    fn inode_record_bytes() {
        let mut rec = InodeRecord::invalidated();
        rec.length = 0x0102;
        rec.ref_count = 1;
        rec.flags = InodeFlags::WRITING;
        rec.direct[0] = Some(9);

        let mut block = Block::new_zeroed();
        rec.encode(&mut block, INODE_SIZE);
        let bytes = &block.as_bytes()[INODE_SIZE..(2 * INODE_SIZE)];
        assert_eq!(&bytes[0..8], &[0, 0, 1, 2, 0, 1, 0x02, 0]);
        assert_eq!(&bytes[8..10], &[0, 9]);
        assert_eq!(&bytes[10..12], &[0xff, 0xff]);
        assert_eq!(&bytes[30..32], &[0xff, 0xff]);
        assert!(block.as_bytes()[0..INODE_SIZE].iter().all(|b| *b == 0));
    }

    #[test]
    fn corrupted_inode_record() {
        let mut block = Block::new_zeroed();
        block.write_i32(0, -5);
        assert_eq!(Err(FsError::Corrupted), InodeRecord::decode(&block, 0));

        block.write_i32(0, 0);
        block.write_i16(8, -7);
        assert_eq!(Err(FsError::Corrupted), InodeRecord::decode(&block, 0));
    }

    #[test]
    fn superblock_header() {
        let header = SuperblockHeader {
            total_blocks: 1000,
            total_inodes: 64,
            free_list: Some(5),
        };
        let mut block = Block::new_zeroed();
        header.encode(&mut block);
        assert_eq!(1000, block.read_i32(0));
        assert_eq!(64, block.read_i32(4));
        assert_eq!(5, block.read_i32(8));
        assert_eq!(header, SuperblockHeader::decode(&block).unwrap());

        block.write_i32(4, 65);
        assert_eq!(Err(FsError::Corrupted), SuperblockHeader::decode(&block));
        assert_eq!(
            Err(FsError::Corrupted),
            SuperblockHeader::decode(&Block::new_zeroed())
        );
    }

    #[test]
    fn first_data_blocks() {
        assert_eq!(1, first_data_block(0));
        assert_eq!(2, first_data_block(1));
        assert_eq!(2, first_data_block(16));
        assert_eq!(3, first_data_block(17));
        assert_eq!(5, first_data_block(64));
        assert_eq!(17, first_data_block(MAX_INODES));
    }
}
