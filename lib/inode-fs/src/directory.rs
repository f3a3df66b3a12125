//! The flat, single-level directory.
//!
//! Entry N names inode N; entry 0 is always "/", the directory itself,
//! stored in inode 0. The directory is persisted as the content of
//! inode 0:
//!
//! `entry_count: i32 | (name_len: i32, name_len bytes of name)*`
//!
//! Cleared entries are written with a zero length.

use crate::block_cache::BlockCache;
use crate::inode::Inode;
use crate::layout::{DIRECTORY_INODE, InodeNo, MAX_NAME_LEN};
use crate::{FsError, Result};

pub(crate) const ROOT_NAME: &str = "/";

pub(crate) fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name == ROOT_NAME {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Directory {
    entries: Vec<Option<String>>,
}

impl Directory {
    pub(crate) fn new(total_inodes: u32) -> Self {
        let mut entries = vec![None; (total_inodes as usize).max(1)];
        entries[DIRECTORY_INODE as usize] = Some(ROOT_NAME.to_owned());
        Self { entries }
    }

    /// Binds `name` to the first free inode number and resets that
    /// inode on disk.
    pub(crate) fn ialloc(
        &mut self,
        name: &str,
        total_inodes: u32,
        cache: &BlockCache,
    ) -> Result<InodeNo> {
        validate_filename(name)?;

        // Scan everything: a free slot may come before a duplicate.
        let mut free = None;
        for (idx, entry) in self.entries.iter().enumerate().skip(1) {
            match entry {
                Some(existing) if existing == name => return Err(FsError::AlreadyExists),
                None if free.is_none() => free = Some(idx),
                _ => {}
            }
        }
        let Some(idx) = free else {
            log::debug!("directory: no free inode for '{name}'");
            return Err(FsError::OutOfInodes);
        };

        let inumber = idx as InodeNo;
        Inode::write_invalidated(inumber, total_inodes, cache)?;
        self.entries[idx] = Some(name.to_owned());

        log::debug!("directory: '{name}' -> #{inumber}");
        Ok(inumber)
    }

    /// Unbinds `inumber` and invalidates its on-disk inode.
    pub(crate) fn ifree(
        &mut self,
        inumber: InodeNo,
        total_inodes: u32,
        cache: &BlockCache,
    ) -> Result<()> {
        let idx = inumber as usize;
        if inumber == DIRECTORY_INODE || idx >= self.entries.len() {
            return Err(FsError::InvalidArgument);
        }
        if self.entries[idx].is_none() {
            return Err(FsError::NotFound);
        }

        Inode::write_invalidated(inumber, total_inodes, cache)?;
        self.unbind(inumber);
        Ok(())
    }

    /// Drops the name bound to `inumber` without touching the disk.
    /// Undoes an `ialloc` whose inode record is still invalidated.
    pub(crate) fn unbind(&mut self, inumber: InodeNo) -> Option<String> {
        if inumber == DIRECTORY_INODE {
            return None;
        }
        self.entries.get_mut(inumber as usize)?.take()
    }

    pub(crate) fn namei(&self, name: &str) -> Option<InodeNo> {
        if name.len() > MAX_NAME_LEN {
            return None;
        }
        self.entries
            .iter()
            .position(|entry| entry.as_deref() == Some(name))
            .map(|idx| idx as InodeNo)
    }

    pub(crate) fn iname(&self, inumber: InodeNo) -> Option<&str> {
        self.entries.get(inumber as usize)?.as_deref()
    }

    /// Live file names with their inode numbers, "/" excluded.
    pub(crate) fn files(&self) -> impl Iterator<Item = (InodeNo, &str)> {
        self.entries
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(idx, entry)| entry.as_deref().map(|name| (idx as InodeNo, name)))
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let names_len: usize = self.entries.iter().flatten().map(|name| name.len()).sum();
        let mut bytes = Vec::with_capacity(4 + self.entries.len() * 4 + names_len);

        bytes.extend_from_slice(&(self.entries.len() as i32).to_be_bytes());
        for entry in self.entries.iter() {
            let name = entry.as_deref().unwrap_or("");
            bytes.extend_from_slice(&(name.len() as i32).to_be_bytes());
            bytes.extend_from_slice(name.as_bytes());
        }

        bytes
    }

    /// Decodes the directory stored in inode 0 of a volume with
    /// `total_inodes` inodes. Entries past `total_inodes` are ignored.
    pub(crate) fn from_bytes(data: &[u8], total_inodes: u32) -> Result<Self> {
        fn take_i32(data: &[u8], pos: &mut usize) -> Result<i32> {
            let bytes = data.get(*pos..(*pos + 4)).ok_or(FsError::Corrupted)?;
            *pos += 4;
            let mut raw = [0_u8; 4];
            raw.copy_from_slice(bytes);
            Ok(i32::from_be_bytes(raw))
        }

        let mut dir = Self::new(total_inodes);
        let mut pos = 0;

        let count = take_i32(data, &mut pos)?;
        if count < 1 {
            return Err(FsError::Corrupted);
        }

        for idx in 0..(count as usize) {
            let len = take_i32(data, &mut pos)?;
            if len < 0 || len as usize > MAX_NAME_LEN {
                return Err(FsError::Corrupted);
            }
            let raw = data
                .get(pos..(pos + len as usize))
                .ok_or(FsError::Corrupted)?;
            pos += len as usize;

            if idx == DIRECTORY_INODE as usize || idx >= dir.entries.len() || len == 0 {
                continue;
            }
            let name = core::str::from_utf8(raw).map_err(|_| FsError::Corrupted)?;
            if validate_filename(name).is_err() || dir.namei(name).is_some() {
                return Err(FsError::Corrupted);
            }
            dir.entries[idx] = Some(name.to_owned());
        }

        Ok(dir)
    }
}
