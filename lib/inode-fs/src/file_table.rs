//! The system-wide open-file table.
//!
//! Every open file has exactly one resident `Inode`, shared by all the
//! descriptors that refer to it, so its lock state is shared too. The
//! inode's reference count is the number of such descriptors.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::block_cache::BlockCache;
use crate::directory::{Directory, validate_filename};
use crate::inode::Inode;
use crate::layout::InodeNo;
use crate::{FsError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// "r"
    Read,
    /// "w"
    Write,
    /// "w+"
    ReadWrite,
    /// "a": writes start at the end of the file.
    Append,
}

impl OpenMode {
    pub fn can_read(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

impl FromStr for OpenMode {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(OpenMode::Read),
            "w" => Ok(OpenMode::Write),
            "w+" => Ok(OpenMode::ReadWrite),
            "a" => Ok(OpenMode::Append),
            _ => Err(FsError::InvalidArgument),
        }
    }
}

/// One descriptor's view of an open file.
#[derive(Debug)]
pub(crate) struct OpenFile {
    inode: Arc<Inode>,
    mode: OpenMode,
    cursor: u32,
}

impl OpenFile {
    pub(crate) fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub(crate) fn inumber(&self) -> InodeNo {
        self.inode.inumber()
    }

    pub(crate) fn mode(&self) -> OpenMode {
        self.mode
    }

    pub(crate) fn cursor(&self) -> u32 {
        self.cursor
    }

    pub(crate) fn advance(&mut self, bytes: usize) {
        self.cursor += bytes as u32;
    }

    /// Moves the cursor to `target`, clamped to `[0, length - 1]`.
    /// A target equal to `length` is kept as is, so seeking to the end
    /// leaves the cursor at end of file.
    pub(crate) fn seek_to(&mut self, target: i64, length: u32) -> u32 {
        self.cursor = if target < 0 {
            0
        } else if target > length as i64 {
            length.saturating_sub(1)
        } else {
            target as u32
        };
        self.cursor
    }
}

#[derive(Default)]
pub(crate) struct OpenFileTable {
    files: HashMap<InodeNo, Arc<Inode>>,
}

impl OpenFileTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Opens `name`, creating it unless `mode` is read-only.
    ///
    /// The caller holds the directory, so lookup, creation and the
    /// reference count increment happen as one step. Returns the new
    /// open file, with its cursor at 0, and whether the directory changed.
    pub(crate) fn falloc(
        &mut self,
        directory: &mut Directory,
        name: &str,
        mode: OpenMode,
        total_inodes: u32,
        cache: &BlockCache,
    ) -> Result<(OpenFile, bool)> {
        validate_filename(name)?;

        let (inode, created) = match directory.namei(name) {
            Some(inumber) => (self.resident(inumber, total_inodes, cache)?, false),
            None if mode == OpenMode::Read => return Err(FsError::NotFound),
            None => {
                let inumber = directory.ialloc(name, total_inodes, cache)?;
                (Arc::new(Inode::new(inumber)), true)
            }
        };

        if inode.is_dying() {
            log::debug!("open '{name}': #{} is pending deletion", inode.inumber());
            return Err(FsError::PendingDeletion);
        }

        inode.inc_ref();
        if let Err(err) = inode.persist(cache) {
            inode.dec_ref();
            if created {
                directory.unbind(inode.inumber());
            }
            return Err(err);
        }
        self.files.insert(inode.inumber(), inode.clone());

        Ok((
            OpenFile {
                inode,
                mode,
                cursor: 0,
            },
            created,
        ))
    }

    /// Drops one reference to `inumber`. Returns the remaining count, or
    /// None if the inode is not open. Dying inodes stay resident for the
    /// deleter.
    pub(crate) fn ffree(&mut self, inumber: InodeNo, cache: &BlockCache) -> Result<Option<u16>> {
        let Some(inode) = self.files.get(&inumber).cloned() else {
            return Ok(None);
        };
        if inode.ref_count() == 0 {
            return Ok(None);
        }

        let remaining = inode.dec_ref();
        if remaining == 0 && !inode.is_dying() {
            self.files.remove(&inumber);
        }
        inode.persist(cache)?;

        Ok(Some(remaining))
    }

    /// The resident inode for `inumber`, loaded from disk if nobody has
    /// it open. A loaded inode is only kept resident by `falloc` or `pin`.
    fn resident(
        &self,
        inumber: InodeNo,
        total_inodes: u32,
        cache: &BlockCache,
    ) -> Result<Arc<Inode>> {
        match self.files.get(&inumber) {
            Some(inode) => Ok(inode.clone()),
            None => Ok(Arc::new(Inode::load(inumber, total_inodes, cache)?)),
        }
    }

    /// Makes `inumber` resident regardless of its reference count.
    pub(crate) fn pin(
        &mut self,
        inumber: InodeNo,
        total_inodes: u32,
        cache: &BlockCache,
    ) -> Result<Arc<Inode>> {
        let inode = self.resident(inumber, total_inodes, cache)?;
        self.files.insert(inumber, inode.clone());
        Ok(inode)
    }

    pub(crate) fn remove(&mut self, inumber: InodeNo) -> Option<Arc<Inode>> {
        self.files.remove(&inumber)
    }

    pub(crate) fn is_open(&self, inumber: InodeNo) -> bool {
        self.files
            .get(&inumber)
            .is_some_and(|inode| inode.ref_count() > 0)
    }
}
