//! Per-thread descriptor tables.

use crate::file_table::OpenFile;
use crate::{FsError, Result};

pub const FD_TABLE_SIZE: usize = 32;

/// Descriptors 0, 1 and 2 belong to the process model (stdin, stdout,
/// stderr) and are never handed out or accepted.
pub const RESERVED_FDS: usize = 3;

pub type Fd = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl TryFrom<i32> for Whence {
    type Error = FsError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            _ => Err(FsError::InvalidArgument),
        }
    }
}

/// The open files of one thread, indexed by descriptor.
///
/// The table is owned by whoever schedules the thread; the filesystem
/// only fills and clears its slots.
#[derive(Debug)]
pub struct DescriptorTable {
    slots: [Option<OpenFile>; FD_TABLE_SIZE],
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Descriptors currently in use.
    pub fn open_fds(&self) -> impl Iterator<Item = Fd> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, slot)| slot.as_ref().map(|_| fd))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub(crate) fn free_slot(&self) -> Option<Fd> {
        (RESERVED_FDS..FD_TABLE_SIZE).find(|fd| self.slots[*fd].is_none())
    }

    pub(crate) fn install(&mut self, fd: Fd, file: OpenFile) {
        debug_assert!(self.slots[fd].is_none());
        self.slots[fd] = Some(file);
    }

    fn slot(&mut self, fd: Fd) -> Result<&mut Option<OpenFile>> {
        if fd < RESERVED_FDS {
            return Err(FsError::InvalidDescriptor);
        }
        self.slots.get_mut(fd).ok_or(FsError::InvalidDescriptor)
    }

    pub(crate) fn get_mut(&mut self, fd: Fd) -> Result<&mut OpenFile> {
        self.slot(fd)?.as_mut().ok_or(FsError::InvalidDescriptor)
    }

    pub(crate) fn take(&mut self, fd: Fd) -> Result<OpenFile> {
        self.slot(fd)?.take().ok_or(FsError::InvalidDescriptor)
    }
}
