use std::io::ErrorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    /// Not an open descriptor, or a descriptor reserved for the process model.
    InvalidDescriptor,
    /// The descriptor's open mode does not allow the operation.
    InvalidMode,
    NotFound,
    AlreadyExists,
    /// The free list is exhausted.
    OutOfSpace,
    /// The directory has no free slot.
    OutOfInodes,
    BlockIoFailure,
    /// The file is marked for deletion.
    PendingDeletion,
    InvalidArgument,
    /// The write would exceed MAX_FILE_SIZE.
    TooLarge,
    /// On-disk data failed validation.
    Corrupted,
}

pub type Result<T> = core::result::Result<T, FsError>;

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            FsError::InvalidDescriptor => "invalid file descriptor",
            FsError::InvalidMode => "operation not permitted by open mode",
            FsError::NotFound => "no such file",
            FsError::AlreadyExists => "file already exists",
            FsError::OutOfSpace => "no free blocks",
            FsError::OutOfInodes => "no free inodes",
            FsError::BlockIoFailure => "block I/O failure",
            FsError::PendingDeletion => "file is pending deletion",
            FsError::InvalidArgument => "invalid argument",
            FsError::TooLarge => "file too large",
            FsError::Corrupted => "filesystem corrupted",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for FsError {}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        log::error!("block device: {err}");
        FsError::BlockIoFailure
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        let kind = match err {
            FsError::InvalidDescriptor => ErrorKind::InvalidInput,
            FsError::InvalidMode => ErrorKind::PermissionDenied,
            FsError::NotFound => ErrorKind::NotFound,
            FsError::AlreadyExists => ErrorKind::AlreadyExists,
            FsError::OutOfSpace => ErrorKind::StorageFull,
            FsError::OutOfInodes => ErrorKind::StorageFull,
            FsError::BlockIoFailure => ErrorKind::BrokenPipe,
            FsError::PendingDeletion => ErrorKind::ResourceBusy,
            FsError::InvalidArgument => ErrorKind::InvalidInput,
            FsError::TooLarge => ErrorKind::FileTooLarge,
            FsError::Corrupted => ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, err)
    }
}
