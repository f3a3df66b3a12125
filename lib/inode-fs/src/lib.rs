//! Inode File System (core library)
//!
//! A small inode-based filesystem over a block device with 512-byte
//! blocks (see trait SyncBlockDevice in crate block-dev).
//!
//! The volume has a flat directory, stored as the content of inode 0,
//! and files of up to 136704 bytes (11 direct block pointers and one
//! indirect block). Many threads may share one `FileSystem`; each
//! thread brings its own `DescriptorTable`. Per file, readers run
//! concurrently and writers exclusively; deleting a file that is still
//! open blocks until the last descriptor is closed.
//!
//! See src/tests.rs for usage examples.
//!
//! TODO:
//!
//! * crash recovery (no cross-block transactions)
//! * timestamps

mod block_cache;
mod config;
mod descriptor;
mod directory;
mod error;
mod file_table;
mod fs;
mod inode;
mod layout;
mod superblock;


pub use config::FsConfig;
pub use descriptor::{DescriptorTable, FD_TABLE_SIZE, Fd, RESERVED_FDS, Whence};
pub use error::*;
pub use file_table::OpenMode;
pub use fs::FileSystem;
pub use layout::*;

pub use block_dev::{BLOCK_SIZE, SyncBlockDevice};
