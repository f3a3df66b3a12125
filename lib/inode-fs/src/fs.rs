//! The filesystem facade.
//!
//! Shared state is split into independently locked parts. Locks are
//! always taken in this order:
//!
//! delete lock -> directory -> open-file table -> allocator -> inode -> block cache
//!
//! Per-inode reader/writer locks are held for whole read/write calls;
//! the structural locks only for the duration of a lookup or update.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use block_dev::{BLOCK_SIZE, Block, SyncBlockDevice};

use crate::block_cache::BlockCache;
use crate::config::FsConfig;
use crate::descriptor::{DescriptorTable, Fd, Whence};
use crate::directory::{Directory, validate_filename};
use crate::file_table::{OpenFile, OpenFileTable, OpenMode};
use crate::inode::{Inode, InodeWriteGuard};
use crate::layout::*;
use crate::superblock::FreeBlockAllocator;
use crate::{FsError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct FileSystem {
    cache: BlockCache,
    config: FsConfig,
    total_inodes: u32,

    allocator: Mutex<FreeBlockAllocator>,
    directory: Mutex<Directory>,
    // Inode 0: the directory's content. Only touched under `directory`.
    root: Inode,
    file_table: Mutex<OpenFileTable>,
    // Signaled (with `file_table` held) when a dying inode loses its
    // last reference.
    released: Condvar,
    delete_lock: Mutex<()>,
}

impl FileSystem {
    fn assemble(cache: BlockCache, allocator: FreeBlockAllocator, config: FsConfig) -> Self {
        let total_inodes = allocator.total_inodes();
        Self {
            cache,
            config,
            total_inodes,
            allocator: Mutex::new(allocator),
            directory: Mutex::new(Directory::new(total_inodes)),
            root: Inode::new(DIRECTORY_INODE),
            file_table: Mutex::new(OpenFileTable::new()),
            released: Condvar::new(),
            delete_lock: Mutex::new(()),
        }
    }

    /// Mounts the volume on `block_device`. An unformatted device is
    /// formatted with `config.default_inodes` inodes, unless
    /// `config.format_on_mount` is off.
    pub fn mount(block_device: Box<dyn SyncBlockDevice>, config: FsConfig) -> Result<Self> {
        let cache = BlockCache::new(block_device, config.cache_blocks);

        let loaded = FreeBlockAllocator::load(&cache);
        match loaded {
            Ok(allocator) => {
                let mut fs = Self::assemble(cache, allocator, config);
                fs.load_directory()?;
                log::info!(
                    "mounted: {} blocks, {} inodes, {} files",
                    fs.total_blocks(),
                    fs.total_inodes,
                    fs.list().len()
                );
                Ok(fs)
            }
            Err(FsError::Corrupted) if config.format_on_mount => {
                log::info!("mount: no volume found, formatting");
                let inodes = config.default_inodes;
                Self::format_device_cached(cache, inodes, config)
            }
            Err(err) => Err(err),
        }
    }

    /// Formats `block_device` with `inodes` inodes and mounts it.
    pub fn format_device(
        block_device: Box<dyn SyncBlockDevice>,
        inodes: u32,
        config: FsConfig,
    ) -> Result<Self> {
        let cache = BlockCache::new(block_device, config.cache_blocks);
        Self::format_device_cached(cache, inodes, config)
    }

    fn format_device_cached(cache: BlockCache, inodes: u32, config: FsConfig) -> Result<Self> {
        let allocator = FreeBlockAllocator::format(&cache, inodes)?;
        let fs = Self::assemble(cache, allocator, config);
        fs.flush_directory(&lock(&fs.directory))?;
        Ok(fs)
    }

    /// Erases the volume, leaving `inodes` inodes.
    ///
    /// Descriptors still open in some thread's table are not revoked;
    /// using them afterwards is unspecified.
    pub fn format(&mut self, inodes: u32) -> Result<()> {
        let allocator = FreeBlockAllocator::format(&self.cache, inodes)?;

        self.total_inodes = allocator.total_inodes();
        self.allocator = Mutex::new(allocator);
        self.directory = Mutex::new(Directory::new(self.total_inodes));
        self.root = Inode::new(DIRECTORY_INODE);
        self.file_table = Mutex::new(OpenFileTable::new());

        self.flush_directory(&lock(&self.directory))
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn total_blocks(&self) -> u32 {
        lock(&self.allocator).total_blocks()
    }

    pub fn total_inodes(&self) -> u32 {
        self.total_inodes
    }

    /// The number of blocks on the free list.
    pub fn free_blocks(&self) -> Result<u32> {
        lock(&self.allocator).count_free_blocks(&self.cache)
    }

    pub fn exists(&self, name: &str) -> bool {
        validate_filename(name).is_ok() && lock(&self.directory).namei(name).is_some()
    }

    /// Names of all files, in inode order.
    pub fn list(&self) -> Vec<String> {
        lock(&self.directory)
            .files()
            .map(|(_, name)| name.to_owned())
            .collect()
    }

    /// Persists the directory and the superblock, and flushes the device.
    pub fn sync(&self) -> Result<()> {
        self.flush_directory(&lock(&self.directory))?;
        lock(&self.allocator).sync(&self.cache)?;
        self.cache.flush()
    }

    /// Opens (or, unless `mode` is read-only, creates) `name`.
    pub fn open(&self, table: &mut DescriptorTable, name: &str, mode: OpenMode) -> Result<Fd> {
        let Some(fd) = table.free_slot() else {
            log::debug!("open '{name}': descriptor table full");
            return Err(FsError::InvalidDescriptor);
        };

        let mut directory = lock(&self.directory);
        let (mut file, created) = lock(&self.file_table).falloc(
            &mut directory,
            name,
            mode,
            self.total_inodes,
            &self.cache,
        )?;

        if created {
            if let Err(err) = self.flush_directory(&directory) {
                self.undo_create(&mut directory, file);
                return Err(err);
            }
        }
        drop(directory);

        // Outside the structural locks: this waits for any writer of the file.
        if mode == OpenMode::Append {
            let length = file.inode().wait_until_accessible();
            file.seek_to(length as i64, length);
        }

        log::debug!("open '{name}' {mode:?}: fd {fd} -> #{}", file.inumber());
        table.install(fd, file);
        Ok(fd)
    }

    /// Rolls back a create whose directory could not be written. The
    /// directory lock stays held, so the inode number cannot be reused
    /// before the file is released.
    fn undo_create(&self, directory: &mut Directory, file: OpenFile) {
        let inumber = file.inumber();
        if let Err(err) = self.release(file) {
            log::warn!("open: releasing #{inumber} after a failed create: {err:?}");
        }
        let name = directory.unbind(inumber);
        log::debug!("open: create of {name:?} (#{inumber}) rolled back");

        if let Err(err) = self.flush_directory(directory) {
            log::error!("open: directory not restored after a failed create: {err:?}");
        }
    }

    pub fn close(&self, table: &mut DescriptorTable, fd: Fd) -> Result<()> {
        let file = table.take(fd)?;
        log::debug!("close fd {fd} (#{})", file.inumber());
        self.release(file)
    }

    /// Closes every descriptor in `table`. Returns the first error, if
    /// any, after trying all of them.
    pub fn close_all(&self, table: &mut DescriptorTable) -> Result<()> {
        let fds: Vec<Fd> = table.open_fds().collect();
        let mut result = Ok(());
        for fd in fds {
            let closed = self.close(table, fd);
            if result.is_ok() {
                result = closed;
            }
        }
        result
    }

    fn release(&self, file: OpenFile) -> Result<()> {
        let inode = file.inode();
        let mut files = lock(&self.file_table);
        let freed = files.ffree(file.inumber(), &self.cache);

        if inode.ref_count() == 0 && inode.is_dying() {
            self.released.notify_all();
        }
        drop(files);

        match freed? {
            Some(_) => Ok(()),
            None => {
                log::warn!("close: #{} is not in the open-file table", file.inumber());
                Err(FsError::InvalidDescriptor)
            }
        }
    }

    /// Sets the cursor of `fd` and returns it. The result is clamped to
    /// `[0, length - 1]`, except that a target of exactly `length` is
    /// kept.
    pub fn seek(
        &self,
        table: &mut DescriptorTable,
        fd: Fd,
        offset: i64,
        whence: Whence,
    ) -> Result<u32> {
        let file = table.get_mut(fd)?;
        let length = file.inode().length();
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => file.cursor() as i64,
            Whence::End => length as i64,
        };
        Ok(file.seek_to(base.saturating_add(offset), length))
    }

    /// Reads from the cursor of `fd`. Returns 0 at end of file.
    pub fn read(&self, table: &mut DescriptorTable, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let file = table.get_mut(fd)?;
        if !file.mode().can_read() {
            return Err(FsError::InvalidMode);
        }

        let inode = Arc::clone(file.inode());
        let guard = inode.acquire_read();
        let bytes = self.read_at(&guard.record(), file.cursor(), buf)?;
        drop(guard);

        file.advance(bytes);
        Ok(bytes)
    }

    /// Writes at the cursor of `fd`, allocating blocks as needed.
    ///
    /// Writes past `MAX_FILE_SIZE` are cut short; a write that cannot
    /// store a single byte fails with `TooLarge`. On failure the blocks
    /// written before the error stay written, and the file length covers
    /// them.
    pub fn write(&self, table: &mut DescriptorTable, fd: Fd, buf: &[u8]) -> Result<usize> {
        let file = table.get_mut(fd)?;
        if !file.mode().can_write() {
            return Err(FsError::InvalidMode);
        }

        let inode = Arc::clone(file.inode());
        let mut guard = inode.acquire_write();
        let written = self.write_at(&mut guard, file.cursor(), buf);
        let persisted = guard.persist(&self.cache);
        drop(guard);

        let written = written?;
        persisted?;
        file.advance(written);
        Ok(written)
    }

    /// The length of the file behind `fd`, once no writer holds it.
    pub fn size(&self, table: &mut DescriptorTable, fd: Fd) -> Result<u32> {
        let file = table.get_mut(fd)?;
        Ok(file.inode().wait_until_accessible())
    }

    /// Deletes `name`. Blocks until every descriptor of the file is closed.
    ///
    /// A thread must not delete a file it has open itself: it would wait
    /// for its own close forever.
    pub fn delete(&self, name: &str) -> Result<()> {
        validate_filename(name)?;
        let _delete_guard = lock(&self.delete_lock);

        let inumber = lock(&self.directory)
            .namei(name)
            .ok_or(FsError::NotFound)?;
        self.delete_locked(inumber)
    }

    /// Deletes the file stored in inode `inumber`; see `delete`.
    pub fn delete_inumber(&self, inumber: InodeNo) -> Result<()> {
        let _delete_guard = lock(&self.delete_lock);
        self.delete_locked(inumber)
    }

    fn delete_locked(&self, inumber: InodeNo) -> Result<()> {
        if inumber == DIRECTORY_INODE || inumber as u32 >= self.total_inodes {
            return Err(FsError::InvalidArgument);
        }

        let directory = lock(&self.directory);
        if directory.iname(inumber).is_none() {
            return Err(FsError::NotFound);
        }
        let mut files = lock(&self.file_table);
        drop(directory);

        let inode = files.pin(inumber, self.total_inodes, &self.cache)?;
        inode.mark_for_death();
        inode.persist(&self.cache)?;

        if files.is_open(inumber) {
            log::debug!(
                "delete #{inumber}: waiting for {} descriptors",
                inode.ref_count()
            );
        }
        while inode.ref_count() > 0 {
            files = self
                .released
                .wait(files)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(files);

        {
            let mut guard = inode.acquire_write();
            self.reclaim_blocks(&mut guard)?;
        }

        let mut directory = lock(&self.directory);
        directory.ifree(inumber, self.total_inodes, &self.cache)?;
        let flushed = self.flush_directory(&directory);
        lock(&self.file_table).remove(inumber);
        drop(directory);

        log::debug!("deleted #{inumber}");
        flushed
    }

    /// Returns every block of the file to the allocator. The record is
    /// updated block by block, so a failure leaves it consistent.
    fn reclaim_blocks(&self, guard: &mut InodeWriteGuard<'_>) -> Result<()> {
        let rec = guard.record();
        let mut allocator = lock(&self.allocator);

        for (idx, block_no) in rec.direct.iter().enumerate() {
            if let Some(block_no) = block_no {
                allocator.return_block(&self.cache, *block_no)?;
                guard.update(|rec| rec.direct[idx] = None);
            }
        }

        if let Some(indirect_no) = rec.indirect {
            let mut indirect = Block::new_zeroed();
            self.cache.read(indirect_no as u64, &mut indirect)?;
            for idx in 0..INDIRECT_POINTERS {
                let Some(block_no) = indirect_get(&indirect, idx) else {
                    continue;
                };
                if let Err(err) = allocator.return_block(&self.cache, block_no) {
                    // Forget the entries already reclaimed.
                    let _ = self.cache.write(indirect_no as u64, &indirect);
                    return Err(err);
                }
                indirect_set(&mut indirect, idx, 0);
            }
            allocator.return_block(&self.cache, indirect_no)?;
            guard.update(|rec| rec.indirect = None);
        }

        guard.update(|rec| rec.length = 0);
        drop(allocator);
        guard.persist(&self.cache)
    }

    fn allocate_block(&self) -> Result<BlockNo> {
        lock(&self.allocator).get_next_free_block(&self.cache)
    }

    fn load_indirect<'a>(
        &self,
        block_no: BlockNo,
        slot: &'a mut Option<Block>,
    ) -> Result<&'a mut Block> {
        if slot.is_none() {
            let mut block = Block::new_zeroed();
            self.cache.read(block_no as u64, &mut block)?;
            *slot = Some(block);
        }
        Ok(slot.get_or_insert_with(Block::new_zeroed))
    }

    /// The block holding file block `idx`, if allocated.
    fn data_block(
        &self,
        rec: &InodeRecord,
        idx: usize,
        indirect: &mut Option<Block>,
    ) -> Result<Option<BlockNo>> {
        if idx < DIRECT_POINTERS {
            return Ok(rec.direct[idx]);
        }
        let Some(indirect_no) = rec.indirect else {
            return Ok(None);
        };
        let table = self.load_indirect(indirect_no, indirect)?;
        Ok(indirect_get(table, idx - DIRECT_POINTERS))
    }

    /// The block holding file block `idx`, allocated if missing. New
    /// indirect entries are written through immediately.
    fn data_block_for_write(
        &self,
        guard: &mut InodeWriteGuard<'_>,
        idx: usize,
        indirect: &mut Option<Block>,
    ) -> Result<BlockNo> {
        let rec = guard.record();
        if let Some(block_no) = self.data_block(&rec, idx, indirect)? {
            return Ok(block_no);
        }

        if idx < DIRECT_POINTERS {
            let block_no = self.allocate_block()?;
            guard.update(|rec| rec.direct[idx] = Some(block_no));
            return Ok(block_no);
        }

        let indirect_no = match rec.indirect {
            Some(block_no) => block_no,
            None => {
                // Freshly allocated blocks are zeroed: no entries yet.
                let block_no = self.allocate_block()?;
                guard.update(|rec| rec.indirect = Some(block_no));
                *indirect = Some(Block::new_zeroed());
                block_no
            }
        };

        let block_no = self.allocate_block()?;
        let table = self.load_indirect(indirect_no, indirect)?;
        indirect_set(table, idx - DIRECT_POINTERS, block_no);
        if let Err(err) = self.cache.write(indirect_no as u64, table) {
            indirect_set(table, idx - DIRECT_POINTERS, 0);
            let _ = lock(&self.allocator).return_block(&self.cache, block_no);
            return Err(err);
        }
        Ok(block_no)
    }

    fn read_at(&self, rec: &InodeRecord, pos: u32, buf: &mut [u8]) -> Result<usize> {
        if pos >= rec.length || buf.is_empty() {
            return Ok(0);
        }
        let pos = pos as usize;
        let to_read = buf.len().min(rec.length as usize - pos);

        let mut indirect = None;
        let mut done = 0;
        while done < to_read {
            let offset = pos + done;
            let block_offset = offset % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - block_offset).min(to_read - done);

            let Some(block_no) = self.data_block(rec, offset / BLOCK_SIZE, &mut indirect)? else {
                log::error!(
                    "FS corrupted: hole at offset {offset} of a {} byte file",
                    rec.length
                );
                return Err(FsError::Corrupted);
            };
            let mut block = Block::new_zeroed();
            self.cache.read(block_no as u64, &mut block)?;
            buf[done..(done + chunk)]
                .copy_from_slice(&block.as_bytes()[block_offset..(block_offset + chunk)]);

            done += chunk;
        }

        Ok(done)
    }

    fn write_at(&self, guard: &mut InodeWriteGuard<'_>, pos: u32, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let pos = pos as usize;
        if pos >= MAX_FILE_SIZE {
            return Err(FsError::TooLarge);
        }
        let to_write = buf.len().min(MAX_FILE_SIZE - pos);
        if to_write < buf.len() {
            log::debug!(
                "write: {} bytes past the maximum file size dropped",
                buf.len() - to_write
            );
        }

        let mut indirect = None;
        let mut done = 0;
        while done < to_write {
            let offset = pos + done;
            let block_offset = offset % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - block_offset).min(to_write - done);
            let src = &buf[done..(done + chunk)];

            let block_no = self.data_block_for_write(guard, offset / BLOCK_SIZE, &mut indirect)?;
            if chunk == BLOCK_SIZE {
                let mut block = Block::new_zeroed();
                block.as_bytes_mut().copy_from_slice(src);
                self.cache.write(block_no as u64, &block)?;
            } else {
                self.cache.update(block_no as u64, |block| {
                    block.as_bytes_mut()[block_offset..(block_offset + chunk)].copy_from_slice(src)
                })?;
            }

            done += chunk;
            let end = (offset + chunk) as u32;
            guard.update(|rec| rec.length = rec.length.max(end));
        }

        Ok(done)
    }

    fn load_directory(&mut self) -> Result<()> {
        if self.total_inodes == 0 {
            return Ok(());
        }

        let root = Inode::load(DIRECTORY_INODE, self.total_inodes, &self.cache)?;
        let rec = root.record();
        let directory = if rec.length == 0 {
            Directory::new(self.total_inodes)
        } else {
            let mut bytes = vec![0_u8; rec.length as usize];
            let read = self.read_at(&rec, 0, &mut bytes)?;
            Directory::from_bytes(&bytes[..read], self.total_inodes).inspect_err(|_| {
                log::error!("FS corrupted: bad directory");
            })?
        };

        self.root = root;
        self.directory = Mutex::new(directory);
        Ok(())
    }

    /// Writes `directory` into inode 0. The caller holds the directory lock.
    fn flush_directory(&self, directory: &Directory) -> Result<()> {
        if self.total_inodes == 0 {
            return Ok(());
        }

        let bytes = directory.to_bytes();
        let mut guard = self.root.acquire_write();
        let written = self.write_at(&mut guard, 0, &bytes);
        if written.is_ok() {
            guard.update(|rec| rec.length = bytes.len() as u32);
        }
        let persisted = guard.persist(&self.cache);

        written?;
        persisted
    }
}
