//! In-memory inodes and their reader/writer/tombstone protocol.
//!
//! An inode is either unlocked, read by up to 255 readers, or written by
//! exactly one writer. The tombstone (DYING) bit is orthogonal: it stops
//! new opens and tells the last close to hand the inode to its deleter.
//!
//! New readers queue behind a waiting writer, so a steady stream of
//! readers cannot starve writers.

use std::sync::{Condvar, Mutex, MutexGuard};

use crate::block_cache::BlockCache;
use crate::layout::*;
use crate::{FsError, Result};

struct InodeState {
    // Only the DYING bit of rec.flags is kept here; the lock bits are
    // derived from the fields below when the record is persisted.
    rec: InodeRecord,
    readers: u8,
    writing: bool,
    writers_waiting: usize,
}

impl InodeState {
    fn disk_record(&self) -> InodeRecord {
        let mut rec = self.rec;
        rec.flags.set(InodeFlags::READING, self.readers > 0);
        rec.flags.set(InodeFlags::WRITING, self.writing);
        rec.reader_count = self.readers;
        rec
    }
}

pub struct Inode {
    inumber: InodeNo,
    state: Mutex<InodeState>,
    cond: Condvar,
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Inode")
            .field("inumber", &self.inumber)
            .field("rec", &self.lock().disk_record())
            .finish()
    }
}

impl Inode {
    fn with_record(inumber: InodeNo, rec: InodeRecord) -> Self {
        Self {
            inumber,
            state: Mutex::new(InodeState {
                rec,
                readers: 0,
                writing: false,
                writers_waiting: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// A fresh inode: empty, no blocks, no references.
    pub fn new(inumber: InodeNo) -> Self {
        Self::with_record(inumber, InodeRecord::invalidated())
    }

    /// Decodes inode `inumber` from the inode region.
    ///
    /// Lock bits and the reference count on disk belong to a previous
    /// session and are dropped; the tombstone is kept.
    pub fn load(inumber: InodeNo, total_inodes: u32, cache: &BlockCache) -> Result<Self> {
        if inumber as u32 >= total_inodes {
            return Err(FsError::InvalidArgument);
        }
        let (block_no, offset) = InodeRecord::location(inumber);
        let mut block = block_dev::Block::new_zeroed();
        cache.read(block_no, &mut block)?;

        let mut rec = InodeRecord::decode(&block, offset).inspect_err(|_| {
            log::error!("FS corrupted: bad inode record #{inumber}");
        })?;
        rec.flags &= InodeFlags::DYING;
        rec.reader_count = 0;
        rec.ref_count = 0;

        Ok(Self::with_record(inumber, rec))
    }

    /// Overwrites the on-disk record of `inumber` with an invalidated one.
    pub(crate) fn write_invalidated(
        inumber: InodeNo,
        total_inodes: u32,
        cache: &BlockCache,
    ) -> Result<()> {
        if inumber as u32 >= total_inodes {
            return Err(FsError::InvalidArgument);
        }
        let (block_no, offset) = InodeRecord::location(inumber);
        cache.update(block_no, |block| {
            InodeRecord::invalidated().encode(block, offset)
        })
    }

    /// Persists the record. Records sharing a block are updated under
    /// the cache lock, so concurrent encodes don't clobber each other.
    pub fn persist(&self, cache: &BlockCache) -> Result<()> {
        let (block_no, offset) = InodeRecord::location(self.inumber);
        let state = self.lock();
        let rec = state.disk_record();
        cache.update(block_no, |block| rec.encode(block, offset))
    }

    fn lock(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, InodeState>) -> MutexGuard<'a, InodeState> {
        self.cond.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    pub fn inumber(&self) -> InodeNo {
        self.inumber
    }

    /// A snapshot of the record as it would be persisted now.
    pub fn record(&self) -> InodeRecord {
        self.lock().disk_record()
    }

    pub fn length(&self) -> u32 {
        self.lock().rec.length
    }

    pub fn ref_count(&self) -> u16 {
        self.lock().rec.ref_count
    }

    pub(crate) fn inc_ref(&self) -> u16 {
        let mut state = self.lock();
        state.rec.ref_count = state.rec.ref_count.saturating_add(1);
        state.rec.ref_count
    }

    pub(crate) fn dec_ref(&self) -> u16 {
        let mut state = self.lock();
        debug_assert!(state.rec.ref_count > 0);
        state.rec.ref_count = state.rec.ref_count.saturating_sub(1);
        state.rec.ref_count
    }

    pub fn mark_for_death(&self) {
        self.lock().rec.flags.insert(InodeFlags::DYING);
    }

    pub fn is_dying(&self) -> bool {
        self.lock().rec.flags.contains(InodeFlags::DYING)
    }

    #[cfg(test)]
    pub fn is_reading(&self) -> bool {
        self.lock().readers > 0
    }

    #[cfg(test)]
    pub fn is_writing(&self) -> bool {
        self.lock().writing
    }

    /// Waits until no writer holds the inode, then returns its length.
    pub fn wait_until_accessible(&self) -> u32 {
        let mut state = self.lock();
        while state.writing {
            state = self.wait(state);
        }
        state.rec.length
    }

    /// Blocks while the inode is written (or a writer is queued), then
    /// joins the readers.
    pub fn acquire_read(&self) -> InodeReadGuard<'_> {
        let mut state = self.lock();
        while state.writing || state.writers_waiting > 0 || state.readers == u8::MAX {
            state = self.wait(state);
        }
        state.readers += 1;
        drop(state);
        // Other readers may be waiting on the reader cap.
        self.cond.notify_all();

        InodeReadGuard { inode: self }
    }

    fn release_read(&self) {
        let mut state = self.lock();
        debug_assert!(state.readers > 0);
        state.readers -= 1;
        drop(state);
        self.cond.notify_all();
    }

    /// Blocks while the inode is read or written, then takes it exclusively.
    pub fn acquire_write(&self) -> InodeWriteGuard<'_> {
        let mut state = self.lock();
        state.writers_waiting += 1;
        while state.writing || state.readers > 0 {
            state = self.wait(state);
        }
        state.writers_waiting -= 1;
        state.writing = true;

        InodeWriteGuard { inode: self }
    }

    /// Takes the inode exclusively if nobody holds it.
    #[cfg(test)]
    pub fn try_acquire_write(&self) -> Option<InodeWriteGuard<'_>> {
        let mut state = self.lock();
        if state.writing || state.readers > 0 {
            return None;
        }
        state.writing = true;
        Some(InodeWriteGuard { inode: self })
    }

    fn release_write(&self) {
        let mut state = self.lock();
        debug_assert!(state.writing);
        state.writing = false;
        drop(state);
        self.cond.notify_all();
    }
}

/// Shared access to an inode; released on drop.
pub struct InodeReadGuard<'a> {
    inode: &'a Inode,
}

impl InodeReadGuard<'_> {
    pub fn record(&self) -> InodeRecord {
        self.inode.record()
    }
}

impl Drop for InodeReadGuard<'_> {
    fn drop(&mut self) {
        self.inode.release_read();
    }
}

/// Exclusive access to an inode; released on drop.
pub struct InodeWriteGuard<'a> {
    inode: &'a Inode,
}

impl InodeWriteGuard<'_> {
    pub fn record(&self) -> InodeRecord {
        self.inode.record()
    }

    /// Mutates the block map and length. Reference count and flags
    /// are owned by the open-file table and the deleter.
    pub fn update<R>(&mut self, f: impl FnOnce(&mut InodeRecord) -> R) -> R {
        let mut state = self.inode.lock();
        let mut rec = state.rec;
        let result = f(&mut rec);
        state.rec.length = rec.length;
        state.rec.direct = rec.direct;
        state.rec.indirect = rec.indirect;
        result
    }

    pub fn persist(&self, cache: &BlockCache) -> Result<()> {
        self.inode.persist(cache)
    }
}

impl Drop for InodeWriteGuard<'_> {
    fn drop(&mut self) {
        self.inode.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn concurrent_readers_block_writer() {
        const READERS: usize = 8;
        let inode = Inode::new(3);
        let all_reading = Barrier::new(READERS + 1);
        let release = Barrier::new(READERS + 1);
        let (tx, rx) = mpsc::channel();

        std::thread::scope(|s| {
            for _ in 0..READERS {
                s.spawn(|| {
                    let _guard = inode.acquire_read();
                    // Every reader gets here while the others hold the lock.
                    all_reading.wait();
                    release.wait();
                });
            }

            all_reading.wait();
            assert!(inode.is_reading());
            assert_eq!(READERS as u8, inode.record().reader_count);

            let tx = tx.clone();
            let inode = &inode;
            s.spawn(move || {
                let _guard = inode.acquire_write();
                tx.send(()).unwrap();
            });

            assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
            assert!(!inode.is_writing());

            release.wait();
            rx.recv_timeout(Duration::from_secs(10)).unwrap();
        });

        assert!(!inode.is_reading());
        assert!(!inode.is_writing());
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        let inode = Inode::new(4);
        let first = inode.acquire_read();
        let (tx, rx) = mpsc::channel();

        std::thread::scope(|s| {
            let inode = &inode;
            let writer_tx = tx.clone();
            s.spawn(move || {
                let mut guard = inode.acquire_write();
                guard.update(|rec| rec.length = 7);
                writer_tx.send(("writer", 7)).unwrap();
            });

            while inode.lock().writers_waiting == 0 {
                std::thread::yield_now();
            }

            let reader_tx = tx.clone();
            s.spawn(move || {
                let guard = inode.acquire_read();
                reader_tx.send(("reader", guard.record().length)).unwrap();
            });

            // Neither gets in while the first reader holds the inode.
            assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
            drop(first);

            let timeout = Duration::from_secs(10);
            assert_eq!(("writer", 7), rx.recv_timeout(timeout).unwrap());
            assert_eq!(("reader", 7), rx.recv_timeout(timeout).unwrap());
        });
    }

    #[test]
    fn reader_count_is_capped() {
        let inode = Inode::new(5);
        let mut guards: Vec<_> = (0..u8::MAX).map(|_| inode.acquire_read()).collect();
        assert_eq!(u8::MAX, inode.record().reader_count);
        let (tx, rx) = mpsc::channel();

        std::thread::scope(|s| {
            let inode = &inode;
            s.spawn(move || {
                let _guard = inode.acquire_read();
                tx.send(inode.record().reader_count).unwrap();
            });

            assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
            guards.pop();
            assert_eq!(u8::MAX, rx.recv_timeout(Duration::from_secs(10)).unwrap());
        });

        drop(guards);
        assert!(!inode.is_reading());
    }

    #[test]
    fn writers_exclude_each_other() {
        let inode = Inode::new(1);
        let counter = Mutex::new(0_u32);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        let mut guard = inode.acquire_write();
                        let len = guard.record().length;
                        std::thread::yield_now();
                        guard.update(|rec| rec.length = len + 1);
                        *counter.lock().unwrap() += 1;
                    }
                });
            }
        });

        assert_eq!(400, inode.length());
        assert_eq!(400, *counter.lock().unwrap());
    }

    #[test]
    fn guards_release_on_drop() {
        let inode = Inode::new(2);
        {
            let _r1 = inode.acquire_read();
            let _r2 = inode.acquire_read();
            assert!(inode.try_acquire_write().is_none());
        }
        {
            let _w = inode.try_acquire_write().unwrap();
            assert!(inode.record().flags.contains(InodeFlags::WRITING));
            assert!(inode.try_acquire_write().is_none());
        }
        assert_eq!(InodeFlags::empty(), inode.record().flags);
        assert_eq!(0, inode.wait_until_accessible());
    }

    #[test]
    fn tombstone_is_orthogonal() {
        let inode = Inode::new(2);
        inode.mark_for_death();
        let _r = inode.acquire_read();
        assert!(inode.is_dying());
        assert_eq!(
            InodeFlags::DYING | InodeFlags::READING,
            inode.record().flags
        );
    }
}
