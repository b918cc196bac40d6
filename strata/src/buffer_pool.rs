//! The buffer pool: a fixed set of in-memory frames caching disk pages,
//! with pinning, an LRU replacer over unpinned frames, and write-ahead
//! discipline on every dirty flush.
//!
//! Callers receive an RAII [`PageGuard`]: fetching pins the page, the
//! guard's `read`/`write` expose the page bytes, and dropping the guard
//! unpins it. One mutex guards the bookkeeping (page table, free list,
//! replacer, pin counts) and is held only during bookkeeping; page
//! reads, victim writebacks and log flushes all run with it released.
//! Do not call back into the pool while holding a page lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use crate::disk::DiskManager;
use crate::errors::{StorageError, StorageResult};
use crate::page::Page;
use crate::replacer::{FrameId, LruReplacer};
use crate::wal::LogManager;
use crate::{FileId, PageId};

pub const BUFFER_POOL_SIZE: usize = 256;

struct Frame {
    page: RwLock<Page>,
    is_dirty: Mutex<bool>,
}

struct FrameMeta {
    page_id: Option<PageId>,
    pin_count: u32,
}

struct PoolInner {
    page_table: HashMap<PageId, FrameId>,
    free_list: Vec<FrameId>,
    replacer: LruReplacer,
    meta: Vec<FrameMeta>,
}

/// An RAII guard for a pinned page.
pub struct PageGuard<'a> {
    bpm: &'a BufferPoolManager,
    page_id: PageId,
    frame_id: FrameId,
    frame: Arc<Frame>,
}

pub struct BufferPoolManager {
    disk: Arc<DiskManager>,
    log: Arc<LogManager>,
    frames: Vec<Arc<Frame>>,
    inner: Mutex<PoolInner>,
}

impl<'a> PageGuard<'a> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> std::sync::RwLockReadGuard<'_, Page> {
        self.frame.page.read().unwrap()
    }

    pub fn write(&self) -> std::sync::RwLockWriteGuard<'_, Page> {
        *self.frame.is_dirty.lock().unwrap() = true;
        self.frame.page.write().unwrap()
    }
}

impl<'a> Drop for PageGuard<'a> {
    fn drop(&mut self) {
        self.bpm.unpin(self.frame_id);
    }
}

impl BufferPoolManager {
    pub fn new(disk: Arc<DiskManager>, log: Arc<LogManager>) -> Self {
        Self::with_capacity(disk, log, BUFFER_POOL_SIZE)
    }

    pub fn with_capacity(disk: Arc<DiskManager>, log: Arc<LogManager>, capacity: usize) -> Self {
        let mut frames = Vec::with_capacity(capacity);
        let mut free_list = Vec::with_capacity(capacity);
        let mut meta = Vec::with_capacity(capacity);
        for i in 0..capacity {
            frames.push(Arc::new(Frame {
                page: RwLock::new(Page::default()),
                is_dirty: Mutex::new(false),
            }));
            free_list.push(capacity - 1 - i);
            meta.push(FrameMeta {
                page_id: None,
                pin_count: 0,
            });
        }
        BufferPoolManager {
            disk,
            log,
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::new(),
                free_list,
                replacer: LruReplacer::new(capacity),
                meta,
            }),
        }
    }

    /// Pins and returns the page, reading it from disk if absent. The
    /// read happens into a private frame with no pool lock held; a
    /// concurrent load of the same page is resolved at publish time.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageGuard<'_>> {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(&frame_id) = inner.page_table.get(&page_id) {
                Self::pin_locked(&mut inner, frame_id);
                return Ok(self.guard(page_id, frame_id));
            }
        }

        let frame_id = self.take_frame()?;
        {
            // The frame is unmapped, so nobody else can reach it.
            let frame = &self.frames[frame_id];
            *frame.is_dirty.lock().unwrap() = false;
            let mut page = frame.page.write().unwrap();
            *page = Page::new(page_id);
            if let Err(e) = self
                .disk
                .read_page(page_id.fid, page_id.page_no, &mut page.data)
            {
                drop(page);
                let mut inner = self.inner.lock().unwrap();
                inner.meta[frame_id] = FrameMeta {
                    page_id: None,
                    pin_count: 0,
                };
                inner.free_list.push(frame_id);
                return Err(e);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(&existing) = inner.page_table.get(&page_id) {
            // Another thread loaded the same page while we read it;
            // its frame is authoritative, ours goes back unused.
            inner.meta[frame_id] = FrameMeta {
                page_id: None,
                pin_count: 0,
            };
            inner.free_list.push(frame_id);
            Self::pin_locked(&mut inner, existing);
            return Ok(self.guard(page_id, existing));
        }
        inner.page_table.insert(page_id, frame_id);
        inner.meta[frame_id] = FrameMeta {
            page_id: Some(page_id),
            pin_count: 1,
        };
        Ok(self.guard(page_id, frame_id))
    }

    /// Allocates a fresh page in `fid`, pins it zero-filled and dirty.
    pub fn new_page(&self, fid: FileId) -> StorageResult<PageGuard<'_>> {
        let page_no = self.disk.allocate_page(fid)?;
        let page_id = PageId { fid, page_no };

        let frame_id = self.take_frame()?;
        {
            let frame = &self.frames[frame_id];
            *frame.is_dirty.lock().unwrap() = true;
            *frame.page.write().unwrap() = Page::new(page_id);
        }

        let mut inner = self.inner.lock().unwrap();
        inner.page_table.insert(page_id, frame_id);
        inner.meta[frame_id] = FrameMeta {
            page_id: Some(page_id),
            pin_count: 1,
        };
        debug!("new page {:?} in frame {}", page_id, frame_id);
        Ok(self.guard(page_id, frame_id))
    }

    /// Write-through of one resident page; clears its dirty bit. The
    /// log is flushed up to the page LSN first (WAL).
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<()> {
        let frame = {
            let inner = self.inner.lock().unwrap();
            match inner.page_table.get(&page_id) {
                Some(&frame_id) => self.frames[frame_id].clone(),
                None => return Ok(()),
            }
        };
        self.flush_frame(&frame)
    }

    /// Writes every dirty resident page. The resident set is snapshot
    /// under the bookkeeping mutex; the writes run without it.
    pub fn flush_all_pages(&self) -> StorageResult<()> {
        let frames: Vec<Arc<Frame>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .page_table
                .values()
                .map(|&frame_id| self.frames[frame_id].clone())
                .collect()
        };
        for frame in frames {
            self.flush_frame(&frame)?;
        }
        Ok(())
    }

    /// Drops a resident page without writing it. Fails while pinned.
    pub fn delete_page(&self, page_id: PageId) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            if inner.meta[frame_id].pin_count > 0 {
                return Err(StorageError::PagePinned(page_id.page_no));
            }
            inner.page_table.remove(&page_id);
            inner.replacer.pin(frame_id);
            inner.meta[frame_id] = FrameMeta {
                page_id: None,
                pin_count: 0,
            };
            *self.frames[frame_id].is_dirty.lock().unwrap() = false;
            inner.free_list.push(frame_id);
        }
        Ok(())
    }

    /// Drops every resident page of a file without writing; used when
    /// the file itself is being destroyed.
    pub fn discard_file_pages(&self, fid: FileId) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let victims: Vec<(PageId, FrameId)> = inner
            .page_table
            .iter()
            .filter(|(id, _)| id.fid == fid)
            .map(|(id, &frame_id)| (*id, frame_id))
            .collect();
        for (page_id, frame_id) in victims {
            if inner.meta[frame_id].pin_count > 0 {
                return Err(StorageError::PagePinned(page_id.page_no));
            }
            inner.page_table.remove(&page_id);
            inner.replacer.pin(frame_id);
            inner.meta[frame_id] = FrameMeta {
                page_id: None,
                pin_count: 0,
            };
            *self.frames[frame_id].is_dirty.lock().unwrap() = false;
            inner.free_list.push(frame_id);
        }
        Ok(())
    }

    fn guard(&self, page_id: PageId, frame_id: FrameId) -> PageGuard<'_> {
        PageGuard {
            bpm: self,
            page_id,
            frame_id,
            frame: self.frames[frame_id].clone(),
        }
    }

    fn pin_locked(inner: &mut PoolInner, frame_id: FrameId) {
        inner.meta[frame_id].pin_count += 1;
        if inner.meta[frame_id].pin_count == 1 {
            inner.replacer.pin(frame_id);
        }
    }

    fn unpin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock().unwrap();
        let meta = &mut inner.meta[frame_id];
        debug_assert!(meta.pin_count > 0);
        meta.pin_count = meta.pin_count.saturating_sub(1);
        if meta.pin_count == 0 {
            inner.replacer.unpin(frame_id);
        }
    }

    /// Claims a clean, unmapped frame: from the free list, or by
    /// evicting the LRU unpinned page. A victim stays mapped (so
    /// readers keep hitting the resident copy, never stale disk
    /// bytes) while any dirty image is written back with the
    /// bookkeeping mutex released, and is re-checked afterwards; if
    /// it was pinned or re-dirtied in the meantime another victim is
    /// chosen.
    fn take_frame(&self) -> StorageResult<FrameId> {
        loop {
            let (frame_id, old_id) = {
                let mut inner = self.inner.lock().unwrap();
                if let Some(frame_id) = inner.free_list.pop() {
                    return Ok(frame_id);
                }
                let frame_id = inner
                    .replacer
                    .victim()
                    .ok_or(StorageError::PoolExhausted)?;
                let Some(old_id) = inner.meta[frame_id].page_id else {
                    return Ok(frame_id);
                };
                (frame_id, old_id)
            };

            // `victim` removed the frame from the replacer, so no
            // other eviction can race for it; pins still can, hence
            // the re-check below.
            let frame = self.frames[frame_id].clone();
            let flush_result = self.flush_frame(&frame);

            let mut inner = self.inner.lock().unwrap();
            if let Err(e) = flush_result {
                // Leave the page resident and evictable again.
                if inner.meta[frame_id].pin_count == 0 {
                    inner.replacer.unpin(frame_id);
                }
                return Err(e);
            }
            let reusable = inner.meta[frame_id].pin_count == 0
                && inner.meta[frame_id].page_id == Some(old_id)
                && !*frame.is_dirty.lock().unwrap();
            if reusable {
                inner.page_table.remove(&old_id);
                inner.replacer.pin(frame_id);
                inner.meta[frame_id] = FrameMeta {
                    page_id: None,
                    pin_count: 0,
                };
                debug!("evicted {:?} from frame {}", old_id, frame_id);
                return Ok(frame_id);
            }
            // Pinned or re-dirtied while flushing: pick another victim.
        }
    }

    /// Flushes one frame's occupant if dirty, log first (WAL). The
    /// page lock is held across the write so the image is stable.
    fn flush_frame(&self, frame: &Frame) -> StorageResult<()> {
        let mut dirty = frame.is_dirty.lock().unwrap();
        if *dirty {
            let page = frame.page.read().unwrap();
            self.log.flush_to_lsn(page.lsn())?;
            self.disk.write_page(page.id.fid, page.id.page_no, &page.data)?;
            *dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;
    use std::thread;
    use tempfile::tempdir;

    fn setup(capacity: usize) -> (tempfile::TempDir, Arc<DiskManager>, BufferPoolManager, FileId) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new());
        disk.set_log_file(&dir.path().join("db.log")).unwrap();
        let path = dir.path().join("t.tbl");
        disk.create_file(&path).unwrap();
        let fid = disk.open_file(&path).unwrap();
        let log = Arc::new(LogManager::new(disk.clone()));
        let bpm = BufferPoolManager::with_capacity(disk.clone(), log, capacity);
        (dir, disk, bpm, fid)
    }

    #[test]
    fn new_page_is_pinned_and_survives_flush() {
        let (_dir, disk, bpm, fid) = setup(4);
        let page_id = {
            let guard = bpm.new_page(fid).unwrap();
            guard.write().write_i32(64, 1234);
            guard.page_id()
        };
        bpm.flush_page(page_id).unwrap();

        let mut raw = vec![0u8; PAGE_SIZE];
        disk.read_page(fid, page_id.page_no, &mut raw).unwrap();
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&raw[64..68]);
        assert_eq!(i32::from_ne_bytes(buf), 1234);
    }

    #[test]
    fn eviction_writes_dirty_pages_back() {
        let (_dir, _disk, bpm, fid) = setup(2);
        let first = {
            let guard = bpm.new_page(fid).unwrap();
            guard.write().write_i32(8, 7);
            guard.page_id()
        };
        // Fill the pool so `first` must be evicted.
        for _ in 0..3 {
            let _ = bpm.new_page(fid).unwrap();
        }
        let guard = bpm.fetch_page(first).unwrap();
        assert_eq!(guard.read().read_i32(8), 7);
    }

    #[test]
    fn all_pinned_pool_is_exhausted() {
        let (_dir, _disk, bpm, fid) = setup(2);
        let _g1 = bpm.new_page(fid).unwrap();
        let _g2 = bpm.new_page(fid).unwrap();
        assert!(matches!(
            bpm.new_page(fid),
            Err(StorageError::PoolExhausted)
        ));
    }

    #[test]
    fn delete_page_fails_while_pinned() {
        let (_dir, _disk, bpm, fid) = setup(2);
        let guard = bpm.new_page(fid).unwrap();
        let page_id = guard.page_id();
        assert!(matches!(
            bpm.delete_page(page_id),
            Err(StorageError::PagePinned(_))
        ));
        drop(guard);
        bpm.delete_page(page_id).unwrap();
        // The frame is reusable afterwards.
        let _ = bpm.new_page(fid).unwrap();
    }

    #[test]
    fn concurrent_fetches_of_one_page_share_a_coherent_image() {
        let (_dir, _disk, bpm, fid) = setup(8);
        let page_id = {
            let guard = bpm.new_page(fid).unwrap();
            guard.write().write_i32(16, 77);
            guard.page_id()
        };
        bpm.flush_page(page_id).unwrap();
        bpm.delete_page(page_id).unwrap();

        // Racing loads of the same page resolve to one frame at
        // publish time; every reader sees the flushed image.
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let guard = bpm.fetch_page(page_id).unwrap();
                        assert_eq!(guard.read().read_i32(16), 77);
                    }
                });
            }
        });
    }
}
