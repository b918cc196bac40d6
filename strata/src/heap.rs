//! The slotted record heap. A table file stores fixed-width records:
//! page 0 holds the file header, every later page is a data page laid
//! out as `page_lsn (4) | next_free_page_no (4) | num_records (4) |
//! free-bitmap | fixed-size slots`. Pages with spare slots form an
//! intrusive free list anchored at the file header.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::buffer_pool::BufferPoolManager;
use crate::disk::DiskManager;
use crate::errors::{StorageError, StorageResult};
use crate::wal::Lsn;
use crate::{FileId, PageId, PageNo, Rid, NO_PAGE, PAGE_SIZE};

/// Page 0 of every table file is the header page.
pub const FILE_HDR_PAGE: PageNo = 0;
/// Data pages start at page 1.
pub const FIRST_RECORD_PAGE: PageNo = 1;

const OFF_NEXT_FREE: usize = 4;
const OFF_NUM_RECORDS: usize = 8;
const OFF_BITMAP: usize = 12;
const DATA_PAGE_HDR_SIZE: usize = OFF_BITMAP;

#[derive(Debug, Clone, Copy)]
pub struct TableFileHdr {
    pub record_size: i32,
    pub records_per_page: i32,
    pub bitmap_size: i32,
    pub num_pages: i32,
    pub first_free_page_no: PageNo,
}

impl TableFileHdr {
    fn encode(&self, buf: &mut [u8]) {
        for (i, v) in [
            self.record_size,
            self.records_per_page,
            self.bitmap_size,
            self.num_pages,
            self.first_free_page_no,
        ]
        .iter()
        .enumerate()
        {
            buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
        }
    }

    fn decode(buf: &[u8]) -> Self {
        let field = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[i * 4..i * 4 + 4]);
            i32::from_ne_bytes(b)
        };
        TableFileHdr {
            record_size: field(0),
            records_per_page: field(1),
            bitmap_size: field(2),
            num_pages: field(3),
            first_free_page_no: field(4),
        }
    }
}

mod bitmap {
    pub fn is_set(bits: &[u8], i: usize) -> bool {
        bits[i / 8] & (1 << (i % 8)) != 0
    }

    pub fn set(bits: &mut [u8], i: usize) {
        bits[i / 8] |= 1 << (i % 8);
    }

    pub fn clear(bits: &mut [u8], i: usize) {
        bits[i / 8] &= !(1 << (i % 8));
    }

    pub fn first_clear(bits: &[u8], n: usize) -> Option<usize> {
        (0..n).find(|&i| !is_set(bits, i))
    }

    /// First set bit strictly after `after` (pass -1 to start from 0).
    pub fn next_set(bits: &[u8], n: usize, after: i32) -> Option<usize> {
        let start = (after + 1).max(0) as usize;
        (start..n).find(|&i| is_set(bits, i))
    }
}

/// A handle to one table's record file.
pub struct TableFile {
    fid: FileId,
    path: PathBuf,
    disk: Arc<DiskManager>,
    bpm: Arc<BufferPoolManager>,
    hdr: Mutex<TableFileHdr>,
}

impl TableFile {
    /// Creates the file on disk with a header sized for `record_size`.
    pub fn create(disk: &DiskManager, path: &Path, record_size: usize) -> StorageResult<()> {
        if record_size == 0 || record_size > PAGE_SIZE - DATA_PAGE_HDR_SIZE - 1 {
            return Err(StorageError::Internal(format!(
                "record size {} does not fit a page",
                record_size
            )));
        }
        // One bitmap bit plus `record_size` bytes per record.
        let records_per_page = ((PAGE_SIZE - DATA_PAGE_HDR_SIZE) * 8) / (1 + record_size * 8);
        let records_per_page = records_per_page.max(1);
        let bitmap_size = (records_per_page + 7) / 8;

        disk.create_file(path)?;
        let fid = disk.open_file(path)?;
        let hdr = TableFileHdr {
            record_size: record_size as i32,
            records_per_page: records_per_page as i32,
            bitmap_size: bitmap_size as i32,
            num_pages: 1,
            first_free_page_no: NO_PAGE,
        };
        let mut page = [0u8; PAGE_SIZE];
        hdr.encode(&mut page);
        disk.write_page(fid, FILE_HDR_PAGE, &page)?;
        disk.close_file(fid)?;
        Ok(())
    }

    pub fn open(
        disk: Arc<DiskManager>,
        bpm: Arc<BufferPoolManager>,
        path: &Path,
    ) -> StorageResult<TableFile> {
        let fid = disk.open_file(path)?;
        let mut page = [0u8; PAGE_SIZE];
        disk.read_page(fid, FILE_HDR_PAGE, &mut page)?;
        let mut hdr = TableFileHdr::decode(&page);
        // The header is only written back at close; after a crash the
        // file may carry flushed data pages the header has not heard
        // about yet.
        let pages_on_disk = (std::fs::metadata(path)?.len() / PAGE_SIZE as u64) as PageNo;
        hdr.num_pages = hdr.num_pages.max(pages_on_disk);
        disk.set_next_page_no(fid, hdr.num_pages)?;
        debug!(
            "opened table file {} (fid {}, {} pages)",
            path.display(),
            fid,
            hdr.num_pages
        );
        Ok(TableFile {
            fid,
            path: path.to_path_buf(),
            disk,
            bpm,
            hdr: Mutex::new(hdr),
        })
    }

    /// Persists the header page and closes the underlying file. Data
    /// pages are expected to have been flushed by the buffer pool.
    pub fn close(&self) -> StorageResult<()> {
        self.write_hdr()?;
        self.disk.close_file(self.fid)
    }

    pub fn write_hdr(&self) -> StorageResult<()> {
        let hdr = self.hdr.lock().unwrap();
        let mut page = [0u8; PAGE_SIZE];
        hdr.encode(&mut page);
        self.disk.write_page(self.fid, FILE_HDR_PAGE, &page)
    }

    pub fn fid(&self) -> FileId {
        self.fid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_size(&self) -> usize {
        self.hdr.lock().unwrap().record_size as usize
    }

    pub fn records_per_page(&self) -> usize {
        self.hdr.lock().unwrap().records_per_page as usize
    }

    pub fn num_pages(&self) -> PageNo {
        self.hdr.lock().unwrap().num_pages
    }

    /// True when no data page has ever been allocated.
    pub fn is_empty_file(&self) -> bool {
        self.hdr.lock().unwrap().num_pages == FIRST_RECORD_PAGE
    }

    fn check_page_no(&self, hdr: &TableFileHdr, page_no: PageNo) -> StorageResult<()> {
        if page_no < FIRST_RECORD_PAGE || page_no >= hdr.num_pages {
            return Err(StorageError::PageNotExist {
                fid: self.fid,
                page_no,
            });
        }
        Ok(())
    }

    pub fn get_record(&self, rid: Rid) -> StorageResult<Vec<u8>> {
        let hdr = *self.hdr.lock().unwrap();
        self.check_page_no(&hdr, rid.page_no)?;
        let guard = self.bpm.fetch_page(PageId {
            fid: self.fid,
            page_no: rid.page_no,
        })?;
        let page = guard.read();
        let bits = page.bytes(OFF_BITMAP, hdr.bitmap_size as usize);
        if rid.slot_no < 0
            || rid.slot_no >= hdr.records_per_page
            || !bitmap::is_set(bits, rid.slot_no as usize)
        {
            return Err(StorageError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }
        let offset = Self::slot_offset(&hdr, rid.slot_no);
        Ok(page.bytes(offset, hdr.record_size as usize).to_vec())
    }

    /// Inserts into the first free page (or a fresh one) and returns
    /// the record's rid.
    pub fn insert_record(&self, buf: &[u8]) -> StorageResult<Rid> {
        let mut hdr = self.hdr.lock().unwrap();
        debug_assert_eq!(buf.len(), hdr.record_size as usize);

        loop {
            let page_no = if hdr.first_free_page_no != NO_PAGE {
                hdr.first_free_page_no
            } else {
                self.create_data_page(&mut hdr)?
            };

            let guard = self.bpm.fetch_page(PageId {
                fid: self.fid,
                page_no,
            })?;
            let mut page = guard.write();
            let slot_no = {
                let bits = page.bytes(OFF_BITMAP, hdr.bitmap_size as usize);
                bitmap::first_clear(bits, hdr.records_per_page as usize)
            };
            let Some(slot_no) = slot_no else {
                // Stale free-list head (out-of-order undo can leave a
                // full page linked): detach it and retry.
                hdr.first_free_page_no = page.read_i32(OFF_NEXT_FREE);
                continue;
            };
            bitmap::set(
                page.bytes_mut(OFF_BITMAP, hdr.bitmap_size as usize),
                slot_no,
            );
            let offset = Self::slot_offset(&hdr, slot_no as i32);
            page.bytes_mut(offset, hdr.record_size as usize)
                .copy_from_slice(buf);

            let num_records = page.read_i32(OFF_NUM_RECORDS) + 1;
            page.write_i32(OFF_NUM_RECORDS, num_records);
            if num_records == hdr.records_per_page {
                hdr.first_free_page_no = page.read_i32(OFF_NEXT_FREE);
            }
            return Ok(Rid {
                page_no,
                slot_no: slot_no as i32,
            });
        }
    }

    /// Force-inserts at a specific rid; used by undo and redo. Grows
    /// the file while `num_pages <= rid.page_no`.
    pub fn insert_record_at(&self, rid: Rid, buf: &[u8]) -> StorageResult<()> {
        let mut hdr = self.hdr.lock().unwrap();
        while hdr.num_pages <= rid.page_no {
            self.create_data_page(&mut hdr)?;
        }

        let guard = self.bpm.fetch_page(PageId {
            fid: self.fid,
            page_no: rid.page_no,
        })?;
        let mut page = guard.write();
        let already_live = {
            let bits = page.bytes(OFF_BITMAP, hdr.bitmap_size as usize);
            bitmap::is_set(bits, rid.slot_no as usize)
        };
        if !already_live {
            bitmap::set(
                page.bytes_mut(OFF_BITMAP, hdr.bitmap_size as usize),
                rid.slot_no as usize,
            );
            let num_records = page.read_i32(OFF_NUM_RECORDS) + 1;
            page.write_i32(OFF_NUM_RECORDS, num_records);
            if num_records == hdr.records_per_page {
                hdr.first_free_page_no = page.read_i32(OFF_NEXT_FREE);
            }
        }
        let offset = Self::slot_offset(&hdr, rid.slot_no);
        page.bytes_mut(offset, hdr.record_size as usize)
            .copy_from_slice(buf);
        Ok(())
    }

    pub fn delete_record(&self, rid: Rid) -> StorageResult<()> {
        let mut hdr = self.hdr.lock().unwrap();
        self.check_page_no(&hdr, rid.page_no)?;
        let guard = self.bpm.fetch_page(PageId {
            fid: self.fid,
            page_no: rid.page_no,
        })?;
        let mut page = guard.write();
        {
            let bits = page.bytes(OFF_BITMAP, hdr.bitmap_size as usize);
            if !bitmap::is_set(bits, rid.slot_no as usize) {
                return Err(StorageError::RecordNotFound {
                    page_no: rid.page_no,
                    slot_no: rid.slot_no,
                });
            }
        }
        let num_records = page.read_i32(OFF_NUM_RECORDS);
        // A full page becomes insertable again: put it back on the list.
        if num_records == hdr.records_per_page {
            page.write_i32(OFF_NEXT_FREE, hdr.first_free_page_no);
            hdr.first_free_page_no = rid.page_no;
        }
        bitmap::clear(
            page.bytes_mut(OFF_BITMAP, hdr.bitmap_size as usize),
            rid.slot_no as usize,
        );
        page.write_i32(OFF_NUM_RECORDS, num_records - 1);
        Ok(())
    }

    pub fn update_record(&self, rid: Rid, buf: &[u8]) -> StorageResult<()> {
        let hdr = *self.hdr.lock().unwrap();
        self.check_page_no(&hdr, rid.page_no)?;
        let guard = self.bpm.fetch_page(PageId {
            fid: self.fid,
            page_no: rid.page_no,
        })?;
        let mut page = guard.write();
        {
            let bits = page.bytes(OFF_BITMAP, hdr.bitmap_size as usize);
            if !bitmap::is_set(bits, rid.slot_no as usize) {
                return Err(StorageError::RecordNotFound {
                    page_no: rid.page_no,
                    slot_no: rid.slot_no,
                });
            }
        }
        let offset = Self::slot_offset(&hdr, rid.slot_no);
        page.bytes_mut(offset, hdr.record_size as usize)
            .copy_from_slice(buf);
        Ok(())
    }

    pub fn page_lsn(&self, page_no: PageNo) -> StorageResult<Lsn> {
        let guard = self.bpm.fetch_page(PageId {
            fid: self.fid,
            page_no,
        })?;
        let lsn = guard.read().lsn();
        Ok(lsn)
    }

    /// Raises the page LSN to `lsn` (never lowers it).
    pub fn set_page_lsn(&self, page_no: PageNo, lsn: Lsn) -> StorageResult<()> {
        let guard = self.bpm.fetch_page(PageId {
            fid: self.fid,
            page_no,
        })?;
        let mut page = guard.write();
        if page.lsn() < lsn {
            page.set_lsn(lsn);
        }
        Ok(())
    }

    fn slot_offset(hdr: &TableFileHdr, slot_no: i32) -> usize {
        OFF_BITMAP + hdr.bitmap_size as usize + slot_no as usize * hdr.record_size as usize
    }

    /// Allocates and initializes a new data page at the head of the
    /// free list.
    fn create_data_page(&self, hdr: &mut TableFileHdr) -> StorageResult<PageNo> {
        let guard = self.bpm.new_page(self.fid)?;
        let page_no = guard.page_id().page_no;
        let mut page = guard.write();
        page.write_i32(OFF_NEXT_FREE, hdr.first_free_page_no);
        page.write_i32(OFF_NUM_RECORDS, 0);
        hdr.num_pages += 1;
        hdr.first_free_page_no = page_no;
        Ok(page_no)
    }

    /// First live slot strictly after `(page_no, after_slot)` on the
    /// given page.
    fn next_live_slot(&self, page_no: PageNo, after_slot: i32) -> StorageResult<Option<i32>> {
        let hdr = *self.hdr.lock().unwrap();
        let guard = self.bpm.fetch_page(PageId {
            fid: self.fid,
            page_no,
        })?;
        let page = guard.read();
        let bits = page.bytes(OFF_BITMAP, hdr.bitmap_size as usize);
        Ok(bitmap::next_set(bits, hdr.records_per_page as usize, after_slot).map(|s| s as i32))
    }

    /// Appends pre-encoded records to an empty table, page by page,
    /// bypassing the buffer pool and the log. `on_row` sees each rid in
    /// insertion order (used to maintain the clustered index).
    pub fn bulk_append(
        &self,
        rows: &mut dyn Iterator<Item = Vec<u8>>,
        on_row: &mut dyn FnMut(Rid, &[u8]) -> StorageResult<()>,
    ) -> StorageResult<usize> {
        let mut hdr = self.hdr.lock().unwrap();
        if hdr.num_pages != FIRST_RECORD_PAGE {
            return Err(StorageError::Internal(
                "bulk load requires an empty table".into(),
            ));
        }
        let records_per_page = hdr.records_per_page as usize;
        let bitmap_size = hdr.bitmap_size as usize;
        let record_size = hdr.record_size as usize;

        let mut page = [0u8; PAGE_SIZE];
        let init_page = |page: &mut [u8; PAGE_SIZE]| {
            page.fill(0);
            page[OFF_NEXT_FREE..OFF_NEXT_FREE + 4].copy_from_slice(&NO_PAGE.to_ne_bytes());
        };
        init_page(&mut page);

        let mut page_no: PageNo = FIRST_RECORD_PAGE;
        let mut slot = 0usize;
        let mut total = 0usize;
        for row in rows {
            debug_assert_eq!(row.len(), record_size);
            let rid = Rid {
                page_no,
                slot_no: slot as i32,
            };
            bitmap::set(&mut page[OFF_BITMAP..OFF_BITMAP + bitmap_size], slot);
            let offset = OFF_BITMAP + bitmap_size + slot * record_size;
            page[offset..offset + record_size].copy_from_slice(&row);
            on_row(rid, &row)?;
            slot += 1;
            total += 1;
            if slot == records_per_page {
                page[OFF_NUM_RECORDS..OFF_NUM_RECORDS + 4]
                    .copy_from_slice(&(records_per_page as i32).to_ne_bytes());
                self.disk.write_page(self.fid, page_no, &page)?;
                page_no += 1;
                slot = 0;
                init_page(&mut page);
            }
        }

        if slot > 0 {
            page[OFF_NUM_RECORDS..OFF_NUM_RECORDS + 4]
                .copy_from_slice(&(slot as i32).to_ne_bytes());
            self.disk.write_page(self.fid, page_no, &page)?;
            hdr.first_free_page_no = page_no;
            hdr.num_pages = page_no + 1;
        } else {
            hdr.first_free_page_no = NO_PAGE;
            hdr.num_pages = page_no;
        }
        self.disk.set_next_page_no(self.fid, hdr.num_pages)?;
        drop(hdr);
        self.write_hdr()?;
        Ok(total)
    }
}

/// Iterates every live rid in page-then-slot order. Exhaustion is
/// signalled by `page_no = NO_PAGE`.
pub struct TableScan {
    file: Arc<TableFile>,
    rid: Rid,
}

impl TableScan {
    pub fn new(file: &Arc<TableFile>) -> StorageResult<TableScan> {
        let mut scan = TableScan {
            file: file.clone(),
            rid: Rid {
                page_no: FIRST_RECORD_PAGE,
                slot_no: -1,
            },
        };
        scan.next()?;
        Ok(scan)
    }

    pub fn next(&mut self) -> StorageResult<()> {
        if self.is_end() {
            return Ok(());
        }
        let num_pages = self.file.num_pages();
        while self.rid.page_no < num_pages {
            match self.file.next_live_slot(self.rid.page_no, self.rid.slot_no)? {
                Some(slot) => {
                    self.rid.slot_no = slot;
                    return Ok(());
                }
                None => {
                    self.rid.page_no += 1;
                    self.rid.slot_no = -1;
                }
            }
        }
        self.rid.page_no = NO_PAGE;
        Ok(())
    }

    pub fn is_end(&self) -> bool {
        self.rid.page_no == NO_PAGE
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::LogManager;
    use tempfile::tempdir;

    fn open_table(record_size: usize) -> (tempfile::TempDir, Arc<TableFile>) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new());
        disk.set_log_file(&dir.path().join("db.log")).unwrap();
        let log = Arc::new(LogManager::new(disk.clone()));
        let bpm = Arc::new(BufferPoolManager::new(disk.clone(), log));
        let path = dir.path().join("t.tbl");
        TableFile::create(&disk, &path, record_size).unwrap();
        let file = Arc::new(TableFile::open(disk, bpm, &path).unwrap());
        (dir, file)
    }

    fn rec(record_size: usize, tag: u8) -> Vec<u8> {
        let mut buf = vec![0u8; record_size];
        buf[0] = tag;
        buf
    }

    #[test]
    fn insert_get_update_delete_round_trip() {
        let (_dir, file) = open_table(16);
        let rid = file.insert_record(&rec(16, 1)).unwrap();
        assert_eq!(file.get_record(rid).unwrap()[0], 1);

        file.update_record(rid, &rec(16, 2)).unwrap();
        assert_eq!(file.get_record(rid).unwrap()[0], 2);

        file.delete_record(rid).unwrap();
        assert!(matches!(
            file.get_record(rid),
            Err(StorageError::RecordNotFound { .. })
        ));
        assert!(matches!(
            file.delete_record(rid),
            Err(StorageError::RecordNotFound { .. })
        ));
    }

    #[test]
    fn full_page_leaves_and_rejoins_free_list() {
        // Large records so a page holds only a handful.
        let record_size = 1000;
        let (_dir, file) = open_table(record_size);
        let per_page = file.records_per_page();

        let mut rids = Vec::new();
        for i in 0..per_page {
            rids.push(file.insert_record(&rec(record_size, i as u8)).unwrap());
        }
        assert!(rids.iter().all(|r| r.page_no == FIRST_RECORD_PAGE));

        // Page 1 is full, so the next insert opens page 2.
        let overflow = file.insert_record(&rec(record_size, 0xFF)).unwrap();
        assert_eq!(overflow.page_no, FIRST_RECORD_PAGE + 1);

        // Deleting from the full page reconnects it to the free list.
        file.delete_record(rids[0]).unwrap();
        let reused = file.insert_record(&rec(record_size, 0xAA)).unwrap();
        assert_eq!(reused.page_no, FIRST_RECORD_PAGE);
        assert_eq!(reused.slot_no, rids[0].slot_no);
    }

    #[test]
    fn scan_visits_each_live_record_once_in_order() {
        let (_dir, file) = open_table(32);
        let mut rids = Vec::new();
        for i in 0..10u8 {
            rids.push(file.insert_record(&rec(32, i)).unwrap());
        }
        file.delete_record(rids[3]).unwrap();
        file.delete_record(rids[7]).unwrap();

        let mut seen = Vec::new();
        let mut scan = TableScan::new(&file).unwrap();
        while !scan.is_end() {
            seen.push(scan.rid());
            scan.next().unwrap();
        }
        let expected: Vec<Rid> = rids
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 3 && *i != 7)
            .map(|(_, r)| *r)
            .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn forced_insert_grows_the_file() {
        let (_dir, file) = open_table(64);
        let rid = Rid {
            page_no: 3,
            slot_no: 5,
        };
        file.insert_record_at(rid, &rec(64, 9)).unwrap();
        assert_eq!(file.num_pages(), 4);
        assert_eq!(file.get_record(rid).unwrap()[0], 9);
    }

    #[test]
    fn header_survives_close_and_reopen() {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new());
        disk.set_log_file(&dir.path().join("db.log")).unwrap();
        let log = Arc::new(LogManager::new(disk.clone()));
        let bpm = Arc::new(BufferPoolManager::new(disk.clone(), log));
        let path = dir.path().join("t.tbl");
        TableFile::create(&disk, &path, 24).unwrap();

        let rid;
        {
            let file = TableFile::open(disk.clone(), bpm.clone(), &path).unwrap();
            rid = file.insert_record(&rec(24, 5)).unwrap();
            bpm.flush_all_pages().unwrap();
            file.close().unwrap();
        }
        let file = TableFile::open(disk, bpm, &path).unwrap();
        assert_eq!(file.get_record(rid).unwrap()[0], 5);
        assert_eq!(file.record_size(), 24);
        file.close().unwrap();
    }
}
