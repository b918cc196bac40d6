//! Page-aligned file I/O. The disk manager owns every open file handle
//! in the database directory plus the append-only log file, and hands
//! out monotonically increasing page numbers per file.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;

use crate::errors::{StorageError, StorageResult};
use crate::{FileId, PageNo, PAGE_SIZE};

struct OpenFile {
    file: File,
    path: PathBuf,
    /// Next page number this file will hand out.
    next_page_no: PageNo,
}

#[derive(Default)]
struct DiskInner {
    files: HashMap<FileId, OpenFile>,
    path2fid: HashMap<PathBuf, FileId>,
    next_fid: FileId,
}

pub struct DiskManager {
    inner: Mutex<DiskInner>,
    log: Mutex<Option<File>>,
    log_path: Mutex<Option<PathBuf>>,
}

impl DiskManager {
    pub fn new() -> Self {
        DiskManager {
            inner: Mutex::new(DiskInner::default()),
            log: Mutex::new(None),
            log_path: Mutex::new(None),
        }
    }

    pub fn is_file(path: &Path) -> bool {
        path.is_file()
    }

    pub fn create_file(&self, path: &Path) -> StorageResult<()> {
        if Self::is_file(path) {
            return Err(StorageError::FileExists(path.display().to_string()));
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(())
    }

    pub fn destroy_file(&self, path: &Path) -> StorageResult<()> {
        if !Self::is_file(path) {
            return Err(StorageError::FileNotFound(path.display().to_string()));
        }
        let inner = self.inner.lock().unwrap();
        if inner.path2fid.contains_key(path) {
            return Err(StorageError::FileNotClosed(path.display().to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    pub fn open_file(&self, path: &Path) -> StorageResult<FileId> {
        if !Self::is_file(path) {
            return Err(StorageError::FileNotFound(path.display().to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.path2fid.contains_key(path) {
            return Err(StorageError::FileNotClosed(path.display().to_string()));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();
        let fid = inner.next_fid;
        inner.next_fid += 1;
        inner.files.insert(
            fid,
            OpenFile {
                file,
                path: path.to_path_buf(),
                next_page_no: (file_size / PAGE_SIZE as u64) as PageNo,
            },
        );
        inner.path2fid.insert(path.to_path_buf(), fid);
        debug!("opened {} as fid {}", path.display(), fid);
        Ok(fid)
    }

    pub fn close_file(&self, fid: FileId) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .files
            .remove(&fid)
            .ok_or(StorageError::FileNotOpen(fid))?;
        entry.file.sync_all()?;
        inner.path2fid.remove(&entry.path);
        Ok(())
    }

    pub fn read_page(&self, fid: FileId, page_no: PageNo, buf: &mut [u8]) -> StorageResult<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .files
            .get_mut(&fid)
            .ok_or(StorageError::FileNotOpen(fid))?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        entry.file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            let n = entry.file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        // Pages past the current end of file read back as zeroes.
        for byte in &mut buf[read..] {
            *byte = 0;
        }
        Ok(())
    }

    pub fn write_page(&self, fid: FileId, page_no: PageNo, buf: &[u8]) -> StorageResult<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .files
            .get_mut(&fid)
            .ok_or(StorageError::FileNotOpen(fid))?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        entry.file.seek(SeekFrom::Start(offset))?;
        entry.file.write_all(buf)?;
        if page_no >= entry.next_page_no {
            entry.next_page_no = page_no + 1;
        }
        Ok(())
    }

    /// Hands out the next page number of the file. The caller decides
    /// when the page bytes are first written.
    pub fn allocate_page(&self, fid: FileId) -> StorageResult<PageNo> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .files
            .get_mut(&fid)
            .ok_or(StorageError::FileNotOpen(fid))?;
        let page_no = entry.next_page_no;
        entry.next_page_no += 1;
        Ok(page_no)
    }

    /// Resets the allocation cursor; used when a file header records a
    /// page count that differs from the raw file length.
    pub fn set_next_page_no(&self, fid: FileId, page_no: PageNo) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .files
            .get_mut(&fid)
            .ok_or(StorageError::FileNotOpen(fid))?;
        entry.next_page_no = page_no;
        Ok(())
    }

    pub fn sync_file(&self, fid: FileId) -> StorageResult<()> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.files.get(&fid).ok_or(StorageError::FileNotOpen(fid))?;
        entry.file.sync_all()?;
        Ok(())
    }

    /// Registers the log file path. The file is created if missing and
    /// opened lazily on first use.
    pub fn set_log_file(&self, path: &Path) -> StorageResult<()> {
        *self.log_path.lock().unwrap() = Some(path.to_path_buf());
        Ok(())
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut File) -> StorageResult<T>) -> StorageResult<T> {
        let mut log = self.log.lock().unwrap();
        if log.is_none() {
            let path = self
                .log_path
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| StorageError::Internal("log file not configured".into()))?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            *log = Some(file);
        }
        f(log.as_mut().unwrap())
    }

    /// Appends `buf` to the end of the log file.
    pub fn append_log(&self, buf: &[u8]) -> StorageResult<()> {
        self.with_log(|file| {
            file.seek(SeekFrom::End(0))?;
            file.write_all(buf)?;
            Ok(())
        })
    }

    pub fn sync_log(&self) -> StorageResult<()> {
        self.with_log(|file| {
            file.sync_all()?;
            Ok(())
        })
    }

    /// Reads up to `buf.len()` log bytes starting at `offset`. Returns
    /// the number of bytes actually read (0 at end of log).
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> StorageResult<usize> {
        self.with_log(|file| {
            let len = file.metadata()?.len();
            if offset >= len {
                return Ok(0);
            }
            file.seek(SeekFrom::Start(offset))?;
            let mut read = 0;
            while read < buf.len() {
                let n = file.read(&mut buf[read..])?;
                if n == 0 {
                    break;
                }
                read += n;
            }
            Ok(read)
        })
    }

    pub fn log_len(&self) -> StorageResult<u64> {
        self.with_log(|file| Ok(file.metadata()?.len()))
    }
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_open_close_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbl");

        let dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        assert!(matches!(
            dm.create_file(&path),
            Err(StorageError::FileExists(_))
        ));

        let fid = dm.open_file(&path).unwrap();
        assert!(matches!(
            dm.open_file(&path),
            Err(StorageError::FileNotClosed(_))
        ));
        assert!(matches!(
            dm.destroy_file(&path),
            Err(StorageError::FileNotClosed(_))
        ));

        dm.close_file(fid).unwrap();
        dm.destroy_file(&path).unwrap();
        assert!(matches!(
            dm.open_file(&path),
            Err(StorageError::FileNotFound(_))
        ));
    }

    #[test]
    fn pages_round_trip_and_allocate_monotonically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbl");
        let dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        let fid = dm.open_file(&path).unwrap();

        assert_eq!(dm.allocate_page(fid).unwrap(), 0);
        assert_eq!(dm.allocate_page(fid).unwrap(), 1);

        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[PAGE_SIZE - 1] = 0xCD;
        dm.write_page(fid, 1, &page).unwrap();

        let mut back = vec![0u8; PAGE_SIZE];
        dm.read_page(fid, 1, &mut back).unwrap();
        assert_eq!(back, page);

        // An unwritten page reads back zeroed.
        dm.read_page(fid, 5, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 0));
        dm.close_file(fid).unwrap();
    }

    #[test]
    fn log_append_and_read_back() {
        let dir = tempdir().unwrap();
        let dm = DiskManager::new();
        dm.set_log_file(&dir.path().join("db.log")).unwrap();

        dm.append_log(b"hello").unwrap();
        dm.append_log(b" world").unwrap();
        assert_eq!(dm.log_len().unwrap(), 11);

        let mut buf = [0u8; 5];
        assert_eq!(dm.read_log(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(dm.read_log(&mut buf, 11).unwrap(), 0);
    }
}
