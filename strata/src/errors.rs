use std::fmt;
use std::io;

use crate::{FileId, PageNo, TxnId};

/// Errors raised by the storage engine.
#[derive(Debug)]
pub enum StorageError {
    /// Underlying OS error.
    Io(io::Error),
    FileExists(String),
    FileNotFound(String),
    FileNotClosed(String),
    FileNotOpen(FileId),
    PageNotExist { fid: FileId, page_no: PageNo },
    RecordNotFound { page_no: PageNo, slot_no: i32 },
    /// Every frame in the buffer pool is pinned.
    PoolExhausted,
    /// `delete_page` on a page that is still pinned.
    PagePinned(PageNo),
    UniqueConstraint,
    IndexEntryNotFound,
    /// Wound-wait aborted the requesting transaction.
    DeadlockPrevention(TxnId),
    Internal(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "io error: {}", e),
            StorageError::FileExists(path) => write!(f, "file already exists: {}", path),
            StorageError::FileNotFound(path) => write!(f, "file not found: {}", path),
            StorageError::FileNotClosed(path) => write!(f, "file not closed: {}", path),
            StorageError::FileNotOpen(fid) => write!(f, "file not open: fid {}", fid),
            StorageError::PageNotExist { fid, page_no } => {
                write!(f, "page {} does not exist in file {}", page_no, fid)
            }
            StorageError::RecordNotFound { page_no, slot_no } => {
                write!(f, "record not found at ({}, {})", page_no, slot_no)
            }
            StorageError::PoolExhausted => write!(f, "buffer pool exhausted: all frames pinned"),
            StorageError::PagePinned(page_no) => {
                write!(f, "page {} is pinned and cannot be deleted", page_no)
            }
            StorageError::UniqueConstraint => write!(f, "unique constraint violation"),
            StorageError::IndexEntryNotFound => write!(f, "index entry not found"),
            StorageError::DeadlockPrevention(txn_id) => {
                write!(f, "transaction {} aborted by deadlock prevention", txn_id)
            }
            StorageError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}
