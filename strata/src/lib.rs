//! # Strata Storage Engine
//! The storage engine for QuartzDB. This crate owns the on-disk and
//! in-memory representation of data: paged files, the buffer pool, the
//! slotted record heap, the clustered B+-tree index, the lock table and
//! the write-ahead log.

/// The B+-tree index implementation.
pub mod btree;
/// The buffer pool manager.
pub mod buffer_pool;
/// Page-oriented file I/O and the append-only log file.
pub mod disk;
/// The storage-level error taxonomy.
pub mod errors;
/// The slotted record heap file.
pub mod heap;
/// The multi-granularity lock manager.
pub mod lock_manager;
/// The page layout shared by every paged file.
pub mod page;
/// The LRU replacement policy for the buffer pool.
pub mod replacer;
/// The transaction manager.
pub mod transaction;
/// Column types and the key comparison rules.
pub mod types;
/// The write-ahead log manager.
pub mod wal;

/// The size of a single page in bytes, used consistently across table,
/// index and log files.
pub const PAGE_SIZE: usize = 4096;

/// A page number within one file. The first page is page 0.
pub type PageNo = i32;

/// A handle to an open file, handed out by the disk manager.
pub type FileId = u32;

/// A transaction identifier, allocated monotonically. Smaller id means
/// older transaction, which is what wound-wait compares.
pub type TxnId = u32;

/// Sentinel page number: "no such page" (free-list ends, leaf-chain
/// ends, scan exhaustion).
pub const NO_PAGE: PageNo = -1;

/// A page identity across files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub fid: FileId,
    pub page_no: PageNo,
}

/// A record identifier: the page and slot holding a heap record. Also
/// reused by the B+-tree, where an internal entry's `page_no` points at
/// a child node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rid {
    pub page_no: PageNo,
    pub slot_no: i32,
}

impl Rid {
    pub const INVALID: Rid = Rid {
        page_no: NO_PAGE,
        slot_no: -1,
    };
}

pub use buffer_pool::{BufferPoolManager, PageGuard};
pub use disk::DiskManager;
pub use errors::{StorageError, StorageResult};
pub use page::Page;
pub use wal::{Lsn, INVALID_LSN};
