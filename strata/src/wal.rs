//! The write-ahead log manager: an append-only log with an in-memory
//! buffer, LSN allocation under a latch, and the fixed binary record
//! format shared with recovery.
//!
//! Record layout: a common header
//! `{log_type (1B), tot_len (4B), lsn (4B), txn_id (4B), prev_lsn (4B)}`
//! followed by the type-specific payload. BEGIN/COMMIT/ABORT carry no
//! payload; INSERT/DELETE carry `{rid (8B), value_len (4B), value,
//! table_name_len (4B), table_name}`; UPDATE carries the after-image
//! then the before-image then the table name. Integers are host-native.

use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, BytesMut};
use log::debug;

use crate::disk::DiskManager;
use crate::errors::{StorageError, StorageResult};
use crate::{Rid, TxnId, PAGE_SIZE};

/// A log sequence number. LSN 0 is never allocated, so a zeroed page
/// header always predates every logged record.
pub type Lsn = i32;

/// "No LSN": the prev_lsn of a transaction's first record and the page
/// LSN of a page no logged record has touched.
pub const INVALID_LSN: Lsn = 0;

/// First LSN handed out by a fresh log.
pub const FIRST_LSN: Lsn = 1;

pub const LOG_HEADER_SIZE: usize = 17;
pub const LOG_BUFFER_SIZE: usize = PAGE_SIZE * 16;

const TYPE_BEGIN: u8 = 0;
const TYPE_COMMIT: u8 = 1;
const TYPE_ABORT: u8 = 2;
const TYPE_INSERT: u8 = 3;
const TYPE_DELETE: u8 = 4;
const TYPE_UPDATE: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    Begin,
    Commit,
    Abort,
    Insert {
        rid: Rid,
        value: Vec<u8>,
        table: String,
    },
    Delete {
        rid: Rid,
        value: Vec<u8>,
        table: String,
    },
    Update {
        rid: Rid,
        after: Vec<u8>,
        before: Vec<u8>,
        table: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub payload: LogPayload,
}

impl LogRecord {
    pub fn new(txn_id: TxnId, prev_lsn: Lsn, payload: LogPayload) -> Self {
        LogRecord {
            lsn: INVALID_LSN,
            txn_id,
            prev_lsn,
            payload,
        }
    }

    fn type_code(&self) -> u8 {
        match self.payload {
            LogPayload::Begin => TYPE_BEGIN,
            LogPayload::Commit => TYPE_COMMIT,
            LogPayload::Abort => TYPE_ABORT,
            LogPayload::Insert { .. } => TYPE_INSERT,
            LogPayload::Delete { .. } => TYPE_DELETE,
            LogPayload::Update { .. } => TYPE_UPDATE,
        }
    }

    pub fn serialized_len(&self) -> usize {
        let payload_len = match &self.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => 0,
            LogPayload::Insert { value, table, .. } | LogPayload::Delete { value, table, .. } => {
                8 + 4 + value.len() + 4 + table.len()
            }
            LogPayload::Update {
                after,
                before,
                table,
                ..
            } => 8 + 4 + after.len() + 4 + before.len() + 4 + table.len(),
        };
        LOG_HEADER_SIZE + payload_len
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.type_code());
        buf.put_slice(&(self.serialized_len() as u32).to_ne_bytes());
        buf.put_slice(&self.lsn.to_ne_bytes());
        buf.put_slice(&self.txn_id.to_ne_bytes());
        buf.put_slice(&self.prev_lsn.to_ne_bytes());
        match &self.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => {}
            LogPayload::Insert { rid, value, table } | LogPayload::Delete { rid, value, table } => {
                put_rid(buf, *rid);
                put_bytes(buf, value);
                put_bytes(buf, table.as_bytes());
            }
            LogPayload::Update {
                rid,
                after,
                before,
                table,
            } => {
                put_rid(buf, *rid);
                put_bytes(buf, after);
                put_bytes(buf, before);
                put_bytes(buf, table.as_bytes());
            }
        }
    }

    /// Decodes one record from the front of `data`. Returns the record
    /// and its total length, or `None` on a truncated or garbled tail.
    pub fn decode(data: &[u8]) -> Option<(LogRecord, usize)> {
        if data.len() < LOG_HEADER_SIZE {
            return None;
        }
        let mut buf = data;
        let type_code = buf.get_u8();
        let tot_len = u32::from_ne_bytes(take4(&mut buf)) as usize;
        let lsn = Lsn::from_ne_bytes(take4(&mut buf));
        let txn_id = TxnId::from_ne_bytes(take4(&mut buf));
        let prev_lsn = Lsn::from_ne_bytes(take4(&mut buf));
        if tot_len < LOG_HEADER_SIZE || data.len() < tot_len {
            return None;
        }
        let payload = match type_code {
            TYPE_BEGIN => LogPayload::Begin,
            TYPE_COMMIT => LogPayload::Commit,
            TYPE_ABORT => LogPayload::Abort,
            TYPE_INSERT | TYPE_DELETE => {
                let rid = get_rid(&mut buf)?;
                let value = get_bytes(&mut buf)?;
                let table = String::from_utf8(get_bytes(&mut buf)?).ok()?;
                if type_code == TYPE_INSERT {
                    LogPayload::Insert { rid, value, table }
                } else {
                    LogPayload::Delete { rid, value, table }
                }
            }
            TYPE_UPDATE => {
                let rid = get_rid(&mut buf)?;
                let after = get_bytes(&mut buf)?;
                let before = get_bytes(&mut buf)?;
                let table = String::from_utf8(get_bytes(&mut buf)?).ok()?;
                LogPayload::Update {
                    rid,
                    after,
                    before,
                    table,
                }
            }
            _ => return None,
        };
        Some((
            LogRecord {
                lsn,
                txn_id,
                prev_lsn,
                payload,
            },
            tot_len,
        ))
    }
}

fn put_rid(buf: &mut BytesMut, rid: Rid) {
    buf.put_slice(&rid.page_no.to_ne_bytes());
    buf.put_slice(&rid.slot_no.to_ne_bytes());
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_slice(&(bytes.len() as u32).to_ne_bytes());
    buf.put_slice(bytes);
}

fn take4(buf: &mut &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[..4]);
    buf.advance(4);
    out
}

fn get_rid(buf: &mut &[u8]) -> Option<Rid> {
    if buf.len() < 8 {
        return None;
    }
    let page_no = i32::from_ne_bytes(take4(buf));
    let slot_no = i32::from_ne_bytes(take4(buf));
    Some(Rid { page_no, slot_no })
}

fn get_bytes(buf: &mut &[u8]) -> Option<Vec<u8>> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_ne_bytes(take4(buf)) as usize;
    if buf.len() < len {
        return None;
    }
    let out = buf[..len].to_vec();
    buf.advance(len);
    Some(out)
}

struct LogInner {
    buffer: BytesMut,
    next_lsn: Lsn,
    persistent_lsn: Lsn,
}

/// Appends records to an in-memory buffer and flushes them to the disk
/// manager's log file. Invariant: `persistent_lsn < next_lsn`; a data
/// page with `page_lsn = L` is never flushed before the log reaches
/// `persistent_lsn >= L` (enforced by the buffer pool calling
/// [`LogManager::flush_to_lsn`]).
pub struct LogManager {
    disk: Arc<DiskManager>,
    inner: Mutex<LogInner>,
}

impl LogManager {
    pub fn new(disk: Arc<DiskManager>) -> Self {
        LogManager {
            disk,
            inner: Mutex::new(LogInner {
                buffer: BytesMut::with_capacity(LOG_BUFFER_SIZE),
                next_lsn: FIRST_LSN,
                persistent_lsn: INVALID_LSN,
            }),
        }
    }

    /// Assigns the record its LSN and appends it to the log buffer,
    /// flushing first when the buffer cannot hold it. Returns the LSN.
    /// The caller must have set `prev_lsn` to the transaction's last
    /// LSN.
    pub fn add(&self, record: &mut LogRecord) -> StorageResult<Lsn> {
        let mut inner = self.inner.lock().unwrap();
        let len = record.serialized_len();
        if len > LOG_BUFFER_SIZE {
            return Err(StorageError::Internal(format!(
                "log record of {} bytes exceeds the log buffer",
                len
            )));
        }
        if inner.buffer.len() + len > LOG_BUFFER_SIZE {
            Self::flush_locked(&self.disk, &mut inner)?;
        }
        record.lsn = inner.next_lsn;
        inner.next_lsn += 1;
        record.encode(&mut inner.buffer);
        debug!(
            "log add lsn={} txn={} type={:?}",
            record.lsn,
            record.txn_id,
            std::mem::discriminant(&record.payload)
        );
        Ok(record.lsn)
    }

    /// Writes the buffered prefix to the log file and advances
    /// `persistent_lsn`.
    pub fn flush(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::flush_locked(&self.disk, &mut inner)
    }

    fn flush_locked(disk: &DiskManager, inner: &mut LogInner) -> StorageResult<()> {
        if !inner.buffer.is_empty() {
            disk.append_log(&inner.buffer)?;
            disk.sync_log()?;
            inner.buffer.clear();
        }
        inner.persistent_lsn = inner.next_lsn - 1;
        Ok(())
    }

    /// Ensures the log is durable at least up to `lsn` before a page
    /// carrying that LSN may reach disk.
    pub fn flush_to_lsn(&self, lsn: Lsn) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.persistent_lsn < lsn {
            Self::flush_locked(&self.disk, &mut inner)?;
        }
        Ok(())
    }

    pub fn persistent_lsn(&self) -> Lsn {
        self.inner.lock().unwrap().persistent_lsn
    }

    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().unwrap().next_lsn
    }

    /// Repositions the allocator after recovery has scanned the
    /// existing log tail.
    pub fn reset_lsn(&self, next_lsn: Lsn) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_lsn = next_lsn;
        inner.persistent_lsn = next_lsn - 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_records() -> Vec<LogRecord> {
        vec![
            LogRecord::new(1, INVALID_LSN, LogPayload::Begin),
            LogRecord::new(
                1,
                1,
                LogPayload::Insert {
                    rid: Rid {
                        page_no: 1,
                        slot_no: 3,
                    },
                    value: vec![1, 2, 3, 4],
                    table: "t".into(),
                },
            ),
            LogRecord::new(
                1,
                2,
                LogPayload::Update {
                    rid: Rid {
                        page_no: 1,
                        slot_no: 3,
                    },
                    after: vec![9, 9],
                    before: vec![1, 2],
                    table: "t".into(),
                },
            ),
            LogRecord::new(
                1,
                3,
                LogPayload::Delete {
                    rid: Rid {
                        page_no: 2,
                        slot_no: 0,
                    },
                    value: vec![7],
                    table: "other".into(),
                },
            ),
            LogRecord::new(1, 4, LogPayload::Commit),
            LogRecord::new(2, INVALID_LSN, LogPayload::Abort),
        ]
    }

    #[test]
    fn encode_decode_is_identity() {
        for mut record in sample_records() {
            record.lsn = 17;
            let mut buf = BytesMut::new();
            record.encode(&mut buf);
            assert_eq!(buf.len(), record.serialized_len());
            let (decoded, len) = LogRecord::decode(&buf).unwrap();
            assert_eq!(len, buf.len());
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn decode_rejects_truncated_records() {
        let mut record = sample_records().remove(1);
        record.lsn = 5;
        let mut buf = BytesMut::new();
        record.encode(&mut buf);
        for cut in 1..buf.len() {
            assert!(LogRecord::decode(&buf[..cut]).is_none(), "cut={}", cut);
        }
    }

    #[test]
    fn add_assigns_increasing_lsns_and_flush_persists() {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new());
        disk.set_log_file(&dir.path().join("db.log")).unwrap();
        let log = LogManager::new(disk.clone());

        let mut first = LogRecord::new(1, INVALID_LSN, LogPayload::Begin);
        let mut second = LogRecord::new(1, 1, LogPayload::Commit);
        assert_eq!(log.add(&mut first).unwrap(), FIRST_LSN);
        assert_eq!(log.add(&mut second).unwrap(), FIRST_LSN + 1);
        assert_eq!(log.persistent_lsn(), INVALID_LSN);

        log.flush().unwrap();
        assert_eq!(log.persistent_lsn(), FIRST_LSN + 1);

        let len = disk.log_len().unwrap() as usize;
        let mut bytes = vec![0u8; len];
        assert_eq!(disk.read_log(&mut bytes, 0).unwrap(), len);
        let (rec, n) = LogRecord::decode(&bytes).unwrap();
        assert_eq!(rec.payload, LogPayload::Begin);
        let (rec2, _) = LogRecord::decode(&bytes[n..]).unwrap();
        assert_eq!(rec2.payload, LogPayload::Commit);
    }
}
