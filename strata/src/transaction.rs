//! Transactions and the transaction manager. A transaction carries its
//! 2PL state, the ordered write-set used for undo, the set of held
//! locks, and the LSN of its last log record (the `prev_lsn` chain).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::errors::StorageResult;
use crate::lock_manager::{LockDataId, LockManager};
use crate::wal::{LogManager, LogPayload, LogRecord, Lsn, INVALID_LSN};
use crate::{Rid, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Default,
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// One reversible effect, recorded in submission order. Delete and
/// update carry the before-image.
#[derive(Debug, Clone)]
pub enum WriteRecord {
    Insert {
        table: String,
        rid: Rid,
    },
    Delete {
        table: String,
        rid: Rid,
        record: Vec<u8>,
    },
    Update {
        table: String,
        rid: Rid,
        record: Vec<u8>,
    },
}

/// Reverses write records; implemented by the schema manager, which
/// knows how to undo heap and index effects together.
pub trait WriteReverter {
    fn rollback_insert(&self, table: &str, rid: Rid) -> StorageResult<()>;
    fn rollback_delete(&self, table: &str, record: &[u8], rid: Rid) -> StorageResult<()>;
    fn rollback_update(&self, table: &str, rid: Rid, record: &[u8]) -> StorageResult<()>;
}

pub struct Transaction {
    id: TxnId,
    state: Mutex<TxnState>,
    prev_lsn: Mutex<Lsn>,
    write_set: Mutex<Vec<WriteRecord>>,
    lock_set: Mutex<HashSet<LockDataId>>,
    /// True inside an explicit BEGIN … COMMIT/ABORT bracket.
    explicit_mode: AtomicBool,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Transaction {
            id,
            state: Mutex::new(TxnState::Default),
            prev_lsn: Mutex::new(INVALID_LSN),
            write_set: Mutex::new(Vec::new()),
            lock_set: Mutex::new(HashSet::new()),
            explicit_mode: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: TxnState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state(), TxnState::Committed | TxnState::Aborted)
    }

    pub fn prev_lsn(&self) -> Lsn {
        *self.prev_lsn.lock().unwrap()
    }

    pub fn set_prev_lsn(&self, lsn: Lsn) {
        *self.prev_lsn.lock().unwrap() = lsn;
    }

    pub fn explicit_mode(&self) -> bool {
        self.explicit_mode.load(Ordering::SeqCst)
    }

    pub fn set_explicit_mode(&self, explicit: bool) {
        self.explicit_mode.store(explicit, Ordering::SeqCst);
    }

    pub fn append_write(&self, record: WriteRecord) {
        self.write_set.lock().unwrap().push(record);
    }

    pub fn pop_write(&self) -> Option<WriteRecord> {
        self.write_set.lock().unwrap().pop()
    }

    pub fn clear_write_set(&self) {
        self.write_set.lock().unwrap().clear();
    }

    pub fn write_set_len(&self) -> usize {
        self.write_set.lock().unwrap().len()
    }

    pub fn add_lock(&self, id: LockDataId) {
        self.lock_set.lock().unwrap().insert(id);
    }

    pub fn remove_lock(&self, id: &LockDataId) {
        self.lock_set.lock().unwrap().remove(id);
    }

    pub fn holds_lock(&self, id: &LockDataId) -> bool {
        self.lock_set.lock().unwrap().contains(id)
    }

    fn drain_locks(&self) -> Vec<LockDataId> {
        self.lock_set.lock().unwrap().drain().collect()
    }
}

pub struct TransactionManager {
    next_txn_id: AtomicU32,
    txns: Mutex<HashMap<TxnId, Arc<Transaction>>>,
    lock_mgr: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(lock_mgr: Arc<LockManager>) -> Self {
        TransactionManager {
            next_txn_id: AtomicU32::new(1),
            txns: Mutex::new(HashMap::new()),
            lock_mgr,
        }
    }

    /// Starts a transaction (or returns the extant one), appending a
    /// BEGIN record for fresh transactions.
    pub fn begin(
        &self,
        existing: Option<Arc<Transaction>>,
        log: &LogManager,
    ) -> StorageResult<Arc<Transaction>> {
        if let Some(txn) = existing {
            return Ok(txn);
        }
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(id));
        let mut record = LogRecord::new(id, INVALID_LSN, LogPayload::Begin);
        let lsn = log.add(&mut record)?;
        txn.set_prev_lsn(lsn);
        self.txns.lock().unwrap().insert(id, txn.clone());
        debug!("txn {} begun", id);
        Ok(txn)
    }

    /// Commits: COMMIT record, log made durable, locks released,
    /// write-set discarded.
    pub fn commit(&self, txn: &Arc<Transaction>, log: &LogManager) -> StorageResult<()> {
        let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::Commit);
        let lsn = log.add(&mut record)?;
        txn.set_prev_lsn(lsn);
        log.flush()?;

        for id in txn.drain_locks() {
            self.lock_mgr.unlock(txn, id)?;
        }
        txn.clear_write_set();
        txn.set_state(TxnState::Committed);
        debug!("txn {} committed", txn.id());
        Ok(())
    }

    /// Aborts: ABORT record, write-set reversed newest-first through
    /// the reverter, locks released.
    pub fn abort(
        &self,
        txn: &Arc<Transaction>,
        log: &LogManager,
        reverter: &dyn WriteReverter,
    ) -> StorageResult<()> {
        let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::Abort);
        let lsn = log.add(&mut record)?;
        txn.set_prev_lsn(lsn);

        while let Some(write) = txn.pop_write() {
            match write {
                WriteRecord::Insert { table, rid } => reverter.rollback_insert(&table, rid)?,
                WriteRecord::Delete { table, rid, record } => {
                    reverter.rollback_delete(&table, &record, rid)?
                }
                WriteRecord::Update { table, rid, record } => {
                    reverter.rollback_update(&table, rid, &record)?
                }
            }
        }

        for id in txn.drain_locks() {
            self.lock_mgr.unlock(txn, id)?;
        }
        txn.set_state(TxnState::Aborted);
        debug!("txn {} aborted", txn.id());
        Ok(())
    }

    pub fn get_transaction(&self, id: TxnId) -> Option<Arc<Transaction>> {
        self.txns.lock().unwrap().get(&id).cloned()
    }

    /// Registers a transaction reconstructed by recovery.
    pub fn install(&self, txn: Arc<Transaction>) {
        self.txns.lock().unwrap().insert(txn.id(), txn);
    }

    /// Repositions the id allocator above every id recovery has seen.
    pub fn reset_next_txn_id(&self, next: TxnId) {
        self.next_txn_id.store(next, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskManager;
    use tempfile::tempdir;

    struct NopReverter;
    impl WriteReverter for NopReverter {
        fn rollback_insert(&self, _table: &str, _rid: Rid) -> StorageResult<()> {
            Ok(())
        }
        fn rollback_delete(&self, _table: &str, _record: &[u8], _rid: Rid) -> StorageResult<()> {
            Ok(())
        }
        fn rollback_update(&self, _table: &str, _rid: Rid, _record: &[u8]) -> StorageResult<()> {
            Ok(())
        }
    }

    fn setup() -> (tempfile::TempDir, LogManager, TransactionManager) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new());
        disk.set_log_file(&dir.path().join("db.log")).unwrap();
        let log = LogManager::new(disk);
        let tm = TransactionManager::new(Arc::new(LockManager::new()));
        (dir, log, tm)
    }

    #[test]
    fn begin_commit_chains_lsns() {
        let (_dir, log, tm) = setup();
        let txn = tm.begin(None, &log).unwrap();
        assert_eq!(txn.prev_lsn(), 1);
        tm.commit(&txn, &log).unwrap();
        assert_eq!(txn.state(), TxnState::Committed);
        assert_eq!(txn.prev_lsn(), 2);
        // Commit forces the log out.
        assert_eq!(log.persistent_lsn(), 2);
    }

    #[test]
    fn begin_returns_extant_transaction() {
        let (_dir, log, tm) = setup();
        let txn = tm.begin(None, &log).unwrap();
        let same = tm.begin(Some(txn.clone()), &log).unwrap();
        assert_eq!(txn.id(), same.id());
    }

    #[test]
    fn abort_reverses_write_set_in_reverse_order() {
        struct Recording(Mutex<Vec<String>>);
        impl WriteReverter for Recording {
            fn rollback_insert(&self, table: &str, _rid: Rid) -> StorageResult<()> {
                self.0.lock().unwrap().push(format!("ins:{}", table));
                Ok(())
            }
            fn rollback_delete(&self, table: &str, _r: &[u8], _rid: Rid) -> StorageResult<()> {
                self.0.lock().unwrap().push(format!("del:{}", table));
                Ok(())
            }
            fn rollback_update(&self, table: &str, _rid: Rid, _r: &[u8]) -> StorageResult<()> {
                self.0.lock().unwrap().push(format!("upd:{}", table));
                Ok(())
            }
        }

        let (_dir, log, tm) = setup();
        let txn = tm.begin(None, &log).unwrap();
        let rid = Rid {
            page_no: 1,
            slot_no: 0,
        };
        txn.append_write(WriteRecord::Insert {
            table: "a".into(),
            rid,
        });
        txn.append_write(WriteRecord::Update {
            table: "b".into(),
            rid,
            record: vec![1],
        });
        txn.append_write(WriteRecord::Delete {
            table: "c".into(),
            rid,
            record: vec![2],
        });

        let recorder = Recording(Mutex::new(Vec::new()));
        tm.abort(&txn, &log, &recorder).unwrap();
        assert_eq!(txn.state(), TxnState::Aborted);
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["del:c", "upd:b", "ins:a"]
        );
        assert_eq!(txn.write_set_len(), 0);
    }

    #[test]
    fn nop_abort_keeps_lock_set_empty() {
        let (_dir, log, tm) = setup();
        let txn = tm.begin(None, &log).unwrap();
        tm.abort(&txn, &log, &NopReverter).unwrap();
        assert!(tm.get_transaction(txn.id()).is_some());
    }
}
