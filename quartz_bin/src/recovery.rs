//! Crash recovery: three passes over the on-disk log.
//!
//! Analyze reads the log from offset 0, rebuilding the
//! active-transaction table and the per-transaction `prev_lsn` chains,
//! stopping at end-of-log or a truncated record. Redo walks the records
//! in order, reinstalling transactions and reapplying page-LSN-gated
//! effects through the schema manager's recovery hooks; the write-set
//! entry is rebuilt unconditionally so effects that reached disk before
//! the crash can still be undone. Undo reverses the write-sets of every
//! transaction still active at end-of-log.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use strata::transaction::{Transaction, TransactionManager, TxnState, WriteRecord};
use strata::wal::{LogManager, LogPayload, LogRecord, Lsn, FIRST_LSN};
use strata::{DiskManager, TxnId};

use crate::errors::{QueryError, QueryResult};
use crate::schema::SchemaManager;

pub struct RecoveryManager<'a> {
    disk: &'a DiskManager,
    sm: &'a SchemaManager,
    tm: &'a TransactionManager,
    log: &'a LogManager,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(
        disk: &'a DiskManager,
        sm: &'a SchemaManager,
        tm: &'a TransactionManager,
        log: &'a LogManager,
    ) -> Self {
        RecoveryManager { disk, sm, tm, log }
    }

    pub fn recover(&self) -> QueryResult<()> {
        let (records, active) = self.analyze()?;
        self.redo(&records)?;
        self.undo(&active)?;
        Ok(())
    }

    /// Scans the log, chaining each transaction's records via
    /// `prev_lsn` and tracking which transactions never finished.
    fn analyze(&self) -> QueryResult<(Vec<LogRecord>, HashMap<TxnId, Lsn>)> {
        let len = self.disk.log_len().map_err(QueryError::from)? as usize;
        let mut bytes = vec![0u8; len];
        let read = self.disk.read_log(&mut bytes, 0).map_err(QueryError::from)?;
        bytes.truncate(read);

        let mut records = Vec::new();
        let mut active: HashMap<TxnId, Lsn> = HashMap::new();
        let mut max_lsn = FIRST_LSN - 1;
        let mut max_txn = 0;
        let mut offset = 0;
        while offset < bytes.len() {
            let Some((mut record, tot_len)) = LogRecord::decode(&bytes[offset..]) else {
                warn!("log truncated at offset {}", offset);
                break;
            };
            max_lsn = max_lsn.max(record.lsn);
            max_txn = max_txn.max(record.txn_id);
            match record.payload {
                LogPayload::Begin => {
                    active.insert(record.txn_id, record.lsn);
                }
                LogPayload::Commit | LogPayload::Abort => {
                    active.remove(&record.txn_id);
                }
                LogPayload::Insert { .. } | LogPayload::Update { .. } | LogPayload::Delete { .. } => {
                    if let Some(last) = active.get(&record.txn_id) {
                        record.prev_lsn = *last;
                    }
                    active.insert(record.txn_id, record.lsn);
                }
            }
            records.push(record);
            offset += tot_len;
        }

        self.log.reset_lsn(max_lsn + 1);
        self.tm.reset_next_txn_id(max_txn + 1);
        info!(
            "recovery: {} log records, {} unfinished transactions",
            records.len(),
            active.len()
        );
        Ok((records, active))
    }

    fn ensure_txn(&self, txn_id: TxnId) -> Arc<Transaction> {
        if let Some(txn) = self.tm.get_transaction(txn_id) {
            return txn;
        }
        let txn = Arc::new(Transaction::new(txn_id));
        self.tm.install(txn.clone());
        txn
    }

    fn redo(&self, records: &[LogRecord]) -> QueryResult<()> {
        for record in records {
            match &record.payload {
                LogPayload::Begin => {
                    self.ensure_txn(record.txn_id);
                }
                LogPayload::Commit => {
                    let txn = self.ensure_txn(record.txn_id);
                    txn.clear_write_set();
                    txn.set_state(TxnState::Committed);
                }
                LogPayload::Abort => {
                    let txn = self.ensure_txn(record.txn_id);
                    self.replay_undo(&txn)?;
                    txn.set_state(TxnState::Aborted);
                }
                LogPayload::Insert { rid, value, table } => {
                    let txn = self.ensure_txn(record.txn_id);
                    if self.needs_redo(table, rid.page_no, record.lsn)? {
                        self.sm.recovery_insert(table, *rid, value)?;
                        self.set_page_lsn(table, rid.page_no, record.lsn)?;
                    }
                    txn.append_write(WriteRecord::Insert {
                        table: table.clone(),
                        rid: *rid,
                    });
                }
                LogPayload::Update {
                    rid,
                    after,
                    before,
                    table,
                } => {
                    let txn = self.ensure_txn(record.txn_id);
                    if self.needs_redo(table, rid.page_no, record.lsn)? {
                        self.sm.recovery_update(table, *rid, after)?;
                        self.set_page_lsn(table, rid.page_no, record.lsn)?;
                    }
                    txn.append_write(WriteRecord::Update {
                        table: table.clone(),
                        rid: *rid,
                        record: before.clone(),
                    });
                }
                LogPayload::Delete { rid, value, table } => {
                    let txn = self.ensure_txn(record.txn_id);
                    if self.needs_redo(table, rid.page_no, record.lsn)? {
                        self.sm.recovery_delete(table, *rid)?;
                        self.set_page_lsn(table, rid.page_no, record.lsn)?;
                    }
                    txn.append_write(WriteRecord::Delete {
                        table: table.clone(),
                        rid: *rid,
                        record: value.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// A logged effect is reapplied only when the page image predates
    /// it. Tables dropped after the logged write are skipped.
    fn needs_redo(&self, table: &str, page_no: i32, lsn: Lsn) -> QueryResult<bool> {
        let fh = match self.sm.table_file(table) {
            Ok(fh) => fh,
            Err(_) => {
                debug!("skipping log record for dropped table {}", table);
                return Ok(false);
            }
        };
        Ok(fh.page_lsn(page_no)? < lsn)
    }

    fn set_page_lsn(&self, table: &str, page_no: i32, lsn: Lsn) -> QueryResult<()> {
        let fh = self.sm.table_file(table)?;
        fh.set_page_lsn(page_no, lsn)?;
        Ok(())
    }

    /// Reverses one transaction's write-set, newest first.
    fn replay_undo(&self, txn: &Arc<Transaction>) -> QueryResult<()> {
        while let Some(write) = txn.pop_write() {
            match write {
                WriteRecord::Insert { table, rid } => {
                    self.sm.rollback_insert_impl(&table, rid)?;
                }
                WriteRecord::Delete { table, rid, record } => {
                    self.sm.rollback_delete_impl(&table, &record, rid)?;
                }
                WriteRecord::Update { table, rid, record } => {
                    self.sm.rollback_update_impl(&table, rid, &record)?;
                }
            }
        }
        Ok(())
    }

    /// Rolls back every transaction still active at end-of-log.
    fn undo(&self, active: &HashMap<TxnId, Lsn>) -> QueryResult<()> {
        for txn_id in active.keys() {
            let txn = self.ensure_txn(*txn_id);
            debug!("undoing unfinished txn {}", txn_id);
            self.replay_undo(&txn)?;
            txn.set_state(TxnState::Aborted);
        }
        Ok(())
    }
}
