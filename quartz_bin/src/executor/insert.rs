//! Insert: coerces the literal row to the table's column types,
//! verifies uniqueness against every index before touching anything,
//! then writes the heap record, the index entries, the log record and
//! the write-set entry.

use strata::transaction::WriteRecord;
use strata::wal::{LogPayload, LogRecord};
use strata::Rid;

use crate::catalog::TabMeta;
use crate::errors::{QueryError, QueryResult};
use crate::value::Value;

use super::ExecCtx;

pub struct InsertExecutor<'a> {
    ctx: &'a ExecCtx<'a>,
    tab: TabMeta,
    values: Vec<Value>,
    rid: Rid,
}

impl<'a> InsertExecutor<'a> {
    pub fn new(ctx: &'a ExecCtx<'a>, table: &str, values: Vec<Value>) -> QueryResult<Self> {
        let tab = ctx.sm.tab_meta(table)?;
        Ok(InsertExecutor {
            ctx,
            tab,
            values,
            rid: Rid::INVALID,
        })
    }

    pub fn execute(&mut self) -> QueryResult<usize> {
        if self.values.len() != self.tab.cols.len() {
            return Err(QueryError::InvalidValueCount);
        }
        let mut record = vec![0u8; self.tab.record_size()];
        for (value, col) in self.values.iter().zip(self.tab.cols.iter()) {
            let coerced = value.clone().coerce_to(col)?;
            record[col.offset..col.offset + col.len].copy_from_slice(&coerced.to_bytes(col.len)?);
        }

        // Uniqueness must be settled for every index before the first
        // entry goes in, or a late conflict leaves earlier indexes
        // inconsistent with the heap.
        for index in &self.tab.indexes {
            let key = index.key_from_record(&record);
            let tree = self.ctx.sm.index_tree(&index.tab_name, &index.col_names())?;
            if tree.contains(&key)? {
                return Err(QueryError::UniqueConstraint);
            }
        }

        let fh = self.ctx.sm.table_file(&self.tab.name)?;
        let rid = fh.insert_record(&record)?;
        self.ctx
            .lock
            .lock_exclusive_on_record(self.ctx.txn, rid, fh.fid())?;
        self.rid = rid;

        for index in &self.tab.indexes {
            let key = index.key_from_record(&record);
            let tree = self.ctx.sm.index_tree(&index.tab_name, &index.col_names())?;
            tree.insert_entry(&key, rid)?;
        }

        let mut log_record = LogRecord::new(
            self.ctx.txn.id(),
            self.ctx.txn.prev_lsn(),
            LogPayload::Insert {
                rid,
                value: record.clone(),
                table: self.tab.name.clone(),
            },
        );
        let lsn = self.ctx.log.add(&mut log_record)?;
        self.ctx.txn.set_prev_lsn(lsn);
        self.ctx.txn.append_write(WriteRecord::Insert {
            table: self.tab.name.clone(),
            rid,
        });
        fh.set_page_lsn(rid.page_no, lsn)?;
        Ok(1)
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }
}
