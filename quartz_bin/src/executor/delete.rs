//! Delete: for each X-locked target rid, removes the index entries and
//! the heap record, logging the before-image for undo.

use strata::transaction::WriteRecord;
use strata::wal::{LogPayload, LogRecord};
use strata::Rid;

use crate::catalog::TabMeta;
use crate::errors::QueryResult;

use super::ExecCtx;

pub struct DeleteExecutor<'a> {
    ctx: &'a ExecCtx<'a>,
    tab: TabMeta,
    rids: Vec<Rid>,
}

impl<'a> DeleteExecutor<'a> {
    pub fn new(ctx: &'a ExecCtx<'a>, table: &str, rids: Vec<Rid>) -> QueryResult<Self> {
        let tab = ctx.sm.tab_meta(table)?;
        Ok(DeleteExecutor { ctx, tab, rids })
    }

    pub fn execute(&mut self) -> QueryResult<usize> {
        let fh = self.ctx.sm.table_file(&self.tab.name)?;
        for rid in self.rids.clone() {
            let record = fh.get_record(rid)?;

            for index in &self.tab.indexes {
                let key = index.key_from_record(&record);
                let tree = self.ctx.sm.index_tree(&index.tab_name, &index.col_names())?;
                tree.delete_entry(&key)?;
            }
            fh.delete_record(rid)?;

            let mut log_record = LogRecord::new(
                self.ctx.txn.id(),
                self.ctx.txn.prev_lsn(),
                LogPayload::Delete {
                    rid,
                    value: record.clone(),
                    table: self.tab.name.clone(),
                },
            );
            let lsn = self.ctx.log.add(&mut log_record)?;
            self.ctx.txn.set_prev_lsn(lsn);
            self.ctx.txn.append_write(WriteRecord::Delete {
                table: self.tab.name.clone(),
                rid,
                record,
            });
            fh.set_page_lsn(rid.page_no, lsn)?;
        }
        Ok(self.rids.len())
    }
}
