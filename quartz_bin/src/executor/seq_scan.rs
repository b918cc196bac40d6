//! Sequential scan: walks the heap in page-then-slot order, applies
//! the filter, and S-locks each qualifying row before emitting it.

use std::sync::Arc;

use strata::heap::{TableFile, TableScan};
use strata::Rid;

use crate::catalog::ColMeta;
use crate::common::Condition;
use crate::errors::QueryResult;

use super::{eval_conds, normalize_conds, ExecCtx, Executor, Record};

pub struct SeqScanExecutor<'a> {
    ctx: &'a ExecCtx<'a>,
    fh: Arc<TableFile>,
    cols: Vec<ColMeta>,
    len: usize,
    conds: Vec<Condition>,
    scan: Option<TableScan>,
    rid: Rid,
}

impl<'a> SeqScanExecutor<'a> {
    pub fn new(ctx: &'a ExecCtx<'a>, table: &str, conds: Vec<Condition>) -> QueryResult<Self> {
        let tab = ctx.sm.tab_meta(table)?;
        let fh = ctx.sm.table_file(table)?;
        let len = tab.record_size();
        Ok(SeqScanExecutor {
            ctx,
            fh,
            cols: tab.cols,
            len,
            conds: normalize_conds(table, conds),
            scan: None,
            rid: Rid::INVALID,
        })
    }

    /// Advances the underlying scan until a row passes the filter,
    /// locking it shared.
    fn settle(&mut self) -> QueryResult<()> {
        let scan = self
            .scan
            .as_mut()
            .ok_or_else(|| crate::errors::QueryError::Internal("scan not started".into()))?;
        while !scan.is_end() {
            let rid = scan.rid();
            let record = self.fh.get_record(rid)?;
            if eval_conds(&self.cols, &self.conds, &record)? {
                self.ctx
                    .lock
                    .lock_shared_on_record(self.ctx.txn, rid, self.fh.fid())?;
                self.rid = rid;
                return Ok(());
            }
            scan.next()?;
        }
        self.rid = Rid::INVALID;
        Ok(())
    }
}

impl<'a> Executor for SeqScanExecutor<'a> {
    fn begin(&mut self) -> QueryResult<()> {
        self.scan = Some(TableScan::new(&self.fh)?);
        self.settle()
    }

    fn next(&mut self) -> QueryResult<()> {
        if let Some(scan) = self.scan.as_mut() {
            scan.next()?;
        }
        self.settle()
    }

    fn is_end(&self) -> bool {
        self.scan.as_ref().map_or(true, |s| s.is_end())
    }

    fn record(&mut self) -> QueryResult<Option<Record>> {
        if self.is_end() {
            return Ok(None);
        }
        Ok(Some(Record {
            data: self.fh.get_record(self.rid)?,
        }))
    }

    fn cols(&self) -> &[ColMeta] {
        &self.cols
    }

    fn tuple_len(&self) -> usize {
        self.len
    }

    fn rid(&self) -> Rid {
        self.rid
    }
}
