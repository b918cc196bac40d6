//! Index scan: builds composite low and high keys from the value
//! predicates over a prefix of the index columns (padding unconstrained
//! positions with type min/max), walks the leaf range, applies the
//! residual filter and S-locks each emitted row.

use std::cmp::Ordering;
use std::sync::Arc;

use strata::btree::{BPlusTree, IxScan};
use strata::heap::TableFile;
use strata::types::compare_value;
use strata::Rid;

use crate::catalog::{ColMeta, IndexMeta};
use crate::common::{CompOp, CondRhs, Condition};
use crate::errors::{QueryError, QueryResult};
use crate::value::{max_bytes, min_bytes};

use super::{eval_conds, normalize_conds, ExecCtx, Executor, Record};

pub struct IndexScanExecutor<'a> {
    ctx: &'a ExecCtx<'a>,
    fh: Arc<TableFile>,
    tree: Arc<BPlusTree>,
    index_meta: IndexMeta,
    cols: Vec<ColMeta>,
    len: usize,
    conds: Vec<Condition>,
    scan: Option<IxScan>,
    rid: Rid,
}

impl<'a> IndexScanExecutor<'a> {
    pub fn new(
        ctx: &'a ExecCtx<'a>,
        table: &str,
        conds: Vec<Condition>,
        index_cols: Vec<String>,
    ) -> QueryResult<Self> {
        let tab = ctx.sm.tab_meta(table)?;
        let fh = ctx.sm.table_file(table)?;
        let tree = ctx.sm.index_tree(table, &index_cols)?;
        let index_meta = tab.get_index_meta(&index_cols)?.clone();
        let len = tab.record_size();
        Ok(IndexScanExecutor {
            ctx,
            fh,
            tree,
            index_meta,
            cols: tab.cols,
            len,
            conds: normalize_conds(table, conds),
            scan: None,
            rid: Rid::INVALID,
        })
    }

    /// Fills one key column from the predicates on it. Returns whether
    /// the column is pinned by an equality (so the next column can
    /// continue the prefix).
    fn fill_key_col(
        &self,
        col: &ColMeta,
        low: &mut Vec<u8>,
        high: &mut Vec<u8>,
    ) -> QueryResult<bool> {
        let mut low_bytes = min_bytes(col.col_type, col.len);
        let mut high_bytes = max_bytes(col.col_type, col.len);
        for cond in &self.conds {
            if cond.lhs.col_name != col.name {
                continue;
            }
            let value = match &cond.rhs {
                CondRhs::Val(v) => v,
                CondRhs::Col(_) => continue,
            };
            let bytes = value.to_bytes(col.len)?;
            match cond.op {
                CompOp::Eq => {
                    low.extend_from_slice(&bytes);
                    high.extend_from_slice(&bytes);
                    return Ok(true);
                }
                CompOp::Lt | CompOp::Le => high_bytes = bytes,
                CompOp::Gt | CompOp::Ge => low_bytes = bytes,
                CompOp::Ne => {}
            }
        }
        low.extend_from_slice(&low_bytes);
        high.extend_from_slice(&high_bytes);
        Ok(false)
    }

    fn build_range(&self) -> QueryResult<(Vec<u8>, Vec<u8>)> {
        let mut low = Vec::with_capacity(self.index_meta.col_tot_len);
        let mut high = Vec::with_capacity(self.index_meta.col_tot_len);
        let mut open = false;
        for col in &self.index_meta.cols {
            if open {
                low.extend_from_slice(&min_bytes(col.col_type, col.len));
                high.extend_from_slice(&max_bytes(col.col_type, col.len));
                continue;
            }
            let pinned = self.fill_key_col(col, &mut low, &mut high)?;
            if !pinned {
                // A range predicate (or none) ends the usable prefix.
                open = true;
            }
        }
        Ok((low, high))
    }

    fn range_is_empty(&self, low: &[u8], high: &[u8]) -> bool {
        let mut offset = 0;
        for col in &self.index_meta.cols {
            let ord = compare_value(
                &low[offset..offset + col.len],
                &high[offset..offset + col.len],
                col.col_type,
            );
            match ord {
                Ordering::Less => return false,
                Ordering::Greater => return true,
                Ordering::Equal => offset += col.len,
            }
        }
        false
    }

    fn settle(&mut self) -> QueryResult<()> {
        let scan = self
            .scan
            .as_mut()
            .ok_or_else(|| QueryError::Internal("index scan not started".into()))?;
        while !scan.is_end() {
            let rid = scan.rid()?;
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

impl<'a> Executor for IndexScanExecutor<'a> {
    fn begin(&mut self) -> QueryResult<()> {
        let (low, high) = self.build_range()?;
        let scan = if self.range_is_empty(&low, &high) {
            let end = self.tree.leaf_end()?;
            IxScan::new(&self.tree, end, end)
        } else {
            let lower = self.tree.lower_bound(&low)?;
            let upper = self.tree.upper_bound(&high)?;
            IxScan::new(&self.tree, lower, upper)
        };
        self.scan = Some(scan);
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
