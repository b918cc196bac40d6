//! Volcano-style executors. Every iterator exposes `begin`/`next`/
//! `is_end`/`record`; DML executors run to completion and report the
//! affected row count. Row-level locks are taken as rows are produced
//! or targeted, per strict 2PL.

mod delete;
mod index_scan;
mod insert;
mod join;
mod load;
mod projection;
mod seq_scan;
mod sort;
mod update;

pub use delete::DeleteExecutor;
pub use index_scan::IndexScanExecutor;
pub use insert::InsertExecutor;
pub use join::NestedLoopJoinExecutor;
pub use load::load_csv;
pub use projection::ProjectionExecutor;
pub use seq_scan::SeqScanExecutor;
pub use sort::SortExecutor;
pub use update::UpdateExecutor;

use std::sync::Arc;

use strata::lock_manager::LockManager;
use strata::transaction::Transaction;
use strata::wal::LogManager;
use strata::Rid;

use crate::catalog::ColMeta;
use crate::common::{CondRhs, Condition, TabCol};
use crate::errors::{QueryError, QueryResult};
use crate::schema::SchemaManager;
use crate::value::{compare_values, Value};

/// Everything a statement needs while executing: the schema manager,
/// the lock and log managers, and the owning transaction.
pub struct ExecCtx<'a> {
    pub sm: &'a SchemaManager,
    pub lock: &'a LockManager,
    pub log: &'a LogManager,
    pub txn: &'a Arc<Transaction>,
}

/// A materialized tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub data: Vec<u8>,
}

pub trait Executor {
    fn begin(&mut self) -> QueryResult<()>;
    fn next(&mut self) -> QueryResult<()>;
    fn is_end(&self) -> bool;
    /// The tuple at the current position, or `None` at the end.
    fn record(&mut self) -> QueryResult<Option<Record>>;
    fn cols(&self) -> &[ColMeta];
    fn tuple_len(&self) -> usize;
    /// The heap rid of the current tuple; only scans have one.
    fn rid(&self) -> Rid {
        Rid::INVALID
    }
}

pub(crate) fn get_col<'c>(cols: &'c [ColMeta], target: &TabCol) -> QueryResult<&'c ColMeta> {
    cols.iter()
        .find(|c| c.tab_name == target.tab_name && c.name == target.col_name)
        .ok_or_else(|| {
            QueryError::ColumnNotFound(format!("{}.{}", target.tab_name, target.col_name))
        })
}

/// Swaps conditions so the scanned table is always on the left side.
pub(crate) fn normalize_conds(table: &str, mut conds: Vec<Condition>) -> Vec<Condition> {
    for cond in conds.iter_mut() {
        if cond.lhs.tab_name != table {
            if let CondRhs::Col(rhs) = cond.rhs.clone() {
                if rhs.tab_name == table {
                    let old_lhs = std::mem::replace(&mut cond.lhs, rhs);
                    cond.rhs = CondRhs::Col(old_lhs);
                    cond.op = cond.op.swapped();
                }
            }
        }
    }
    conds
}

pub(crate) fn col_value(col: &ColMeta, record: &[u8]) -> Value {
    Value::from_bytes(col.col_type, &record[col.offset..col.offset + col.len])
}

/// Evaluates one condition against a record whose layout is `cols`.
pub(crate) fn eval_cond(cols: &[ColMeta], cond: &Condition, record: &[u8]) -> QueryResult<bool> {
    let lhs_col = get_col(cols, &cond.lhs)?;
    let lhs = col_value(lhs_col, record);
    let rhs = match &cond.rhs {
        CondRhs::Val(v) => v.clone(),
        CondRhs::Col(col) => {
            let rhs_col = get_col(cols, col)?;
            col_value(rhs_col, record)
        }
    };
    Ok(cond.op.eval(compare_values(&lhs, &rhs)))
}

pub(crate) fn eval_conds(
    cols: &[ColMeta],
    conds: &[Condition],
    record: &[u8],
) -> QueryResult<bool> {
    for cond in conds {
        if !eval_cond(cols, cond, record)? {
            return Ok(false);
        }
    }
    Ok(true)
}
