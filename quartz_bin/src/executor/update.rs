//! Update: for each X-locked target rid, applies the SET clauses
//! (including `col = col + literal` arithmetic) to a copy of the
//! record, swaps changed index keys after re-checking uniqueness, and
//! logs before- and after-images.

use strata::transaction::WriteRecord;
use strata::wal::{LogPayload, LogRecord};
use strata::Rid;

use crate::catalog::{ColMeta, TabMeta};
use crate::common::SetClause;
use crate::errors::{QueryError, QueryResult};
use crate::value::Value;

use super::{col_value, ExecCtx};

pub struct UpdateExecutor<'a> {
    ctx: &'a ExecCtx<'a>,
    tab: TabMeta,
    set_clauses: Vec<SetClause>,
    rids: Vec<Rid>,
}

impl<'a> UpdateExecutor<'a> {
    pub fn new(
        ctx: &'a ExecCtx<'a>,
        table: &str,
        set_clauses: Vec<SetClause>,
        rids: Vec<Rid>,
    ) -> QueryResult<Self> {
        let tab = ctx.sm.tab_meta(table)?;
        Ok(UpdateExecutor {
            ctx,
            tab,
            set_clauses,
            rids,
        })
    }

    fn apply_set(col: &ColMeta, clause: &SetClause, record: &mut [u8]) -> QueryResult<()> {
        let new_value = if clause.add {
            let current = col_value(col, record);
            match (current, clause.rhs.clone()) {
                (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(b)),
                (Value::BigInt(a), Value::Int(b)) => Value::BigInt(a.wrapping_add(b as i64)),
                (Value::BigInt(a), Value::BigInt(b)) => Value::BigInt(a.wrapping_add(b)),
                (Value::Float(a), Value::Int(b)) => Value::Float(a + b as f32),
                (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
                (current, rhs) => {
                    return Err(QueryError::IncompatibleType {
                        expected: current.col_type().name().into(),
                        found: rhs.col_type().name().into(),
                    })
                }
            }
        } else {
            clause.rhs.clone().coerce_to(col)?
        };
        record[col.offset..col.offset + col.len].copy_from_slice(&new_value.to_bytes(col.len)?);
        Ok(())
    }

    pub fn execute(&mut self) -> QueryResult<usize> {
        let fh = self.ctx.sm.table_file(&self.tab.name)?;
        for rid in self.rids.clone() {
            let before = fh.get_record(rid)?;
            let mut after = before.clone();
            for clause in &self.set_clauses {
                let col = self.tab.get_col(&clause.col.col_name)?.clone();
                Self::apply_set(&col, clause, &mut after)?;
            }

            // Unique checks first, across all indexes whose key moved.
            for index in &self.tab.indexes {
                let old_key = index.key_from_record(&before);
                let new_key = index.key_from_record(&after);
                if old_key != new_key {
                    let tree = self.ctx.sm.index_tree(&index.tab_name, &index.col_names())?;
                    if tree.contains(&new_key)? {
                        return Err(QueryError::UniqueConstraint);
                    }
                }
            }

            for index in &self.tab.indexes {
                let old_key = index.key_from_record(&before);
                let new_key = index.key_from_record(&after);
                if old_key != new_key {
                    let tree = self.ctx.sm.index_tree(&index.tab_name, &index.col_names())?;
                    tree.delete_entry(&old_key)?;
                    tree.insert_entry(&new_key, rid)?;
                }
            }

            fh.update_record(rid, &after)?;

            let mut log_record = LogRecord::new(
                self.ctx.txn.id(),
                self.ctx.txn.prev_lsn(),
                LogPayload::Update {
                    rid,
                    after: after.clone(),
                    before: before.clone(),
                    table: self.tab.name.clone(),
                },
            );
            let lsn = self.ctx.log.add(&mut log_record)?;
            self.ctx.txn.set_prev_lsn(lsn);
            self.ctx.txn.append_write(WriteRecord::Update {
                table: self.tab.name.clone(),
                rid,
                record: before,
            });
            fh.set_page_lsn(rid.page_no, lsn)?;
        }
        Ok(self.rids.len())
    }
}
