//! The portal: converts a planned statement into an executor tree,
//! taking the table-level locks the plan implies (IS for scans, IX for
//! DML with per-rid X locks), runs it to completion and renders the
//! result.

use strata::Rid;

use crate::errors::QueryResult;
use crate::executor::{
    DeleteExecutor, ExecCtx, Executor, IndexScanExecutor, InsertExecutor, NestedLoopJoinExecutor,
    ProjectionExecutor, SeqScanExecutor, SortExecutor, UpdateExecutor,
};
use crate::planner::{Plan, StmtPlan};
use crate::printer;
use crate::value::column_display;

pub enum PortalStmt<'a> {
    Select {
        root: Box<dyn Executor + 'a>,
        captions: Vec<String>,
    },
    Insert(InsertExecutor<'a>),
    Update(UpdateExecutor<'a>),
    Delete(DeleteExecutor<'a>),
}

/// Builds the executor tree for a plan node, locking scanned tables.
fn convert<'a>(plan: Plan, ctx: &'a ExecCtx<'a>) -> QueryResult<Box<dyn Executor + 'a>> {
    match plan {
        Plan::Projection {
            child,
            sel_cols,
            aggs,
            limit,
        } => Ok(Box::new(ProjectionExecutor::new(
            convert(*child, ctx)?,
            sel_cols,
            aggs,
            limit,
        )?)),
        Plan::Sort { child, order_by } => {
            Ok(Box::new(SortExecutor::new(convert(*child, ctx)?, order_by)))
        }
        Plan::Join { left, right, conds } => Ok(Box::new(NestedLoopJoinExecutor::new(
            convert(*left, ctx)?,
            convert(*right, ctx)?,
            conds,
        )?)),
        Plan::SeqScan { table, conds } => {
            let fh = ctx.sm.table_file(&table)?;
            ctx.lock.lock_is_on_table(ctx.txn, fh.fid())?;
            Ok(Box::new(SeqScanExecutor::new(ctx, &table, conds)?))
        }
        Plan::IndexScan {
            table,
            conds,
            index_cols,
        } => {
            let fh = ctx.sm.table_file(&table)?;
            ctx.lock.lock_is_on_table(ctx.txn, fh.fid())?;
            Ok(Box::new(IndexScanExecutor::new(
                ctx, &table, conds, index_cols,
            )?))
        }
    }
}

/// Runs the filter scan of a DML statement, X-locking every target rid.
fn collect_target_rids<'a>(
    scan: Plan,
    table: &str,
    ctx: &'a ExecCtx<'a>,
) -> QueryResult<Vec<Rid>> {
    let fh = ctx.sm.table_file(table)?;
    let mut exec = convert(scan, ctx)?;
    let mut rids = Vec::new();
    exec.begin()?;
    while !exec.is_end() {
        let rid = exec.rid();
        ctx.lock.lock_exclusive_on_record(ctx.txn, rid, fh.fid())?;
        rids.push(rid);
        exec.next()?;
    }
    Ok(rids)
}

pub fn start<'a>(plan: StmtPlan, ctx: &'a ExecCtx<'a>) -> QueryResult<PortalStmt<'a>> {
    match plan {
        StmtPlan::Select { plan, captions } => Ok(PortalStmt::Select {
            root: convert(plan, ctx)?,
            captions,
        }),
        StmtPlan::Insert { table, values } => {
            let fh = ctx.sm.table_file(&table)?;
            ctx.lock.lock_ix_on_table(ctx.txn, fh.fid())?;
            Ok(PortalStmt::Insert(InsertExecutor::new(ctx, &table, values)?))
        }
        StmtPlan::Update {
            table,
            set_clauses,
            scan,
        } => {
            let fh = ctx.sm.table_file(&table)?;
            ctx.lock.lock_ix_on_table(ctx.txn, fh.fid())?;
            let rids = collect_target_rids(scan, &table, ctx)?;
            Ok(PortalStmt::Update(UpdateExecutor::new(
                ctx,
                &table,
                set_clauses,
                rids,
            )?))
        }
        StmtPlan::Delete { table, scan } => {
            let fh = ctx.sm.table_file(&table)?;
            ctx.lock.lock_ix_on_table(ctx.txn, fh.fid())?;
            let rids = collect_target_rids(scan, &table, ctx)?;
            Ok(PortalStmt::Delete(DeleteExecutor::new(ctx, &table, rids)?))
        }
    }
}

/// Drains the iterator tree (or runs the DML executor) and returns the
/// client-facing text. Select results are mirrored to `output.txt`.
pub fn run<'a>(stmt: PortalStmt<'a>, ctx: &ExecCtx<'a>) -> QueryResult<String> {
    match stmt {
        PortalStmt::Select { mut root, captions } => {
            let mut rows = Vec::new();
            root.begin()?;
            while !root.is_end() {
                if let Some(record) = root.record()? {
                    let row: Vec<String> = root
                        .cols()
                        .iter()
                        .map(|col| column_display(col, &record.data))
                        .collect();
                    rows.push(row);
                }
                root.next()?;
            }
            let text = printer::render_table(&captions, &rows);
            ctx.sm.write_output(&text);
            Ok(text)
        }
        PortalStmt::Insert(mut exec) => {
            exec.execute()?;
            Ok(String::new())
        }
        PortalStmt::Update(mut exec) => {
            exec.execute()?;
            Ok(String::new())
        }
        PortalStmt::Delete(mut exec) => {
            exec.execute()?;
            Ok(String::new())
        }
    }
}
