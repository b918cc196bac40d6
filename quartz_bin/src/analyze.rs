//! Semantic analysis: resolves the parsed AST against the catalog into
//! a `Query` with qualified columns and type-checked, coerced
//! condition values.

use crate::catalog::DbMeta;
use crate::common::{AggFunc, CondRhs, Condition, NamedAgg, SetClause, TabCol};
use crate::errors::{QueryError, QueryResult};
use crate::parser::{AggKind, ColRef, CondExpr, RhsExpr, SelectItem, SelectStmt, Statement};
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum Query {
    Select(SelectQuery),
    Insert(InsertQuery),
    Update(UpdateQuery),
    Delete(DeleteQuery),
}

#[derive(Debug, Clone)]
pub struct SelectQuery {
    pub tables: Vec<String>,
    pub sel_cols: Vec<TabCol>,
    pub aggs: Vec<NamedAgg>,
    pub conds: Vec<Condition>,
    pub order_by: Vec<(TabCol, bool)>,
    /// Negative means unbounded.
    pub limit: i64,
}

#[derive(Debug, Clone)]
pub struct InsertQuery {
    pub table: String,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct UpdateQuery {
    pub table: String,
    pub set_clauses: Vec<SetClause>,
    pub conds: Vec<Condition>,
}

#[derive(Debug, Clone)]
pub struct DeleteQuery {
    pub table: String,
    pub conds: Vec<Condition>,
}

/// Resolves a column reference against the visible tables.
fn resolve_col(meta: &DbMeta, tables: &[String], col: &ColRef) -> QueryResult<TabCol> {
    if let Some(table) = &col.table {
        if !tables.contains(table) {
            return Err(QueryError::TableNotFound(table.clone()));
        }
        meta.get_table(table)?.get_col(&col.column)?;
        return Ok(TabCol {
            tab_name: table.clone(),
            col_name: col.column.clone(),
        });
    }
    let mut owner = None;
    for table in tables {
        if meta.get_table(table)?.is_col(&col.column) {
            if owner.is_some() {
                return Err(QueryError::AmbiguousColumn(col.column.clone()));
            }
            owner = Some(table.clone());
        }
    }
    match owner {
        Some(tab_name) => Ok(TabCol {
            tab_name,
            col_name: col.column.clone(),
        }),
        None => Err(QueryError::ColumnNotFound(col.column.clone())),
    }
}

fn resolve_conds(
    meta: &DbMeta,
    tables: &[String],
    conds: Vec<CondExpr>,
) -> QueryResult<Vec<Condition>> {
    let mut out = Vec::with_capacity(conds.len());
    for cond in conds {
        let lhs = resolve_col(meta, tables, &cond.lhs)?;
        let lhs_col = meta.get_table(&lhs.tab_name)?.get_col(&lhs.col_name)?.clone();
        let rhs = match cond.rhs {
            RhsExpr::Lit(value) => CondRhs::Val(value.coerce_to(&lhs_col)?),
            RhsExpr::Col(col) => {
                let rhs = resolve_col(meta, tables, &col)?;
                let rhs_col = meta.get_table(&rhs.tab_name)?.get_col(&rhs.col_name)?;
                if rhs_col.col_type != lhs_col.col_type {
                    return Err(QueryError::IncompatibleType {
                        expected: lhs_col.col_type.name().to_string(),
                        found: rhs_col.col_type.name().to_string(),
                    });
                }
                CondRhs::Col(rhs)
            }
        };
        out.push(Condition {
            lhs,
            op: cond.op,
            rhs,
        });
    }
    Ok(out)
}

fn agg_display(kind: &AggKind, arg: Option<&TabCol>) -> String {
    let name = match kind {
        AggKind::Count => "COUNT",
        AggKind::Sum => "SUM",
        AggKind::Max => "MAX",
        AggKind::Min => "MIN",
    };
    match arg {
        Some(col) => format!("{}({})", name, col.col_name),
        None => format!("{}(*)", name),
    }
}

fn analyze_select(meta: &DbMeta, sel: SelectStmt) -> QueryResult<SelectQuery> {
    for table in &sel.tables {
        meta.get_table(table)?;
    }

    let mut sel_cols = Vec::new();
    let mut aggs = Vec::new();
    let mut has_plain = false;
    for item in &sel.items {
        match item {
            SelectItem::Wildcard => {
                has_plain = true;
                for table in &sel.tables {
                    for col in &meta.get_table(table)?.cols {
                        sel_cols.push(TabCol {
                            tab_name: table.clone(),
                            col_name: col.name.clone(),
                        });
                    }
                }
            }
            SelectItem::Col(col) => {
                has_plain = true;
                sel_cols.push(resolve_col(meta, &sel.tables, col)?);
            }
            SelectItem::Agg { kind, arg, alias } => {
                let arg = arg
                    .as_ref()
                    .map(|col| resolve_col(meta, &sel.tables, col))
                    .transpose()?;
                let func = match (kind, arg.clone()) {
                    (AggKind::Count, None) => AggFunc::CountStar,
                    (AggKind::Count, Some(col)) => AggFunc::Count(col),
                    (AggKind::Sum, Some(col)) => AggFunc::Sum(col),
                    (AggKind::Max, Some(col)) => AggFunc::Max(col),
                    (AggKind::Min, Some(col)) => AggFunc::Min(col),
                    _ => return Err(QueryError::Planning("aggregate requires a column".into())),
                };
                let out_name = alias
                    .clone()
                    .unwrap_or_else(|| agg_display(kind, func.arg()));
                aggs.push(NamedAgg { func, out_name });
            }
        }
    }
    if has_plain && !aggs.is_empty() {
        return Err(QueryError::Planning(
            "cannot mix aggregates with plain columns".into(),
        ));
    }

    let conds = resolve_conds(meta, &sel.tables, sel.conds)?;
    let order_by = sel
        .order_by
        .into_iter()
        .map(|(col, desc)| Ok((resolve_col(meta, &sel.tables, &col)?, desc)))
        .collect::<QueryResult<Vec<_>>>()?;

    Ok(SelectQuery {
        tables: sel.tables,
        sel_cols,
        aggs,
        conds,
        order_by,
        limit: sel.limit.unwrap_or(-1),
    })
}

/// Turns a parsed statement into a resolved query. DDL and utility
/// statements never reach this point.
pub fn analyze(meta: &DbMeta, stmt: Statement) -> QueryResult<Query> {
    match stmt {
        Statement::Select(sel) => Ok(Query::Select(analyze_select(meta, *sel)?)),
        Statement::Insert { table, values } => {
            meta.get_table(&table)?;
            Ok(Query::Insert(InsertQuery { table, values }))
        }
        Statement::Update { table, sets, conds } => {
            let tables = vec![table.clone()];
            let tab = meta.get_table(&table)?;
            let mut set_clauses = Vec::with_capacity(sets.len());
            for set in sets {
                tab.get_col(&set.column)?;
                set_clauses.push(SetClause {
                    col: TabCol {
                        tab_name: table.clone(),
                        col_name: set.column,
                    },
                    rhs: set.rhs,
                    add: set.add,
                });
            }
            let conds = resolve_conds(meta, &tables, conds)?;
            Ok(Query::Update(UpdateQuery {
                table,
                set_clauses,
                conds,
            }))
        }
        Statement::Delete { table, conds } => {
            meta.get_table(&table)?;
            let tables = vec![table.clone()];
            let conds = resolve_conds(meta, &tables, conds)?;
            Ok(Query::Delete(DeleteQuery { table, conds }))
        }
        other => Err(QueryError::Internal(format!(
            "statement is not analyzable: {:?}",
            other
        ))),
    }
}
