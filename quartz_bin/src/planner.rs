//! The planner: turns a resolved `Query` into a `Plan` tree. The only
//! optimization performed is index selection: a scan becomes an index
//! scan when value predicates constrain a prefix of some index's
//! columns. Multi-table FROM lists become left-deep nested-loop join
//! trees with single-table predicates pushed down to their scans.

use crate::analyze::{DeleteQuery, InsertQuery, Query, SelectQuery, UpdateQuery};
use crate::catalog::{DbMeta, TabMeta};
use crate::common::{CompOp, CondRhs, Condition, NamedAgg, SetClause, TabCol};
use crate::errors::{QueryError, QueryResult};
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum Plan {
    Projection {
        child: Box<Plan>,
        sel_cols: Vec<TabCol>,
        aggs: Vec<NamedAgg>,
        limit: i64,
    },
    Sort {
        child: Box<Plan>,
        order_by: Vec<(TabCol, bool)>,
    },
    Join {
        left: Box<Plan>,
        right: Box<Plan>,
        conds: Vec<Condition>,
    },
    SeqScan {
        table: String,
        conds: Vec<Condition>,
    },
    IndexScan {
        table: String,
        conds: Vec<Condition>,
        index_cols: Vec<String>,
    },
}

/// A fully planned statement ready for the portal.
#[derive(Debug, Clone)]
pub enum StmtPlan {
    Select {
        plan: Plan,
        captions: Vec<String>,
    },
    Insert {
        table: String,
        values: Vec<Value>,
    },
    Update {
        table: String,
        set_clauses: Vec<SetClause>,
        scan: Plan,
    },
    Delete {
        table: String,
        scan: Plan,
    },
}

pub fn plan_query(meta: &DbMeta, query: Query) -> QueryResult<StmtPlan> {
    match query {
        Query::Select(sel) => plan_select(meta, sel),
        Query::Insert(InsertQuery { table, values }) => Ok(StmtPlan::Insert { table, values }),
        Query::Update(UpdateQuery {
            table,
            set_clauses,
            conds,
        }) => {
            let scan = make_scan(meta.get_table(&table)?, conds);
            Ok(StmtPlan::Update {
                table,
                set_clauses,
                scan,
            })
        }
        Query::Delete(DeleteQuery { table, conds }) => {
            let scan = make_scan(meta.get_table(&table)?, conds);
            Ok(StmtPlan::Delete { table, scan })
        }
    }
}

fn cond_tables(cond: &Condition) -> (String, Option<String>) {
    let rhs = match &cond.rhs {
        CondRhs::Col(col) => Some(col.tab_name.clone()),
        CondRhs::Val(_) => None,
    };
    (cond.lhs.tab_name.clone(), rhs)
}

/// True when every table the condition references is in `joined`.
fn covered(cond: &Condition, joined: &[String]) -> bool {
    let (lhs, rhs) = cond_tables(cond);
    joined.contains(&lhs) && rhs.map_or(true, |t| joined.contains(&t))
}

fn plan_select(meta: &DbMeta, sel: SelectQuery) -> QueryResult<StmtPlan> {
    // Partition predicates: single-table ones go to their scan, the
    // rest wait for the join that covers both sides.
    let mut scan_conds: Vec<(String, Vec<Condition>)> = sel
        .tables
        .iter()
        .map(|t| (t.clone(), Vec::new()))
        .collect();
    let mut join_conds: Vec<Condition> = Vec::new();
    for cond in sel.conds {
        let (lhs_tab, rhs_tab) = cond_tables(&cond);
        let single = rhs_tab.as_deref().map_or(true, |t| t == lhs_tab);
        if single {
            let slot = scan_conds
                .iter_mut()
                .find(|(t, _)| *t == lhs_tab)
                .ok_or_else(|| QueryError::TableNotFound(lhs_tab.clone()))?;
            slot.1.push(cond);
        } else {
            join_conds.push(cond);
        }
    }

    let mut plans = scan_conds
        .into_iter()
        .map(|(table, conds)| Ok(make_scan(meta.get_table(&table)?, conds)))
        .collect::<QueryResult<Vec<Plan>>>()?;

    let mut plan = plans.remove(0);
    let mut joined = vec![sel.tables[0].clone()];
    for (i, right) in plans.into_iter().enumerate() {
        let table = sel.tables[i + 1].clone();
        joined.push(table);
        let (now_covered, rest): (Vec<Condition>, Vec<Condition>) =
            join_conds.into_iter().partition(|c| covered(c, &joined));
        join_conds = rest;
        plan = Plan::Join {
            left: Box::new(plan),
            right: Box::new(right),
            conds: now_covered,
        };
    }
    if !join_conds.is_empty() {
        return Err(QueryError::Planning(
            "condition references a table outside the FROM list".into(),
        ));
    }

    if !sel.order_by.is_empty() {
        plan = Plan::Sort {
            child: Box::new(plan),
            order_by: sel.order_by,
        };
    }

    let captions = if sel.aggs.is_empty() {
        sel.sel_cols.iter().map(|c| c.col_name.clone()).collect()
    } else {
        sel.aggs.iter().map(|a| a.out_name.clone()).collect()
    };

    Ok(StmtPlan::Select {
        plan: Plan::Projection {
            child: Box::new(plan),
            sel_cols: sel.sel_cols,
            aggs: sel.aggs,
            limit: sel.limit,
        },
        captions,
    })
}

/// Chooses between a sequential scan and an index scan: picks the
/// index whose column prefix is constrained by the longest run of
/// value predicates.
fn make_scan(tab: &TabMeta, conds: Vec<Condition>) -> Plan {
    let mut best: Option<(usize, Vec<String>)> = None;
    for index in &tab.indexes {
        let mut prefix = 0;
        for col in &index.cols {
            let constrained = conds.iter().any(|c| {
                c.lhs.col_name == col.name
                    && c.lhs.tab_name == tab.name
                    && c.rhs_is_val()
                    && c.op != CompOp::Ne
            });
            if constrained {
                prefix += 1;
            } else {
                break;
            }
        }
        if prefix > 0 && best.as_ref().map_or(true, |(p, _)| prefix > *p) {
            best = Some((prefix, index.col_names()));
        }
    }
    match best {
        Some((_, index_cols)) => Plan::IndexScan {
            table: tab.name.clone(),
            conds,
            index_cols,
        },
        None => Plan::SeqScan {
            table: tab.name.clone(),
            conds,
        },
    }
}
