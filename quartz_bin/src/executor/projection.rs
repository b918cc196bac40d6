//! Projection, aggregation and limit. Without aggregates the executor
//! re-lays the configured columns of each child tuple; with aggregates
//! it drains the child and emits a single row of per-function results.
//! A negative limit means unbounded.

use strata::types::ColType;

use crate::catalog::ColMeta;
use crate::common::{AggFunc, NamedAgg, TabCol};
use crate::errors::{QueryError, QueryResult};
use crate::value::{compare_values, Value};

use super::{col_value, get_col, Executor, Record};

pub struct ProjectionExecutor<'a> {
    child: Box<dyn Executor + 'a>,
    /// Output layout; for aggregates these are synthesized columns.
    out_cols: Vec<ColMeta>,
    /// (source column in the child, output column) pairs.
    proj: Vec<(ColMeta, ColMeta)>,
    aggs: Vec<NamedAgg>,
    limit: i64,
    emitted: i64,
    agg_row: Option<Record>,
    agg_done: bool,
}

struct AggState {
    func: AggFunc,
    count: i64,
    sum_int: i64,
    sum_float: f64,
    extreme: Option<Value>,
}

impl AggState {
    fn new(func: AggFunc) -> Self {
        AggState {
            func,
            count: 0,
            sum_int: 0,
            sum_float: 0.0,
            extreme: None,
        }
    }

    fn feed(&mut self, cols: &[ColMeta], record: &[u8]) -> QueryResult<()> {
        self.count += 1;
        let arg = match self.func.arg() {
            Some(arg) => arg,
            None => return Ok(()),
        };
        let value = col_value(get_col(cols, arg)?, record);
        match &self.func {
            AggFunc::Sum(_) => match value {
                Value::Int(v) => self.sum_int += v as i64,
                Value::BigInt(v) => self.sum_int += v,
                Value::Float(v) => self.sum_float += v as f64,
                other => {
                    return Err(QueryError::IncompatibleType {
                        expected: "numeric".into(),
                        found: other.col_type().name().into(),
                    })
                }
            },
            AggFunc::Max(_) => {
                let better = match &self.extreme {
                    Some(best) => compare_values(&value, best) == std::cmp::Ordering::Greater,
                    None => true,
                };
                if better {
                    self.extreme = Some(value);
                }
            }
            AggFunc::Min(_) => {
                let better = match &self.extreme {
                    Some(best) => compare_values(&value, best) == std::cmp::Ordering::Less,
                    None => true,
                };
                if better {
                    self.extreme = Some(value);
                }
            }
            AggFunc::Count(_) | AggFunc::CountStar => {}
        }
        Ok(())
    }

    fn result(&self, out_type: ColType) -> Value {
        match &self.func {
            AggFunc::CountStar | AggFunc::Count(_) => Value::Int(self.count as i32),
            AggFunc::Sum(_) => match out_type {
                ColType::Int => Value::Int(self.sum_int as i32),
                ColType::BigInt => Value::BigInt(self.sum_int),
                _ => Value::Float(self.sum_float as f32),
            },
            AggFunc::Max(_) | AggFunc::Min(_) => match (&self.extreme, out_type) {
                (Some(v), _) => v.clone(),
                (None, ColType::Int) => Value::Int(0),
                (None, ColType::BigInt) => Value::BigInt(0),
                (None, ColType::Float) => Value::Float(0.0),
                (None, _) => Value::Str(String::new()),
            },
        }
    }
}

impl<'a> ProjectionExecutor<'a> {
    pub fn new(
        child: Box<dyn Executor + 'a>,
        sel_cols: Vec<TabCol>,
        aggs: Vec<NamedAgg>,
        limit: i64,
    ) -> QueryResult<Self> {
        let mut out_cols = Vec::new();
        let mut proj = Vec::new();
        if aggs.is_empty() {
            let mut offset = 0;
            for sel in &sel_cols {
                let src = get_col(child.cols(), sel)?.clone();
                let mut out = src.clone();
                out.offset = offset;
                offset += out.len;
                proj.push((src, out.clone()));
                out_cols.push(out);
            }
        } else {
            let mut offset = 0;
            for agg in &aggs {
                let (col_type, len) = match &agg.func {
                    AggFunc::CountStar | AggFunc::Count(_) => (ColType::Int, 4),
                    other => {
                        let arg = other.arg().expect("aggregate with argument");
                        let src = get_col(child.cols(), arg)?;
                        (src.col_type, src.len)
                    }
                };
                out_cols.push(ColMeta {
                    tab_name: String::new(),
                    name: agg.out_name.clone(),
                    col_type,
                    len,
                    offset,
                    index: false,
                });
                offset += len;
            }
        }
        Ok(ProjectionExecutor {
            child,
            out_cols,
            proj,
            aggs,
            limit,
            emitted: 0,
            agg_row: None,
            agg_done: false,
        })
    }

    fn compute_aggregates(&mut self) -> QueryResult<()> {
        let mut states: Vec<AggState> = self
            .aggs
            .iter()
            .map(|agg| AggState::new(agg.func.clone()))
            .collect();
        while !self.child.is_end() {
            if let Some(record) = self.child.record()? {
                for state in states.iter_mut() {
                    state.feed(self.child.cols(), &record.data)?;
                }
            }
            self.child.next()?;
        }

        let mut data = vec![0u8; self.out_cols.iter().map(|c| c.len).sum()];
        for (state, col) in states.iter().zip(self.out_cols.iter()) {
            let bytes = state.result(col.col_type).to_bytes(col.len)?;
            data[col.offset..col.offset + col.len].copy_from_slice(&bytes);
        }
        self.agg_row = Some(Record { data });
        Ok(())
    }

    fn limit_reached(&self) -> bool {
        self.limit >= 0 && self.emitted >= self.limit
    }
}

impl<'a> Executor for ProjectionExecutor<'a> {
    fn begin(&mut self) -> QueryResult<()> {
        self.emitted = 0;
        self.agg_done = false;
        self.agg_row = None;
        self.child.begin()?;
        if !self.aggs.is_empty() {
            self.compute_aggregates()?;
        }
        Ok(())
    }

    fn next(&mut self) -> QueryResult<()> {
        if !self.aggs.is_empty() {
            self.agg_done = true;
            return Ok(());
        }
        self.emitted += 1;
        self.child.next()
    }

    fn is_end(&self) -> bool {
        if !self.aggs.is_empty() {
            return self.agg_done || self.limit == 0;
        }
        self.limit_reached() || self.child.is_end()
    }

    fn record(&mut self) -> QueryResult<Option<Record>> {
        if self.is_end() {
            return Ok(None);
        }
        if !self.aggs.is_empty() {
            return Ok(self.agg_row.clone());
        }
        let child_record = match self.child.record()? {
            Some(r) => r,
            None => return Ok(None),
        };
        let mut data = vec![0u8; self.tuple_len()];
        for (src, out) in &self.proj {
            data[out.offset..out.offset + out.len]
                .copy_from_slice(&child_record.data[src.offset..src.offset + src.len]);
        }
        Ok(Some(Record { data }))
    }

    fn cols(&self) -> &[ColMeta] {
        &self.out_cols
    }

    fn tuple_len(&self) -> usize {
        self.out_cols.iter().map(|c| c.len).sum()
    }
}
