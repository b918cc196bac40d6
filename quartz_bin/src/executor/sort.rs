//! Sort: materializes the child, orders by the configured columns with
//! a stable multi-key comparator, and emits in order.

use crate::catalog::ColMeta;
use crate::common::TabCol;
use crate::errors::QueryResult;
use crate::value::compare_values;

use super::{col_value, get_col, Executor, Record};

pub struct SortExecutor<'a> {
    child: Box<dyn Executor + 'a>,
    order_by: Vec<(TabCol, bool)>,
    tuples: Vec<Record>,
    pos: usize,
}

impl<'a> SortExecutor<'a> {
    pub fn new(child: Box<dyn Executor + 'a>, order_by: Vec<(TabCol, bool)>) -> Self {
        SortExecutor {
            child,
            order_by,
            tuples: Vec::new(),
            pos: 0,
        }
    }
}

impl<'a> Executor for SortExecutor<'a> {
    fn begin(&mut self) -> QueryResult<()> {
        self.tuples.clear();
        self.pos = 0;
        self.child.begin()?;
        while !self.child.is_end() {
            if let Some(record) = self.child.record()? {
                self.tuples.push(record);
            }
            self.child.next()?;
        }

        let mut sort_cols = Vec::with_capacity(self.order_by.len());
        for (col, desc) in &self.order_by {
            sort_cols.push((get_col(self.child.cols(), col)?.clone(), *desc));
        }
        self.tuples.sort_by(|a, b| {
            for (col, desc) in &sort_cols {
                let ord = compare_values(&col_value(col, &a.data), &col_value(col, &b.data));
                if ord != std::cmp::Ordering::Equal {
                    return if *desc { ord.reverse() } else { ord };
                }
            }
            std::cmp::Ordering::Equal
        });
        Ok(())
    }

    fn next(&mut self) -> QueryResult<()> {
        if self.pos < self.tuples.len() {
            self.pos += 1;
        }
        Ok(())
    }

    fn is_end(&self) -> bool {
        self.pos >= self.tuples.len()
    }

    fn record(&mut self) -> QueryResult<Option<Record>> {
        Ok(self.tuples.get(self.pos).cloned())
    }

    fn cols(&self) -> &[ColMeta] {
        self.child.cols()
    }

    fn tuple_len(&self) -> usize {
        self.child.tuple_len()
    }
}
