//! Blocked nested-loop join: buffers up to `JOIN_BUFFER_SIZE` tuples
//! from the left child, streams the right child against the buffer,
//! and refills the buffer from the left when the right side exhausts.
//! Join conditions are normalized so the left side of each condition
//! resolves in the left child and the right side in the right child.

use crate::catalog::ColMeta;
use crate::common::{CondRhs, Condition};
use crate::errors::QueryResult;
use crate::value::compare_values;

use super::{col_value, get_col, Executor, Record};

const JOIN_BUFFER_SIZE: usize = 30000;

pub struct NestedLoopJoinExecutor<'a> {
    left: Box<dyn Executor + 'a>,
    right: Box<dyn Executor + 'a>,
    cols: Vec<ColMeta>,
    len: usize,
    conds: Vec<Condition>,
    buffer: Vec<Record>,
    buffer_idx: usize,
    cur_right: Option<Record>,
    current: Option<Record>,
    left_drained: bool,
}

impl<'a> NestedLoopJoinExecutor<'a> {
    pub fn new(
        left: Box<dyn Executor + 'a>,
        right: Box<dyn Executor + 'a>,
        conds: Vec<Condition>,
    ) -> QueryResult<Self> {
        let mut cols = left.cols().to_vec();
        let left_len = left.tuple_len();
        for col in right.cols() {
            let mut col = col.clone();
            col.offset += left_len;
            cols.push(col);
        }
        let len = left_len + right.tuple_len();

        // Make each condition's left side resolvable in the left child.
        let mut normalized = Vec::with_capacity(conds.len());
        for mut cond in conds {
            if get_col(left.cols(), &cond.lhs).is_err() {
                if let CondRhs::Col(rhs) = cond.rhs.clone() {
                    let old_lhs = std::mem::replace(&mut cond.lhs, rhs);
                    cond.rhs = CondRhs::Col(old_lhs);
                    cond.op = cond.op.swapped();
                }
            }
            normalized.push(cond);
        }

        Ok(NestedLoopJoinExecutor {
            left,
            right,
            cols,
            len,
            conds: normalized,
            buffer: Vec::new(),
            buffer_idx: 0,
            cur_right: None,
            current: None,
            left_drained: false,
        })
    }

    fn fill_buffer(&mut self) -> QueryResult<()> {
        self.buffer.clear();
        self.buffer_idx = 0;
        while !self.left.is_end() && self.buffer.len() < JOIN_BUFFER_SIZE {
            if let Some(record) = self.left.record()? {
                self.buffer.push(record);
            }
            self.left.next()?;
        }
        if self.left.is_end() {
            self.left_drained = true;
        }
        Ok(())
    }

    fn matches(&self, left_rec: &Record, right_rec: &Record) -> QueryResult<bool> {
        for cond in &self.conds {
            let lhs_col = get_col(self.left.cols(), &cond.lhs)?;
            let lhs = col_value(lhs_col, &left_rec.data);
            let rhs = match &cond.rhs {
                CondRhs::Val(v) => v.clone(),
                CondRhs::Col(col) => {
                    let rhs_col = get_col(self.right.cols(), col)?;
                    col_value(rhs_col, &right_rec.data)
                }
            };
            if !cond.op.eval(compare_values(&lhs, &rhs)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn advance(&mut self) -> QueryResult<()> {
        self.current = None;
        if self.buffer.is_empty() {
            return Ok(());
        }
        loop {
            let right_rec = match self.cur_right.clone() {
                Some(r) => r,
                None => return Ok(()),
            };
            while self.buffer_idx < self.buffer.len() {
                let idx = self.buffer_idx;
                self.buffer_idx += 1;
                if self.matches(&self.buffer[idx], &right_rec)? {
                    let mut data = self.buffer[idx].data.clone();
                    data.extend_from_slice(&right_rec.data);
                    self.current = Some(Record { data });
                    return Ok(());
                }
            }

            self.right.next()?;
            if self.right.is_end() {
                // The right side has seen this whole left block; move
                // on to the next block and rewind the right child.
                if self.left_drained {
                    return Ok(());
                }
                self.fill_buffer()?;
                if self.buffer.is_empty() {
                    return Ok(());
                }
                self.right.begin()?;
                if self.right.is_end() {
                    return Ok(());
                }
            }
            self.cur_right = self.right.record()?;
            self.buffer_idx = 0;
        }
    }
}

impl<'a> Executor for NestedLoopJoinExecutor<'a> {
    fn begin(&mut self) -> QueryResult<()> {
        self.left_drained = false;
        self.right.begin()?;
        if self.right.is_end() {
            self.current = None;
            return Ok(());
        }
        self.cur_right = self.right.record()?;
        self.left.begin()?;
        self.fill_buffer()?;
        self.advance()
    }

    fn next(&mut self) -> QueryResult<()> {
        self.advance()
    }

    fn is_end(&self) -> bool {
        self.current.is_none()
    }

    fn record(&mut self) -> QueryResult<Option<Record>> {
        Ok(self.current.clone())
    }

    fn cols(&self) -> &[ColMeta] {
        &self.cols
    }

    fn tuple_len(&self) -> usize {
        self.len
    }
}
