//! Range scan over the leaf chain: advances slot by slot within a
//! leaf, follows `next_leaf` at the boundary, and stops at the end
//! position. Pages are pinned only while advancing.

use std::sync::Arc;

use crate::errors::StorageResult;
use crate::Rid;

use super::{BPlusTree, Iid};

pub struct IxScan {
    tree: Arc<BPlusTree>,
    iid: Iid,
    end: Iid,
}

impl IxScan {
    pub fn new(tree: &Arc<BPlusTree>, lower: Iid, upper: Iid) -> IxScan {
        IxScan {
            tree: tree.clone(),
            iid: lower,
            end: upper,
        }
    }

    pub fn is_end(&self) -> bool {
        self.iid == self.end
    }

    pub fn iid(&self) -> Iid {
        self.iid
    }

    pub fn rid(&self) -> StorageResult<Rid> {
        self.tree.get_rid(self.iid)
    }

    pub fn next(&mut self) -> StorageResult<()> {
        if self.is_end() {
            return Ok(());
        }
        self.iid.slot_no += 1;
        if self.iid.page_no != self.tree.last_leaf()
            && self.iid.slot_no as usize >= self.tree.leaf_size(self.iid.page_no)?
        {
            self.iid.page_no = self.tree.leaf_next(self.iid.page_no)?;
            self.iid.slot_no = 0;
        }
        Ok(())
    }
}
