//! The clustered B+-tree index: a composite fixed-width key maps to a
//! heap rid. Page 0 of an index file is the file header, page 1 is the
//! sentinel terminating the doubly-linked leaf list in both directions,
//! page 2 the initial root. Every public mutator serializes on the root
//! latch and pins each touched node for the duration of the operation.

mod node;
mod scan;

pub use scan::IxScan;

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::BufMut;
use log::debug;

use crate::buffer_pool::BufferPoolManager;
use crate::disk::DiskManager;
use crate::errors::{StorageError, StorageResult};
use crate::types::{compare_keys, ColType};
use crate::{FileId, PageId, PageNo, Rid, NO_PAGE, PAGE_SIZE};

use node::{NodeHandle, NODE_HDR_SIZE, OFF_IS_LEAF, OFF_NEXT_FREE, OFF_NEXT_LEAF, OFF_NUM_KEY, OFF_PARENT, OFF_PREV_LEAF};

pub const FILE_HDR_PAGE: PageNo = 0;
/// The sentinel page closing the leaf chain at both ends.
pub const LEAF_SENTINEL_PAGE: PageNo = 1;
pub const INIT_ROOT_PAGE: PageNo = 2;

/// A position inside a leaf node; `slot_no == num_key` of the last leaf
/// is the one-past-the-end position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iid {
    pub page_no: PageNo,
    pub slot_no: i32,
}

/// The immutable shape of an index: column types, widths and the node
/// fan-out derived from them.
#[derive(Debug, Clone)]
pub struct KeySchema {
    pub col_types: Vec<ColType>,
    pub col_lens: Vec<usize>,
    pub col_tot_len: usize,
    pub max_size: usize,
}

impl KeySchema {
    fn new(cols: &[(ColType, usize)]) -> StorageResult<KeySchema> {
        let col_types: Vec<ColType> = cols.iter().map(|(t, _)| *t).collect();
        let col_lens: Vec<usize> = cols.iter().map(|(_, l)| *l).collect();
        let col_tot_len: usize = col_lens.iter().sum();
        let max_size = (PAGE_SIZE - NODE_HDR_SIZE) / (col_tot_len + 8);
        if max_size < 4 {
            return Err(StorageError::Internal(format!(
                "index key of {} bytes is too wide for a page",
                col_tot_len
            )));
        }
        Ok(KeySchema {
            col_types,
            col_lens,
            col_tot_len,
            max_size,
        })
    }

    fn min_size(&self) -> usize {
        self.max_size / 2
    }
}

struct TreeHdr {
    root_page: PageNo,
    first_leaf: PageNo,
    last_leaf: PageNo,
    num_pages: PageNo,
}

fn encode_hdr(hdr: &TreeHdr, schema: &KeySchema, page: &mut [u8]) {
    let mut buf = &mut page[..];
    buf.put_slice(&hdr.root_page.to_ne_bytes());
    buf.put_slice(&hdr.first_leaf.to_ne_bytes());
    buf.put_slice(&hdr.last_leaf.to_ne_bytes());
    buf.put_slice(&hdr.num_pages.to_ne_bytes());
    buf.put_slice(&(schema.col_types.len() as i32).to_ne_bytes());
    buf.put_slice(&(schema.col_tot_len as i32).to_ne_bytes());
    for (ty, len) in schema.col_types.iter().zip(schema.col_lens.iter()) {
        let code: u8 = match ty {
            ColType::Int => 0,
            ColType::BigInt => 1,
            ColType::Float => 2,
            ColType::String => 3,
            ColType::Datetime => 4,
        };
        buf.put_u8(code);
        buf.put_slice(&(*len as u32).to_ne_bytes());
    }
}

fn decode_hdr(page: &[u8]) -> StorageResult<(TreeHdr, Vec<(ColType, usize)>)> {
    let read_i32 = |off: usize| {
        let mut b = [0u8; 4];
        b.copy_from_slice(&page[off..off + 4]);
        i32::from_ne_bytes(b)
    };
    let hdr = TreeHdr {
        root_page: read_i32(0),
        first_leaf: read_i32(4),
        last_leaf: read_i32(8),
        num_pages: read_i32(12),
    };
    let col_num = read_i32(16) as usize;
    let mut cols = Vec::with_capacity(col_num);
    let mut off = 24;
    for _ in 0..col_num {
        let ty = match page[off] {
            0 => ColType::Int,
            1 => ColType::BigInt,
            2 => ColType::Float,
            3 => ColType::String,
            4 => ColType::Datetime,
            code => {
                return Err(StorageError::Internal(format!(
                    "corrupt index header: column type {}",
                    code
                )))
            }
        };
        let mut b = [0u8; 4];
        b.copy_from_slice(&page[off + 1..off + 5]);
        cols.push((ty, u32::from_ne_bytes(b) as usize));
        off += 5;
    }
    Ok((hdr, cols))
}

fn init_node_page(page: &mut [u8], is_leaf: bool, prev_leaf: PageNo, next_leaf: PageNo) {
    let write = |page: &mut [u8], off: usize, v: i32| {
        page[off..off + 4].copy_from_slice(&v.to_ne_bytes());
    };
    write(page, OFF_IS_LEAF, is_leaf as i32);
    write(page, OFF_NUM_KEY, 0);
    write(page, OFF_PARENT, NO_PAGE);
    write(page, OFF_PREV_LEAF, prev_leaf);
    write(page, OFF_NEXT_LEAF, next_leaf);
    write(page, OFF_NEXT_FREE, NO_PAGE);
}

pub struct BPlusTree {
    fid: FileId,
    path: PathBuf,
    disk: Arc<DiskManager>,
    bpm: Arc<BufferPoolManager>,
    schema: KeySchema,
    /// Mutable header doubling as the root latch: every public
    /// operation holds it for its full duration.
    hdr: Mutex<TreeHdr>,
}

impl BPlusTree {
    /// Creates an index file: header page, leaf sentinel, empty root.
    pub fn create(disk: &DiskManager, path: &Path, cols: &[(ColType, usize)]) -> StorageResult<()> {
        let schema = KeySchema::new(cols)?;
        let hdr = TreeHdr {
            root_page: INIT_ROOT_PAGE,
            first_leaf: INIT_ROOT_PAGE,
            last_leaf: INIT_ROOT_PAGE,
            num_pages: 3,
        };
        disk.create_file(path)?;
        let fid = disk.open_file(path)?;

        let mut page = [0u8; PAGE_SIZE];
        encode_hdr(&hdr, &schema, &mut page);
        disk.write_page(fid, FILE_HDR_PAGE, &page)?;

        page.fill(0);
        init_node_page(&mut page, true, INIT_ROOT_PAGE, INIT_ROOT_PAGE);
        disk.write_page(fid, LEAF_SENTINEL_PAGE, &page)?;

        page.fill(0);
        init_node_page(&mut page, true, LEAF_SENTINEL_PAGE, LEAF_SENTINEL_PAGE);
        disk.write_page(fid, INIT_ROOT_PAGE, &page)?;

        disk.close_file(fid)?;
        Ok(())
    }

    pub fn open(
        disk: Arc<DiskManager>,
        bpm: Arc<BufferPoolManager>,
        path: &Path,
    ) -> StorageResult<BPlusTree> {
        let fid = disk.open_file(path)?;
        let mut page = [0u8; PAGE_SIZE];
        disk.read_page(fid, FILE_HDR_PAGE, &mut page)?;
        let (mut hdr, cols) = decode_hdr(&page)?;
        let schema = KeySchema::new(&cols)?;
        // Never hand out page numbers that flushed nodes already use:
        // the header only reaches disk at close.
        let pages_on_disk = (std::fs::metadata(path)?.len() / PAGE_SIZE as u64) as PageNo;
        hdr.num_pages = hdr.num_pages.max(pages_on_disk);
        disk.set_next_page_no(fid, hdr.num_pages)?;
        debug!(
            "opened index {} (fid {}, root {}, {} pages)",
            path.display(),
            fid,
            hdr.root_page,
            hdr.num_pages
        );
        Ok(BPlusTree {
            fid,
            path: path.to_path_buf(),
            disk,
            bpm,
            schema,
            hdr: Mutex::new(hdr),
        })
    }

    pub fn close(&self) -> StorageResult<()> {
        self.write_hdr()?;
        self.disk.close_file(self.fid)
    }

    pub fn write_hdr(&self) -> StorageResult<()> {
        let hdr = self.hdr.lock().unwrap();
        let mut page = [0u8; PAGE_SIZE];
        encode_hdr(&hdr, &self.schema, &mut page);
        self.disk.write_page(self.fid, FILE_HDR_PAGE, &page)
    }

    pub fn fid(&self) -> FileId {
        self.fid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &KeySchema {
        &self.schema
    }

    pub fn last_leaf(&self) -> PageNo {
        self.hdr.lock().unwrap().last_leaf
    }

    fn fetch_node(&self, page_no: PageNo) -> StorageResult<NodeHandle<'_>> {
        let guard = self.bpm.fetch_page(PageId {
            fid: self.fid,
            page_no,
        })?;
        Ok(NodeHandle {
            guard,
            schema: &self.schema,
        })
    }

    fn create_node(&self, hdr: &mut TreeHdr) -> StorageResult<NodeHandle<'_>> {
        let guard = self.bpm.new_page(self.fid)?;
        hdr.num_pages += 1;
        let node = NodeHandle {
            guard,
            schema: &self.schema,
        };
        node.set_parent(NO_PAGE);
        node.set_prev_leaf(NO_PAGE);
        node.set_next_leaf(NO_PAGE);
        Ok(node)
    }

    fn find_leaf(&self, hdr: &TreeHdr, key: &[u8]) -> StorageResult<NodeHandle<'_>> {
        let mut node = self.fetch_node(hdr.root_page)?;
        while !node.is_leaf() {
            let child = node.internal_lookup(key);
            node = self.fetch_node(child)?;
        }
        Ok(node)
    }

    /// Point lookup.
    pub fn get_value(&self, key: &[u8]) -> StorageResult<Option<Rid>> {
        let hdr = self.hdr.lock().unwrap();
        let leaf = self.find_leaf(&hdr, key)?;
        Ok(leaf.leaf_lookup(key))
    }

    pub fn contains(&self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get_value(key)?.is_some())
    }

    /// Inserts a unique key. A duplicate fails with
    /// [`StorageError::UniqueConstraint`] and leaves the tree unchanged.
    pub fn insert_entry(&self, key: &[u8], rid: Rid) -> StorageResult<()> {
        let mut hdr = self.hdr.lock().unwrap();
        let leaf = self.find_leaf(&hdr, key)?;
        leaf.insert(key, rid)?;
        if leaf.num_key() == self.schema.max_size {
            let new = self.split(&leaf, &mut hdr)?;
            if hdr.last_leaf == leaf.page_no() && new.is_leaf() {
                hdr.last_leaf = new.page_no();
            }
            let sep = new.get_key(0);
            self.insert_into_parent(&leaf, &sep, &new, &mut hdr)?;
        }
        Ok(())
    }

    /// Removes a key if present; merges or redistributes underflowing
    /// nodes. Returns whether anything was removed.
    pub fn delete_entry(&self, key: &[u8]) -> StorageResult<bool> {
        let mut hdr = self.hdr.lock().unwrap();
        let leaf = self.find_leaf(&hdr, key)?;
        let before = leaf.num_key();
        leaf.remove(key);
        let deleted = leaf.num_key() < before;
        if deleted {
            self.coalesce_or_redistribute(leaf, &mut hdr)?;
        }
        Ok(deleted)
    }

    /// Appends a key known to be greater than everything in the tree;
    /// the bulk-load path for sorted input.
    pub fn sorted_insert(&self, key: &[u8], rid: Rid) -> StorageResult<()> {
        let mut hdr = self.hdr.lock().unwrap();
        let leaf = self.fetch_node(hdr.last_leaf)?;
        let n = leaf.num_key();
        if n > 0 {
            let last = leaf.get_key(n - 1);
            if compare_keys(key, &last, &self.schema.col_types, &self.schema.col_lens)
                != Ordering::Greater
            {
                return Err(StorageError::UniqueConstraint);
            }
        }
        if n == self.schema.max_size - 1 {
            // Open a fresh rightmost leaf instead of splitting.
            let new = self.create_node(&mut hdr)?;
            new.set_is_leaf(true);
            new.set_parent(leaf.parent());
            new.set_prev_leaf(leaf.page_no());
            new.set_next_leaf(leaf.next_leaf());
            leaf.set_next_leaf(new.page_no());
            let sentinel = self.fetch_node(LEAF_SENTINEL_PAGE)?;
            sentinel.set_prev_leaf(new.page_no());
            new.insert_pair(0, key, rid);
            hdr.last_leaf = new.page_no();
            self.insert_into_parent(&leaf, key, &new, &mut hdr)?;
        } else {
            leaf.insert_pair(n, key, rid);
        }
        Ok(())
    }

    /// Splits `node`, giving the upper half to a new right sibling.
    fn split(&self, node: &NodeHandle<'_>, hdr: &mut TreeHdr) -> StorageResult<NodeHandle<'_>> {
        let new = self.create_node(hdr)?;
        let split_pos = node.num_key() / 2;
        let n = node.num_key() - split_pos;

        new.set_is_leaf(node.is_leaf());
        new.set_parent(node.parent());
        new.insert_pairs(0, &node.keys_range(split_pos, n), &node.rids_range(split_pos, n));
        node.set_num_key(split_pos);

        if new.is_leaf() {
            new.set_prev_leaf(node.page_no());
            new.set_next_leaf(node.next_leaf());
            let next = self.fetch_node(new.next_leaf())?;
            next.set_prev_leaf(new.page_no());
            node.set_next_leaf(new.page_no());
        } else {
            for i in 0..new.num_key() {
                self.maintain_child(&new, i)?;
            }
        }
        Ok(new)
    }

    /// Publishes a split upward: `new`'s first key becomes the parent
    /// separator; a root split grows the tree by one level.
    fn insert_into_parent(
        &self,
        old: &NodeHandle<'_>,
        key: &[u8],
        new: &NodeHandle<'_>,
        hdr: &mut TreeHdr,
    ) -> StorageResult<()> {
        if old.page_no() == hdr.root_page {
            let root = self.create_node(hdr)?;
            root.set_is_leaf(false);
            root.insert_pair(
                0,
                &old.get_key(0),
                Rid {
                    page_no: old.page_no(),
                    slot_no: -1,
                },
            );
            root.insert_pair(
                1,
                key,
                Rid {
                    page_no: new.page_no(),
                    slot_no: -1,
                },
            );
            old.set_parent(root.page_no());
            new.set_parent(root.page_no());
            hdr.root_page = root.page_no();
            debug!("index {}: new root {}", self.fid, root.page_no());
            return Ok(());
        }

        let parent = self.fetch_node(old.parent())?;
        let pos = parent.find_child(old.page_no())?;
        parent.insert_pair(
            pos + 1,
            key,
            Rid {
                page_no: new.page_no(),
                slot_no: -1,
            },
        );
        new.set_parent(parent.page_no());
        if parent.num_key() == self.schema.max_size {
            let split_parent = self.split(&parent, hdr)?;
            let sep = split_parent.get_key(0);
            self.insert_into_parent(&parent, &sep, &split_parent, hdr)?;
        }
        Ok(())
    }

    fn coalesce_or_redistribute(
        &self,
        node: NodeHandle<'_>,
        hdr: &mut TreeHdr,
    ) -> StorageResult<()> {
        if node.page_no() == hdr.root_page {
            return self.adjust_root(node, hdr);
        }
        if node.num_key() >= self.schema.min_size() {
            self.maintain_parent(&node)?;
            return Ok(());
        }

        let parent = self.fetch_node(node.parent())?;
        let index = parent.find_child(node.page_no())?;
        let neighbor_index = if index == 0 { 1 } else { index - 1 };
        let neighbor = self.fetch_node(parent.get_rid(neighbor_index).page_no)?;

        if node.num_key() + neighbor.num_key() >= 2 * self.schema.min_size() {
            self.redistribute(&neighbor, &node, index)?;
            Ok(())
        } else {
            self.coalesce(neighbor, node, parent, index, hdr)
        }
    }

    /// Root shrinkage: an internal root with one child hands the root
    /// to that child; an empty leaf root stays and the tree is empty.
    fn adjust_root(&self, old_root: NodeHandle<'_>, hdr: &mut TreeHdr) -> StorageResult<()> {
        if !old_root.is_leaf() && old_root.num_key() == 1 {
            let child_page = old_root.get_rid(0).page_no;
            let child = self.fetch_node(child_page)?;
            child.set_parent(NO_PAGE);
            hdr.root_page = child_page;
            hdr.num_pages -= 1;
            debug!("index {}: root collapsed to {}", self.fid, child_page);
        }
        Ok(())
    }

    /// Moves one pair across from the sibling; `index > 0` means the
    /// neighbor is the left sibling.
    fn redistribute(
        &self,
        neighbor: &NodeHandle<'_>,
        node: &NodeHandle<'_>,
        index: usize,
    ) -> StorageResult<()> {
        if index > 0 {
            let erase_pos = neighbor.num_key() - 1;
            node.insert_pair(0, &neighbor.get_key(erase_pos), neighbor.get_rid(erase_pos));
            neighbor.erase_pair(erase_pos);
            self.maintain_child(node, 0)?;
            self.maintain_parent(node)?;
        } else {
            let insert_pos = node.num_key();
            node.insert_pair(insert_pos, &neighbor.get_key(0), neighbor.get_rid(0));
            neighbor.erase_pair(0);
            self.maintain_child(node, insert_pos)?;
            self.maintain_parent(neighbor)?;
        }
        Ok(())
    }

    /// Merges the right node into its left sibling and removes the
    /// separator, recursing when the parent underflows.
    fn coalesce<'a>(
        &self,
        mut neighbor: NodeHandle<'a>,
        mut node: NodeHandle<'a>,
        parent: NodeHandle<'a>,
        mut index: usize,
        hdr: &mut TreeHdr,
    ) -> StorageResult<()> {
        if index == 0 {
            std::mem::swap(&mut node, &mut neighbor);
            index = 1;
        }
        if node.is_leaf() && node.page_no() == hdr.last_leaf {
            hdr.last_leaf = neighbor.page_no();
        }
        let insert_pos = neighbor.num_key();
        let n = node.num_key();
        neighbor.insert_pairs(insert_pos, &node.keys_range(0, n), &node.rids_range(0, n));
        for i in 0..n {
            self.maintain_child(&neighbor, insert_pos + i)?;
        }
        if node.is_leaf() {
            self.erase_leaf(&node)?;
        }
        hdr.num_pages -= 1;
        parent.erase_pair(index);
        drop(node);
        drop(neighbor);
        self.coalesce_or_redistribute(parent, hdr)
    }

    /// Splices a leaf out of the doubly-linked leaf chain.
    fn erase_leaf(&self, leaf: &NodeHandle<'_>) -> StorageResult<()> {
        let prev = self.fetch_node(leaf.prev_leaf())?;
        prev.set_next_leaf(leaf.next_leaf());
        let next = self.fetch_node(leaf.next_leaf())?;
        next.set_prev_leaf(leaf.prev_leaf());
        Ok(())
    }

    /// Propagates a changed first key up through the parent separators.
    fn maintain_parent(&self, node: &NodeHandle<'_>) -> StorageResult<()> {
        if node.num_key() == 0 {
            return Ok(());
        }
        let mut current_page = node.page_no();
        loop {
            let current = self.fetch_node(current_page)?;
            let parent_no = current.parent();
            if parent_no == NO_PAGE {
                return Ok(());
            }
            let parent = self.fetch_node(parent_no)?;
            let rank = parent.find_child(current_page)?;
            let first_key = current.get_key(0);
            if parent.get_key(rank) == first_key {
                return Ok(());
            }
            parent.set_key(rank, &first_key);
            current_page = parent_no;
        }
    }

    /// Repoints the parent link of an internal node's `i`-th child.
    fn maintain_child(&self, node: &NodeHandle<'_>, i: usize) -> StorageResult<()> {
        if !node.is_leaf() {
            let child = self.fetch_node(node.get_rid(i).page_no)?;
            child.set_parent(node.page_no());
        }
        Ok(())
    }

    /// Leaf position of the first entry `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> StorageResult<Iid> {
        let hdr = self.hdr.lock().unwrap();
        let leaf = self.find_leaf(&hdr, key)?;
        let pos = leaf.lower_bound(key);
        self.position_after(&hdr, &leaf, pos)
    }

    /// Leaf position of the first entry `> key`.
    pub fn upper_bound(&self, key: &[u8]) -> StorageResult<Iid> {
        let hdr = self.hdr.lock().unwrap();
        let leaf = self.find_leaf(&hdr, key)?;
        let pos = leaf.upper_bound(key);
        self.position_after(&hdr, &leaf, pos)
    }

    fn position_after(
        &self,
        hdr: &TreeHdr,
        leaf: &NodeHandle<'_>,
        pos: usize,
    ) -> StorageResult<Iid> {
        if pos >= leaf.num_key() {
            if leaf.next_leaf() == LEAF_SENTINEL_PAGE {
                return self.leaf_end_locked(hdr);
            }
            return Ok(Iid {
                page_no: leaf.next_leaf(),
                slot_no: 0,
            });
        }
        Ok(Iid {
            page_no: leaf.page_no(),
            slot_no: pos as i32,
        })
    }

    pub fn leaf_begin(&self) -> StorageResult<Iid> {
        let hdr = self.hdr.lock().unwrap();
        Ok(Iid {
            page_no: hdr.first_leaf,
            slot_no: 0,
        })
    }

    pub fn leaf_end(&self) -> StorageResult<Iid> {
        let hdr = self.hdr.lock().unwrap();
        self.leaf_end_locked(&hdr)
    }

    fn leaf_end_locked(&self, hdr: &TreeHdr) -> StorageResult<Iid> {
        let node = self.fetch_node(hdr.last_leaf)?;
        Ok(Iid {
            page_no: hdr.last_leaf,
            slot_no: node.num_key() as i32,
        })
    }

    /// Resolves a leaf position to the heap rid stored there.
    pub fn get_rid(&self, iid: Iid) -> StorageResult<Rid> {
        let node = self.fetch_node(iid.page_no)?;
        if iid.slot_no < 0 || iid.slot_no as usize >= node.num_key() {
            return Err(StorageError::IndexEntryNotFound);
        }
        Ok(node.get_rid(iid.slot_no as usize))
    }

    pub(crate) fn leaf_size(&self, page_no: PageNo) -> StorageResult<usize> {
        Ok(self.fetch_node(page_no)?.num_key())
    }

    pub(crate) fn leaf_next(&self, page_no: PageNo) -> StorageResult<PageNo> {
        Ok(self.fetch_node(page_no)?.next_leaf())
    }
}
