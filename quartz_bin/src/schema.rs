//! The schema manager: owns the catalog, the per-table record files
//! and the per-index B+-trees, and implements the reversal hooks used
//! by transaction abort and crash recovery. Catalog edits are not
//! transactional: every DDL operation flushes `db.meta` before
//! returning.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use strata::btree::BPlusTree;
use strata::heap::{TableFile, TableScan};
use strata::transaction::WriteReverter;
use strata::{BufferPoolManager, DiskManager, Rid, StorageError, StorageResult};

use crate::catalog::{
    index_file_name, load_meta, store_meta, table_file_name, ColMeta, DbMeta, IndexMeta, TabMeta,
    LOG_FILE_NAME, OUTPUT_FILE_NAME,
};
use crate::errors::{QueryError, QueryResult};
use crate::parser::ColDef;
use crate::printer;

pub struct SchemaManager {
    dir: PathBuf,
    disk: Arc<DiskManager>,
    bpm: Arc<BufferPoolManager>,
    db: Mutex<DbMeta>,
    fhs: Mutex<HashMap<String, Arc<TableFile>>>,
    ihs: Mutex<HashMap<String, Arc<BPlusTree>>>,
    output_latch: Mutex<()>,
    output_off: AtomicBool,
}

impl SchemaManager {
    /// Creates a database directory with an empty catalog and log.
    pub fn create_db(dir: &Path) -> QueryResult<()> {
        if dir.is_dir() {
            return Err(QueryError::DatabaseExists(dir.display().to_string()));
        }
        std::fs::create_dir_all(dir)?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "db".to_string());
        let meta = DbMeta {
            name,
            tabs: Default::default(),
        };
        store_meta(dir, &meta)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE_NAME))?;
        info!("created database at {}", dir.display());
        Ok(())
    }

    /// Removes a database directory and everything in it.
    pub fn drop_db(dir: &Path) -> QueryResult<()> {
        if !dir.is_dir() {
            return Err(QueryError::DatabaseNotFound(dir.display().to_string()));
        }
        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    /// Loads the catalog and opens every table and index file. A
    /// partial open is fatal: already-opened handles are closed and
    /// the error surfaces.
    pub fn open_db(
        dir: &Path,
        disk: Arc<DiskManager>,
        bpm: Arc<BufferPoolManager>,
    ) -> QueryResult<SchemaManager> {
        if !dir.is_dir() {
            return Err(QueryError::DatabaseNotFound(dir.display().to_string()));
        }
        let meta = load_meta(dir)?;
        disk.set_log_file(&dir.join(LOG_FILE_NAME))?;

        let sm = SchemaManager {
            dir: dir.to_path_buf(),
            disk,
            bpm,
            db: Mutex::new(meta),
            fhs: Mutex::new(HashMap::new()),
            ihs: Mutex::new(HashMap::new()),
            output_latch: Mutex::new(()),
            output_off: AtomicBool::new(false),
        };

        let result = sm.open_all_handles();
        if let Err(e) = result {
            sm.close_handles_best_effort();
            return Err(e);
        }
        Ok(sm)
    }

    fn open_all_handles(&self) -> QueryResult<()> {
        let db = self.db.lock().unwrap();
        for tab in db.tabs.values() {
            let fh = TableFile::open(
                self.disk.clone(),
                self.bpm.clone(),
                &self.dir.join(table_file_name(&tab.name)),
            )?;
            self.fhs
                .lock()
                .unwrap()
                .insert(tab.name.clone(), Arc::new(fh));
            for index in &tab.indexes {
                let file = index_file_name(&tab.name, &index.col_names());
                let tree = BPlusTree::open(
                    self.disk.clone(),
                    self.bpm.clone(),
                    &self.dir.join(&file),
                )?;
                self.ihs.lock().unwrap().insert(file, Arc::new(tree));
            }
        }
        Ok(())
    }

    fn close_handles_best_effort(&self) {
        for (_, fh) in self.fhs.lock().unwrap().drain() {
            if let Err(e) = fh.close() {
                warn!("failed to close table file: {}", e);
            }
        }
        for (_, ih) in self.ihs.lock().unwrap().drain() {
            if let Err(e) = ih.close() {
                warn!("failed to close index file: {}", e);
            }
        }
    }

    /// Flushes data pages, file headers and the catalog, and closes
    /// every handle.
    pub fn close_db(&self) -> QueryResult<()> {
        self.flush_meta()?;
        self.bpm.flush_all_pages()?;
        for (_, fh) in self.fhs.lock().unwrap().drain() {
            fh.close()?;
        }
        for (_, ih) in self.ihs.lock().unwrap().drain() {
            ih.close()?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn flush_meta(&self) -> QueryResult<()> {
        let db = self.db.lock().unwrap();
        store_meta(&self.dir, &db)
    }

    /// A point-in-time copy of the catalog for analysis and planning.
    pub fn meta(&self) -> DbMeta {
        self.db.lock().unwrap().clone()
    }

    pub fn tab_meta(&self, name: &str) -> QueryResult<TabMeta> {
        Ok(self.db.lock().unwrap().get_table(name)?.clone())
    }

    pub fn table_file(&self, name: &str) -> QueryResult<Arc<TableFile>> {
        self.fhs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| QueryError::TableNotFound(name.to_string()))
    }

    pub fn index_tree(&self, tab_name: &str, col_names: &[String]) -> QueryResult<Arc<BPlusTree>> {
        let file = index_file_name(tab_name, col_names);
        self.ihs
            .lock()
            .unwrap()
            .get(&file)
            .cloned()
            .ok_or(QueryError::IndexNotFound(file))
    }

    pub fn create_table(&self, name: &str, col_defs: &[ColDef]) -> QueryResult<()> {
        let mut db = self.db.lock().unwrap();
        if db.is_table(name) {
            return Err(QueryError::TableExists(name.to_string()));
        }
        let mut offset = 0;
        let mut cols = Vec::with_capacity(col_defs.len());
        for def in col_defs {
            cols.push(ColMeta {
                tab_name: name.to_string(),
                name: def.name.clone(),
                col_type: def.col_type,
                len: def.len,
                offset,
                index: false,
            });
            offset += def.len;
        }

        TableFile::create(&self.disk, &self.dir.join(table_file_name(name)), offset)?;
        let fh = TableFile::open(
            self.disk.clone(),
            self.bpm.clone(),
            &self.dir.join(table_file_name(name)),
        )?;
        self.fhs
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(fh));

        db.tabs.insert(
            name.to_string(),
            TabMeta {
                name: name.to_string(),
                cols,
                indexes: Vec::new(),
            },
        );
        store_meta(&self.dir, &db)?;
        info!("created table {}", name);
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> QueryResult<()> {
        let mut db = self.db.lock().unwrap();
        let tab = db.get_table(name)?.clone();

        for index in &tab.indexes {
            self.drop_index_files(name, &index.col_names())?;
        }

        let fh = self
            .fhs
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| QueryError::TableNotFound(name.to_string()))?;
        self.bpm.discard_file_pages(fh.fid())?;
        fh.close()?;
        self.disk
            .destroy_file(&self.dir.join(table_file_name(name)))?;

        db.tabs.remove(name);
        store_meta(&self.dir, &db)?;
        info!("dropped table {}", name);
        Ok(())
    }

    /// Creates an index and populates it from every live record, in
    /// scan order. A duplicate key aborts the build and removes the
    /// half-built file.
    pub fn create_index(&self, tab_name: &str, col_names: &[String]) -> QueryResult<()> {
        let mut db = self.db.lock().unwrap();
        let tab = db.get_table_mut(tab_name)?;
        if tab.has_index_on(col_names) {
            return Err(QueryError::IndexExists(index_file_name(
                tab_name, col_names,
            )));
        }
        let mut cols = Vec::with_capacity(col_names.len());
        for col_name in col_names {
            cols.push(tab.get_col(col_name)?.clone());
        }
        let col_tot_len: usize = cols.iter().map(|c| c.len).sum();
        let index_meta = IndexMeta {
            tab_name: tab_name.to_string(),
            col_tot_len,
            col_num: cols.len(),
            cols: cols.clone(),
        };

        let path = self.dir.join(index_file_name(tab_name, col_names));
        let key_schema: Vec<_> = cols.iter().map(|c| (c.col_type, c.len)).collect();
        BPlusTree::create(&self.disk, &path, &key_schema)?;
        let tree = Arc::new(BPlusTree::open(
            self.disk.clone(),
            self.bpm.clone(),
            &path,
        )?);

        let fh = self
            .fhs
            .lock()
            .unwrap()
            .get(tab_name)
            .cloned()
            .ok_or_else(|| QueryError::TableNotFound(tab_name.to_string()))?;
        let mut scan = TableScan::new(&fh)?;
        while !scan.is_end() {
            let rid = scan.rid();
            let record = fh.get_record(rid)?;
            let key = index_meta.key_from_record(&record);
            if let Err(e) = tree.insert_entry(&key, rid) {
                self.bpm.discard_file_pages(tree.fid())?;
                tree.close()?;
                self.disk.destroy_file(&path)?;
                return Err(e.into());
            }
            scan.next()?;
        }

        for col in tab.cols.iter_mut() {
            if col_names.contains(&col.name) {
                col.index = true;
            }
        }
        tab.indexes.push(index_meta);
        self.ihs
            .lock()
            .unwrap()
            .insert(index_file_name(tab_name, col_names), tree);
        store_meta(&self.dir, &db)?;
        info!("created index on {}({})", tab_name, col_names.join(","));
        Ok(())
    }

    pub fn drop_index(&self, tab_name: &str, col_names: &[String]) -> QueryResult<()> {
        let mut db = self.db.lock().unwrap();
        let tab = db.get_table_mut(tab_name)?;
        let pos = tab
            .indexes
            .iter()
            .position(|ix| ix.col_names() == col_names)
            .ok_or_else(|| {
                QueryError::IndexNotFound(index_file_name(tab_name, col_names))
            })?;
        tab.indexes.remove(pos);
        let remaining = tab.indexes.clone();
        for col in tab.cols.iter_mut() {
            col.index = remaining
                .iter()
                .any(|ix| ix.cols.iter().any(|c| c.name == col.name));
        }
        self.drop_index_files(tab_name, col_names)?;
        store_meta(&self.dir, &db)?;
        Ok(())
    }

    fn drop_index_files(&self, tab_name: &str, col_names: &[String]) -> QueryResult<()> {
        let file = index_file_name(tab_name, col_names);
        if let Some(tree) = self.ihs.lock().unwrap().remove(&file) {
            self.bpm.discard_file_pages(tree.fid())?;
            tree.close()?;
        }
        self.disk.destroy_file(&self.dir.join(&file))?;
        Ok(())
    }

    pub fn show_tables(&self) -> String {
        let db = self.db.lock().unwrap();
        let rows: Vec<Vec<String>> = db.tabs.keys().map(|name| vec![name.clone()]).collect();
        let text = printer::render_table(&["Tables".to_string()], &rows);
        drop(db);
        self.write_output(&text);
        text
    }

    pub fn desc_table(&self, name: &str) -> QueryResult<String> {
        let db = self.db.lock().unwrap();
        let tab = db.get_table(name)?;
        let rows: Vec<Vec<String>> = tab
            .cols
            .iter()
            .map(|col| {
                let ty = match col.col_type {
                    strata::types::ColType::String => format!("CHAR({})", col.len),
                    other => other.name().to_string(),
                };
                vec![
                    col.name.clone(),
                    ty,
                    if col.index { "YES" } else { "NO" }.to_string(),
                ]
            })
            .collect();
        let text = printer::render_table(
            &["Field".to_string(), "Type".to_string(), "Index".to_string()],
            &rows,
        );
        drop(db);
        self.write_output(&text);
        Ok(text)
    }

    pub fn show_index(&self, name: &str) -> QueryResult<String> {
        let db = self.db.lock().unwrap();
        let tab = db.get_table(name)?;
        let rows: Vec<Vec<String>> = tab
            .indexes
            .iter()
            .map(|index| {
                vec![
                    name.to_string(),
                    "unique".to_string(),
                    format!("({})", index.col_names().join(",")),
                ]
            })
            .collect();
        let text = printer::render_table(
            &[
                "Table".to_string(),
                "Type".to_string(),
                "Columns".to_string(),
            ],
            &rows,
        );
        drop(db);
        self.write_output(&text);
        Ok(text)
    }

    /// Appends result or audit text to the `output.txt` mirror unless
    /// it has been switched off for this run.
    pub fn write_output(&self, text: &str) {
        if self.output_off.load(Ordering::SeqCst) {
            return;
        }
        let _guard = self.output_latch.lock().unwrap();
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(OUTPUT_FILE_NAME))
            .and_then(|mut f| f.write_all(text.as_bytes()));
        if let Err(e) = result {
            warn!("cannot write output file: {}", e);
        }
    }

    pub fn audit_line(&self, line: &str) {
        self.write_output(&format!("{}\n", line));
    }

    pub fn set_output_off(&self) {
        self.output_off.store(true, Ordering::SeqCst);
    }

    // ----- reversal hooks -------------------------------------------------

    fn indexes_of(&self, table: &str) -> StorageResult<Vec<IndexMeta>> {
        let db = self.db.lock().unwrap();
        db.get_table(table)
            .map(|tab| tab.indexes.clone())
            .map_err(|e| StorageError::Internal(e.to_string()))
    }

    fn table_file_storage(&self, table: &str) -> StorageResult<Arc<TableFile>> {
        self.table_file(table)
            .map_err(|e| StorageError::Internal(e.to_string()))
    }

    fn index_tree_storage(&self, index: &IndexMeta) -> StorageResult<Arc<BPlusTree>> {
        self.index_tree(&index.tab_name, &index.col_names())
            .map_err(|e| StorageError::Internal(e.to_string()))
    }

    /// Undo of an insert: remove the index entries, then the record.
    pub fn rollback_insert_impl(&self, table: &str, rid: Rid) -> StorageResult<()> {
        let fh = self.table_file_storage(table)?;
        let record = fh.get_record(rid)?;
        for index in self.indexes_of(table)? {
            let key = index.key_from_record(&record);
            self.index_tree_storage(&index)?.delete_entry(&key)?;
        }
        fh.delete_record(rid)
    }

    /// Undo of a delete: reinsert at the same rid, rebuild index
    /// entries. Re-running after a partial apply is harmless.
    pub fn rollback_delete_impl(&self, table: &str, record: &[u8], rid: Rid) -> StorageResult<()> {
        let fh = self.table_file_storage(table)?;
        fh.insert_record_at(rid, record)?;
        for index in self.indexes_of(table)? {
            let key = index.key_from_record(record);
            match self.index_tree_storage(&index)?.insert_entry(&key, rid) {
                Ok(()) | Err(StorageError::UniqueConstraint) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Undo of an update: restore the before-image and swap changed
    /// index keys back.
    pub fn rollback_update_impl(&self, table: &str, rid: Rid, before: &[u8]) -> StorageResult<()> {
        let fh = self.table_file_storage(table)?;
        let current = fh.get_record(rid)?;
        for index in self.indexes_of(table)? {
            let new_key = index.key_from_record(&current);
            let old_key = index.key_from_record(before);
            if new_key != old_key {
                let tree = self.index_tree_storage(&index)?;
                tree.delete_entry(&new_key)?;
                match tree.insert_entry(&old_key, rid) {
                    Ok(()) | Err(StorageError::UniqueConstraint) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        fh.update_record(rid, before)
    }

    // ----- recovery hooks (idempotent redo of logged effects) -------------

    pub fn recovery_insert(&self, table: &str, rid: Rid, value: &[u8]) -> StorageResult<()> {
        let fh = self.table_file_storage(table)?;
        fh.insert_record_at(rid, value)?;
        for index in self.indexes_of(table)? {
            let key = index.key_from_record(value);
            match self.index_tree_storage(&index)?.insert_entry(&key, rid) {
                Ok(()) | Err(StorageError::UniqueConstraint) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn recovery_update(&self, table: &str, rid: Rid, after: &[u8]) -> StorageResult<()> {
        let fh = self.table_file_storage(table)?;
        let current = fh.get_record(rid)?;
        for index in self.indexes_of(table)? {
            let old_key = index.key_from_record(&current);
            let new_key = index.key_from_record(after);
            if old_key != new_key {
                let tree = self.index_tree_storage(&index)?;
                tree.delete_entry(&old_key)?;
                match tree.insert_entry(&new_key, rid) {
                    Ok(()) | Err(StorageError::UniqueConstraint) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        fh.update_record(rid, after)
    }

    pub fn recovery_delete(&self, table: &str, rid: Rid) -> StorageResult<()> {
        let fh = self.table_file_storage(table)?;
        let record = match fh.get_record(rid) {
            Ok(record) => record,
            // Already gone: the effect reached disk before the crash.
            Err(StorageError::RecordNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        for index in self.indexes_of(table)? {
            let key = index.key_from_record(&record);
            self.index_tree_storage(&index)?.delete_entry(&key)?;
        }
        fh.delete_record(rid)
    }
}

impl WriteReverter for SchemaManager {
    fn rollback_insert(&self, table: &str, rid: Rid) -> StorageResult<()> {
        self.rollback_insert_impl(table, rid)
    }

    fn rollback_delete(&self, table: &str, record: &[u8], rid: Rid) -> StorageResult<()> {
        self.rollback_delete_impl(table, record, rid)
    }

    fn rollback_update(&self, table: &str, rid: Rid, record: &[u8]) -> StorageResult<()> {
        self.rollback_update_impl(table, rid, record)
    }
}
