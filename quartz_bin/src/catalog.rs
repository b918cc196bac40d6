//! The catalog: database, table, column and index metadata. Persisted
//! as a human-readable JSON file (`db.meta`) in the database directory
//! and rewritten on every DDL edit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata::types::ColType;

use crate::errors::{QueryError, QueryResult};

pub const DB_META_NAME: &str = "db.meta";
pub const LOG_FILE_NAME: &str = "db.log";
pub const OUTPUT_FILE_NAME: &str = "output.txt";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColMeta {
    pub tab_name: String,
    pub name: String,
    pub col_type: ColType,
    pub len: usize,
    pub offset: usize,
    /// Whether some index leads with this column.
    pub index: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexMeta {
    pub tab_name: String,
    pub col_tot_len: usize,
    pub col_num: usize,
    pub cols: Vec<ColMeta>,
}

impl IndexMeta {
    /// Extracts this index's composite key from a heap record.
    pub fn key_from_record(&self, record: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.col_tot_len);
        for col in &self.cols {
            key.extend_from_slice(&record[col.offset..col.offset + col.len]);
        }
        key
    }

    pub fn col_names(&self) -> Vec<String> {
        self.cols.iter().map(|c| c.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TabMeta {
    pub name: String,
    pub cols: Vec<ColMeta>,
    pub indexes: Vec<IndexMeta>,
}

impl TabMeta {
    pub fn get_col(&self, name: &str) -> QueryResult<&ColMeta> {
        self.cols
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| QueryError::ColumnNotFound(name.to_string()))
    }

    pub fn is_col(&self, name: &str) -> bool {
        self.cols.iter().any(|c| c.name == name)
    }

    pub fn record_size(&self) -> usize {
        self.cols.iter().map(|c| c.len).sum()
    }

    pub fn get_index_meta(&self, col_names: &[String]) -> QueryResult<&IndexMeta> {
        self.indexes
            .iter()
            .find(|ix| ix.col_names() == col_names)
            .ok_or_else(|| {
                QueryError::IndexNotFound(format!("{}({})", self.name, col_names.join(",")))
            })
    }

    pub fn has_index_on(&self, col_names: &[String]) -> bool {
        self.indexes.iter().any(|ix| ix.col_names() == col_names)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DbMeta {
    pub name: String,
    pub tabs: BTreeMap<String, TabMeta>,
}

impl DbMeta {
    pub fn is_table(&self, name: &str) -> bool {
        self.tabs.contains_key(name)
    }

    pub fn get_table(&self, name: &str) -> QueryResult<&TabMeta> {
        self.tabs
            .get(name)
            .ok_or_else(|| QueryError::TableNotFound(name.to_string()))
    }

    pub fn get_table_mut(&mut self, name: &str) -> QueryResult<&mut TabMeta> {
        self.tabs
            .get_mut(name)
            .ok_or_else(|| QueryError::TableNotFound(name.to_string()))
    }
}

/// Deterministic index file name: `{table}_{col1}_{col2}….idx`.
pub fn index_file_name(tab_name: &str, col_names: &[String]) -> String {
    format!("{}_{}.idx", tab_name, col_names.join("_"))
}

pub fn table_file_name(tab_name: &str) -> String {
    format!("{}.tbl", tab_name)
}

pub fn meta_path(dir: &Path) -> PathBuf {
    dir.join(DB_META_NAME)
}

pub fn load_meta(dir: &Path) -> QueryResult<DbMeta> {
    let text = std::fs::read_to_string(meta_path(dir))?;
    serde_json::from_str(&text)
        .map_err(|e| QueryError::Internal(format!("corrupt catalog file: {}", e)))
}

pub fn store_meta(dir: &Path, meta: &DbMeta) -> QueryResult<()> {
    let text = serde_json::to_string_pretty(meta)
        .map_err(|e| QueryError::Internal(format!("cannot serialize catalog: {}", e)))?;
    std::fs::write(meta_path(dir), text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_meta() -> DbMeta {
        let cols = vec![
            ColMeta {
                tab_name: "t".into(),
                name: "id".into(),
                col_type: ColType::Int,
                len: 4,
                offset: 0,
                index: true,
            },
            ColMeta {
                tab_name: "t".into(),
                name: "name".into(),
                col_type: ColType::String,
                len: 8,
                offset: 4,
                index: false,
            },
        ];
        let index = IndexMeta {
            tab_name: "t".into(),
            col_tot_len: 4,
            col_num: 1,
            cols: vec![cols[0].clone()],
        };
        let mut tabs = BTreeMap::new();
        tabs.insert(
            "t".into(),
            TabMeta {
                name: "t".into(),
                cols,
                indexes: vec![index],
            },
        );
        DbMeta {
            name: "testdb".into(),
            tabs,
        }
    }

    #[test]
    fn meta_round_trips_through_the_catalog_file() {
        let dir = tempdir().unwrap();
        let meta = sample_meta();
        store_meta(dir.path(), &meta).unwrap();
        let loaded = load_meta(dir.path()).unwrap();
        assert_eq!(loaded.name, "testdb");
        let tab = loaded.get_table("t").unwrap();
        assert_eq!(tab.cols.len(), 2);
        assert_eq!(tab.indexes.len(), 1);
        assert_eq!(tab.get_col("name").unwrap().offset, 4);
        assert_eq!(tab.record_size(), 12);
    }

    #[test]
    fn index_key_extraction_uses_column_offsets() {
        let meta = sample_meta();
        let tab = meta.get_table("t").unwrap();
        let mut record = Vec::new();
        record.extend_from_slice(&42i32.to_ne_bytes());
        record.extend_from_slice(b"abcd\0\0\0\0");
        let key = tab.indexes[0].key_from_record(&record);
        assert_eq!(key, 42i32.to_ne_bytes().to_vec());
    }

    #[test]
    fn index_file_names_are_deterministic() {
        assert_eq!(
            index_file_name("orders", &["id".into(), "ts".into()]),
            "orders_id_ts.idx"
        );
    }
}
