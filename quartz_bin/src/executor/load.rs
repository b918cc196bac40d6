//! Bulk CSV load: straight-line ingestion that bypasses the log,
//! builds heap pages directly and feeds the clustered index through
//! `sorted_insert`. Requires an empty table and rows pre-sorted by the
//! indexed columns; only runs outside an explicit transaction.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::info;
use strata::types::ColType;

use crate::catalog::TabMeta;
use crate::errors::{QueryError, QueryResult};
use crate::schema::SchemaManager;
use crate::value::Value;

fn parse_field(tab: &TabMeta, col_idx: usize, text: &str) -> QueryResult<Value> {
    let col = &tab.cols[col_idx];
    let value = match col.col_type {
        ColType::Int => Value::Int(
            text.trim()
                .parse::<i32>()
                .map_err(|_| QueryError::Parse(format!("invalid INT field: {}", text)))?,
        ),
        ColType::BigInt => Value::BigInt(
            text.trim()
                .parse::<i64>()
                .map_err(|_| QueryError::Parse(format!("invalid BIGINT field: {}", text)))?,
        ),
        ColType::Float => Value::Float(
            text.trim()
                .parse::<f32>()
                .map_err(|_| QueryError::Parse(format!("invalid FLOAT field: {}", text)))?,
        ),
        ColType::String => Value::Str(text.to_string()),
        ColType::Datetime => Value::datetime(text.trim())?,
    };
    Ok(value)
}

fn encode_row(tab: &TabMeta, line: &str) -> QueryResult<Vec<u8>> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != tab.cols.len() {
        return Err(QueryError::InvalidValueCount);
    }
    let mut record = vec![0u8; tab.record_size()];
    for (i, field) in fields.iter().enumerate() {
        let col = &tab.cols[i];
        let value = parse_field(tab, i, field)?.coerce_to(col)?;
        record[col.offset..col.offset + col.len].copy_from_slice(&value.to_bytes(col.len)?);
    }
    Ok(record)
}

/// Loads a headered CSV file into an empty table and its clustered
/// index. Returns the number of rows loaded.
pub fn load_csv(sm: &SchemaManager, path: &Path, table: &str) -> QueryResult<usize> {
    let tab = sm.tab_meta(table)?;
    let fh = sm.table_file(table)?;
    if !fh.is_empty_file() {
        return Err(QueryError::Planning(format!(
            "bulk load requires empty table {}",
            table
        )));
    }

    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();
    // First line is the header.
    lines.next().transpose()?;

    let mut rows = Vec::new();
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(encode_row(&tab, &line)?);
    }

    let tree = match tab.indexes.first() {
        Some(index) => Some((index.clone(), sm.index_tree(table, &index.col_names())?)),
        None => None,
    };

    let mut on_row = |rid: strata::Rid, record: &[u8]| -> strata::StorageResult<()> {
        if let Some((index, tree)) = &tree {
            let key = index.key_from_record(record);
            tree.sorted_insert(&key, rid)?;
        }
        Ok(())
    };
    let total = fh.bulk_append(&mut rows.into_iter(), &mut on_row)?;
    if let Some((_, tree)) = &tree {
        tree.write_hdr()?;
    }
    info!("bulk loaded {} rows into {}", total, table);
    Ok(total)
}
