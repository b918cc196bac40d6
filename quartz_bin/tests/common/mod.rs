#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use quartz_bin::{Database, Session};
use tempfile::TempDir;

/// A database in a temp directory, dropped (not closed) at the end of
/// the test unless the test shuts it down itself.
pub struct TestDb {
    pub dir: TempDir,
    pub path: PathBuf,
    pub db: Arc<Database>,
}

pub fn open_test_db() -> TestDb {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("qdb");
    let db = Arc::new(Database::open(&path).expect("open database"));
    TestDb { dir, path, db }
}

impl TestDb {
    pub fn session(&self) -> Session {
        Session::new(self.db.clone())
    }

    /// Drops the engine without flushing data pages, simulating a
    /// crash (committed work is durable only through the log), then
    /// reopens the same directory, running recovery.
    pub fn crash_and_reopen(mut self) -> TestDb {
        let _ = self.db.log.flush();
        drop(self.db);
        self.db = Arc::new(Database::open(&self.path).expect("reopen database"));
        self
    }

    /// Clean shutdown followed by reopen.
    pub fn close_and_reopen(mut self) -> TestDb {
        self.db.close().expect("close database");
        drop(self.db);
        self.db = Arc::new(Database::open(&self.path).expect("reopen database"));
        self
    }
}

/// Extracts the data rows from a rendered result table.
pub fn rows_of(text: &str) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = text
        .lines()
        .filter(|line| line.starts_with('|'))
        .map(|line| {
            line.trim_start_matches('|')
                .trim_end_matches('|')
                .split('|')
                .map(|cell| cell.trim().to_string())
                .collect()
        })
        .collect();
    if !rows.is_empty() {
        // First |-row is the caption line.
        rows.remove(0);
    }
    rows
}

#[allow(dead_code)]
pub fn row_count(text: &str) -> usize {
    rows_of(text).len()
}
