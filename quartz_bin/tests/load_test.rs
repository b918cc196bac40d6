mod common;

use std::io::Write;

use common::{open_test_db, rows_of};
use quartz_bin::errors::QueryError;

fn write_csv(dir: &std::path::Path, name: &str, lines: &[String]) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
    path
}

#[test]
fn bulk_load_fills_heap_and_clustered_index_in_key_order() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE t (id INT, name CHAR(8));")
        .unwrap();
    session.execute("CREATE INDEX t (id);").unwrap();

    let rows = 500;
    let mut lines = vec!["id,name".to_string()];
    for i in 0..rows {
        lines.push(format!("{i},n{i}"));
    }
    let csv = write_csv(db.dir.path(), "data.csv", &lines);

    session.load(&csv, "t").unwrap();

    let text = session.execute("SELECT COUNT(*) AS cnt FROM t;").unwrap();
    assert_eq!(rows_of(&text), vec![vec![rows.to_string()]]);

    // A full-range index scan comes back in key order.
    let text = session
        .execute(&format!("SELECT id FROM t WHERE id >= 0 LIMIT {rows};"))
        .unwrap();
    let ids: Vec<i64> = rows_of(&text)
        .into_iter()
        .map(|row| row[0].parse().unwrap())
        .collect();
    assert_eq!(ids, (0..rows).collect::<Vec<i64>>());

    // Point lookups and later DML work on the loaded table.
    let text = session
        .execute("SELECT name FROM t WHERE id = 123;")
        .unwrap();
    assert_eq!(rows_of(&text), vec![vec!["n123".to_string()]]);
    session
        .execute(&format!("INSERT INTO t VALUES ({rows}, 'tail');"))
        .unwrap();
    let text = session
        .execute(&format!("SELECT name FROM t WHERE id = {rows};"))
        .unwrap();
    assert_eq!(rows_of(&text), vec![vec!["tail".to_string()]]);
}

#[test]
fn bulk_load_requires_an_empty_table() {
    let db = open_test_db();
    let mut session = db.session();
    session.execute("CREATE TABLE t (id INT);").unwrap();
    session.execute("INSERT INTO t VALUES (1);").unwrap();

    let csv = write_csv(db.dir.path(), "more.csv", &[
        "id".to_string(),
        "2".to_string(),
    ]);
    let err = session.load(&csv, "t").unwrap_err();
    assert!(matches!(err, QueryError::Planning(_)));
}

#[test]
fn bulk_load_parses_typed_fields() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE m (id INT, big BIGINT, f FLOAT, name CHAR(8), at DATETIME);")
        .unwrap();

    let csv = write_csv(db.dir.path(), "mixed.csv", &[
        "id,big,f,name,at".to_string(),
        "1,3000000000,1.5,ann,2024-01-02 03:04:05".to_string(),
        "2,-7,2.25,bob,2024-06-30 12:00:00".to_string(),
    ]);
    session.load(&csv, "m").unwrap();

    let text = session
        .execute("SELECT big, f, name, at FROM m WHERE id = 1;")
        .unwrap();
    assert_eq!(
        rows_of(&text),
        vec![vec![
            "3000000000".to_string(),
            "1.5".to_string(),
            "ann".to_string(),
            "2024-01-02 03:04:05".to_string(),
        ]]
    );
}
