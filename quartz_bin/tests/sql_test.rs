mod common;

use common::{open_test_db, rows_of};
use quartz_bin::errors::QueryError;

#[test]
fn create_insert_select_round_trip() {
    let db = open_test_db();
    let mut session = db.session();

    session
        .execute("CREATE TABLE t (id INT, name CHAR(8));")
        .unwrap();
    session.execute("INSERT INTO t VALUES (1, 'a');").unwrap();
    session.execute("INSERT INTO t VALUES (2, 'b');").unwrap();

    let text = session.execute("SELECT * FROM t;").unwrap();
    let mut rows = rows_of(&text);
    rows.sort();
    assert_eq!(
        rows,
        vec![
            vec!["1".to_string(), "a".to_string()],
            vec!["2".to_string(), "b".to_string()],
        ]
    );
    assert!(text.contains("Total record(s): 2"));
}

#[test]
fn where_projection_order_and_limit() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE t (id INT, score FLOAT, name CHAR(8));")
        .unwrap();
    for (id, score, name) in [(1, 3.5, "ann"), (2, 1.0, "bob"), (3, 9.25, "cho"), (4, 2.0, "dee")] {
        session
            .execute(&format!("INSERT INTO t VALUES ({id}, {score}, '{name}');"))
            .unwrap();
    }

    let text = session
        .execute("SELECT name, id FROM t WHERE score > 1.5 ORDER BY score DESC LIMIT 2;")
        .unwrap();
    assert_eq!(
        rows_of(&text),
        vec![
            vec!["cho".to_string(), "3".to_string()],
            vec!["ann".to_string(), "1".to_string()],
        ]
    );
}

#[test]
fn join_two_tables() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE emp (id INT, dept INT);")
        .unwrap();
    session
        .execute("CREATE TABLE dept (dno INT, dname CHAR(8));")
        .unwrap();
    session.execute("INSERT INTO emp VALUES (1, 10);").unwrap();
    session.execute("INSERT INTO emp VALUES (2, 20);").unwrap();
    session.execute("INSERT INTO emp VALUES (3, 10);").unwrap();
    session
        .execute("INSERT INTO dept VALUES (10, 'eng');")
        .unwrap();
    session
        .execute("INSERT INTO dept VALUES (20, 'ops');")
        .unwrap();

    let text = session
        .execute("SELECT emp.id, dept.dname FROM emp, dept WHERE emp.dept = dept.dno ORDER BY emp.id;")
        .unwrap();
    assert_eq!(
        rows_of(&text),
        vec![
            vec!["1".to_string(), "eng".to_string()],
            vec!["2".to_string(), "ops".to_string()],
            vec!["3".to_string(), "eng".to_string()],
        ]
    );
}

#[test]
fn aggregates_over_a_table() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE t (id INT, score INT);")
        .unwrap();
    for (id, score) in [(1, 10), (2, 40), (3, 25)] {
        session
            .execute(&format!("INSERT INTO t VALUES ({id}, {score});"))
            .unwrap();
    }

    let text = session
        .execute("SELECT COUNT(*) AS cnt, SUM(score) AS total, MAX(score) AS hi, MIN(score) AS lo FROM t;")
        .unwrap();
    assert_eq!(
        rows_of(&text),
        vec![vec![
            "3".to_string(),
            "75".to_string(),
            "40".to_string(),
            "10".to_string()
        ]]
    );
}

#[test]
fn update_with_arithmetic_and_delete() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE t (id INT, score INT);")
        .unwrap();
    session.execute("INSERT INTO t VALUES (1, 10);").unwrap();
    session.execute("INSERT INTO t VALUES (2, 20);").unwrap();

    session
        .execute("UPDATE t SET score = score + 5 WHERE id = 1;")
        .unwrap();
    let text = session.execute("SELECT score FROM t WHERE id = 1;").unwrap();
    assert_eq!(rows_of(&text), vec![vec!["15".to_string()]]);

    session.execute("DELETE FROM t WHERE id = 2;").unwrap();
    let text = session.execute("SELECT * FROM t;").unwrap();
    assert_eq!(rows_of(&text).len(), 1);
}

#[test]
fn index_scan_returns_the_same_rows_as_seq_scan() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE t (id INT, name CHAR(8));")
        .unwrap();
    session.execute("INSERT INTO t VALUES (1, 'a');").unwrap();
    session.execute("INSERT INTO t VALUES (2, 'b');").unwrap();
    session.execute("CREATE INDEX t (id);").unwrap();
    session.execute("INSERT INTO t VALUES (3, 'c');").unwrap();

    let text = session.execute("SELECT * FROM t WHERE id = 2;").unwrap();
    assert_eq!(
        rows_of(&text),
        vec![vec!["2".to_string(), "b".to_string()]]
    );

    // Range predicates drive the index too.
    let text = session
        .execute("SELECT id FROM t WHERE id >= 2 ORDER BY id;")
        .unwrap();
    assert_eq!(
        rows_of(&text),
        vec![vec!["2".to_string()], vec!["3".to_string()]]
    );
}

#[test]
fn unique_index_rejects_duplicates_atomically() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE t (id INT, name CHAR(8));")
        .unwrap();
    session.execute("CREATE INDEX t (id);").unwrap();
    session.execute("INSERT INTO t VALUES (1, 'a');").unwrap();

    let err = session
        .execute("INSERT INTO t VALUES (1, 'dup');")
        .unwrap_err();
    assert!(matches!(err, QueryError::UniqueConstraint));

    // No side effects: one heap row, index lookup still finds 'a'.
    let text = session.execute("SELECT * FROM t WHERE id = 1;").unwrap();
    assert_eq!(
        rows_of(&text),
        vec![vec!["1".to_string(), "a".to_string()]]
    );
}

#[test]
fn composite_index_and_multi_column_ddl() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE t (a INT, b CHAR(4), c FLOAT);")
        .unwrap();
    session.execute("CREATE INDEX t (a, b);").unwrap();
    session.execute("INSERT INTO t VALUES (1, 'x', 0.5);").unwrap();
    session.execute("INSERT INTO t VALUES (1, 'y', 1.5);").unwrap();

    let text = session
        .execute("SELECT c FROM t WHERE a = 1 AND b = 'y';")
        .unwrap();
    assert_eq!(rows_of(&text), vec![vec!["1.5".to_string()]]);

    session.execute("DROP INDEX t (a, b);").unwrap();
    let text = session
        .execute("SELECT c FROM t WHERE a = 1 AND b = 'y';")
        .unwrap();
    assert_eq!(rows_of(&text), vec![vec!["1.5".to_string()]]);
}

#[test]
fn datetime_round_trip_and_comparison() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE ev (id INT, at DATETIME);")
        .unwrap();
    session
        .execute("INSERT INTO ev VALUES (1, '2024-01-02 03:04:05');")
        .unwrap();
    session
        .execute("INSERT INTO ev VALUES (2, '2023-12-31 23:59:59');")
        .unwrap();

    let text = session
        .execute("SELECT id FROM ev WHERE at > '2024-01-01 00:00:00';")
        .unwrap();
    assert_eq!(rows_of(&text), vec![vec!["1".to_string()]]);

    let err = session
        .execute("INSERT INTO ev VALUES (3, 'not a datetime');")
        .unwrap_err();
    assert!(matches!(err, QueryError::InvalidDatetime(_)));
}

#[test]
fn type_widening_on_insert() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE t (big BIGINT, f FLOAT);")
        .unwrap();
    // Plain int literals widen to BIGINT and FLOAT columns.
    session.execute("INSERT INTO t VALUES (7, 7);").unwrap();
    let text = session.execute("SELECT * FROM t;").unwrap();
    assert_eq!(
        rows_of(&text),
        vec![vec!["7".to_string(), "7".to_string()]]
    );
}

#[test]
fn semantic_errors_are_reported() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE t (id INT, name CHAR(4));")
        .unwrap();

    assert!(matches!(
        session.execute("SELECT * FROM missing;").unwrap_err(),
        QueryError::TableNotFound(_)
    ));
    assert!(matches!(
        session.execute("SELECT nope FROM t;").unwrap_err(),
        QueryError::ColumnNotFound(_)
    ));
    assert!(matches!(
        session.execute("INSERT INTO t VALUES (1);").unwrap_err(),
        QueryError::InvalidValueCount
    ));
    assert!(matches!(
        session
            .execute("INSERT INTO t VALUES (1, 'toolong');")
            .unwrap_err(),
        QueryError::StringOverflow
    ));
    assert!(matches!(
        session
            .execute("INSERT INTO t VALUES ('x', 'a');")
            .unwrap_err(),
        QueryError::IncompatibleType { .. }
    ));
    assert!(matches!(
        session.execute("CREATE TABLE t (id INT);").unwrap_err(),
        QueryError::TableExists(_)
    ));
    assert!(matches!(
        session.execute("not sql at all").unwrap_err(),
        QueryError::Parse(_)
    ));
}

#[test]
fn show_and_desc_render_catalog_state() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE t (id INT, name CHAR(8));")
        .unwrap();
    session.execute("CREATE INDEX t (id);").unwrap();

    let tables = session.execute("SHOW TABLES;").unwrap();
    assert!(tables.contains("| t |"));

    let desc = session.execute("DESC t;").unwrap();
    assert!(desc.contains("| id | INT | YES |"));
    assert!(desc.contains("| name | CHAR(8) | NO |"));

    let index = session.execute("SHOW INDEX FROM t;").unwrap();
    assert!(index.contains("| t | unique | (id) |"));

    session.execute("DROP TABLE t;").unwrap();
    let tables = session.execute("SHOW TABLES;").unwrap();
    assert!(!tables.contains("| t |"));
}

#[test]
fn catalog_survives_clean_reopen() {
    let db = open_test_db();
    {
        let mut session = db.session();
        session
            .execute("CREATE TABLE t (id INT, name CHAR(8));")
            .unwrap();
        session.execute("CREATE INDEX t (id);").unwrap();
        session.execute("INSERT INTO t VALUES (5, 'five');").unwrap();
    }
    let db = db.close_and_reopen();
    let mut session = db.session();
    let text = session.execute("SELECT name FROM t WHERE id = 5;").unwrap();
    assert_eq!(rows_of(&text), vec![vec!["five".to_string()]]);
}
