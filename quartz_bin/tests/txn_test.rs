mod common;

use std::thread;
use std::time::Duration;

use common::{open_test_db, rows_of};

#[test]
fn abort_rolls_back_heap_and_index() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE t (id INT, name CHAR(8));")
        .unwrap();
    session.execute("CREATE INDEX t (id);").unwrap();
    session.execute("INSERT INTO t VALUES (1, 'a');").unwrap();
    session.execute("INSERT INTO t VALUES (2, 'b');").unwrap();

    session.execute("BEGIN;").unwrap();
    session.execute("INSERT INTO t VALUES (3, 'c');").unwrap();
    session.execute("ABORT;").unwrap();

    let text = session.execute("SELECT * FROM t;").unwrap();
    assert_eq!(rows_of(&text).len(), 2);

    // The unique index must not keep a stale entry for id=3: a lookup
    // finds nothing and a re-insert succeeds.
    let text = session.execute("SELECT * FROM t WHERE id = 3;").unwrap();
    assert_eq!(rows_of(&text).len(), 0);
    session.execute("INSERT INTO t VALUES (3, 'c2');").unwrap();
    let text = session.execute("SELECT name FROM t WHERE id = 3;").unwrap();
    assert_eq!(rows_of(&text), vec![vec!["c2".to_string()]]);
}

#[test]
fn abort_rolls_back_updates_and_deletes() {
    let db = open_test_db();
    let mut session = db.session();
    session
        .execute("CREATE TABLE t (id INT, score INT);")
        .unwrap();
    session.execute("CREATE INDEX t (id);").unwrap();
    session.execute("INSERT INTO t VALUES (1, 10);").unwrap();
    session.execute("INSERT INTO t VALUES (2, 20);").unwrap();

    session.execute("BEGIN;").unwrap();
    session
        .execute("UPDATE t SET id = 7 WHERE id = 1;")
        .unwrap();
    session.execute("DELETE FROM t WHERE id = 2;").unwrap();
    session.execute("ROLLBACK;").unwrap();

    let text = session
        .execute("SELECT id, score FROM t ORDER BY id;")
        .unwrap();
    assert_eq!(
        rows_of(&text),
        vec![
            vec!["1".to_string(), "10".to_string()],
            vec!["2".to_string(), "20".to_string()],
        ]
    );
    // Index agrees with the heap after rollback.
    let text = session.execute("SELECT score FROM t WHERE id = 7;").unwrap();
    assert_eq!(rows_of(&text).len(), 0);
    let text = session.execute("SELECT score FROM t WHERE id = 1;").unwrap();
    assert_eq!(rows_of(&text), vec![vec!["10".to_string()]]);
}

#[test]
fn explicit_commit_makes_writes_visible() {
    let db = open_test_db();
    let mut writer = db.session();
    writer
        .execute("CREATE TABLE t (id INT, name CHAR(8));")
        .unwrap();
    writer.execute("BEGIN;").unwrap();
    writer.execute("INSERT INTO t VALUES (1, 'a');").unwrap();
    writer.execute("COMMIT;").unwrap();

    let mut reader = db.session();
    let text = reader.execute("SELECT * FROM t;").unwrap();
    assert_eq!(rows_of(&text).len(), 1);
}

#[test]
fn younger_conflicting_writer_is_wound() {
    let db = open_test_db();
    let mut setup = db.session();
    setup
        .execute("CREATE TABLE t (id INT, score INT);")
        .unwrap();
    setup.execute("INSERT INTO t VALUES (1, 10);").unwrap();

    // The older transaction holds shared row locks.
    let mut older = db.session();
    older.execute("BEGIN;").unwrap();
    older.execute("SELECT * FROM t;").unwrap();

    // The younger transaction's update conflicts and is aborted
    // immediately by wound-wait.
    let mut younger = db.session();
    younger.execute("BEGIN;").unwrap();
    let err = younger
        .execute("UPDATE t SET score = 99 WHERE id = 1;")
        .unwrap_err();
    assert!(err.is_abort());

    older.execute("COMMIT;").unwrap();
    // Nothing from the wounded transaction stuck.
    let text = setup.execute("SELECT score FROM t;").unwrap();
    assert_eq!(rows_of(&text), vec![vec!["10".to_string()]]);
}

#[test]
fn older_conflicting_writer_waits_for_the_younger_holder() {
    let db = open_test_db();
    let mut setup = db.session();
    setup
        .execute("CREATE TABLE t (id INT, score INT);")
        .unwrap();
    setup.execute("INSERT INTO t VALUES (1, 10);").unwrap();

    // Older transaction starts first (smaller txn id) but acts second.
    let mut older = db.session();
    older.execute("BEGIN;").unwrap();

    let mut younger = db.session();
    younger.execute("BEGIN;").unwrap();
    younger.execute("SELECT * FROM t;").unwrap();

    let handle = thread::spawn(move || {
        // Blocks until the younger reader commits.
        older
            .execute("UPDATE t SET score = 99 WHERE id = 1;")
            .unwrap();
        older.execute("COMMIT;").unwrap();
    });

    thread::sleep(Duration::from_millis(100));
    assert!(!handle.is_finished(), "older writer should be waiting");
    younger.execute("COMMIT;").unwrap();
    handle.join().unwrap();

    let text = setup.execute("SELECT score FROM t;").unwrap();
    assert_eq!(rows_of(&text), vec![vec!["99".to_string()]]);
}

#[test]
fn implicit_transactions_auto_commit_per_statement() {
    let db = open_test_db();
    let mut a = db.session();
    a.execute("CREATE TABLE t (id INT);").unwrap();
    a.execute("INSERT INTO t VALUES (1);").unwrap();

    // A second session sees the row at once: the implicit transaction
    // committed and released its locks.
    let mut b = db.session();
    let text = b.execute("SELECT * FROM t;").unwrap();
    assert_eq!(rows_of(&text).len(), 1);
    b.execute("UPDATE t SET id = 2 WHERE id = 1;").unwrap();

    let text = a.execute("SELECT * FROM t;").unwrap();
    assert_eq!(rows_of(&text), vec![vec!["2".to_string()]]);
}
