//! QuartzDB: a small relational engine over the `strata` storage
//! crate. This crate hosts the SQL front end (parser, analyzer,
//! planner), the catalog and schema manager, the volcano executors and
//! portal, crash recovery, and the line-protocol TCP server.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use strata::lock_manager::LockManager;
use strata::transaction::{Transaction, TransactionManager};
use strata::wal::LogManager;
use strata::{BufferPoolManager, DiskManager, TxnId};

pub mod analyze;
pub mod catalog;
pub mod common;
pub mod errors;
pub mod executor;
pub mod parser;
pub mod planner;
pub mod portal;
pub mod printer;
pub mod recovery;
pub mod schema;
pub mod value;

use errors::{QueryError, QueryResult};
use executor::ExecCtx;
use parser::Statement;
use recovery::RecoveryManager;
use schema::SchemaManager;

/// Largest client message accepted by the line protocol.
pub const BUFFER_LENGTH: usize = 8192;

const HELP_TEXT: &str = "Supported SQL syntax:\n\
  CREATE TABLE table (column TYPE [, ...]);\n\
  DROP TABLE table;\n\
  CREATE INDEX table (column [, ...]);\n\
  DROP INDEX table (column [, ...]);\n\
  SHOW TABLES; SHOW INDEX FROM table; DESC table;\n\
  INSERT INTO table VALUES (value [, ...]);\n\
  DELETE FROM table [WHERE conditions];\n\
  UPDATE table SET column = value [, ...] [WHERE conditions];\n\
  SELECT selector FROM table [, table ...] [WHERE conditions]\n\
      [ORDER BY column [DESC]] [LIMIT n];\n\
  BEGIN; COMMIT; ABORT;\n\
TYPE: INT | BIGINT | FLOAT | CHAR(n) | DATETIME\n";

/// The engine: every long-lived manager, wired in dependency order.
pub struct Database {
    pub disk: Arc<DiskManager>,
    pub bpm: Arc<BufferPoolManager>,
    pub log: Arc<LogManager>,
    pub lock: Arc<LockManager>,
    pub txn_mgr: TransactionManager,
    pub sm: SchemaManager,
}

impl Database {
    /// Opens (creating and initializing if absent) the database
    /// directory, then runs the analyze/redo/undo recovery passes.
    pub fn open(dir: &Path) -> QueryResult<Database> {
        if !dir.is_dir() {
            SchemaManager::create_db(dir)?;
        }
        let disk = Arc::new(DiskManager::new());
        let log = Arc::new(LogManager::new(disk.clone()));
        let bpm = Arc::new(BufferPoolManager::new(disk.clone(), log.clone()));
        let lock = Arc::new(LockManager::new());
        let txn_mgr = TransactionManager::new(lock.clone());
        let sm = SchemaManager::open_db(dir, disk.clone(), bpm.clone())?;

        let db = Database {
            disk,
            bpm,
            log,
            lock,
            txn_mgr,
            sm,
        };
        RecoveryManager::new(&db.disk, &db.sm, &db.txn_mgr, &db.log).recover()?;
        info!("database open at {}", dir.display());
        Ok(db)
    }

    /// Flushes the log and all data, then closes every file handle.
    pub fn close(&self) -> QueryResult<()> {
        self.log.flush()?;
        self.sm.close_db()
    }
}

/// One client's statement stream and its transaction bracket.
pub struct Session {
    db: Arc<Database>,
    txn_id: Option<TxnId>,
}

impl Session {
    pub fn new(db: Arc<Database>) -> Session {
        Session { db, txn_id: None }
    }

    fn active_txn(&self) -> Option<Arc<Transaction>> {
        let id = self.txn_id?;
        let txn = self.db.txn_mgr.get_transaction(id)?;
        if txn.is_finished() {
            return None;
        }
        Some(txn)
    }

    /// The transaction the next statement runs in: the extant one, or
    /// a fresh implicit transaction.
    fn current_txn(&mut self) -> QueryResult<Arc<Transaction>> {
        if let Some(txn) = self.active_txn() {
            return Ok(txn);
        }
        let txn = self.db.txn_mgr.begin(None, &self.db.log)?;
        self.txn_id = Some(txn.id());
        Ok(txn)
    }

    /// Parses and executes one statement, handling the transaction
    /// bracket and the audit stream.
    pub fn execute(&mut self, sql: &str) -> QueryResult<String> {
        let stmt = match parser::parse_sql(sql) {
            Ok(stmt) => stmt,
            Err(errs) => {
                self.db.sm.audit_line("failure");
                return Err(QueryError::Parse(
                    errs.iter()
                        .map(|e| e.to_string())
                        .collect::<Vec<_>>()
                        .join("; "),
                ));
            }
        };

        match self.execute_stmt(stmt) {
            Ok(text) => Ok(text),
            Err(e) => {
                if e.is_abort() {
                    // Deadlock prevention: the whole transaction rolls
                    // back, whatever mode it was in.
                    if let Some(txn) = self.active_txn() {
                        if let Err(abort_err) =
                            self.db.txn_mgr.abort(&txn, &self.db.log, &self.db.sm)
                        {
                            error!("rollback after wound-wait failed: {}", abort_err);
                        }
                    }
                    self.txn_id = None;
                    self.db.sm.audit_line("abort");
                } else {
                    self.db.sm.audit_line("failure");
                    // An implicit transaction has no one left to roll
                    // it back; an explicit one stays open for the
                    // client to decide.
                    if let Some(txn) = self.active_txn() {
                        if !txn.explicit_mode() {
                            if let Err(abort_err) =
                                self.db.txn_mgr.abort(&txn, &self.db.log, &self.db.sm)
                            {
                                error!("rollback of failed statement failed: {}", abort_err);
                            }
                            self.txn_id = None;
                        }
                    }
                }
                Err(e)
            }
        }
    }

    fn execute_stmt(&mut self, stmt: Statement) -> QueryResult<String> {
        match stmt {
            Statement::Begin => {
                let txn = self.current_txn()?;
                txn.set_explicit_mode(true);
                Ok(String::new())
            }
            Statement::Commit => {
                if let Some(txn) = self.active_txn() {
                    self.db.txn_mgr.commit(&txn, &self.db.log)?;
                }
                self.txn_id = None;
                Ok(String::new())
            }
            Statement::Abort | Statement::Rollback => {
                if let Some(txn) = self.active_txn() {
                    self.db.txn_mgr.abort(&txn, &self.db.log, &self.db.sm)?;
                }
                self.txn_id = None;
                Ok(String::new())
            }
            Statement::Help => Ok(HELP_TEXT.to_string()),
            Statement::ShowTables => Ok(self.db.sm.show_tables()),
            Statement::ShowIndex { table } => self.db.sm.show_index(&table),
            Statement::DescTable { table } => self.db.sm.desc_table(&table),
            Statement::CreateTable { table, cols } => {
                self.db.sm.create_table(&table, &cols)?;
                Ok(String::new())
            }
            Statement::DropTable { table } => {
                self.db.sm.drop_table(&table)?;
                Ok(String::new())
            }
            Statement::CreateIndex { table, cols } => {
                self.db.sm.create_index(&table, &cols)?;
                Ok(String::new())
            }
            Statement::DropIndex { table, cols } => {
                self.db.sm.drop_index(&table, &cols)?;
                Ok(String::new())
            }
            stmt => self.execute_dml(stmt),
        }
    }

    fn execute_dml(&mut self, stmt: Statement) -> QueryResult<String> {
        let txn = self.current_txn()?;
        let meta = self.db.sm.meta();
        let query = analyze::analyze(&meta, stmt)?;
        let plan = planner::plan_query(&meta, query)?;

        let ctx = ExecCtx {
            sm: &self.db.sm,
            lock: &self.db.lock,
            log: &self.db.log,
            txn: &txn,
        };
        let portal_stmt = portal::start(plan, &ctx)?;
        let text = portal::run(portal_stmt, &ctx)?;

        if !txn.explicit_mode() {
            self.db.txn_mgr.commit(&txn, &self.db.log)?;
            self.txn_id = None;
        }
        Ok(text)
    }

    /// Bulk-loads a CSV file; only allowed outside an explicit
    /// transaction because the load bypasses the log.
    pub fn load(&mut self, path: &Path, table: &str) -> QueryResult<String> {
        if self.active_txn().map_or(false, |t| t.explicit_mode()) {
            return Err(QueryError::Planning(
                "bulk load cannot run inside a transaction".into(),
            ));
        }
        executor::load_csv(&self.db.sm, path, table)?;
        Ok(String::new())
    }

    /// Best-effort rollback when the client goes away mid-transaction.
    pub fn abort_on_disconnect(&mut self) {
        if let Some(txn) = self.active_txn() {
            if let Err(e) = self.db.txn_mgr.abort(&txn, &self.db.log, &self.db.sm) {
                warn!("abort on disconnect failed: {}", e);
            }
        }
        self.txn_id = None;
    }
}

fn handle_client(mut stream: TcpStream, db: Arc<Database>) -> std::io::Result<()> {
    debug!("client connected: {:?}", stream.peer_addr());
    let mut session = Session::new(db.clone());
    let mut buf = [0u8; BUFFER_LENGTH];

    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&buf[..n]);
        let msg = text.trim_end_matches('\0').trim();
        debug!("received: {}", msg);

        if msg == "exit" {
            break;
        }
        if msg == "crash" {
            // Recovery-testing hook: make the log durable, then die
            // without flushing data pages.
            info!("crash requested; flushing log and terminating");
            let _ = db.log.flush();
            std::process::exit(1);
        }
        if msg == "set output_file off" {
            db.sm.set_output_off();
            stream.write_all(&[0])?;
            continue;
        }

        let reply = if let Some(rest) = msg.strip_prefix("load ") {
            match rest.split_once(" into ") {
                Some((path, table)) => {
                    let table = table.trim_end_matches(';').trim();
                    match session.load(Path::new(path.trim()), table) {
                        Ok(text) => text,
                        Err(e) => format!("{}\n", e),
                    }
                }
                None => "syntax error: load <path> into <table>;\n".to_string(),
            }
        } else {
            match session.execute(msg) {
                Ok(text) => text,
                Err(e) if e.is_abort() => "abort\n".to_string(),
                Err(e) => format!("{}\n", e),
            }
        };

        stream.write_all(reply.as_bytes())?;
        stream.write_all(&[0])?;
    }

    session.abort_on_disconnect();
    debug!("client disconnected");
    Ok(())
}

/// Accepts connections forever, one worker thread per client.
pub fn run_server(db: Arc<Database>, addr: &str) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    info!("QuartzDB listening on {}", addr);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let db = db.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_client(stream, db) {
                        error!("client handler failed: {}", e);
                    }
                });
            }
            Err(e) => error!("accept failed: {}", e),
        }
    }
    Ok(())
}
