//! The QuartzDB server entry point: opens (or initializes) the
//! database directory named on the command line and serves the line
//! protocol until SIGINT, which flushes the log and closes the
//! database cleanly.

use std::path::PathBuf;
use std::sync::Arc;

use quartz_bin::{run_server, Database};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <database>", args[0]);
        std::process::exit(1);
    }
    let dir = PathBuf::from(&args[1]);

    let db = match Database::open(&dir) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            eprintln!("failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    {
        let db = db.clone();
        ctrlc::set_handler(move || {
            eprintln!("received SIGINT, shutting down");
            if let Err(e) = db.close() {
                eprintln!("shutdown error: {}", e);
            }
            std::process::exit(0);
        })
        .expect("cannot install SIGINT handler");
    }

    let addr = std::env::var("QUARTZ_ADDR").unwrap_or_else(|_| "127.0.0.1:8765".to_string());
    if let Err(e) = run_server(db, &addr) {
        eprintln!("server error: {}", e);
        std::process::exit(1);
    }
}
