//! shareboxd - multi-user network file-share daemon.
//!
//! Hosts per-user trees under a root directory, authenticates clients over a
//! line-oriented TCP protocol, enforces byte quotas, and keeps all durable
//! state in an SQLite metadata store.

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;

use sharebox::cli::ServerOpts;
use sharebox::logger::TextLogger;
use sharebox::server::Server;
use sharebox::sqlite::SqliteStore;

fn main() -> Result<()> {
    let opts = ServerOpts::parse();

    let log_path =
        std::env::var("SHAREBOX_LOG_PATH").unwrap_or_else(|_| "server.log".to_string());
    let account_path =
        std::env::var("SHAREBOX_ACCOUNT_PATH").unwrap_or_else(|_| "user_account.txt".to_string());

    let store = Arc::new(SqliteStore::open(&opts.db)?);
    let audit = Box::new(TextLogger::new(&log_path)?);
    let server = Arc::new(Server::new(opts.root.clone(), store, audit)?);

    match server.import_legacy_accounts(Path::new(&account_path)) {
        Ok(n) if n > 0 => eprintln!("imported {n} accounts from {account_path}"),
        Ok(_) => {}
        Err(e) => eprintln!("legacy account import failed: {e}"),
    }

    server.serve(&format!("{}:{}", opts.bind, opts.port))
}
