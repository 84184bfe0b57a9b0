//! Server core: listener, process-wide counters, online-user table, and the
//! handles every session shares.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use walkdir::WalkDir;

use crate::db::MetaStore;
use crate::logger::AuditLog;
use crate::quota::QuotaManager;
use crate::session::Session;

/// Quota handed to freshly registered and imported accounts (100 MiB).
pub const DEFAULT_QUOTA_BYTES: u64 = 100 * 1024 * 1024;

pub struct Server {
    root: PathBuf,
    store: Arc<dyn MetaStore>,
    quota: QuotaManager,
    audit: Box<dyn AuditLog>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    // username -> live session count
    online: Mutex<HashMap<String, u32>>,
}

impl Server {
    /// Build the server: ensures the root directory and metadata schema
    /// exist and sweeps stale `.tmp` leftovers from earlier crashes.
    pub fn new(root: PathBuf, store: Arc<dyn MetaStore>, audit: Box<dyn AuditLog>) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create root {}", root.display()))?;
        store.init_schema()?;
        sweep_tmp_files(&root);
        Ok(Self {
            root,
            store,
            quota: QuotaManager::new(),
            audit,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            online: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &dyn MetaStore {
        self.store.as_ref()
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    pub fn audit(&self) -> &dyn AuditLog {
        self.audit.as_ref()
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn user_login(&self, user: &str) {
        let mut online = self.online.lock();
        *online.entry(user.to_string()).or_insert(0) += 1;
    }

    pub fn user_logout(&self, user: &str) {
        let mut online = self.online.lock();
        if let Some(count) = online.get_mut(user) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                online.remove(user);
            }
        }
    }

    pub fn is_user_online(&self, user: &str) -> bool {
        self.online.lock().get(user).copied().unwrap_or(0) > 0
    }

    pub fn online_count(&self) -> usize {
        self.online.lock().len()
    }

    pub fn online_snapshot(&self) -> Vec<String> {
        let mut names: Vec<String> = self.online.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Seed users from the legacy account file (`user:password` lines).
    /// Passwords stay as stored; AUTH accepts them via the legacy
    /// comparison arm. Returns how many accounts were created.
    pub fn import_legacy_accounts(&self, path: &Path) -> Result<usize> {
        let Ok(text) = std::fs::read_to_string(path) else {
            return Ok(0);
        };
        let mut created = 0usize;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((user, pass)) = line.split_once(':') else {
                continue;
            };
            if self.store.get_user_by_username(user)?.is_none() {
                self.store.create_user(user, pass, DEFAULT_QUOTA_BYTES)?;
                created += 1;
            }
        }
        Ok(created)
    }

    /// Accept loop: one blocking worker per connection. Accept failures are
    /// logged and skipped.
    pub fn serve(self: Arc<Self>, bind: &str) -> Result<()> {
        let listener = TcpListener::bind(bind).with_context(|| format!("bind {}", bind))?;
        eprintln!(
            "shareboxd listening on {} root={}",
            bind,
            self.root.display()
        );
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => {
                    let peer = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "unknown".to_string());
                    let server = Arc::clone(&self);
                    thread::spawn(move || {
                        let mut session = Session::new(stream, server, peer.clone());
                        if let Err(e) = session.run() {
                            eprintln!("session {} closed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    eprintln!("accept error: {}", e);
                }
            }
        }
        Ok(())
    }
}

fn sweep_tmp_files(root: &Path) {
    let mut removed = 0usize;
    for entry in WalkDir::new(root).follow_links(false).into_iter().flatten() {
        if entry.file_type().is_file()
            && entry
                .file_name()
                .to_str()
                .map(|n| n.ends_with(".tmp"))
                .unwrap_or(false)
        {
            if std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        eprintln!("swept {} stale .tmp files under {}", removed, root.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::sqlite::SqliteStore;

    fn test_server() -> (tempfile::TempDir, Arc<Server>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("meta.db")).unwrap());
        let server =
            Server::new(dir.path().join("data"), store, Box::new(NoopLogger)).unwrap();
        (dir, Arc::new(server))
    }

    #[test]
    fn online_table_counts_sessions_per_user() {
        let (_d, server) = test_server();
        assert!(!server.is_user_online("alice"));
        server.user_login("alice");
        server.user_login("alice");
        server.user_login("bob");
        assert!(server.is_user_online("alice"));
        assert_eq!(server.online_count(), 2);
        assert_eq!(server.online_snapshot(), vec!["alice", "bob"]);
        server.user_logout("alice");
        assert!(server.is_user_online("alice"));
        server.user_logout("alice");
        assert!(!server.is_user_online("alice"));
        assert_eq!(server.online_count(), 1);
    }

    #[test]
    fn byte_counters_accumulate() {
        let (_d, server) = test_server();
        server.add_bytes_in(10);
        server.add_bytes_in(5);
        server.add_bytes_out(7);
        assert_eq!(server.bytes_in(), 15);
        assert_eq!(server.bytes_out(), 7);
    }

    #[test]
    fn startup_sweeps_stale_tmp_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        std::fs::create_dir_all(root.join("alice")).unwrap();
        std::fs::write(root.join("alice/partial.bin.tmp"), b"junk").unwrap();
        std::fs::write(root.join("alice/keep.bin"), b"data").unwrap();

        let store = Arc::new(SqliteStore::open(dir.path().join("meta.db")).unwrap());
        let _server = Server::new(root.clone(), store, Box::new(NoopLogger)).unwrap();
        assert!(!root.join("alice/partial.bin.tmp").exists());
        assert!(root.join("alice/keep.bin").exists());
    }

    #[test]
    fn legacy_accounts_import_once() {
        let (dir, server) = test_server();
        let accounts = dir.path().join("user_account.txt");
        std::fs::write(&accounts, "# seeded\nalice:pw1\nbob:pw2\nbad-line\n").unwrap();
        assert_eq!(server.import_legacy_accounts(&accounts).unwrap(), 2);
        assert_eq!(server.import_legacy_accounts(&accounts).unwrap(), 0);
        let rec = server.store().get_user_by_username("alice").unwrap().unwrap();
        assert_eq!(rec.password_hash, "pw1");
        assert_eq!(rec.quota_bytes, DEFAULT_QUOTA_BYTES);
    }
}
