//! SQLite-backed metadata store.
//!
//! One connection, opened in serialized mode and wrapped in a mutex; every
//! trait call is a single statement (or one short transaction) under that
//! lock, which gives the per-operation atomicity the store contract asks for.

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;

use crate::db::{
    Direction, FileEntry, MetaStore, Permissions, SharedFile, TransferSession, UserRecord,
};

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS app_user (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    username      TEXT UNIQUE NOT NULL,
    password_hash TEXT NOT NULL,
    quota_bytes   INTEGER NOT NULL DEFAULT 0,
    used_bytes    INTEGER NOT NULL DEFAULT 0,
    created_at    DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS file_entry (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id    INTEGER NOT NULL,
    path        TEXT NOT NULL,
    size_bytes  INTEGER NOT NULL,
    is_folder   INTEGER NOT NULL DEFAULT 0,
    is_deleted  INTEGER NOT NULL DEFAULT 0,
    deleted_at  DATETIME,
    created_at  DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at  DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY(owner_id) REFERENCES app_user(id) ON DELETE CASCADE
);

-- Partial: a path is reusable once its previous entry is tombstoned.
CREATE UNIQUE INDEX IF NOT EXISTS idx_file_entry_owner_path
    ON file_entry(owner_id, path) WHERE is_deleted = 0;

CREATE TABLE IF NOT EXISTS file_acl (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id      INTEGER NOT NULL,
    grantee_id   INTEGER NOT NULL,
    can_view     INTEGER NOT NULL DEFAULT 1,
    can_download INTEGER NOT NULL DEFAULT 0,
    can_edit     INTEGER NOT NULL DEFAULT 0,
    created_at   DATETIME DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(file_id, grantee_id),
    FOREIGN KEY(file_id) REFERENCES file_entry(id) ON DELETE CASCADE,
    FOREIGN KEY(grantee_id) REFERENCES app_user(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS transfer_session (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      INTEGER NOT NULL,
    path         TEXT NOT NULL,
    direction    TEXT NOT NULL,
    total_bytes  INTEGER NOT NULL,
    offset_bytes INTEGER NOT NULL,
    updated_at   DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY(user_id) REFERENCES app_user(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_transfer_session_key
    ON transfer_session(user_id, path, direction);

CREATE TABLE IF NOT EXISTS audit_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     INTEGER,
    action      TEXT NOT NULL,
    detail      TEXT,
    remote_ip   TEXT,
    created_at  DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY(user_id) REFERENCES app_user(id) ON DELETE SET NULL
);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_context(|| format!("open metadata db {}", db_path.as_ref().display()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl MetaStore for SqliteStore {
    fn init_schema(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(SCHEMA)
            .context("create metadata schema")
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, username, password_hash, quota_bytes, used_bytes \
                 FROM app_user WHERE username = ?1",
                params![username],
                |r| {
                    Ok(UserRecord {
                        id: r.get(0)?,
                        username: r.get(1)?,
                        password_hash: r.get(2)?,
                        quota_bytes: r.get::<_, i64>(3)? as u64,
                        used_bytes: r.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn create_user(&self, username: &str, password_hash: &str, quota_bytes: u64) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO app_user (username, password_hash, quota_bytes, used_bytes) \
             VALUES (?1, ?2, ?3, 0)",
            params![username, password_hash, quota_bytes as i64],
        )
        .map_err(|e| anyhow!("{e}"))?;
        Ok(conn.last_insert_rowid())
    }

    fn update_used_bytes(&self, user_id: i64, used_bytes: u64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE app_user SET used_bytes = ?1 WHERE id = ?2",
            params![used_bytes as i64, user_id],
        )?;
        Ok(())
    }

    fn upsert_file_entry(
        &self,
        owner_id: i64,
        path: &str,
        size_bytes: u64,
        is_folder: bool,
    ) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO file_entry (owner_id, path, size_bytes, is_folder) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(owner_id, path) WHERE is_deleted = 0 DO UPDATE SET \
             size_bytes = excluded.size_bytes, \
             is_folder = excluded.is_folder, \
             updated_at = CURRENT_TIMESTAMP",
            params![owner_id, path, size_bytes as i64, is_folder],
        )?;
        Ok(())
    }

    fn get_file_entry(&self, owner_id: i64, path: &str) -> Result<Option<FileEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, size_bytes, is_folder, is_deleted FROM file_entry \
                 WHERE owner_id = ?1 AND path = ?2 \
                 ORDER BY is_deleted ASC, id DESC LIMIT 1",
                params![owner_id, path],
                |r| {
                    Ok(FileEntry {
                        id: r.get(0)?,
                        size_bytes: r.get::<_, i64>(1)? as u64,
                        is_folder: r.get(2)?,
                        is_deleted: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn list_files(&self, owner_id: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT path, size_bytes, is_folder FROM file_entry \
             WHERE owner_id = ?1 AND is_deleted = 0 ORDER BY path",
        )?;
        let rows = stmt.query_map(params![owner_id], |r| {
            let path: String = r.get(0)?;
            let size: i64 = r.get(1)?;
            let folder: bool = r.get(2)?;
            Ok(format!("{path}|{size}|{}", folder as u8))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn list_deleted_files(&self, owner_id: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT path, size_bytes, deleted_at FROM file_entry \
             WHERE owner_id = ?1 AND is_deleted = 1 ORDER BY path",
        )?;
        let rows = stmt.query_map(params![owner_id], |r| {
            let path: String = r.get(0)?;
            let size: i64 = r.get(1)?;
            let deleted_at: String = r.get::<_, Option<String>>(2)?.unwrap_or_default();
            Ok(format!("{path}|{size}|{deleted_at}"))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn delete_file_entry(&self, owner_id: i64, path: &str) -> Result<bool> {
        let n = self.conn.lock().execute(
            "UPDATE file_entry SET is_deleted = 1, deleted_at = CURRENT_TIMESTAMP \
             WHERE owner_id = ?1 AND path = ?2 AND is_deleted = 0",
            params![owner_id, path],
        )?;
        Ok(n > 0)
    }

    fn restore_file_entry(&self, owner_id: i64, path: &str) -> Result<bool> {
        // Most recent tombstone wins when the path was deleted repeatedly.
        let n = self.conn.lock().execute(
            "UPDATE file_entry SET is_deleted = 0, deleted_at = NULL \
             WHERE id = (SELECT id FROM file_entry \
                         WHERE owner_id = ?1 AND path = ?2 AND is_deleted = 1 \
                         ORDER BY deleted_at DESC, id DESC LIMIT 1)",
            params![owner_id, path],
        )?;
        Ok(n > 0)
    }

    fn rename_file_entry(&self, owner_id: i64, old_path: &str, new_path: &str) -> Result<bool> {
        let n = self.conn.lock().execute(
            "UPDATE file_entry SET path = ?3, updated_at = CURRENT_TIMESTAMP \
             WHERE owner_id = ?1 AND path = ?2 AND is_deleted = 0",
            params![owner_id, old_path, new_path],
        )?;
        Ok(n > 0)
    }

    fn copy_file_entry(&self, owner_id: i64, src_path: &str, dst_path: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let (src_id, size_bytes, is_folder): (i64, i64, bool) = tx.query_row(
            "SELECT id, size_bytes, is_folder FROM file_entry \
             WHERE owner_id = ?1 AND path = ?2 AND is_deleted = 0",
            params![owner_id, src_path],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        tx.execute(
            "INSERT INTO file_entry (owner_id, path, size_bytes, is_folder) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(owner_id, path) WHERE is_deleted = 0 DO UPDATE SET \
             size_bytes = excluded.size_bytes, \
             is_folder = excluded.is_folder, \
             updated_at = CURRENT_TIMESTAMP",
            params![owner_id, dst_path, size_bytes, is_folder],
        )?;
        let dst_id: i64 = tx.query_row(
            "SELECT id FROM file_entry \
             WHERE owner_id = ?1 AND path = ?2 AND is_deleted = 0",
            params![owner_id, dst_path],
            |r| r.get(0),
        )?;
        tx.execute("DELETE FROM file_acl WHERE file_id = ?1", params![dst_id])?;
        tx.execute(
            "INSERT INTO file_acl (file_id, grantee_id, can_view, can_download, can_edit) \
             SELECT ?1, grantee_id, can_view, can_download, can_edit \
             FROM file_acl WHERE file_id = ?2",
            params![dst_id, src_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_file_id_by_path(&self, owner_id: i64, path: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT id FROM file_entry \
                 WHERE owner_id = ?1 AND path = ?2 AND is_deleted = 0",
                params![owner_id, path],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn find_shared_file(&self, path: &str, grantee_id: i64) -> Result<Option<SharedFile>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT f.id, f.owner_id, u.username FROM file_entry f \
                 JOIN file_acl a ON a.file_id = f.id \
                 JOIN app_user u ON u.id = f.owner_id \
                 WHERE f.path = ?1 AND a.grantee_id = ?2 AND f.is_deleted = 0 \
                 ORDER BY f.updated_at DESC, f.id DESC LIMIT 1",
                params![path, grantee_id],
                |r| {
                    Ok(SharedFile {
                        file_id: r.get(0)?,
                        owner_id: r.get(1)?,
                        owner_username: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn check_permission(&self, file_id: i64, user_id: i64) -> Result<Permissions> {
        let conn = self.conn.lock();
        let owner_id: i64 = conn.query_row(
            "SELECT owner_id FROM file_entry WHERE id = ?1",
            params![file_id],
            |r| r.get(0),
        )?;
        if owner_id == user_id {
            return Ok(Permissions::ALL);
        }
        let perms = conn
            .query_row(
                "SELECT can_view, can_download, can_edit FROM file_acl \
                 WHERE file_id = ?1 AND grantee_id = ?2",
                params![file_id, user_id],
                |r| {
                    Ok(Permissions {
                        view: r.get(0)?,
                        download: r.get(1)?,
                        edit: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(perms.unwrap_or_default())
    }

    fn set_permission(&self, file_id: i64, grantee_id: i64, perms: Permissions) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO file_acl (file_id, grantee_id, can_view, can_download, can_edit) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(file_id, grantee_id) DO UPDATE SET \
             can_view = excluded.can_view, \
             can_download = excluded.can_download, \
             can_edit = excluded.can_edit",
            params![file_id, grantee_id, perms.view, perms.download, perms.edit],
        )?;
        Ok(())
    }

    fn create_transfer_session(
        &self,
        user_id: i64,
        path: &str,
        direction: Direction,
        total_bytes: u64,
        offset_bytes: u64,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO transfer_session (user_id, path, direction, total_bytes, offset_bytes) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user_id,
                path,
                direction.as_str(),
                total_bytes as i64,
                offset_bytes as i64
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_transfer_session(
        &self,
        user_id: i64,
        path: &str,
        direction: Direction,
    ) -> Result<Option<TransferSession>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, total_bytes, offset_bytes FROM transfer_session \
                 WHERE user_id = ?1 AND path = ?2 AND direction = ?3 \
                 ORDER BY updated_at DESC, id DESC LIMIT 1",
                params![user_id, path, direction.as_str()],
                |r| {
                    Ok(TransferSession {
                        id: r.get(0)?,
                        total_bytes: r.get::<_, i64>(1)? as u64,
                        offset_bytes: r.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn update_transfer_session(&self, session_id: i64, offset_bytes: u64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE transfer_session SET offset_bytes = ?1, updated_at = CURRENT_TIMESTAMP \
             WHERE id = ?2",
            params![offset_bytes as i64, session_id],
        )?;
        Ok(())
    }

    fn delete_transfer_session(&self, session_id: i64) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM transfer_session WHERE id = ?1", params![session_id])?;
        Ok(())
    }

    fn insert_audit(
        &self,
        user_id: Option<i64>,
        action: &str,
        detail: &str,
        remote_addr: &str,
    ) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO audit_log (user_id, action, detail, remote_ip) \
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, action, detail, remote_addr],
        )?;
        Ok(())
    }
}
