//! Per-connection session engine.
//!
//! One blocking worker owns one `TcpStream`. Requests are single lines; a
//! few verbs stream a count-prefixed body right after the intermediate
//! `OK 100` line. Recoverable errors answer with an `ERR` line and the
//! session keeps going; any error that bubbles out of a handler means the
//! stream can no longer be re-synchronized and the connection is dropped.

use anyhow::{bail, Result};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive;
use crate::copy::{self, MAX_COPY_DEPTH};
use crate::db::{Direction, Permissions};
use crate::fsutil;
use crate::passwd;
use crate::protocol::{self, BodyCopy, CHECKPOINT_EVERY_CHUNKS};
use crate::server::{Server, DEFAULT_QUOTA_BYTES};

struct CurrentUser {
    id: i64,
    name: String,
}

/// Owner-or-shared path resolution result (the file the verb will act on).
struct ResolvedFile {
    owner_id: i64,
    owner_name: String,
    file_id: i64,
    size_bytes: u64,
    #[allow(dead_code)]
    is_folder: bool,
}

pub struct Session {
    stream: TcpStream,
    server: Arc<Server>,
    peer: String,
    user: Option<CurrentUser>,
    counted_online: bool,
}

impl Session {
    pub fn new(stream: TcpStream, server: Arc<Server>, peer: String) -> Self {
        Self {
            stream,
            server,
            peer,
            user: None,
            counted_online: false,
        }
    }

    /// Request loop. Returns when the peer closes the connection or a
    /// handler reports an unrecoverable stream failure.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let line = match protocol::read_line(&mut self.stream) {
                Ok(Some(line)) => line,
                // Clean close or a peer that vanished: nothing to answer.
                Ok(None) => return Ok(()),
                Err(_) => return Ok(()),
            };
            self.handle_command(&line)?;
        }
    }

    fn handle_command(&mut self, line: &str) -> Result<()> {
        let tokens = protocol::split_tokens(line);
        let Some(&cmd) = tokens.first() else {
            return self.send_line("ERR 400 Empty command");
        };

        match cmd {
            "AUTH" => return self.cmd_auth(&tokens),
            "REGISTER" => return self.cmd_register(&tokens),
            "WHO" => return self.cmd_who(),
            "STATS" => return self.cmd_stats(),
            _ => {}
        }

        if self.user.is_none() {
            return self.send_line("ERR 401 Not authenticated");
        }

        match cmd {
            "LOGOUT" => self.cmd_logout(),
            "LIST_DB" => self.cmd_list_db(),
            "LIST_DELETED" => self.cmd_list_deleted(),
            "CREATE_FOLDER" => self.cmd_create_folder(&tokens),
            "DELETE" => self.cmd_delete(&tokens),
            "RENAME" | "MOVE" => self.cmd_rename(&tokens),
            "COPY" => self.cmd_copy(&tokens),
            "RESTORE" => self.cmd_restore(&tokens),
            "SET_PERMISSION" => self.cmd_set_permission(&tokens),
            "CHECK_PERMISSION" => self.cmd_check_permission(&tokens),
            "UPLOAD" => self.cmd_upload(&tokens),
            "DOWNLOAD" => self.cmd_download(&tokens),
            "GET_TEXT" => self.cmd_get_text(&tokens),
            "PUT_TEXT" => self.cmd_put_text(&tokens),
            "PAUSE_UPLOAD" => self.cmd_pause_upload(&tokens),
            "CONTINUE_UPLOAD" => self.cmd_continue_upload(&tokens),
            "PAUSE_DOWNLOAD" => self.cmd_pause_download(&tokens),
            "CONTINUE_DOWNLOAD" => self.cmd_continue_download(&tokens),
            "UNZIP" => self.cmd_unzip(&tokens),
            _ => self.send_line("ERR 400 Unknown command"),
        }
    }

    // ----- small helpers ---------------------------------------------------

    fn send_line(&mut self, line: &str) -> Result<()> {
        protocol::send_line(&mut self.stream, line)
    }

    fn auth_user(&self) -> Result<(i64, String)> {
        match &self.user {
            Some(u) => Ok((u.id, u.name.clone())),
            None => bail!("command dispatched without authentication"),
        }
    }

    fn user_root(&self, name: &str) -> PathBuf {
        self.server.root().join(name)
    }

    fn audit(&self, user: &str, message: &str) {
        self.server.audit().log(user, message);
    }

    fn db_audit(&self, user_id: i64, action: &str, detail: &str) {
        self.server
            .store()
            .insert_audit(Some(user_id), action, detail, &self.peer)
            .ok();
    }

    /// Owner-or-shared resolution: the caller's own live entry wins,
    /// otherwise the most recent ACL grant at this path. `Ok(None)` covers
    /// both "no such file" and "bits missing"; callers answer 403 either
    /// way.
    fn check_file_permission(
        &self,
        path: &str,
        need: Permissions,
    ) -> Result<Option<ResolvedFile>> {
        let (uid, uname) = self.auth_user()?;
        let store = self.server.store();

        let mut resolved: Option<ResolvedFile> = None;
        if let Some(entry) = store.get_file_entry(uid, path)? {
            if !entry.is_deleted {
                resolved = Some(ResolvedFile {
                    owner_id: uid,
                    owner_name: uname,
                    file_id: entry.id,
                    size_bytes: entry.size_bytes,
                    is_folder: entry.is_folder,
                });
            }
        }
        if resolved.is_none() {
            if let Some(shared) = store.find_shared_file(path, uid)? {
                if let Some(entry) = store.get_file_entry(shared.owner_id, path)? {
                    if !entry.is_deleted {
                        resolved = Some(ResolvedFile {
                            owner_id: shared.owner_id,
                            owner_name: shared.owner_username,
                            file_id: entry.id,
                            size_bytes: entry.size_bytes,
                            is_folder: entry.is_folder,
                        });
                    }
                }
            }
        }
        let Some(file) = resolved else {
            return Ok(None);
        };

        let perms = store.check_permission(file.file_id, uid)?;
        if (need.view && !perms.view)
            || (need.download && !perms.download)
            || (need.edit && !perms.edit)
        {
            return Ok(None);
        }
        Ok(Some(file))
    }

    // ----- unauthenticated verbs -------------------------------------------

    fn cmd_auth(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 3 {
            return self.send_line("ERR 400 Usage: AUTH <user> <pass>");
        }
        let (user, pass) = (tokens[1], tokens[2]);

        let rec = match self.server.store().get_user_by_username(user) {
            Ok(Some(rec)) => rec,
            Ok(None) => {
                self.audit(user, "Login failed (user not found)");
                return self.send_line("ERR 403 Invalid credentials");
            }
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };

        if !passwd::verify_password(pass, &rec.password_hash) {
            self.audit(user, "Login failed (wrong password)");
            self.db_audit(rec.id, "login", "Login failed (wrong password)");
            return self.send_line("ERR 403 Invalid credentials");
        }

        let same_identity = self.counted_online
            && self
                .user
                .as_ref()
                .map(|u| u.name == rec.username)
                .unwrap_or(false);
        if !same_identity {
            if self.server.is_user_online(&rec.username) {
                return self.send_line("ERR 409 User already logged in");
            }
            // Switching identity mid-session releases the previous claim.
            if self.counted_online {
                if let Some(prev) = &self.user {
                    self.server.user_logout(&prev.name);
                }
                self.counted_online = false;
            }
            self.server.user_login(&rec.username);
            self.counted_online = true;
        }

        self.server
            .quota()
            .load(&rec.username, rec.quota_bytes, rec.used_bytes);
        self.user = Some(CurrentUser {
            id: rec.id,
            name: rec.username.clone(),
        });

        self.audit(&rec.username, "Login success");
        self.db_audit(rec.id, "login", "Login success");
        self.send_line("OK 200 Authenticated")
    }

    fn cmd_register(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 3 {
            return self.send_line("ERR 400 Usage: REGISTER <user> <pass>");
        }
        let (user, pass) = (tokens[1], tokens[2]);

        match self.server.store().get_user_by_username(user) {
            Ok(Some(_)) => return self.send_line("ERR 409 User already exists"),
            Ok(None) => {}
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        }

        let hash = match passwd::hash_password(pass) {
            Ok(h) => h,
            Err(_) => return self.send_line("ERR 500 Internal error"),
        };
        let new_id = match self
            .server
            .store()
            .create_user(user, &hash, DEFAULT_QUOTA_BYTES)
        {
            Ok(id) => id,
            Err(e) if e.to_string().contains("UNIQUE") => {
                return self.send_line("ERR 409 User already exists")
            }
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };

        self.audit(user, "REGISTER success");
        self.db_audit(new_id, "register", "Account created");
        self.send_line("OK 201 Registered")
    }

    fn cmd_who(&mut self) -> Result<()> {
        let list = self.server.online_snapshot().join(", ");
        self.send_line(&format!("OK 200 Users online: {list}"))
    }

    fn cmd_stats(&mut self) -> Result<()> {
        let msg = format!(
            "OK 200 online={} bytes_in={} bytes_out={}",
            self.server.online_count(),
            self.server.bytes_in(),
            self.server.bytes_out()
        );
        if let Some(u) = &self.user {
            self.server.audit().log(&u.name, "STATS");
        }
        self.send_line(&msg)
    }

    // ----- session control -------------------------------------------------

    fn cmd_logout(&mut self) -> Result<()> {
        if let Some(u) = self.user.take() {
            if self.counted_online {
                self.server.user_logout(&u.name);
                self.counted_online = false;
            }
        }
        self.send_line("OK 200 Logged out")
    }

    // ----- listings --------------------------------------------------------

    fn cmd_list_db(&mut self) -> Result<()> {
        let (uid, _) = self.auth_user()?;
        let lines = match self.server.store().list_files(uid) {
            Ok(l) => l,
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };
        self.send_line(&format!("OK 200 {}", lines.len()))?;
        let mut body = String::new();
        for line in &lines {
            body.push_str(line);
            body.push('\n');
        }
        self.stream.write_all(body.as_bytes())?;
        Ok(())
    }

    fn cmd_list_deleted(&mut self) -> Result<()> {
        let (uid, uname) = self.auth_user()?;
        let lines = match self.server.store().list_deleted_files(uid) {
            Ok(l) => l,
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };
        self.send_line(&format!("OK 200 {}", lines.len()))?;
        let mut body = String::new();
        for line in &lines {
            body.push_str(line);
            body.push('\n');
        }
        self.stream.write_all(body.as_bytes())?;
        self.audit(&uname, "LIST_DELETED");
        Ok(())
    }

    // ----- tree manipulation -----------------------------------------------

    fn cmd_create_folder(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 2 {
            return self.send_line("ERR 400 Usage: CREATE_FOLDER <path>");
        }
        let rel = tokens[1];
        let (uid, uname) = self.auth_user()?;
        let full = match fsutil::resolve_under(&self.user_root(&uname), rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };
        if std::fs::create_dir_all(&full).is_err() {
            return self.send_line("ERR 500 Cannot create folder");
        }
        if let Err(e) = self.server.store().upsert_file_entry(uid, rel, 0, true) {
            return self.send_line(&format!("ERR 500 DB error: {e}"));
        }
        self.audit(&uname, &format!("CREATE_FOLDER {rel}"));
        self.db_audit(uid, "create_folder", rel);
        self.send_line("OK 200 Folder created")
    }

    fn cmd_delete(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 2 {
            return self.send_line("ERR 400 Usage: DELETE <path>");
        }
        let rel = tokens[1];
        let (uid, uname) = self.auth_user()?;

        let root = self.user_root(&uname);
        let full = match fsutil::resolve_under(&root, rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };
        let trash = match fsutil::resolve_under(&root.join(".trash"), rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };

        // Sharing never grants delete: the path must resolve in the caller's
        // own tree.
        match self.server.store().get_file_id_by_path(uid, rel) {
            Ok(Some(_)) => {}
            Ok(None) => return self.send_line("ERR 404 File not found"),
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        }
        if fsutil::ensure_parent_dir(&trash).is_err() {
            return self.send_line("ERR 500 Move to trash failed");
        }
        // Last delete wins: replace any earlier trashed object at this path.
        if trash.is_dir() {
            std::fs::remove_dir_all(&trash).ok();
        } else {
            std::fs::remove_file(&trash).ok();
        }

        let moved = match std::fs::rename(&full, &trash) {
            Ok(()) => true,
            // Row without a filesystem object: tombstone it anyway.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(_) => return self.send_line("ERR 500 Move to trash failed"),
        };

        match self.server.store().delete_file_entry(uid, rel) {
            Ok(true) => {}
            Ok(false) => return self.send_line("ERR 404 File not found"),
            Err(e) => {
                if moved {
                    std::fs::rename(&trash, &full).ok();
                }
                return self.send_line(&format!("ERR 500 DB error: {e}"));
            }
        }

        if moved && fsutil::file_exists(&trash) {
            let size = fsutil::file_size(&trash);
            let used = self.server.quota().adjust_usage(&uname, -(size as i64));
            self.server.store().update_used_bytes(uid, used).ok();
        }

        self.audit(&uname, &format!("DELETE {rel}"));
        self.db_audit(uid, "delete", rel);
        self.send_line("OK 200 Deleted")
    }

    fn cmd_rename(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 3 {
            return self.send_line("ERR 400 Usage: RENAME <old_path> <new_path>");
        }
        let (old_rel, new_rel) = (tokens[1], tokens[2]);
        let (uid, uname) = self.auth_user()?;
        let root = self.user_root(&uname);
        let old_full = match fsutil::resolve_under(&root, old_rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };
        let new_full = match fsutil::resolve_under(&root, new_rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };

        // Refuse to clobber an existing object so a failed rename leaves
        // metadata untouched.
        if new_full.exists() {
            return self.send_line("ERR 500 Rename failed");
        }
        if fsutil::ensure_parent_dir(&new_full).is_err()
            || std::fs::rename(&old_full, &new_full).is_err()
        {
            return self.send_line("ERR 500 Rename failed");
        }
        if let Err(e) = self.server.store().rename_file_entry(uid, old_rel, new_rel) {
            return self.send_line(&format!("ERR 500 DB error: {e}"));
        }

        self.audit(&uname, &format!("RENAME {old_rel} -> {new_rel}"));
        self.db_audit(uid, "rename", &format!("{old_rel} -> {new_rel}"));
        self.send_line("OK 200 Renamed")
    }

    fn cmd_copy(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 3 {
            return self.send_line("ERR 400 Usage: COPY <src_path> <dst_path>");
        }
        let (src_rel, dst_rel) = (tokens[1], tokens[2]);
        let (uid, uname) = self.auth_user()?;
        let root = self.user_root(&uname);
        let src_full = match fsutil::resolve_under(&root, src_rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };
        let dst_full = match fsutil::resolve_under(&root, dst_rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };

        let md = match std::fs::symlink_metadata(&src_full) {
            Ok(md) => md,
            Err(_) => return self.send_line("ERR 404 Source not found"),
        };
        if md.file_type().is_symlink() {
            return self.send_line("ERR 500 Symlinks are not copied");
        }

        if md.is_file() {
            let size = md.len();
            if !self.server.quota().try_reserve(&uname, size) {
                return self.send_line("ERR 403 Quota exceeded");
            }
            let copied = match copy::copy_file(&src_full, &dst_full) {
                Ok(n) => n,
                Err(_) => {
                    self.server.quota().release_reservation(&uname, size);
                    return self.send_line("ERR 500 Copy failed");
                }
            };
            let used = self
                .server
                .quota()
                .commit_reservation(&uname, size, copied as i64);
            self.server.store().update_used_bytes(uid, used).ok();
            if let Err(e) = self.server.store().copy_file_entry(uid, src_rel, dst_rel) {
                return self.send_line(&format!("ERR 500 DB error: {e}"));
            }
        } else {
            // Directory: pre-scan for the quota reservation, then copy each
            // immediate entry the way the verb itself would.
            let total = match tree_size(&src_full, 0) {
                Ok(n) => n,
                Err(e) => return self.send_line(&format!("ERR 500 Copy failed: {e}")),
            };
            if !self.server.quota().try_reserve(&uname, total) {
                return self.send_line("ERR 403 Quota exceeded");
            }
            match self.copy_tree(uid, &uname, src_rel, dst_rel, 0) {
                Ok(copied) => {
                    let used = self
                        .server
                        .quota()
                        .commit_reservation(&uname, total, copied as i64);
                    self.server.store().update_used_bytes(uid, used).ok();
                    if let Err(e) = self.server.store().upsert_file_entry(uid, dst_rel, 0, true)
                    {
                        return self.send_line(&format!("ERR 500 DB error: {e}"));
                    }
                }
                Err(e) => {
                    self.server.quota().release_reservation(&uname, total);
                    return self.send_line(&format!("ERR 500 Copy failed: {e}"));
                }
            }
        }

        self.audit(&uname, &format!("COPY {src_rel} -> {dst_rel}"));
        self.db_audit(uid, "copy", &format!("{src_rel} -> {dst_rel}"));
        self.send_line("OK 200 Copied")
    }

    /// Recursive arm of COPY. Returns the bytes copied; metadata rows are
    /// duplicated per child (files carry the source ACL).
    fn copy_tree(
        &self,
        uid: i64,
        uname: &str,
        src_rel: &str,
        dst_rel: &str,
        depth: usize,
    ) -> Result<u64> {
        if depth > MAX_COPY_DEPTH {
            bail!("recursion too deep");
        }
        let root = self.user_root(uname);
        let src_full = fsutil::resolve_under(&root, src_rel)?;
        let dst_full = fsutil::resolve_under(&root, dst_rel)?;
        copy::reject_symlink(&src_full)?;
        std::fs::create_dir_all(&dst_full)?;

        let mut copied = 0u64;
        for entry in std::fs::read_dir(&src_full)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_src = format!("{src_rel}/{name}");
            let child_dst = format!("{dst_rel}/{name}");
            let ft = entry.file_type()?;
            if ft.is_symlink() {
                bail!("symlinks are not copied");
            }
            if ft.is_dir() {
                copied += self.copy_tree(uid, uname, &child_src, &child_dst, depth + 1)?;
                self.server
                    .store()
                    .upsert_file_entry(uid, &child_dst, 0, true)?;
            } else {
                let src_p = fsutil::resolve_under(&root, &child_src)?;
                let dst_p = fsutil::resolve_under(&root, &child_dst)?;
                copied += copy::copy_file(&src_p, &dst_p)?;
                // Untracked files on disk still copy; metadata follows only
                // for tracked ones.
                if self
                    .server
                    .store()
                    .get_file_id_by_path(uid, &child_src)?
                    .is_some()
                {
                    self.server
                        .store()
                        .copy_file_entry(uid, &child_src, &child_dst)?;
                } else {
                    self.server.store().upsert_file_entry(
                        uid,
                        &child_dst,
                        fsutil::file_size(&dst_p),
                        false,
                    )?;
                }
            }
        }
        Ok(copied)
    }

    fn cmd_restore(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 2 {
            return self.send_line("ERR 400 Usage: RESTORE <path>");
        }
        let rel = tokens[1];
        let (uid, uname) = self.auth_user()?;
        let root = self.user_root(&uname);
        let full = match fsutil::resolve_under(&root, rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };
        let trash = match fsutil::resolve_under(&root.join(".trash"), rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };

        let trash_md = match std::fs::symlink_metadata(&trash) {
            Ok(md) => md,
            Err(_) => return self.send_line("ERR 404 Cannot find deleted file content"),
        };

        match self.server.store().restore_file_entry(uid, rel) {
            Ok(true) => {}
            Ok(false) => return self.send_line("ERR 404 File not found in deleted list"),
            // Covers restoring onto an occupied path: the partial unique
            // index refuses and nothing changes.
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        }

        if fsutil::ensure_parent_dir(&full).is_err()
            || std::fs::rename(&trash, &full).is_err()
        {
            self.server.store().delete_file_entry(uid, rel).ok();
            return self.send_line("ERR 500 Restore failed");
        }

        if trash_md.is_file() {
            let size = trash_md.len();
            let used = self.server.quota().adjust_usage(&uname, size as i64);
            self.server.store().update_used_bytes(uid, used).ok();
        }

        self.audit(&uname, &format!("RESTORE {rel}"));
        self.db_audit(uid, "restore", rel);
        self.send_line("OK 200 Restored")
    }

    // ----- sharing ---------------------------------------------------------

    fn cmd_set_permission(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 6 {
            return self
                .send_line("ERR 400 Usage: SET_PERMISSION <path> <target_user> <view> <download> <edit>");
        }
        let rel = tokens[1];
        let target_user = tokens[2];
        let perms = Permissions {
            view: parse_bool(tokens[3]),
            download: parse_bool(tokens[4]),
            edit: parse_bool(tokens[5]),
        };
        let (uid, uname) = self.auth_user()?;

        // Only the owner may share.
        let file_id = match self.server.store().get_file_id_by_path(uid, rel) {
            Ok(Some(id)) => id,
            Ok(None) => return self.send_line("ERR 404 File not found"),
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };
        let target = match self.server.store().get_user_by_username(target_user) {
            Ok(Some(rec)) => rec,
            Ok(None) => return self.send_line("ERR 404 Target user not found"),
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };
        // The owner's bits are implicit; no row is stored for them.
        if target.id == uid {
            return self.send_line("ERR 400 Owner already has full access");
        }
        if let Err(e) = self.server.store().set_permission(file_id, target.id, perms) {
            return self.send_line(&format!("ERR 500 Cannot set permission: {e}"));
        }

        self.audit(&uname, &format!("SET_PERMISSION {rel} for {target_user}"));
        self.db_audit(uid, "set_permission", &format!("{rel} for {target_user}"));
        self.send_line("OK 200 Permission set")
    }

    fn cmd_check_permission(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 2 {
            return self.send_line("ERR 400 Usage: CHECK_PERMISSION <path>");
        }
        let rel = tokens[1];
        let (uid, _) = self.auth_user()?;
        let store = self.server.store();

        let file_id = match store.get_file_id_by_path(uid, rel) {
            Ok(Some(id)) => Some(id),
            Ok(None) => match store.find_shared_file(rel, uid) {
                Ok(shared) => shared.map(|s| s.file_id),
                Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
            },
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };
        let Some(file_id) = file_id else {
            return self.send_line("ERR 404 File not found");
        };
        let perms = match store.check_permission(file_id, uid) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 500 Cannot check permission: {e}")),
        };
        self.send_line(&format!(
            "OK 200 view={} download={} edit={}",
            perms.view as u8, perms.download as u8, perms.edit as u8
        ))
    }

    // ----- transfers -------------------------------------------------------

    fn cmd_upload(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 3 {
            return self.send_line("ERR 400 Usage: UPLOAD <size> <path>");
        }
        let size: u64 = match tokens[1].parse() {
            Ok(n) => n,
            Err(_) => return self.send_line("ERR 400 Invalid size"),
        };
        // The path is everything after the size and may contain spaces.
        let rel = tokens[2..].join(" ");
        let (uid, uname) = self.auth_user()?;
        let full = match fsutil::resolve_under(&self.user_root(&uname), &rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };
        let tmp = tmp_path(&full);

        let old_size = fsutil::file_size(&full);
        let additional = size.saturating_sub(old_size);
        if !self.server.quota().try_reserve(&uname, additional) {
            return self.send_line("ERR 403 Quota exceeded");
        }

        if fsutil::ensure_parent_dir(&full).is_err() {
            self.server.quota().release_reservation(&uname, additional);
            return self.send_line("ERR 500 Cannot open temp file");
        }
        let mut out = match File::create(&tmp) {
            Ok(f) => f,
            Err(_) => {
                self.server.quota().release_reservation(&uname, additional);
                return self.send_line("ERR 500 Cannot open temp file");
            }
        };

        self.send_line("OK 100 Ready to receive")?;

        let server = Arc::clone(&self.server);
        match protocol::copy_body(&mut self.stream, &mut out, size, |n| server.add_bytes_in(n)) {
            BodyCopy::Complete(_) => {}
            BodyCopy::SourceClosed(received) => {
                // Best-effort checkpoint of what safely landed in the tmp
                // file, then drop the connection.
                self.checkpoint_upload(uid, &rel, size, received);
                self.server.quota().release_reservation(&uname, additional);
                bail!("client disconnected during upload body");
            }
            BodyCopy::SinkFailed(_) => {
                self.server.quota().release_reservation(&uname, additional);
                self.send_line("ERR 500 Write error").ok();
                bail!("disk write failed mid-body");
            }
        }
        drop(out);

        if std::fs::rename(&tmp, &full).is_err() {
            self.server.quota().release_reservation(&uname, additional);
            std::fs::remove_file(&tmp).ok();
            return self.send_line("ERR 500 Rename failed");
        }

        let delta = size as i64 - old_size as i64;
        let used = self
            .server
            .quota()
            .commit_reservation(&uname, additional, delta);
        self.server.store().update_used_bytes(uid, used).ok();
        if let Err(e) = self.server.store().upsert_file_entry(uid, &rel, size, false) {
            return self.send_line(&format!("ERR 500 DB error: {e}"));
        }

        // A completed upload invalidates any stale checkpoint.
        if let Ok(Some(sess)) = self
            .server
            .store()
            .get_transfer_session(uid, &rel, Direction::Upload)
        {
            self.server.store().delete_transfer_session(sess.id).ok();
        }

        self.audit(&uname, &format!("UPLOAD {rel} size={size}"));
        self.db_audit(uid, "upload", &format!("{rel} size={size}"));
        self.send_line("OK 200 Upload completed")
    }

    fn checkpoint_upload(&self, uid: i64, rel: &str, total: u64, received: u64) {
        let store = self.server.store();
        match store.get_transfer_session(uid, rel, Direction::Upload) {
            Ok(Some(sess)) => {
                store.update_transfer_session(sess.id, received).ok();
            }
            Ok(None) => {
                store
                    .create_transfer_session(uid, rel, Direction::Upload, total, received)
                    .ok();
            }
            Err(_) => {}
        }
    }

    fn cmd_download(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 2 {
            return self.send_line("ERR 400 Usage: DOWNLOAD <path>");
        }
        let rel = tokens[1];
        let (uid, uname) = self.auth_user()?;

        let resolved = match self.check_file_permission(
            rel,
            Permissions {
                download: true,
                ..Permissions::default()
            },
        ) {
            Ok(Some(r)) => r,
            Ok(None) => return self.send_line("ERR 403 Permission denied"),
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };

        let full = match fsutil::resolve_under(&self.user_root(&resolved.owner_name), rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };
        let size = fsutil::file_size(&full);
        if size == 0 && resolved.size_bytes == 0 {
            return self.send_line("ERR 404 File not found");
        }
        let mut file = match File::open(&full) {
            Ok(f) => f,
            Err(_) => return self.send_line("ERR 500 Cannot open file"),
        };

        self.send_line(&format!("OK 100 {size}"))?;

        let server = Arc::clone(&self.server);
        match protocol::copy_body(&mut file, &mut self.stream, size, |n| server.add_bytes_out(n)) {
            BodyCopy::Complete(_) => {}
            // The file came up short against its own stat; nothing more to
            // send, and no line may follow once the body has started.
            BodyCopy::SourceClosed(_) => {}
            BodyCopy::SinkFailed(served) => {
                // Checkpoint the offset the client actually has, then drop.
                self.checkpoint_download(uid, rel, size, served);
                bail!("client disconnected during download body");
            }
        }

        if let Ok(Some(sess)) = self
            .server
            .store()
            .get_transfer_session(uid, rel, Direction::Download)
        {
            self.server.store().delete_transfer_session(sess.id).ok();
        }
        self.audit(&uname, &format!("DOWNLOAD {rel} size={size}"));
        self.db_audit(uid, "download", &format!("{rel} size={size}"));
        Ok(())
    }

    fn checkpoint_download(&self, uid: i64, rel: &str, total: u64, served: u64) {
        let store = self.server.store();
        match store.get_transfer_session(uid, rel, Direction::Download) {
            Ok(Some(sess)) => {
                store.update_transfer_session(sess.id, served).ok();
            }
            Ok(None) => {
                store
                    .create_transfer_session(uid, rel, Direction::Download, total, served)
                    .ok();
            }
            Err(_) => {}
        }
    }

    fn cmd_get_text(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 2 {
            return self.send_line("ERR 400 Usage: GET_TEXT <path>");
        }
        let rel = tokens[1];
        if !is_txt(rel) {
            return self.send_line("ERR 415 Only .txt allowed");
        }
        let (_, uname) = self.auth_user()?;

        // View or edit both open the file for reading.
        let view = Permissions {
            view: true,
            ..Permissions::default()
        };
        let edit = Permissions {
            edit: true,
            ..Permissions::default()
        };
        let resolved = match self.check_file_permission(rel, view) {
            Ok(Some(r)) => Some(r),
            Ok(None) => match self.check_file_permission(rel, edit) {
                Ok(r) => r,
                Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
            },
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };
        let Some(resolved) = resolved else {
            return self.send_line("ERR 403 Permission denied");
        };

        let full = match fsutil::resolve_under(&self.user_root(&resolved.owner_name), rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };
        let content = match std::fs::read(&full) {
            Ok(c) => c,
            Err(_) => return self.send_line("ERR 404 File not found"),
        };

        self.send_line(&format!("OK 100 {}", content.len()))?;
        self.stream.write_all(&content)?;
        self.server.add_bytes_out(content.len() as u64);
        self.audit(&uname, &format!("GET_TEXT {rel} size={}", content.len()));
        Ok(())
    }

    fn cmd_put_text(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 3 {
            return self.send_line("ERR 400 Usage: PUT_TEXT <path> <size>");
        }
        let rel = tokens[1];
        if !is_txt(rel) {
            return self.send_line("ERR 415 Only .txt allowed");
        }
        let size: u64 = match tokens[2].parse() {
            Ok(n) => n,
            Err(_) => return self.send_line("ERR 400 Invalid size"),
        };
        let (uid, uname) = self.auth_user()?;

        // Resolve the write target: an existing file (owned or shared)
        // demands the edit bit; a fresh path lands in the caller's own tree
        // unless an edit grant points at another owner's copy of it.
        let edit = Permissions {
            edit: true,
            ..Permissions::default()
        };
        let owns_live_entry = match self.server.store().get_file_entry(uid, rel) {
            Ok(Some(e)) => !e.is_deleted,
            Ok(None) => false,
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };
        let (owner_id, owner_name) = match self.check_file_permission(rel, edit) {
            Ok(Some(r)) => (r.owner_id, r.owner_name),
            Ok(None) => {
                if owns_live_entry {
                    // Entry exists but edit was denied (only possible for a
                    // grantee path shadowing; owners always pass).
                    return self.send_line("ERR 403 Permission denied (edit required)");
                }
                match self.server.store().find_shared_file(rel, uid) {
                    Ok(Some(_)) => {
                        return self.send_line("ERR 403 Permission denied (edit required)")
                    }
                    Ok(None) => (uid, uname.clone()),
                    Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
                }
            }
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };

        let full = match fsutil::resolve_under(&self.user_root(&owner_name), rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };
        let tmp = tmp_path(&full);
        let old_size = fsutil::file_size(&full);
        let additional = size.saturating_sub(old_size);
        // Quota is charged to the tree that grows: the owner's.
        if !self.server.quota().try_reserve(&owner_name, additional) {
            return self.send_line("ERR 403 Quota exceeded");
        }

        if fsutil::ensure_parent_dir(&full).is_err() {
            self.server.quota().release_reservation(&owner_name, additional);
            return self.send_line("ERR 500 Cannot open temp file");
        }
        let mut out = match File::create(&tmp) {
            Ok(f) => f,
            Err(_) => {
                self.server.quota().release_reservation(&owner_name, additional);
                return self.send_line("ERR 500 Cannot open temp file");
            }
        };

        self.send_line("OK 100 Ready to receive")?;

        let server = Arc::clone(&self.server);
        match protocol::copy_body(&mut self.stream, &mut out, size, |n| server.add_bytes_in(n)) {
            BodyCopy::Complete(_) => {}
            BodyCopy::SourceClosed(_) => {
                self.server.quota().release_reservation(&owner_name, additional);
                self.send_line("ERR 500 Receive error").ok();
                bail!("client disconnected during text body");
            }
            BodyCopy::SinkFailed(_) => {
                self.server.quota().release_reservation(&owner_name, additional);
                self.send_line("ERR 500 Write error").ok();
                bail!("disk write failed mid-body");
            }
        }
        drop(out);

        if std::fs::rename(&tmp, &full).is_err() {
            self.server.quota().release_reservation(&owner_name, additional);
            std::fs::remove_file(&tmp).ok();
            return self.send_line("ERR 500 Rename failed");
        }

        let delta = size as i64 - old_size as i64;
        let used = self
            .server
            .quota()
            .commit_reservation(&owner_name, additional, delta);
        self.server.store().update_used_bytes(owner_id, used).ok();
        if let Err(e) = self
            .server
            .store()
            .upsert_file_entry(owner_id, rel, size, false)
        {
            return self.send_line(&format!("ERR 500 DB error: {e}"));
        }

        self.audit(&uname, &format!("PUT_TEXT {rel} size={size}"));
        self.db_audit(uid, "put_text", &format!("{rel} size={size}"));
        self.send_line("OK 200 Text file updated")
    }

    // ----- pause / continue ------------------------------------------------

    fn cmd_pause_upload(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 2 {
            return self.send_line("ERR 400 Usage: PAUSE_UPLOAD <path> [total]");
        }
        let rel = tokens[1];
        let (uid, uname) = self.auth_user()?;
        let full = match fsutil::resolve_under(&self.user_root(&uname), rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };
        let tmp = tmp_path(&full);
        let current = if fsutil::file_exists(&tmp) {
            fsutil::file_size(&tmp)
        } else {
            fsutil::file_size(&full)
        };

        match self
            .server
            .store()
            .get_transfer_session(uid, rel, Direction::Upload)
        {
            Ok(Some(sess)) => {
                if let Err(e) = self.server.store().update_transfer_session(sess.id, current) {
                    return self.send_line(&format!("ERR 500 DB error: {e}"));
                }
            }
            Ok(None) => {
                let total: u64 = tokens
                    .get(2)
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(0);
                if self
                    .server
                    .store()
                    .create_transfer_session(uid, rel, Direction::Upload, total, current)
                    .is_err()
                {
                    return self.send_line("ERR 500 Cannot create session");
                }
            }
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        }

        self.audit(&uname, &format!("PAUSE_UPLOAD {rel} at {current}"));
        self.send_line(&format!("OK 200 Upload paused at offset {current}"))
    }

    fn cmd_continue_upload(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 2 {
            return self.send_line("ERR 400 Usage: CONTINUE_UPLOAD <path>");
        }
        let rel = tokens[1];
        let (uid, uname) = self.auth_user()?;

        let sess = match self
            .server
            .store()
            .get_transfer_session(uid, rel, Direction::Upload)
        {
            Ok(Some(s)) => s,
            Ok(None) => return self.send_line("ERR 404 No paused upload found"),
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };

        let full = match fsutil::resolve_under(&self.user_root(&uname), rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };
        let tmp = tmp_path(&full);
        let resuming_tmp = fsutil::file_exists(&tmp);
        let target = if resuming_tmp { tmp.clone() } else { full.clone() };

        let total = sess.total_bytes;
        let offset = sess.offset_bytes;
        if total < offset {
            return self.send_line("ERR 400 Invalid resume offset");
        }
        let remaining = total - offset;
        if remaining == 0 {
            self.server.store().delete_transfer_session(sess.id).ok();
            return self.send_line("OK 200 Upload already completed");
        }

        // The reservation lost with the first connection is re-taken here,
        // sized against the previously stored entry.
        let prev_size = match self.server.store().get_file_entry(uid, rel) {
            Ok(Some(e)) if !e.is_deleted => e.size_bytes,
            Ok(_) => 0,
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };
        let additional = total.saturating_sub(prev_size);
        if !self.server.quota().try_reserve(&uname, additional) {
            return self.send_line("ERR 403 Quota exceeded");
        }

        if fsutil::ensure_parent_dir(&full).is_err() {
            self.server.quota().release_reservation(&uname, additional);
            return self.send_line("ERR 500 Cannot open file");
        }
        let mut out = match OpenOptions::new().create(true).append(true).open(&target) {
            Ok(f) => f,
            Err(_) => {
                self.server.quota().release_reservation(&uname, additional);
                return self.send_line("ERR 500 Cannot open file");
            }
        };

        self.send_line(&format!("OK 100 Continue from {offset} size {remaining}"))?;

        let server = Arc::clone(&self.server);
        let sess_id = sess.id;
        let base = offset;
        let mut landed = 0u64;
        let mut chunks = 0u64;
        let outcome = protocol::copy_body(&mut self.stream, &mut out, remaining, |n| {
            server.add_bytes_in(n);
            landed += n;
            chunks += 1;
            if chunks % CHECKPOINT_EVERY_CHUNKS == 0 {
                server.store().update_transfer_session(sess_id, base + landed).ok();
            }
        });
        match outcome {
            BodyCopy::Complete(_) => {}
            BodyCopy::SourceClosed(received) => {
                self.server
                    .store()
                    .update_transfer_session(sess_id, base + received)
                    .ok();
                self.server.quota().release_reservation(&uname, additional);
                bail!("client disconnected during resumed upload");
            }
            BodyCopy::SinkFailed(received) => {
                self.server
                    .store()
                    .update_transfer_session(sess_id, base + received)
                    .ok();
                self.server.quota().release_reservation(&uname, additional);
                self.send_line("ERR 500 Write error").ok();
                bail!("disk write failed mid-body");
            }
        }
        drop(out);

        self.server.store().delete_transfer_session(sess.id).ok();

        if resuming_tmp && std::fs::rename(&tmp, &full).is_err() {
            self.server.quota().release_reservation(&uname, additional);
            return self.send_line("ERR 500 Rename failed");
        }

        let final_size = fsutil::file_size(&full);
        let delta = final_size as i64 - prev_size as i64;
        let used = self
            .server
            .quota()
            .commit_reservation(&uname, additional, delta);
        self.server.store().update_used_bytes(uid, used).ok();
        if let Err(e) = self
            .server
            .store()
            .upsert_file_entry(uid, rel, final_size, false)
        {
            return self.send_line(&format!("ERR 500 DB error: {e}"));
        }

        self.audit(&uname, &format!("CONTINUE_UPLOAD completed {rel}"));
        self.db_audit(uid, "upload", &format!("{rel} resumed size={final_size}"));
        self.send_line("OK 200 Upload completed")
    }

    fn cmd_pause_download(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 2 {
            return self.send_line("ERR 400 Usage: PAUSE_DOWNLOAD <path> [offset]");
        }
        let rel = tokens[1];
        let (uid, uname) = self.auth_user()?;

        let resolved = match self.check_file_permission(
            rel,
            Permissions {
                download: true,
                ..Permissions::default()
            },
        ) {
            Ok(Some(r)) => r,
            Ok(None) => return self.send_line("ERR 403 Permission denied"),
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };

        let full = match fsutil::resolve_under(&self.user_root(&resolved.owner_name), rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };
        let mut total = fsutil::file_size(&full);
        if total == 0 {
            total = resolved.size_bytes;
        }
        if total == 0 {
            return self.send_line("ERR 404 File not found");
        }
        let offset: u64 = tokens.get(2).and_then(|t| t.parse().ok()).unwrap_or(0);

        match self
            .server
            .store()
            .get_transfer_session(uid, rel, Direction::Download)
        {
            Ok(Some(sess)) => {
                if let Err(e) = self.server.store().update_transfer_session(sess.id, offset) {
                    return self.send_line(&format!("ERR 500 DB error: {e}"));
                }
            }
            Ok(None) => {
                if self
                    .server
                    .store()
                    .create_transfer_session(uid, rel, Direction::Download, total, offset)
                    .is_err()
                {
                    return self.send_line("ERR 500 Cannot create session");
                }
            }
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        }

        self.audit(&uname, &format!("PAUSE_DOWNLOAD {rel} at {offset}"));
        self.send_line(&format!("OK 200 Download paused at offset {offset}"))
    }

    fn cmd_continue_download(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 2 {
            return self.send_line("ERR 400 Usage: CONTINUE_DOWNLOAD <path>");
        }
        let rel = tokens[1];
        let (uid, uname) = self.auth_user()?;

        let sess = match self
            .server
            .store()
            .get_transfer_session(uid, rel, Direction::Download)
        {
            Ok(Some(s)) => s,
            Ok(None) => return self.send_line("ERR 404 No paused download found"),
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };

        let resolved = match self.check_file_permission(
            rel,
            Permissions {
                download: true,
                ..Permissions::default()
            },
        ) {
            Ok(Some(r)) => r,
            Ok(None) => return self.send_line("ERR 403 Permission denied"),
            Err(e) => return self.send_line(&format!("ERR 500 DB error: {e}")),
        };

        let full = match fsutil::resolve_under(&self.user_root(&resolved.owner_name), rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };
        let mut file = match File::open(&full) {
            Ok(f) => f,
            Err(_) => return self.send_line("ERR 500 Cannot open file"),
        };
        let offset = sess.offset_bytes;
        let remaining = sess.total_bytes.saturating_sub(offset);
        if file.seek(SeekFrom::Start(offset)).is_err() {
            return self.send_line("ERR 500 Cannot open file");
        }

        self.send_line(&format!("OK 100 Continue from {offset} size {remaining}"))?;

        let server = Arc::clone(&self.server);
        let sess_id = sess.id;
        let mut landed = 0u64;
        let mut chunks = 0u64;
        let outcome = protocol::copy_body(&mut file, &mut self.stream, remaining, |n| {
            server.add_bytes_out(n);
            landed += n;
            chunks += 1;
            if chunks % CHECKPOINT_EVERY_CHUNKS == 0 {
                server.store().update_transfer_session(sess_id, offset + landed).ok();
            }
        });
        match outcome {
            BodyCopy::Complete(_) => {}
            // File shorter than the recorded total: stop streaming.
            BodyCopy::SourceClosed(_) => {}
            BodyCopy::SinkFailed(served) => {
                self.server
                    .store()
                    .update_transfer_session(sess_id, offset + served)
                    .ok();
                bail!("client disconnected during resumed download");
            }
        }

        self.server.store().delete_transfer_session(sess.id).ok();
        self.audit(&uname, &format!("CONTINUE_DOWNLOAD completed {rel}"));
        Ok(())
    }

    // ----- unzip -----------------------------------------------------------

    fn cmd_unzip(&mut self, tokens: &[&str]) -> Result<()> {
        if tokens.len() < 2 {
            return self.send_line("ERR 400 Usage: UNZIP <zip_path> [target_dir]");
        }
        let zip_rel = tokens[1];
        let target_dir = tokens.get(2).copied();
        let (uid, uname) = self.auth_user()?;

        if !zip_rel.ends_with(".zip") {
            return self.send_line("ERR 415 Not a zip file");
        }
        let base = self.user_root(&uname);
        let zip_full = match fsutil::resolve_under(&base, zip_rel) {
            Ok(p) => p,
            Err(e) => return self.send_line(&format!("ERR 400 {e}")),
        };
        if !fsutil::file_exists(&zip_full) {
            return self.send_line("ERR 404 Zip file not found");
        }

        let total = match archive::total_uncompressed_size(&zip_full) {
            Ok(n) => n,
            Err(_) => return self.send_line("ERR 500 Cannot open zip file"),
        };
        let extract_dir = match target_dir {
            None => base.clone(),
            Some(t) => match fsutil::resolve_under(&base, t) {
                Ok(p) => p,
                Err(e) => return self.send_line(&format!("ERR 400 {e}")),
            },
        };

        if !self.server.quota().try_reserve(&uname, total) {
            return self.send_line("ERR 403 Quota exceeded for unzip");
        }

        let entries = match archive::extract_archive(&zip_full, &extract_dir) {
            Ok(entries) => entries,
            Err(_) => {
                self.server.quota().release_reservation(&uname, total);
                return self.send_line("ERR 500 Unzip failed");
            }
        };

        let mut extracted_bytes = 0u64;
        for entry in &entries {
            extracted_bytes += entry.size_bytes;
            let entry_rel = match target_dir {
                Some(t) => format!("{t}/{}", entry.rel_path),
                None => entry.rel_path.clone(),
            };
            self.server
                .store()
                .upsert_file_entry(uid, &entry_rel, entry.size_bytes, false)
                .ok();
        }
        let used = self
            .server
            .quota()
            .commit_reservation(&uname, total, extracted_bytes as i64);
        self.server.store().update_used_bytes(uid, used).ok();

        self.audit(
            &uname,
            &format!("UNZIP {zip_rel} extracted {extracted_bytes} bytes"),
        );
        self.db_audit(uid, "unzip", &format!("{zip_rel} entries={}", entries.len()));
        self.send_line(&format!("OK 200 Unzipped {} entries", entries.len()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // The online-login claim must not outlive the session, whatever
        // killed it.
        if self.counted_online {
            if let Some(u) = &self.user {
                self.server.user_logout(&u.name);
            }
        }
    }
}

fn tmp_path(full: &Path) -> PathBuf {
    let mut s = full.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

fn is_txt(path: &str) -> bool {
    path.ends_with(".txt")
}

fn parse_bool(token: &str) -> bool {
    token == "1" || token.eq_ignore_ascii_case("true")
}

/// Total size of the regular files under `path`, refusing symlinks and
/// runaway depth.
fn tree_size(path: &Path, depth: usize) -> Result<u64> {
    if depth > MAX_COPY_DEPTH {
        bail!("recursion too deep");
    }
    copy::reject_symlink(path)?;
    let md = std::fs::symlink_metadata(path)?;
    if md.is_file() {
        return Ok(md.len());
    }
    let mut total = 0u64;
    for entry in std::fs::read_dir(path)? {
        total += tree_size(&entry?.path(), depth + 1)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("/data/alice/a.bin")),
            Path::new("/data/alice/a.bin.tmp")
        );
    }

    #[test]
    fn txt_and_bool_token_rules() {
        assert!(is_txt("notes.txt"));
        assert!(!is_txt("notes.txt.bak"));
        assert!(!is_txt("archive.zip"));
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("yes"));
    }

    #[test]
    fn tree_size_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/x.bin"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("a/b/y.bin"), vec![0u8; 32]).unwrap();
        assert_eq!(tree_size(&dir.path().join("a"), 0).unwrap(), 42);
    }
}
