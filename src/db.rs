//! Metadata store interface.
//!
//! The store is the source of truth for users, file entries, ACLs, resumable
//! transfer checkpoints, and the audit trail. Every operation is
//! independently atomic; implementations serialize internally.

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub quota_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub id: i64,
    pub size_bytes: u64,
    pub is_folder: bool,
    pub is_deleted: bool,
}

/// Result of resolving a path through another owner's ACL grant.
#[derive(Debug, Clone)]
pub struct SharedFile {
    pub file_id: i64,
    pub owner_id: i64,
    pub owner_username: String,
}

/// The three independent ACL bits. The owner of a file implicitly holds all
/// of them; no row is ever stored for the owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    pub view: bool,
    pub download: bool,
    pub edit: bool,
}

impl Permissions {
    pub const ALL: Permissions = Permissions {
        view: true,
        download: true,
        edit: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "UPLOAD",
            Direction::Download => "DOWNLOAD",
        }
    }
}

/// A checkpoint for a paused or interrupted transfer.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub id: i64,
    pub total_bytes: u64,
    pub offset_bytes: u64,
}

pub trait MetaStore: Send + Sync {
    fn init_schema(&self) -> Result<()>;

    // Users
    fn get_user_by_username(&self, username: &str) -> Result<Option<UserRecord>>;
    /// Fails on a duplicate username (surface contains "UNIQUE").
    fn create_user(&self, username: &str, password_hash: &str, quota_bytes: u64) -> Result<i64>;
    fn update_used_bytes(&self, user_id: i64, used_bytes: u64) -> Result<()>;

    // File entries
    fn upsert_file_entry(
        &self,
        owner_id: i64,
        path: &str,
        size_bytes: u64,
        is_folder: bool,
    ) -> Result<()>;
    /// The non-deleted entry at (owner, path) if one exists, otherwise the
    /// most recent tombstoned one.
    fn get_file_entry(&self, owner_id: i64, path: &str) -> Result<Option<FileEntry>>;
    /// Non-deleted entries of `owner`, sorted by path, as `path|size|folder`.
    fn list_files(&self, owner_id: i64) -> Result<Vec<String>>;
    /// Tombstoned entries of `owner`, sorted by path, as `path|size|deleted-at`.
    fn list_deleted_files(&self, owner_id: i64) -> Result<Vec<String>>;
    /// Soft-delete; false when no live entry matched.
    fn delete_file_entry(&self, owner_id: i64, path: &str) -> Result<bool>;
    /// Clear the most recent tombstone at (owner, path); false when none.
    fn restore_file_entry(&self, owner_id: i64, path: &str) -> Result<bool>;
    fn rename_file_entry(&self, owner_id: i64, old_path: &str, new_path: &str) -> Result<bool>;
    /// Duplicate the live entry at `src_path` to `dst_path`, carrying size,
    /// folder flag, and the source's ACL rows.
    fn copy_file_entry(&self, owner_id: i64, src_path: &str, dst_path: &str) -> Result<()>;

    // ACL
    fn get_file_id_by_path(&self, owner_id: i64, path: &str) -> Result<Option<i64>>;
    /// The most recently updated live entry at `path` across all owners for
    /// which `grantee_id` holds an ACL row.
    fn find_shared_file(&self, path: &str, grantee_id: i64) -> Result<Option<SharedFile>>;
    /// ACL bits of `user_id` on `file_id`; the owner short-circuits to ALL.
    fn check_permission(&self, file_id: i64, user_id: i64) -> Result<Permissions>;
    fn set_permission(&self, file_id: i64, grantee_id: i64, perms: Permissions) -> Result<()>;

    // Transfer sessions
    fn create_transfer_session(
        &self,
        user_id: i64,
        path: &str,
        direction: Direction,
        total_bytes: u64,
        offset_bytes: u64,
    ) -> Result<i64>;
    /// Most recent checkpoint for (user, path, direction).
    fn get_transfer_session(
        &self,
        user_id: i64,
        path: &str,
        direction: Direction,
    ) -> Result<Option<TransferSession>>;
    fn update_transfer_session(&self, session_id: i64, offset_bytes: u64) -> Result<()>;
    fn delete_transfer_session(&self, session_id: i64) -> Result<()>;

    // Audit
    fn insert_audit(
        &self,
        user_id: Option<i64>,
        action: &str,
        detail: &str,
        remote_addr: &str,
    ) -> Result<()>;
}
