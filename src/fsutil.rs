//! Filesystem helpers for user trees.

use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};

/// Join a client-supplied relative path under `root`.
///
/// Rejects empty, absolute, and parent-directory components so a session can
/// never reach outside its user tree.
pub fn resolve_under(root: &Path, rel: &str) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    let mut pushed = 0usize;
    for comp in Path::new(rel).components() {
        match comp {
            Component::Normal(c) => {
                out.push(c);
                pushed += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => bail!("path contains parent component"),
            Component::RootDir | Component::Prefix(_) => bail!("absolute path not allowed"),
        }
    }
    if pushed == 0 {
        bail!("empty path");
    }
    Ok(out)
}

/// mkdir -p for the parent directory of `path`.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Size of a regular file; 0 when missing or not a regular file.
pub fn file_size(path: &Path) -> u64 {
    match std::fs::metadata(path) {
        Ok(md) if md.is_file() => md.len(),
        _ => 0,
    }
}

/// True only for an existing regular file.
pub fn file_exists(path: &Path) -> bool {
    std::fs::metadata(path).map(|md| md.is_file()).unwrap_or(false)
}
