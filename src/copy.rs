//! Local copy primitives used by the COPY verb.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Directory copies recurse at most this deep.
pub const MAX_COPY_DEPTH: usize = 32;

const COPY_BUF: usize = 64 * 1024;

/// Buffered byte copy, creating the destination's parent directories.
/// Returns the number of bytes copied.
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut reader = BufReader::with_capacity(COPY_BUF, File::open(src)?);
    let mut writer = BufWriter::with_capacity(COPY_BUF, File::create(dst)?);
    let mut buffer = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

/// Refuse symlinks anywhere in a copy source. Loops through links are the
/// classic way a recursive copy runs away.
pub fn reject_symlink(path: &Path) -> Result<()> {
    let md = std::fs::symlink_metadata(path)
        .with_context(|| format!("stat {}", path.display()))?;
    if md.file_type().is_symlink() {
        bail!("symlinks are not copied");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_file_copies_bytes_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"hello copy").unwrap();
        let dst = dir.path().join("deep/nested/dst.bin");
        let n = copy_file(&src, &dst).unwrap();
        assert_eq!(n, 10);
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello copy");
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t");
        std::fs::write(&target, b"x").unwrap();
        let link = dir.path().join("l");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        assert!(reject_symlink(&link).is_err());
        assert!(reject_symlink(&target).is_ok());
    }
}
