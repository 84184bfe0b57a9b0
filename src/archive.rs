//! Zip archive inspection and extraction for the UNZIP verb.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io;
use std::path::Path;
use zip::ZipArchive;

#[derive(Debug)]
pub struct ExtractedEntry {
    pub rel_path: String,
    pub size_bytes: u64,
}

/// Sum of the uncompressed sizes of every entry, for the quota pre-check.
pub fn total_uncompressed_size(zip_path: &Path) -> Result<u64> {
    let file = File::open(zip_path).with_context(|| format!("open {}", zip_path.display()))?;
    let mut archive = ZipArchive::new(file).context("read zip directory")?;
    let mut total = 0u64;
    for i in 0..archive.len() {
        total += archive.by_index(i)?.size();
    }
    Ok(total)
}

/// Extract every entry under `dest_root`, creating parent directories.
/// Entries whose name would escape the destination are rejected.
pub fn extract_archive(zip_path: &Path, dest_root: &Path) -> Result<Vec<ExtractedEntry>> {
    let file = File::open(zip_path).with_context(|| format!("open {}", zip_path.display()))?;
    let mut archive = ZipArchive::new(file).context("read zip directory")?;
    std::fs::create_dir_all(dest_root)?;

    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let rel = match entry.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => bail!("zip entry escapes destination: {}", entry.name()),
        };
        let dest = dest_root.join(&rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dest)?;
        let n = io::copy(&mut entry, &mut out)?;
        extracted.push(ExtractedEntry {
            rel_path: rel.to_string_lossy().replace('\\', "/"),
            size_bytes: n,
        });
    }
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn build_zip(path: &Path) {
        let file = File::create(path).unwrap();
        let mut zw = zip::ZipWriter::new(file);
        let opts = FileOptions::default();
        zw.add_directory("docs/", opts).unwrap();
        zw.start_file("docs/a.txt", opts).unwrap();
        zw.write_all(b"alpha").unwrap();
        zw.start_file("b.bin", opts).unwrap();
        zw.write_all(&[7u8; 100]).unwrap();
        zw.finish().unwrap();
    }

    #[test]
    fn size_scan_sums_uncompressed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("pack.zip");
        build_zip(&zip_path);
        assert_eq!(total_uncompressed_size(&zip_path).unwrap(), 105);
    }

    #[test]
    fn extract_recreates_tree() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("pack.zip");
        build_zip(&zip_path);

        let dest = dir.path().join("out");
        let mut entries = extract_archive(&zip_path, &dest).unwrap();
        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].rel_path, "b.bin");
        assert_eq!(entries[0].size_bytes, 100);
        assert_eq!(entries[1].rel_path, "docs/a.txt");
        assert_eq!(entries[1].size_bytes, 5);
        assert_eq!(std::fs::read(dest.join("docs/a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(dest.join("b.bin")).unwrap().len(), 100);
    }
}
