//! On-disk state: per-key checkpoints and per-fetch response files.
//!
//! Both are written through [`persist_staged`]: the bytes go to a temp file
//! in a staging directory on the same filesystem, are fsynced, then renamed
//! into place. Response files stage outside the watched API directory, so
//! watchers only ever see complete files appear there.

pub mod checkpoint;
pub mod response_writer;

use std::io::Write;
use std::path::Path;

/// Write `bytes` to `path` so that the file appears complete or not at all,
/// staging the temp file next to it.
///
/// `path` must have a parent directory that already exists.
pub fn persist_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    persist_staged(path, dir, bytes)
}

/// Like [`persist_atomically`], but the temp file lives in `staging`.
///
/// `staging` must exist and share a filesystem with `path` for the rename
/// to be atomic.
pub fn persist_staged(path: &Path, staging: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .suffix(".partial")
        .tempfile_in(staging)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_replaces_existing_file_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value.txt");
        persist_atomically(&path, b"one").unwrap();
        persist_atomically(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1, "temp files must not be left behind");
    }

    #[test]
    fn staged_write_leaves_nothing_in_staging() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let out = dir.path().join("out");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::create_dir_all(&out).unwrap();
        persist_staged(&out.join("a.json"), &staging, b"{}").unwrap();
        assert_eq!(std::fs::read(out.join("a.json")).unwrap(), b"{}");
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }
}
