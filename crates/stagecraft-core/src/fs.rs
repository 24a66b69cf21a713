//! Filesystem helpers

use crate::{Result, StagecraftError};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Write `contents` to `path` so that readers never observe a partial file.
///
/// Data goes to a uniquely named temp file in the same directory first and
/// is then renamed over the destination.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    if let Err(e) = std::fs::write(&tmp, contents) {
        std::fs::remove_file(&tmp).ok();
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        std::fs::remove_file(&tmp).ok();
        return Err(e.into());
    }
    Ok(())
}

/// Exclusive lock represented by the existence of a file.
///
/// Acquired with `create_new`, so exactly one process or thread holds it at a
/// time. Released (the file removed) on drop. A lock file older than
/// `stale_after` is assumed to belong to a crashed writer and is broken.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(path: &Path, wait: Duration, stale_after: Duration) -> Result<Self> {
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_age(path).is_some_and(|age| age > stale_after) {
                        tracing::warn!(lock = %path.display(), "Breaking stale lock");
                        std::fs::remove_file(path).ok();
                        continue;
                    }
                    if start.elapsed() >= wait {
                        return Err(StagecraftError::Locked(path.to_path_buf()));
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path).ok();
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("stagecraft_fs_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_atomic_write_replaces_and_leaves_no_temp() {
        let dir = temp_dir();
        let path = dir.join("asset_manifest.json");

        atomic_write(&path, b"{\"v\":1}").unwrap();
        atomic_write(&path, b"{\"v\":2}").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"v\":2}");
        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_atomic_write_creates_parent() {
        let dir = temp_dir();
        let path = dir.join("nested").join("assets").join("chair_1.glb");
        atomic_write(&path, b"glTF").unwrap();
        assert!(path.exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_file_lock_is_exclusive_until_dropped() {
        let dir = temp_dir();
        let path = dir.join(".asset_manifest.lock");
        let long = Duration::from_secs(600);

        let held = FileLock::acquire(&path, Duration::from_secs(1), long).unwrap();
        assert!(path.exists());
        let err = FileLock::acquire(&path, Duration::from_millis(50), long).unwrap_err();
        assert!(matches!(err, StagecraftError::Locked(_)));

        drop(held);
        assert!(!path.exists());
        let again = FileLock::acquire(&path, Duration::from_millis(50), long).unwrap();
        assert_eq!(again.path(), path.as_path());
        drop(again);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let dir = temp_dir();
        let path = dir.join(".stale.lock");
        std::fs::write(&path, "12345\n").unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let lock = FileLock::acquire(&path, Duration::from_millis(50), Duration::from_millis(10)).unwrap();
        drop(lock);
        std::fs::remove_dir_all(&dir).ok();
    }
}
