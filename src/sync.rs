use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

/// A lock older than this was left behind by a process that died holding it.
pub const STALE_AFTER: Duration = Duration::from_secs(60);

/// A lock held by the existence of a file. Created with `create_new`, so only
/// one process at a time can hold it; removed again on drop.
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub async fn acquire(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut waited = false;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        warn!("Removing stale lock {}", path.display());
                        match std::fs::remove_file(&path) {
                            Ok(()) => continue,
                            // Someone else cleaned it up first.
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(e),
                        }
                    }
                    if !waited {
                        info!("Waiting for lock {}", path.display());
                        waited = true;
                    } else {
                        debug!("Still waiting for lock {}", path.display());
                    }
                    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Self { path })
    }
}

fn is_stale(path: &Path) -> bool {
    let modified = match std::fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > STALE_AFTER)
        .unwrap_or(false)
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.lock");
        {
            let _lock = LockFile::acquire(&path).await.unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
        let _again = LockFile::acquire(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.lock");
        let file = std::fs::File::create(&path).unwrap();
        file.set_modified(SystemTime::now() - STALE_AFTER * 2).unwrap();
        drop(file);

        let lock = tokio::time::timeout(Duration::from_secs(5), LockFile::acquire(&path))
            .await
            .expect("a stale lock must not block")
            .unwrap();
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_fresh_lock_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.lock");
        std::fs::File::create(&path).unwrap();
        assert!(!is_stale(&path));
        assert!(!is_stale(&dir.path().join("missing.lock")));
    }
}
