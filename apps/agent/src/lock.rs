//! Exclusive advisory lock on the store directory.
//!
//! Every agent process takes an exclusive lock on `store/.lock` before it
//! touches the crypto database and holds it until the operation ends.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::time::Duration;

use mxagent_shared::error::MxError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Held for the lifetime of an operation; unlocks on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

enum TryLock {
    Acquired,
    Contended,
}

fn try_lock(file: &File) -> Result<TryLock, MxError> {
    match file.try_lock() {
        Ok(()) => Ok(TryLock::Acquired),
        Err(TryLockError::WouldBlock) => Ok(TryLock::Contended),
        Err(TryLockError::Error(e)) => Err(MxError::Storage(format!("lock failed: {e}"))),
    }
}

impl StoreLock {
    /// Take the lock at `path`, waiting up to `timeout` for another process
    /// to release it.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self, MxError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| MxError::Storage(format!("cannot open {}: {e}", path.display())))?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut logged = false;
        loop {
            match try_lock(&file)? {
                TryLock::Acquired => {
                    tracing::debug!(path = %path.display(), "store lock acquired");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                TryLock::Contended => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(MxError::Timeout(format!(
                            "store is locked by another process ({})",
                            path.display()
                        )));
                    }
                    if !logged {
                        tracing::info!(path = %path.display(), "waiting for store lock");
                        logged = true;
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let first = StoreLock::acquire(&path, Duration::from_secs(1)).await.unwrap();

        let second = StoreLock::acquire(&path, Duration::from_millis(250)).await;
        assert!(matches!(second, Err(MxError::Timeout(_))));

        drop(first);
        let third = StoreLock::acquire(&path, Duration::from_millis(250)).await.unwrap();
        assert_eq!(third.path(), path.as_path());
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        let first = StoreLock::acquire(&path, Duration::from_secs(1)).await.unwrap();

        let waiter_path = path.clone();
        let waiter = tokio::spawn(async move {
            StoreLock::acquire(&waiter_path, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(first);
        assert!(waiter.await.unwrap().is_ok());
    }
}
