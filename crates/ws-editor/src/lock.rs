//! Per-file advisory lock at `<target>.lock`, bounded to ~5s. Every write
//! operation acquires this before touching `<target>`; a lock that can't be
//! acquired in time surfaces as `Error::LockTimeout` and the write is not
//! performed. The wait observes the caller's cancellation token.

use fs2::FileExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use ws_core::cancel::CancellationToken;
use ws_core::{Error, Result};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: std::fs::File,
}

impl FileLock {
    /// Acquire the lock for `target`, polling until `LOCK_TIMEOUT` elapses
    /// or `ctx` fires, whichever comes first.
    pub async fn acquire(ctx: &CancellationToken, target: &Path) -> Result<Self> {
        let lock_path = lock_path(target);
        if let Some(parent) = lock_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            if ctx.is_cancelled() {
                return Err(Error::Canceled("lock wait".into()));
            }
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self { path: lock_path, file });
                }
                Err(_) if Instant::now() < deadline => {
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(Error::Canceled("lock wait".into())),
                        _ = sleep(POLL_INTERVAL) => {}
                    }
                }
                Err(_) => {
                    return Err(Error::LockTimeout(target.display().to_string()));
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.txt");
        tokio::fs::write(&target, b"x").await.unwrap();
        let ctx = CancellationToken::new();

        let lock = FileLock::acquire(&ctx, &target).await.unwrap();
        assert!(lock_path(&target).exists());
        drop(lock);
        assert!(!lock_path(&target).exists());
    }

    #[tokio::test]
    async fn contended_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.txt");
        tokio::fs::write(&target, b"x").await.unwrap();
        let ctx = CancellationToken::new();

        let _held = FileLock::acquire(&ctx, &target).await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(10), FileLock::acquire(&ctx, &target))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
    }

    #[tokio::test]
    async fn canceled_wait_stops_before_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.txt");
        tokio::fs::write(&target, b"x").await.unwrap();

        let live = CancellationToken::new();
        let _held = FileLock::acquire(&live, &target).await.unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = FileLock::acquire(&ctx, &target).await.unwrap_err();
        assert!(matches!(err, Error::Canceled(_)));
    }
}
