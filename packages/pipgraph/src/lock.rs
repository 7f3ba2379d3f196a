//! Single-instance lock on the engine output directory.
//!
//! Two engine processes pointed at the same output directory would
//! corrupt each other's bundles, so an exclusive on-disk lock is taken
//! before anything else. The first acquisition window is a short probe
//! so "another build briefly holds the lock" resolves quickly; after
//! that, retries continue on the caller's wall-clock budget. Failure to
//! acquire is one of the two fatal conditions in the core.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::Display;
use fslock::LockFile;
use tokio::task::spawn_blocking;
use tracing::{debug, instrument, warn};

/// Lock file name inside the locked directory.
const LOCK_FILE_NAME: &str = ".engine_lock";

/// The short first-attempt window distinguishing "busy once" from a
/// genuinely concurrent build.
const PROBE_WINDOW: Duration = Duration::from_secs(5);

/// Exclusive lock over an engine output directory.
///
/// Held for the lifetime of the invocation; released on drop.
#[derive(Display)]
#[display("{}", self.directory.display())]
pub struct FolderLock {
    directory: PathBuf,
    // Held, not read. Dropping releases the OS lock.
    _lock: LockFile,
}

impl std::fmt::Debug for FolderLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderLock")
            .field("directory", &self.directory)
            .finish()
    }
}

impl FolderLock {
    /// Acquire the lock, retrying up to `total_wait` with `retry_interval`
    /// sleeps between attempts.
    ///
    /// Failure is fatal to the invocation; the error names the directory
    /// so the user can find the competing build.
    #[instrument]
    pub async fn take(
        directory: &Path,
        total_wait: Duration,
        retry_interval: Duration,
    ) -> Result<FolderLock> {
        tokio::fs::create_dir_all(directory)
            .await
            .with_context(|| format!("create lock directory: {directory:?}"))?;
        let lock_path = directory.join(LOCK_FILE_NAME);

        let started = Instant::now();
        let mut probe_logged = false;
        loop {
            let path = lock_path.clone();
            let acquired = spawn_blocking(move || -> Result<Option<LockFile>> {
                let mut lock = LockFile::open(&path)
                    .with_context(|| format!("open lock file: {path:?}"))?;
                if lock.try_lock().with_context(|| format!("try lock: {path:?}"))? {
                    Ok(Some(lock))
                } else {
                    Ok(None)
                }
            })
            .await
            .context("join task")??;

            if let Some(lock) = acquired {
                debug!(?directory, waited = ?started.elapsed(), "acquired folder lock");
                return Ok(FolderLock {
                    directory: directory.to_owned(),
                    _lock: lock,
                });
            }

            let elapsed = started.elapsed();
            if !probe_logged && elapsed >= PROBE_WINDOW {
                probe_logged = true;
                warn!(
                    ?directory,
                    "another build holds the output directory; waiting for it to finish"
                );
            }
            if elapsed >= total_wait {
                bail!(
                    "output directory {directory:?} is locked by another build \
                     (waited {elapsed:?})"
                );
            }
            tokio::time::sleep(retry_interval).await;
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn uncontended_lock_acquires_immediately() {
        let dir = TempDir::new().unwrap();
        let lock = FolderLock::take(
            dir.path(),
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        pretty_assert_eq!(lock.directory(), dir.path());
    }

    #[tokio::test]
    async fn contended_lock_fails_with_directory_identity() {
        let dir = TempDir::new().unwrap();
        let _held = FolderLock::take(
            dir.path(),
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        let err = FolderLock::take(
            dir.path(),
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(
            err.to_string().contains(&format!("{:?}", dir.path())),
            "error should name the directory: {err}"
        );
    }

    #[tokio::test]
    async fn released_lock_can_be_retaken() {
        let dir = TempDir::new().unwrap();
        let lock = FolderLock::take(
            dir.path(),
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        drop(lock);

        FolderLock::take(
            dir.path(),
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    }
}
