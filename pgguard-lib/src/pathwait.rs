//! Poll for a path to come into existence, or a directory to become
//! non-empty, at a fixed 1 Hz cadence.
//!
//! Most waits in this crate (the PostgreSQL listening socket, the
//! `recovery.done` marker) are unbounded by design: giving up would leave
//! an operator blind to what is still a legitimate, if slow, startup. Only
//! [`wait_for_non_empty_dir`] is bounded, reflecting the one place the
//! spec calls for a cap rather than patience.

use std::path::Path;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound for [`wait_for_non_empty_dir`]: about 30 seconds.
pub const DEFAULT_CONTENTS_ATTEMPTS: u32 = 30;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum WaitError {
    #[error("input/output error waiting on {0:?}: {1}")]
    IoError(std::path::PathBuf, #[source] std::io::Error),
    #[error("timed out after {1} attempts waiting for {0:?} to become non-empty")]
    Timeout(std::path::PathBuf, u32),
}

/// Poll, unboundedly, until `path` exists.
pub async fn wait_for_path(path: &Path) {
    while !path.exists() {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll, unboundedly, until `path` does *not* exist.
pub async fn wait_for_absence(path: &Path) {
    while path.exists() {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll, up to `attempts` times at 1 Hz, until `dir` exists and contains at
/// least one entry. Fails with [`WaitError::Timeout`] if the bound is
/// exhausted.
pub async fn wait_for_non_empty_dir(dir: &Path, attempts: u32) -> Result<(), WaitError> {
    for attempt in 0..attempts {
        match is_non_empty_dir(dir) {
            Ok(true) => return Ok(()),
            Ok(false) => (),
            Err(err) => return Err(WaitError::IoError(dir.to_owned(), err)),
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
    Err(WaitError::Timeout(dir.to_owned(), attempts))
}

fn is_non_empty_dir(dir: &Path) -> std::io::Result<bool> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    #[tokio::test]
    async fn wait_for_path_returns_once_the_path_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marker");
        let waiter = tokio::spawn({
            let path = path.clone();
            async move { super::wait_for_path(&path).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&path, b"").unwrap();
        tokio::time::timeout(Duration::from_secs(3), waiter)
            .await
            .expect("wait_for_path should return promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_non_empty_dir_succeeds_once_populated() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("contents");
        std::fs::create_dir(&target).unwrap();
        let waiter = tokio::spawn({
            let target = target.clone();
            async move { super::wait_for_non_empty_dir(&target, 5).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(target.join("file"), b"x").unwrap();
        let result = tokio::time::timeout(Duration::from_secs(3), waiter)
            .await
            .expect("should not hang");
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_non_empty_dir_times_out_when_never_populated() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("never");
        let result = super::wait_for_non_empty_dir(&target, 3).await;
        assert!(matches!(result, Err(super::WaitError::Timeout(_, 3))));
    }
}
