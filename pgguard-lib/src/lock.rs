//! Inheritable file-system lock: advisory mutual exclusion by symlink,
//! bequeathable to a child process across a spawn boundary.
//!
//! A plain `flock(2)`-style lock is lost the moment a process execs or
//! spawns a successor — the kernel does not propagate an advisory lock held
//! by a file descriptor to an unrelated process. But the controller must be
//! able to hand the control-socket lock to a freshly spawned `Server`
//! without any window in which some other racing controller could claim it.
//!
//! The scheme here is a symbolic link at a fixed path whose target text is
//! the decimal PID of the current holder. Acquiring a free lock is a plain
//! `symlink(2)`. Handing the lock to an *expected* successor is a
//! `symlink(tempname) + rename(tempname, path)`: the rename is atomic, so
//! there is no instant at which the path exists but names no holder. The
//! successor learns it is expected to inherit via an environment-variable
//! carrier (see [`carrier`]) rather than by guessing.
//!
//! ```rust
//! # use pgguard::lock::UnlockedFile;
//! # use either::Either::*;
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("lock");
//! let lock = match UnlockedFile::new(&path).acquire()? {
//!     Right(lock) => lock,
//!     Left(_) => panic!("expected to acquire an uncontended lock"),
//! };
//! lock.release()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::Duration;

use either::{Either, Left, Right};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{getpid, Pid};

pub mod carrier;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum LockError {
    #[error("input/output error at {1:?}: {0}")]
    IoError(#[source] io::Error, PathBuf),
    #[error("system error probing lock holder: {0}")]
    UnixError(#[from] nix::Error),
    #[error(transparent)]
    CarrierError(#[from] carrier::CarrierError),
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum BequeathError {
    #[error(transparent)]
    LockError(#[from] LockError),
    #[error("timed out after {0:?} waiting for the lock at {1:?} to be inherited")]
    Timeout(Duration, PathBuf),
}

/// A lock that is not currently held by this process.
#[derive(Debug, Clone)]
pub struct UnlockedFile {
    path: PathBuf,
}

/// A lock held by this process.
#[derive(Debug)]
pub struct LockedFile {
    path: PathBuf,
}

impl UnlockedFile {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attempt to acquire the lock.
    ///
    /// If the environment carrier names this path with a PID that matches
    /// the symlink's current target, this process *inherits* the lock:
    /// the symlink is rewritten, atomically, to point at our own PID, and
    /// the carrier entry is consumed. Otherwise a plain `symlink(2)` is
    /// attempted; if that fails because the path already exists, the
    /// recorded holder is probed, and a stale link (dead, or live but
    /// owned by a different user) is removed so the caller may retry
    /// immediately. Returns `Left(self)` when the lock was not acquired —
    /// including when a stale link was just cleaned up — so the caller
    /// can decide whether and how to retry.
    pub fn acquire(self) -> Result<Either<Self, LockedFile>, LockError> {
        let our_pid = getpid();

        if let Some(expected) = carrier::take(&self.path)? {
            if let Some(current) = read_target(&self.path)? {
                if current == expected {
                    replace_target(&self.path, our_pid)?;
                    log::debug!(
                        "inherited lock at {:?} from pid {current} as pid {our_pid}",
                        self.path
                    );
                    return Ok(Right(LockedFile { path: self.path }));
                }
            }
            // Carrier named a handoff that is no longer reflected on disk;
            // put the entry back so a later, correctly-timed attempt can
            // still use it, and fall through to a normal acquire attempt.
            carrier::put(&self.path, &expected)?;
        }

        match symlink(our_pid.to_string(), &self.path) {
            Ok(()) => {
                log::debug!("acquired lock at {:?} as pid {our_pid}", self.path);
                Ok(Right(LockedFile { path: self.path }))
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if self.clean_if_stale()? {
                    log::debug!("removed stale lock at {:?}", self.path);
                } else {
                    log::debug!("lock at {:?} is held by a live process", self.path);
                }
                Ok(Left(self))
            }
            Err(err) => Err(LockError::IoError(err, self.path)),
        }
    }

    /// Remove the symlink if its target does not name a live process owned
    /// by our own UID. Returns whether it was removed.
    fn clean_if_stale(&self) -> Result<bool, LockError> {
        let Some(target) = read_target(&self.path)? else {
            return Ok(false);
        };
        if is_live_and_ours(target) {
            return Ok(false);
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(err) => Err(LockError::IoError(err, self.path.clone())),
        }
    }
}

impl LockedFile {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offer this lock to a specific, not-yet-spawned child process.
    ///
    /// Writes `{absolute(path) → our pid}` into the environment carrier,
    /// synchronously, so that a child spawned immediately afterwards (which
    /// inherits the process environment at spawn time) sees the offer.
    /// Splitting this from the poll in [`Offered::await_handoff`] is what
    /// lets a caller spawn the successor *between* the two steps — doing
    /// both in one `async fn` would defer the carrier write until the
    /// future is first polled, which could race a child spawned eagerly
    /// right after the call.
    pub fn offer(self) -> Result<Offered, LockError> {
        let our_pid = getpid();
        carrier::put(&self.path, &our_pid)?;
        log::debug!("bequeathing lock at {:?} from pid {our_pid}", self.path);
        Ok(Offered { path: self.path, our_pid })
    }

    /// Offer this lock, then wait for a successor to claim it, in one step.
    /// Convenient when no child needs to be spawned in between (e.g. tests);
    /// [`LockedFile::offer`] / [`Offered::await_handoff`] is the two-step
    /// form the controller's `start` sequence actually needs.
    pub async fn bequeath(self, timeout: Duration) -> Result<(), BequeathError> {
        self.offer()?.await_handoff(timeout).await
    }

    /// Release the lock outright by removing the symlink.
    pub fn release(self) -> Result<(), LockError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LockError::IoError(err, self.path)),
        }
    }
}

/// A lock whose bequeathal has been offered into the environment carrier,
/// awaiting a successor to claim it.
#[derive(Debug)]
pub struct Offered {
    path: PathBuf,
    our_pid: Pid,
}

impl Offered {
    /// Poll at 1 Hz for the symlink target to change away from our PID, up
    /// to `timeout`. The symlink itself is never removed here; the
    /// successor rewrites it in place via [`UnlockedFile::acquire`].
    pub async fn await_handoff(self, timeout: Duration) -> Result<(), BequeathError> {
        let attempts = timeout.as_secs().max(1);
        for _ in 0..attempts {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match read_target(&self.path)? {
                Some(target) if target != self.our_pid => {
                    log::debug!("lock at {:?} inherited by pid {target}", self.path);
                    return Ok(());
                }
                _ => continue,
            }
        }

        // Nobody claimed the handoff; withdraw the offer so a later,
        // unrelated acquire attempt does not mistakenly inherit.
        carrier::take(&self.path)?;
        Err(BequeathError::Timeout(timeout, self.path))
    }
}

/// Convenience alias used where callers care only about "is this path
/// locked by us right now", not the acquisition choreography.
pub type InheritableLock = LockedFile;

fn read_target(path: &Path) -> Result<Option<Pid>, LockError> {
    match std::fs::read_link(path) {
        Ok(target) => {
            let text = target.to_string_lossy();
            Ok(text.parse::<i32>().ok().map(Pid::from_raw))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(LockError::IoError(err, path.to_owned())),
    }
}

/// Atomically replace the symlink at `path` with one pointing at `pid`,
/// via `symlink(tempname) + rename(tempname, path)` — never an intermediate
/// unlink, so there is no instant at which the path names no holder.
fn replace_target(path: &Path, pid: Pid) -> Result<(), LockError> {
    let temp = path.with_extension(format!("tmp.{}", getpid()));
    symlink(pid.to_string(), &temp).map_err(|err| LockError::IoError(err, temp.clone()))?;
    std::fs::rename(&temp, path).map_err(|err| LockError::IoError(err, path.to_owned()))?;
    Ok(())
}

/// True if `pid` names a live process owned by our effective UID.
fn is_live_and_ours(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => false, // live, but not ours
        Err(_) => false,            // ESRCH (dead) or any other probe failure
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use either::{Left, Right};

    use super::UnlockedFile;

    #[test]
    fn acquire_succeeds_on_a_free_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        match UnlockedFile::new(&path).acquire().unwrap() {
            Right(locked) => assert_eq!(locked.path(), path),
            Left(_) => panic!("expected to acquire"),
        }
    }

    #[test]
    fn acquire_fails_while_held_by_a_live_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let _locked = UnlockedFile::new(&path).acquire().unwrap().right().unwrap();
        match UnlockedFile::new(&path).acquire().unwrap() {
            Left(_) => (),
            Right(_) => panic!("expected contention"),
        }
    }

    #[test]
    fn acquire_cleans_up_a_stale_link_and_permits_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        // A PID that is very unlikely to be alive.
        std::os::unix::fs::symlink("999999", &path).unwrap();
        let unlocked = match UnlockedFile::new(&path).acquire().unwrap() {
            Left(unlocked) => unlocked,
            Right(_) => panic!("stale link should not grant the lock directly"),
        };
        assert!(!path.exists());
        match unlocked.acquire().unwrap() {
            Right(_) => (),
            Left(_) => panic!("retry after cleanup should succeed"),
        }
    }

    #[test]
    fn release_removes_the_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let locked = UnlockedFile::new(&path).acquire().unwrap().right().unwrap();
        locked.release().unwrap();
        assert!(!Path::new(&path).exists());
    }

    #[tokio::test]
    async fn bequeath_succeeds_once_a_successor_rewrites_the_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let locked = UnlockedFile::new(&path).acquire().unwrap().right().unwrap();
        let path_for_successor = path.clone();
        let successor = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
            let unlocked = UnlockedFile::new(&path_for_successor);
            unlocked.acquire().unwrap()
        });
        locked.bequeath(std::time::Duration::from_secs(5)).await.unwrap();
        let outcome = successor.await.unwrap();
        assert!(outcome.is_right());
    }

    #[tokio::test]
    async fn bequeath_times_out_and_withdraws_the_offer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let locked = UnlockedFile::new(&path).acquire().unwrap().right().unwrap();
        let result = locked.bequeath(std::time::Duration::from_secs(1)).await;
        assert!(result.is_err());
        assert!(super::carrier::take(&path).unwrap().is_none());
    }
}
