//! Restore a data directory from the most recent base backup plus the
//! archived WAL segments PostgreSQL replays on top of it.
//!
//! Run whenever the `.NoRestoreNeeded` sentinel is absent and a base backup
//! is present — at Server boot, or ahead of a controller-initiated start.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::archive::{Archive, ArchiveError};
use crate::config::{self, ConfigError};
use crate::pathwait;
use crate::process::{self, ProcessError};

const RECOVERY_WAIT: Duration = Duration::from_secs(10_000);

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RestoreError {
    #[error("input/output error at {1:?}: {0}")]
    IoError(#[source] io::Error, PathBuf),
    #[error(transparent)]
    ArchiveError(#[from] ArchiveError),
    #[error(transparent)]
    ConfigError(#[from] ConfigError),
    #[error(transparent)]
    ProcessError(#[from] ProcessError),
    #[error("could not extract the base backup tarball: tar exited with {0:?}")]
    TarFailed(Option<i32>),
    #[error("PostgreSQL did not finish WAL replay within {0:?}")]
    ReplayTimeout(Duration),
}

pub struct RestorePlan<'a> {
    pub archive: &'a Archive,
    pub data_dir: &'a Path,
    pub socket_dir: &'a Path,
    pub tar_binary: &'a Path,
    pub postgres_binary: &'a Path,
}

/// Run the 12-step restore sequence. Returns once PostgreSQL has replayed
/// the archived WAL and exited; the caller proceeds to the normal boot
/// sequence from there.
pub async fn restore(plan: &RestorePlan<'_>) -> Result<(), RestoreError> {
    let tarball = plan.archive.base_backup_dir().join("base_complete.tar.gz");
    if !tarball.exists() {
        return Err(RestoreError::IoError(
            io::Error::new(io::ErrorKind::NotFound, "no backup file"),
            tarball,
        ));
    }

    // 1. Expose any WAL left `*.partial` at crash time to replay.
    plan.archive.unpartialize()?;

    // 2. Archive the current data dir aside, if present. The previous copy
    // is a sibling of the backup zip file itself (under `base_backup/`),
    // not of the data directory.
    if plan.data_dir.exists() {
        let previous = plan.archive.base_backup_dir().join("base_complete.tar.gz.previous");
        remove_dir_if_present(&previous)?;
        std::fs::rename(plan.data_dir, &previous)
            .map_err(|err| RestoreError::IoError(err, plan.data_dir.to_owned()))?;
    }

    // 3. Recreate an empty data dir, mode 0700.
    create_dir(plan.data_dir)?;
    set_mode(plan.data_dir, 0o700)?;

    // 4. Extract the base backup tarball into it.
    extract_tarball(plan.tar_binary, &tarball, plan.data_dir).await?;

    // 5. Remove `recovery.done` if present (from a previous restore attempt).
    remove_if_present(&plan.data_dir.join("recovery.done"))?;

    // 6. Remove the `.NoRestoreNeeded` sentinel.
    remove_if_present(&plan.data_dir.join(".NoRestoreNeeded"))?;

    // 7. Write `recovery.conf` with the literal restore command.
    std::fs::write(
        plan.data_dir.join("recovery.conf"),
        "restore_command = '/bin/cp ../backup/%f %p'\n",
    )
    .map_err(|err| RestoreError::IoError(err, plan.data_dir.join("recovery.conf")))?;

    // 8. Disable archiving while replaying.
    config::disable(&plan.data_dir.join("postgresql.conf"))?;

    // 9. Spawn PostgreSQL in restore mode: a private socket dir, no TCP
    // listeners, doingRestore suppresses the terminate-idle-backends query
    // elsewhere in the supervisor.
    let restore_socket_dir = plan.socket_dir.join("restore_only");
    create_dir(&restore_socket_dir)?;
    let handle = process::spawn(
        plan.postgres_binary,
        [
            "-D".to_string(),
            plan.data_dir.display().to_string(),
            "-k".to_string(),
            restore_socket_dir.display().to_string(),
            "-c".to_string(),
            "listen_addresses=".to_string(),
        ],
        std::iter::empty::<(&str, &str)>(),
        None,
    )?;

    // 10. Wait until PostgreSQL signals replay is complete.
    pathwait::wait_for_path(&plan.data_dir.join("recovery.done")).await;

    // 11. Stop it, bounded.
    handle.signal(nix::sys::signal::Signal::SIGINT).ok();
    let mut handle = handle;
    tokio::time::timeout(RECOVERY_WAIT, handle.wait())
        .await
        .map_err(|_| RestoreError::ReplayTimeout(RECOVERY_WAIT))?;

    Ok(())
}

async fn extract_tarball(
    tar_binary: &Path,
    tarball: &Path,
    destination: &Path,
) -> Result<(), RestoreError> {
    let status = Command::new(tar_binary)
        .arg("xzf")
        .arg(tarball)
        .arg("-C")
        .arg(destination)
        .status()
        .await
        .map_err(|err| RestoreError::ProcessError(ProcessError::Spawn(tar_binary.to_owned(), err)))?;
    if status.success() {
        Ok(())
    } else {
        Err(RestoreError::TarFailed(status.code()))
    }
}

fn create_dir(path: &Path) -> Result<(), RestoreError> {
    std::fs::create_dir_all(path).map_err(|err| RestoreError::IoError(err, path.to_owned()))
}

fn set_mode(path: &Path, mode: u32) -> Result<(), RestoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|err| RestoreError::IoError(err, path.to_owned()))
}

fn remove_if_present(path: &Path) -> Result<(), RestoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(RestoreError::IoError(err, path.to_owned())),
    }
}

fn remove_dir_if_present(path: &Path) -> Result<(), RestoreError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(RestoreError::IoError(err, path.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::RestoreError;

    #[test]
    fn tar_failure_reports_the_exit_code() {
        let err = RestoreError::TarFailed(Some(2));
        assert!(err.to_string().contains("2"));
    }

    #[test]
    fn io_error_names_the_offending_path() {
        let path = PathBuf::from("/tmp/does-not-exist/recovery.conf");
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = RestoreError::IoError(io_err, path.clone());
        assert!(err.to_string().contains("recovery.conf"));
    }
}
