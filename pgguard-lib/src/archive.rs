//! Disk-sizing policy, base-backup capture, WAL pruning, and the one-shot
//! archiver personality invoked by PostgreSQL as its `archive_command`.
//!
//! The archive directory holds streamed WAL segments directly, plus a
//! `base_backup/` subdirectory holding the current base backup
//! (`base_complete.tar.gz`), an in-flight one (`base.tar.gz`), and an
//! optional operator-installed `.DoNotBackup` veto file.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use nix::sys::stat::{utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;
use tokio::process::Command;

use crate::process;

/// Base backups older than this are still considered fresh enough to skip.
const FRESHNESS: Duration = Duration::from_secs(900);

/// Below this much free space on the archive volume, capture unconditionally.
const MIN_FREE_GB: f64 = 30.0;

/// WAL files retained after a successful capture, most recent first.
pub const MAINTAINED_LOG_COUNT: usize = 4;

const BASE_BACKUP_RETRY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ArchiveError {
    #[error("input/output error at {1:?}: {0}")]
    IoError(#[source] io::Error, PathBuf),
    #[error("could not spawn the base-backup binary: {0}")]
    Spawn(#[from] process::ProcessError),
}

#[derive(Debug, Clone)]
pub struct Archive {
    dir: PathBuf,
}

impl Archive {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn base_backup_dir(&self) -> PathBuf {
        self.dir.join("base_backup")
    }

    fn in_flight(&self) -> PathBuf {
        self.base_backup_dir().join("base.tar.gz")
    }

    fn complete(&self) -> PathBuf {
        self.base_backup_dir().join("base_complete.tar.gz")
    }

    fn do_not_backup(&self) -> PathBuf {
        self.base_backup_dir().join(".DoNotBackup")
    }

    /// Evaluate the decision policy against the current state of the
    /// archive directory and volume.
    pub fn should_backup(&self) -> Result<bool, ArchiveError> {
        let complete = self.complete();
        if let Some(mtime) = file_mtime(&complete)? {
            if mtime.elapsed().map(|age| age < FRESHNESS).unwrap_or(true) {
                return Ok(false);
            }
        }

        let free_gb = disk_free_gb(&self.dir)?;
        if free_gb < MIN_FREE_GB {
            return Ok(true);
        }

        let capacity_gb = disk_capacity_gb(&self.dir)?;
        let content_bytes = directory_size(&self.dir)?;
        #[allow(clippy::cast_precision_loss)]
        let content_gb = content_bytes as f64 / 2f64.powi(30);
        if content_gb > size_scaled_cap_gb(capacity_gb) {
            return Ok(true);
        }

        if self.do_not_backup().exists() {
            return Ok(false);
        }

        Ok(!complete.exists())
    }

    /// Capture a new base backup: remove any stale in-flight tarball, spawn
    /// `base_backup_binary` with `-Ft -z` writing to `base.tar.gz`, retrying
    /// every two seconds on non-zero exit, then fsync, atomic rename, and
    /// WAL pruning.
    pub async fn capture(
        &self,
        base_backup_binary: &Path,
        args: &[String],
    ) -> Result<(), ArchiveError> {
        let base_backup_dir = self.base_backup_dir();
        create_dir(&base_backup_dir)?;
        remove_if_present(&self.in_flight())?;

        let pre_capture = self.snapshot_wal_files()?;

        let in_flight = self.in_flight();
        loop {
            let file = std::fs::File::create(&in_flight)
                .map_err(|err| ArchiveError::IoError(err, in_flight.clone()))?;
            log::debug!("starting base backup capture into {in_flight:?}");
            let status = Command::new(base_backup_binary)
                .args(args)
                .stdout(file)
                .status()
                .await
                .map_err(|err| ArchiveError::Spawn(process::ProcessError::Spawn(
                    base_backup_binary.to_owned(),
                    err,
                )))?;
            if status.success() {
                break;
            }
            log::warn!(
                "base backup capture exited with {:?}; retrying in {BASE_BACKUP_RETRY:?}",
                status.code()
            );
            let _ = std::fs::File::create(&in_flight);
            tokio::time::sleep(BASE_BACKUP_RETRY).await;
        }

        fsync(&in_flight)?;
        std::fs::rename(&in_flight, self.complete())
            .map_err(|err| ArchiveError::IoError(err, in_flight.clone()))?;

        self.prune_wal_files(pre_capture)?;
        Ok(())
    }

    fn snapshot_wal_files(&self) -> Result<Vec<(i64, PathBuf)>, ArchiveError> {
        let mut files = Vec::new();
        for entry in read_dir(&self.dir)? {
            let path = entry.path();
            if path.is_file() {
                let ctime = entry
                    .metadata()
                    .map_err(|err| ArchiveError::IoError(err, path.clone()))?
                    .ctime();
                files.push((ctime, path));
            }
        }
        Ok(files)
    }

    fn prune_wal_files(&self, mut files: Vec<(i64, PathBuf)>) -> Result<(), ArchiveError> {
        files.sort_by_key(|(ctime, _)| *ctime);
        let keep_from = files.len().saturating_sub(MAINTAINED_LOG_COUNT);
        for (_, path) in &files[..keep_from] {
            remove_if_present(path)?;
        }
        Ok(())
    }

    /// Remove any `*.partial` with an existing complete sibling, and any
    /// `*.in-progress` unconditionally. Run at boot, before the restore
    /// decision is made.
    pub fn prune_stale(&self) -> Result<(), ArchiveError> {
        for entry in read_dir(&self.dir)? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if let Some(stem) = name.strip_suffix(".partial") {
                if path.with_file_name(stem).exists() {
                    remove_if_present(&path)?;
                }
            } else if name.ends_with(".in-progress") {
                remove_if_present(&path)?;
            }
        }
        Ok(())
    }

    /// Rename any `*.partial` whose complete sibling does *not* exist back
    /// to its complete name, exposing in-flight-at-crash WAL to replay.
    /// The inverse of [`Archive::prune_stale`]'s `*.partial` half.
    pub fn unpartialize(&self) -> Result<(), ArchiveError> {
        for entry in read_dir(&self.dir)? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if let Some(stem) = name.strip_suffix(".partial") {
                let complete = path.with_file_name(stem);
                if !complete.exists() {
                    std::fs::rename(&path, &complete)
                        .map_err(|err| ArchiveError::IoError(err, path.clone()))?;
                }
            }
        }
        Ok(())
    }

    /// Touch the access/modification times of every file the log-receiver
    /// process has open under this archive directory, so host backup
    /// software does not skip a currently-written segment. Best-effort: a
    /// file descriptor that vanishes between listing and touching is not an
    /// error, since the receiver may close and reopen segments
    /// concurrently with the scan.
    pub fn touch_open_receiver_files(&self, receiver_pid: u32) -> Result<(), ArchiveError> {
        let fd_dir = PathBuf::from(format!("/proc/{receiver_pid}/fd"));
        let Ok(entries) = std::fs::read_dir(&fd_dir) else {
            return Ok(());
        };
        let now = TimeSpec::from_duration(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default(),
        );
        for entry in entries.flatten() {
            let Ok(target) = std::fs::read_link(entry.path()) else { continue };
            if !target.starts_with(&self.dir) {
                continue;
            }
            let _ = utimensat(None, &target, &now, &now, UtimensatFlags::FollowSymlink);
        }
        Ok(())
    }
}

/// `argv[2]`/`argv[3]` of the archiver personality: copy `source` into
/// `destination`, atomically and idempotently.
pub fn archive_segment(source: &Path, destination: &Path) -> Result<(), ArchiveError> {
    if let (Ok(src_meta), Ok(dst_meta)) = (source.metadata(), destination.metadata()) {
        if src_meta.len() == dst_meta.len() {
            log::debug!("{destination:?} already has the same size as {source:?}; skipping");
            return Ok(());
        }
    }

    let temp = destination.with_extension("in-progress");
    std::fs::copy(source, &temp).map_err(|err| ArchiveError::IoError(err, source.to_owned()))?;
    std::fs::rename(&temp, destination)
        .map_err(|err| ArchiveError::IoError(err, temp.clone()))?;
    let mut perms = destination
        .metadata()
        .map_err(|err| ArchiveError::IoError(err, destination.to_owned()))?
        .permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o600);
    std::fs::set_permissions(destination, perms)
        .map_err(|err| ArchiveError::IoError(err, destination.to_owned()))?;
    Ok(())
}

fn create_dir(path: &Path) -> Result<(), ArchiveError> {
    match std::fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) => Err(ArchiveError::IoError(err, path.to_owned())),
    }
}

fn remove_if_present(path: &Path) -> Result<(), ArchiveError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ArchiveError::IoError(err, path.to_owned())),
    }
}

fn read_dir(dir: &Path) -> Result<Vec<std::fs::DirEntry>, ArchiveError> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .collect::<io::Result<Vec<_>>>()
            .map_err(|err| ArchiveError::IoError(err, dir.to_owned())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(ArchiveError::IoError(err, dir.to_owned())),
    }
}

fn file_mtime(path: &Path) -> Result<Option<SystemTime>, ArchiveError> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(
            meta.modified()
                .map_err(|err| ArchiveError::IoError(err, path.to_owned()))?,
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ArchiveError::IoError(err, path.to_owned())),
    }
}

fn fsync(path: &Path) -> Result<(), ArchiveError> {
    std::fs::File::open(path)
        .and_then(|f| f.sync_all())
        .map_err(|err| ArchiveError::IoError(err, path.to_owned()))
}

fn directory_size(dir: &Path) -> Result<u64, ArchiveError> {
    let mut total = 0;
    for entry in read_dir(dir)? {
        let path = entry.path();
        let meta = entry
            .metadata()
            .map_err(|err| ArchiveError::IoError(err, path.clone()))?;
        if meta.is_dir() {
            total += directory_size(&path)?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

fn disk_free_gb(path: &Path) -> Result<f64, ArchiveError> {
    let stats = nix::sys::statvfs::statvfs(path)
        .map_err(|err| ArchiveError::IoError(io::Error::from(err), path.to_owned()))?;
    #[allow(clippy::cast_precision_loss)]
    Ok((stats.blocks_available() * stats.fragment_size()) as f64 / 2f64.powi(30))
}

fn disk_capacity_gb(path: &Path) -> Result<f64, ArchiveError> {
    let stats = nix::sys::statvfs::statvfs(path)
        .map_err(|err| ArchiveError::IoError(io::Error::from(err), path.to_owned()))?;
    #[allow(clippy::cast_precision_loss)]
    Ok((stats.blocks() * stats.fragment_size()) as f64 / 2f64.powi(30))
}

fn size_scaled_cap_gb(capacity_gb: f64) -> f64 {
    if capacity_gb < 50.0 {
        5.0
    } else if capacity_gb < 100.0 {
        10.0
    } else if capacity_gb < 200.0 {
        20.0
    } else {
        30.0
    }
}

#[cfg(test)]
mod tests {
    use super::Archive;

    #[test]
    fn size_scaled_cap_gb_follows_the_capacity_bands() {
        assert_eq!(super::size_scaled_cap_gb(10.0), 5.0);
        assert_eq!(super::size_scaled_cap_gb(75.0), 10.0);
        assert_eq!(super::size_scaled_cap_gb(150.0), 20.0);
        assert_eq!(super::size_scaled_cap_gb(1000.0), 30.0);
    }

    #[test]
    fn should_backup_is_true_when_no_backup_exists_yet() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path());
        std::fs::create_dir_all(archive.base_backup_dir()).unwrap();
        assert!(archive.should_backup().unwrap());
    }

    #[test]
    fn should_backup_is_false_when_a_fresh_backup_exists() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path());
        std::fs::create_dir_all(archive.base_backup_dir()).unwrap();
        std::fs::write(archive.base_backup_dir().join("base_complete.tar.gz"), b"x").unwrap();
        assert!(!archive.should_backup().unwrap());
    }

    #[test]
    fn should_backup_respects_the_do_not_backup_veto() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path());
        std::fs::create_dir_all(archive.base_backup_dir()).unwrap();
        std::fs::write(archive.base_backup_dir().join(".DoNotBackup"), b"").unwrap();
        // No backup yet would otherwise say "yes"; the veto overrides unless
        // the free-space or size-cap conditions already forced a yes, which
        // a fresh temp directory on a non-pathological disk will not.
        assert!(!archive.should_backup().unwrap());
    }

    #[test]
    fn prune_stale_removes_partials_with_complete_siblings_and_all_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path());
        std::fs::write(dir.path().join("000001"), b"").unwrap();
        std::fs::write(dir.path().join("000001.partial"), b"").unwrap();
        std::fs::write(dir.path().join("000002.partial"), b"").unwrap();
        std::fs::write(dir.path().join("leftover.in-progress"), b"").unwrap();
        archive.prune_stale().unwrap();
        assert!(!dir.path().join("000001.partial").exists());
        assert!(dir.path().join("000002.partial").exists());
        assert!(!dir.path().join("leftover.in-progress").exists());
    }

    #[test]
    fn unpartialize_renames_partials_without_a_complete_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path());
        std::fs::write(dir.path().join("000003.partial"), b"data").unwrap();
        archive.unpartialize().unwrap();
        assert!(dir.path().join("000003").exists());
        assert!(!dir.path().join("000003.partial").exists());
    }

    #[test]
    fn archive_segment_copies_atomically_and_sets_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("000001");
        let destination = dir.path().join("dest").join("000001");
        std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
        std::fs::write(&source, b"segment contents").unwrap();

        super::archive_segment(&source, &destination).unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), b"segment contents");
        let mode = std::fs::metadata(&destination).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn archive_segment_is_a_no_op_when_sizes_already_match() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("000001");
        let destination = dir.path().join("000001.copy");
        std::fs::write(&source, b"same size").unwrap();
        std::fs::write(&destination, b"same size").unwrap();
        let before = std::fs::metadata(&destination).unwrap().modified().unwrap();

        super::archive_segment(&source, &destination).unwrap();

        let after = std::fs::metadata(&destination).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }
}
