//! The `Server` personality: boots PostgreSQL, the WAL-streaming receiver,
//! and the control socket, then runs the backup heartbeat until the
//! reference count drops to zero or PostgreSQL exits unexpectedly.
//!
//! This is the piece everything else in this crate is assembled for. The
//! boot sequence is linear and each step is a suspension point; the
//! steady-state loop is a single `tokio::select!` fielding control-plane
//! RPCs, the 10s backup heartbeat, and the PostgreSQL child's exit.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};

pub mod paths;

use crate::archive::{Archive, ArchiveError};
use crate::config::{self, ConfigError};
use crate::control::{self, ControlError, Request, Verb};
use crate::lock::{BequeathError, LockError, LockedFile, UnlockedFile};
use crate::pathwait;
use crate::process::{self, Handle, ProcessError};
use crate::restore::{self, RestoreError, RestorePlan};
use crate::util::{self, CurrentUserError};
pub use paths::{Paths, PathsError};

const CONTROL_SOCKET_NAME: &str = ".xpg.skt";
const CONTROL_LOCK_NAME: &str = ".xpg.skt.lock";
pub const NO_RESTORE_SENTINEL: &str = ".NoRestoreNeeded";

/// The control socket path for a given socket directory. Shared with the
/// controller personality, which connects to a Server it did not start.
#[must_use]
pub fn control_socket_path(socket_dir: &Path) -> PathBuf {
    socket_dir.join(CONTROL_SOCKET_NAME)
}

/// The control-socket lock path for a given socket directory. Shared with
/// the controller personality, which must contend for the same lock a
/// Server holds in order to tell whether one is currently running.
#[must_use]
pub fn control_lock_path(socket_dir: &Path) -> PathBuf {
    socket_dir.join(CONTROL_LOCK_NAME)
}

/// The archive directory that corresponds to a given data directory:
/// `parent(dataDir)/backup`, per the data model in §3.
#[must_use]
pub fn archive_dir_for(data_dir: &Path) -> PathBuf {
    data_dir
        .parent()
        .map(|parent| parent.join("backup"))
        .unwrap_or_else(|| PathBuf::from("backup"))
}
const HEARTBEAT: Duration = Duration::from_secs(10);
const STOP_GRACE_TERM: Duration = Duration::from_secs(50);
const STOP_GRACE_INT: Duration = Duration::from_secs(2);
const RECEIVER_READY_MARKER: &str = "starting log streaming";

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum SupervisorError {
    #[error("no data directory was given on the command line, in -D, or in $PGDATA")]
    NoDataDirectory,
    #[error("could not lock the control socket at {0:?}; another server is already running")]
    LockContention(PathBuf),
    #[error(transparent)]
    LockError(#[from] LockError),
    #[error(transparent)]
    BequeathError(#[from] BequeathError),
    #[error(transparent)]
    ControlError(#[from] ControlError),
    #[error(transparent)]
    ConfigError(#[from] ConfigError),
    #[error(transparent)]
    ArchiveError(#[from] ArchiveError),
    #[error(transparent)]
    RestoreError(#[from] RestoreError),
    #[error(transparent)]
    ProcessError(#[from] ProcessError),
    #[error(transparent)]
    PathsError(#[from] paths::PathsError),
    #[error(transparent)]
    CurrentUserError(#[from] CurrentUserError),
    #[error("input/output error at {1:?}: {0}")]
    IoError(#[source] io::Error, PathBuf),
    #[error("PostgreSQL exited unexpectedly with code {0}")]
    PostgresExited(i32),
}

/// Everything the command-line argument parser derives from argv and env,
/// resolved by the CLI layer before the library boot sequence begins.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    /// The filtered argv to pass to the PostgreSQL binary, with
    /// `-k`/`-D`/`--apple-configuration` already stripped.
    pub postgres_argv: Vec<String>,
    /// The absolute path of the currently running binary, embedded in the
    /// `archive_command` this supervisor installs.
    pub this_binary: PathBuf,
}

impl ServerConfig {
    fn control_socket_path(&self) -> PathBuf {
        control_socket_path(&self.socket_dir)
    }

    fn control_lock_path(&self) -> PathBuf {
        control_lock_path(&self.socket_dir)
    }

    fn archive_dir(&self) -> PathBuf {
        archive_dir_for(&self.data_dir)
    }

    fn sentinel(&self) -> PathBuf {
        self.data_dir.join(NO_RESTORE_SENTINEL)
    }
}

/// The running Server's state. Constructed once at boot and driven to
/// completion by [`Supervisor::run`]; there is deliberately no way to share
/// it across threads — every field here is touched only from the one task
/// that owns it.
pub struct Supervisor {
    config: ServerConfig,
    archive: Archive,
    paths: Paths,
    control_lock: LockedFile,
    ref_count: i64,
    running_postgres: Option<Handle>,
    running_receiver: Option<Handle>,
    doing_restore: bool,
    in_stop_trigger: bool,
    pending_restore: bool,
}

impl Supervisor {
    /// §4.3 steps 2–4: preflight the directories, prune the archive
    /// directory, acquire the control-socket lock, and bind the RPC
    /// listener. Returns the bound listener alongside the constructed
    /// supervisor, since binding must happen before any restore work.
    pub async fn boot(
        config: ServerConfig,
        paths: Paths,
    ) -> Result<(Self, UnixListener), SupervisorError> {
        if config.data_dir.as_os_str().is_empty() {
            return Err(SupervisorError::NoDataDirectory);
        }

        // Step 2: preflight.
        create_dir_mode(&config.socket_dir, 0o700)?;
        let archive = Archive::new(config.archive_dir());
        let mut restore_before_run = false;
        if !archive.dir().exists() {
            create_dir_mode(archive.dir(), 0o700)?;
        } else if !config.sentinel().exists() && archive.base_backup_dir().join("base_complete.tar.gz").exists() {
            restore_before_run = true;
        }
        archive.prune_stale()?;

        // Step 3: acquire the control-socket lock.
        let lock_path = config.control_lock_path();
        let lock = match UnlockedFile::new(&lock_path).acquire()? {
            either::Right(locked) => locked,
            either::Left(_) => return Err(SupervisorError::LockContention(lock_path)),
        };
        let socket_path = config.control_socket_path();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .map_err(|err| SupervisorError::IoError(err, socket_path.clone()))?;
        }

        // Step 4: bind the RPC listener.
        let listener = control::bind(&socket_path).await?;

        let supervisor = Self {
            config,
            archive,
            paths,
            control_lock: lock,
            ref_count: 1,
            running_postgres: None,
            running_receiver: None,
            doing_restore: false,
            in_stop_trigger: false,
            pending_restore: restore_before_run,
        };
        Ok((supervisor, listener))
    }

    /// Drive the supervisor through the rest of boot (§4.3 steps 5–11) and
    /// then the steady-state heartbeat/RPC loop until shutdown.
    pub async fn run(mut self, listener: UnixListener) -> Result<(), SupervisorError> {
        let (requests_tx, mut requests_rx) = mpsc::channel::<Request>(16);
        let serve_task = tokio::spawn(control::serve(listener, requests_tx));

        if self.pending_restore {
            log::info!("doing restore before starting postgres");
            self.do_restore().await?;
        }

        self.register_backup_exclusion(&self.config.data_dir);

        log::info!("turning on archive logging");
        config::enable(
            &self.config.data_dir.join("postgresql.conf"),
            &self.config.data_dir.join("pg_hba.conf"),
            &self.config.this_binary,
        )?;

        log::info!("starting postgres");
        self.spawn_postgres().await?;

        log::info!("touching {NO_RESTORE_SENTINEL}");
        touch_file(&self.config.sentinel())?;
        self.register_backup_exclusion(&self.config.sentinel());

        log::info!("starting the wal receiver");
        self.spawn_receiver().await?;

        let result = self.heartbeat_loop(&mut requests_rx).await;

        self.shutdown().await;
        serve_task.abort();
        let _ = std::fs::remove_file(self.config.control_socket_path());
        self.control_lock.release()?;

        result
    }

    async fn heartbeat_loop(
        &mut self,
        requests: &mut mpsc::Receiver<Request>,
    ) -> Result<(), SupervisorError> {
        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so the heartbeat
        // genuinely runs every `HEARTBEAT`, starting one interval after
        // the receiver announced readiness (ordering guarantee (a)).
        heartbeat.tick().await;

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(|err| SupervisorError::IoError(err, PathBuf::from("SIGTERM")))?;

        loop {
            tokio::select! {
                biased;

                _ = tokio::signal::ctrl_c() => {
                    log::info!("received interrupt; shutting down");
                    return Ok(());
                }

                _ = sigterm.recv() => {
                    log::info!("received SIGTERM; shutting down");
                    return Ok(());
                }

                request = requests.recv() => {
                    match request {
                        Some(request) => {
                            if let Some(disconnect) = self.handle_request(request).await {
                                disconnect.await.ok();
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(err) = self.do_backup().await {
                        log::error!("backup heartbeat failed: {err}");
                    }
                }

                code = wait_optional(&mut self.running_postgres) => {
                    self.running_postgres = None;
                    log::warn!("postgres exited with code {code}");
                    if !self.in_stop_trigger {
                        return Err(SupervisorError::PostgresExited(code));
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Handle one control-plane RPC. Returns `Some(disconnect)` when this
    /// was a `Decref` that dropped the count to zero — the caller should
    /// await `disconnect` (the post-shutdown hook phase) before exiting.
    async fn handle_request(&mut self, request: Request) -> Option<oneshot::Receiver<()>> {
        match request.verb {
            Verb::Incref => {
                self.ref_count += 1;
                log::info!("incremented reference count; now {}", self.ref_count);
                request.ack();
                None
            }
            Verb::Decref => {
                self.ref_count -= 1;
                log::info!("decremented reference count; now {}", self.ref_count);
                if self.ref_count == 0 {
                    log::info!("reference count reached zero; shutting down");
                    Some(request.ack_shutting_down())
                } else {
                    request.ack();
                    None
                }
            }
            Verb::Restart => {
                if let Some(handle) = &self.running_postgres {
                    let _ = handle.signal(Signal::SIGHUP);
                }
                request.ack();
                None
            }
        }
    }

    async fn do_restore(&mut self) -> Result<(), SupervisorError> {
        self.doing_restore = true;
        let plan = RestorePlan {
            archive: &self.archive,
            data_dir: &self.config.data_dir,
            socket_dir: &self.config.socket_dir,
            tar_binary: &self.paths.tar,
            postgres_binary: &self.paths.postgres,
        };
        let result = restore::restore(&plan).await;
        self.doing_restore = false;
        result.map_err(SupervisorError::from)
    }

    async fn spawn_postgres(&mut self) -> Result<(), SupervisorError> {
        let handle = process::spawn(
            &self.paths.postgres,
            self.config.postgres_argv.clone(),
            std::iter::empty::<(&str, &str)>(),
            None,
        )?;
        let socket = self.config.socket_dir.join(".s.PGSQL.5432");
        log::info!("waiting for {socket:?} to appear");
        pathwait::wait_for_path(&socket).await;
        self.running_postgres = Some(handle);
        Ok(())
    }

    async fn spawn_receiver(&mut self) -> Result<(), SupervisorError> {
        use tokio::io::{AsyncBufReadExt, BufReader};

        let (handle, stderr) = process::spawn_with_piped_stderr(
            &self.paths.pg_receivexlog,
            [
                "-h".to_string(),
                self.config.socket_dir.display().to_string(),
                "--no-password".to_string(),
                "--directory".to_string(),
                self.archive.dir().display().to_string(),
                "--verbose".to_string(),
            ],
            [("LANG", "C")],
        )?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let mut ready_tx = Some(ready_tx);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("log receiver: {line}");
                if line.contains(RECEIVER_READY_MARKER) {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                }
            }
        });
        self.running_receiver = Some(handle);

        log::info!("waiting for the wal receiver to start streaming");
        let _ = ready_rx.await;
        Ok(())
    }

    async fn do_backup(&mut self) -> Result<(), SupervisorError> {
        if let Some(receiver) = &self.running_receiver {
            if let Some(pid) = receiver.pid() {
                self.archive.touch_open_receiver_files(pid)?;
            }
        }
        if self.archive.should_backup()? {
            log::info!("capturing a new base backup");
            let args = [
                "-Ft".to_string(),
                "-z".to_string(),
                "-h".to_string(),
                self.config.socket_dir.display().to_string(),
                "-D".to_string(),
                "-".to_string(),
            ];
            self.archive.capture(&self.paths.pg_basebackup, &args).await?;
        }
        Ok(())
    }

    /// §4.3 shutdown sequence: stop PostgreSQL (which, in turn, tells the
    /// receiver to stop once PostgreSQL has gone), unlisten, and release
    /// the control-socket lock.
    async fn shutdown(&mut self) {
        self.in_stop_trigger = true;
        if let Err(err) = self.stop_postgres().await {
            log::error!("error stopping postgres: {err}");
        }
        if let Some(receiver) = self.running_receiver.take() {
            let _ = receiver.signal(Signal::SIGINT);
        }
    }

    async fn stop_postgres(&mut self) -> Result<(), SupervisorError> {
        let Some(mut handle) = self.running_postgres.take() else {
            return Ok(());
        };
        if !self.doing_restore {
            if let Err(err) = self.terminate_idle_backends().await {
                log::warn!("could not terminate idle backends before stopping: {err}");
            }
        }
        handle.signal(Signal::SIGTERM).ok();
        if tokio::time::timeout(STOP_GRACE_TERM, handle.wait()).await.is_err() {
            handle.signal(Signal::SIGINT).ok();
            let _ = tokio::time::timeout(STOP_GRACE_INT, handle.wait()).await;
        }
        Ok(())
    }

    async fn terminate_idle_backends(&self) -> Result<(), SupervisorError> {
        let user = util::current_user()?;
        let pool = sqlx::PgPool::connect_lazy_with(
            sqlx::postgres::PgConnectOptions::new()
                .socket(&self.config.socket_dir)
                .database("postgres")
                .username(&user)
                .application_name("pgguard"),
        );
        sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE state = 'idle' AND pid <> pg_backend_pid()",
        )
        .execute(&pool)
        .await
        .map_err(|err| {
            SupervisorError::IoError(
                io::Error::new(io::ErrorKind::Other, err.to_string()),
                self.config.socket_dir.clone(),
            )
        })?;
        Ok(())
    }

    fn register_backup_exclusion(&self, path: &Path) {
        // The host backup-exclusion utility (`tmutil` on the platform this
        // was ported from) is an out-of-scope external collaborator (§1);
        // best-effort and silent when it is not installed, since most
        // development and CI hosts will not have it.
        if let Ok(tmutil) = paths::resolve_optional("tmutil", "XPG_TMUTIL") {
            let path = path.to_owned();
            tokio::spawn(async move {
                if let Ok(handle) = process::spawn(
                    &tmutil,
                    ["addexclusion".to_string(), path.display().to_string()],
                    std::iter::empty::<(&str, &str)>(),
                    None,
                ) {
                    let mut handle = handle;
                    let _ = handle.wait().await;
                }
            });
        }
    }
}

fn create_dir_mode(path: &Path, mode: u32) -> Result<(), SupervisorError> {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::create_dir(path) {
        Ok(()) => (),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
        Err(err) => return Err(SupervisorError::IoError(err, path.to_owned())),
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|err| SupervisorError::IoError(err, path.to_owned()))
}

fn touch_file(path: &Path) -> Result<(), SupervisorError> {
    std::fs::File::create(path).map_err(|err| SupervisorError::IoError(err, path.to_owned()))?;
    Ok(())
}

/// Await `handle`'s exit if it is running, else never resolve — lets the
/// "no postgres currently running" state sit alongside the other
/// `select!` branches without a separate code path.
async fn wait_optional(handle: &mut Option<Handle>) -> i32 {
    match handle {
        Some(handle) => handle.wait().await,
        None => std::future::pending().await,
    }
}
