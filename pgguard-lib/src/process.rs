//! Uniform child-process launch and exit-code observation.
//!
//! There is one operation here that matters: [`spawn`]. Everything else
//! (the [`Handle`] it returns, the exit-code convention) exists to let
//! several independent parts of the supervisor await the same child without
//! racing to consume a single-shot future, the way `tokio::process::Child`
//! would force us to.

use std::ffi::OsStr;
use std::path::Path;
use std::process::ExitStatus;

use tokio::process::Command;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ProcessError {
    #[error("could not spawn {0:?}: {1}")]
    Spawn(std::path::PathBuf, #[source] std::io::Error),
}

/// Translate a process [`ExitStatus`] into the convention used throughout
/// this crate: a natural exit yields the actual code; a signalled exit
/// yields the signal number; anything else yields 255.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return signal;
        }
    }
    255
}

/// A spawned child, observable by any number of independent callers.
///
/// Cloning a [`Handle`] gives a second observer of the same child's exit
/// code; all observers see the same value once the child has exited, and
/// late observers that clone after exit see it immediately.
#[derive(Debug, Clone)]
pub struct Handle {
    pid: Option<u32>,
    exited: watch::Receiver<Option<i32>>,
}

impl Handle {
    /// The child's process ID, if it could be determined at spawn time.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True once the child has exited.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.borrow().is_some()
    }

    /// Await the child's exit code, per the convention in [`exit_code`].
    pub async fn wait(&mut self) -> i32 {
        loop {
            if let Some(code) = *self.exited.borrow() {
                return code;
            }
            if self.exited.changed().await.is_err() {
                return 255;
            }
        }
    }

    /// Send a signal to the child, if its PID is known. A child that has
    /// already exited simply yields `ESRCH` from the underlying `kill(2)`.
    pub fn signal(&self, signal: nix::sys::signal::Signal) -> nix::Result<()> {
        match self.pid {
            Some(pid) => nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal),
            None => Ok(()),
        }
    }
}

/// Spawn `program` with `args`, overlaying `env` on top of the current
/// process environment (never clearing it — every child still needs `PATH`
/// and locale variables it never set explicitly), inheriting
/// stdin/stdout/stderr, and optionally running in `cwd`.
///
/// Returns a [`Handle`] immediately; the child is driven to completion on a
/// background task so that multiple callers may observe its exit
/// independently, per the "multiple independent observers" requirement.
pub fn spawn<I, S, K, V>(
    program: &Path,
    args: I,
    env: impl IntoIterator<Item = (K, V)>,
    cwd: Option<&Path>,
) -> Result<Handle, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args);
    command.envs(
        env.into_iter()
            .map(|(k, v)| (k.as_ref().to_owned(), v.as_ref().to_owned())),
    );
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    log::debug!("spawning {program:?}");
    let mut child = command
        .spawn()
        .map_err(|err| ProcessError::Spawn(program.to_owned(), err))?;
    let pid = child.id();
    let (tx, rx) = watch::channel(None);
    let program = program.to_owned();
    tokio::spawn(async move {
        let status = child.wait().await;
        let code = status.map(exit_code).unwrap_or(255);
        log::debug!("{program:?} (pid {pid:?}) exited with code {code}");
        let _ = tx.send(Some(code));
    });
    Ok(Handle { pid, exited: rx })
}

/// As [`spawn`], but pipes the child's stderr back to the caller instead of
/// inheriting it, for callers that need to watch the child's own log output
/// for a readiness marker before treating it as up.
pub fn spawn_with_piped_stderr<I, S, K, V>(
    program: &Path,
    args: I,
    env: impl IntoIterator<Item = (K, V)>,
) -> Result<(Handle, tokio::process::ChildStderr), ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args);
    command.envs(
        env.into_iter()
            .map(|(k, v)| (k.as_ref().to_owned(), v.as_ref().to_owned())),
    );
    command.stderr(std::process::Stdio::piped());
    log::debug!("spawning {program:?} with piped stderr");
    let mut child = command
        .spawn()
        .map_err(|err| ProcessError::Spawn(program.to_owned(), err))?;
    let pid = child.id();
    let stderr = child.stderr.take().expect("stderr was piped");
    let (tx, rx) = watch::channel(None);
    let program = program.to_owned();
    tokio::spawn(async move {
        let status = child.wait().await;
        let code = status.map(exit_code).unwrap_or(255);
        log::debug!("{program:?} (pid {pid:?}) exited with code {code}");
        let _ = tx.send(Some(code));
    });
    Ok((Handle { pid, exited: rx }, stderr))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use nix::sys::signal::Signal;

    #[tokio::test]
    async fn spawn_observes_natural_exit_code() {
        let mut handle = super::spawn(
            Path::new("/bin/sh"),
            ["-c", "exit 7"],
            std::iter::empty::<(&str, &str)>(),
            None,
        )
        .unwrap();
        assert_eq!(handle.wait().await, 7);
    }

    #[tokio::test]
    async fn spawn_allows_multiple_independent_observers() {
        let handle = super::spawn(
            Path::new("/bin/sh"),
            ["-c", "exit 3"],
            std::iter::empty::<(&str, &str)>(),
            None,
        )
        .unwrap();
        let mut a = handle.clone();
        let mut b = handle.clone();
        assert_eq!(a.wait().await, 3);
        assert_eq!(b.wait().await, 3);
    }

    #[tokio::test]
    async fn spawn_reports_signalled_exit_as_signal_number() {
        let mut handle = super::spawn(
            Path::new("/bin/sh"),
            ["-c", "kill -TERM $$; sleep 5"],
            std::iter::empty::<(&str, &str)>(),
            None,
        )
        .unwrap();
        assert_eq!(handle.wait().await, Signal::SIGTERM as i32);
    }

    #[tokio::test]
    async fn spawn_overlays_env_without_clearing_existing() {
        std::env::set_var("PGGUARD_TEST_PASSTHROUGH", "from-parent");
        let mut handle = super::spawn(
            Path::new("/bin/sh"),
            ["-c", "[ \"$PGGUARD_TEST_PASSTHROUGH\" = from-parent ] && [ \"$PGGUARD_TEST_EXTRA\" = injected ]"],
            [("PGGUARD_TEST_EXTRA", "injected")],
            None,
        )
        .unwrap();
        assert_eq!(handle.wait().await, 0);
    }

    #[tokio::test]
    async fn spawn_reports_spawn_error_for_missing_binary() {
        let result = super::spawn(
            Path::new("/no/such/binary-pgguard-test"),
            std::iter::empty::<&str>(),
            std::iter::empty::<(&str, &str)>(),
            None,
        );
        assert!(result.is_err());
    }
}
