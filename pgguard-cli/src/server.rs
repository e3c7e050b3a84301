//! The Server personality: parse the PostgreSQL-compatible command line
//! this binary was invoked with, then hand off to the supervisor.

use std::path::PathBuf;

use pgguard::supervisor::{Paths, PathsError, ServerConfig, Supervisor, SupervisorError};

/// Default control-socket directory when `-k`/`unix_socket_directory` is
/// not given on the command line, adapted from the macOS original's
/// `/var/pgsql_socket` to a Linux-conventional runtime directory.
pub(crate) const DEFAULT_SOCKET_DIR: &str = "/var/run/pgguard";

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ServerCliError {
    #[error("could not read --apple-configuration plist at {0:?}: {1}")]
    PlistRead(PathBuf, #[source] plist::Error),
    #[error("--apple-configuration plist at {0:?} has no array-of-strings ProgramArguments key")]
    PlistShape(PathBuf),
    #[error(transparent)]
    Paths(#[from] PathsError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Parse `argv` (excluding the program name) into a [`ServerConfig`],
/// following the original's `parse_command_line`: `-k` sets the socket
/// directory, `-D`/`--apple-configuration`'s appended args may set the data
/// directory, `-c unix_socket_directory=...`/`-c log_directory=...` are
/// recognised overrides, and `$PGDATA` wins over all of the above. Every
/// other argument is passed through to PostgreSQL untouched.
fn parse_command_line(
    argv: &[String],
    this_binary: PathBuf,
) -> Result<ServerConfig, ServerCliError> {
    let mut socket_dir = PathBuf::from(DEFAULT_SOCKET_DIR);
    let mut data_dir: Option<PathBuf> = None;
    let mut log_dir: Option<PathBuf> = None;
    let mut postgres_argv = Vec::new();

    // `--apple-configuration` can append further arguments to the list
    // we're iterating over, exactly as the original's `argv.extend(...)`
    // does; a growable work queue models that without re-parsing.
    let mut pending: std::collections::VecDeque<String> = argv.iter().cloned().collect();

    while let Some(value) = pending.pop_front() {
        let mut include = true;
        match value.as_str() {
            "-k" => {
                let dir = pending.pop_front().unwrap_or_default();
                socket_dir = PathBuf::from(&dir);
                postgres_argv.push(value);
                postgres_argv.push(dir);
                continue;
            }
            "-a" | "--apple-configuration" => {
                include = false;
                let plist_path = PathBuf::from(pending.pop_front().unwrap_or_default());
                let program_arguments = read_program_arguments(&plist_path)?;
                for extra in program_arguments.into_iter().rev() {
                    pending.push_front(extra);
                }
            }
            "-D" => {
                let dir = pending.pop_front().unwrap_or_default();
                data_dir = Some(PathBuf::from(&dir));
                postgres_argv.push(value);
                postgres_argv.push(dir);
                continue;
            }
            "-c" => {
                let kv = pending.pop_front().unwrap_or_default();
                if let Some((key, val)) = kv.split_once('=') {
                    match key {
                        "unix_socket_directory" => socket_dir = PathBuf::from(val),
                        "log_directory" => log_dir = Some(PathBuf::from(val)),
                        _ => (),
                    }
                }
                postgres_argv.push(value);
                postgres_argv.push(kv);
                continue;
            }
            _ => (),
        }
        if include {
            postgres_argv.push(value);
        }
    }

    if let Ok(pgdata) = std::env::var("PGDATA") {
        if !pgdata.trim().is_empty() {
            data_dir = Some(PathBuf::from(pgdata));
        }
    }

    let data_dir = data_dir.unwrap_or_default();

    Ok(ServerConfig { socket_dir, data_dir, log_dir, postgres_argv, this_binary })
}

fn read_program_arguments(plist_path: &std::path::Path) -> Result<Vec<String>, ServerCliError> {
    let value = plist::Value::from_file(plist_path)
        .map_err(|err| ServerCliError::PlistRead(plist_path.to_owned(), err))?;
    value
        .as_dictionary()
        .and_then(|dict| dict.get("ProgramArguments"))
        .and_then(|value| value.as_array())
        .map(|array| {
            array
                .iter()
                .filter_map(|item| item.as_string().map(str::to_owned))
                .collect()
        })
        .ok_or_else(|| ServerCliError::PlistShape(plist_path.to_owned()))
}

/// Run the Server personality to completion. Returns the process exit code:
/// `0` on a clean shutdown, `1` if PostgreSQL exited unexpectedly or the
/// boot sequence failed.
pub fn run(argv: &[String]) -> std::process::ExitCode {
    let this_binary = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("pgguard"));
    let config = match parse_command_line(argv, this_binary) {
        Ok(config) => config,
        Err(err) => {
            log::error!("{err}");
            return std::process::ExitCode::FAILURE;
        }
    };
    if config.data_dir.as_os_str().is_empty() {
        log::error!(
            "no data directory was given on the command line, in -D, or in $PGDATA"
        );
        return std::process::ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("could not start the async runtime: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        match boot_and_run(config).await {
            Ok(()) => std::process::ExitCode::SUCCESS,
            Err(err) => {
                log::error!("{err}");
                std::process::ExitCode::FAILURE
            }
        }
    })
}

async fn boot_and_run(config: ServerConfig) -> Result<(), ServerCliError> {
    let paths = Paths::discover()?;
    let (supervisor, listener) = Supervisor::boot(config, paths).await?;
    supervisor.run(listener).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dash_k_and_dash_d_set_the_socket_and_data_directories() {
        let argv = vec![
            "-k".to_string(),
            "/tmp/sock".to_string(),
            "-D".to_string(),
            "/tmp/data".to_string(),
        ];
        let config = parse_command_line(&argv, PathBuf::from("pgguard")).unwrap();
        assert_eq!(config.socket_dir, PathBuf::from("/tmp/sock"));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/data"));
        assert_eq!(config.postgres_argv, argv);
    }

    #[test]
    fn dash_c_overrides_are_recognised_and_still_passed_through() {
        let argv = vec![
            "-c".to_string(),
            "unix_socket_directory=/tmp/sock2".to_string(),
            "-c".to_string(),
            "log_directory=/tmp/logs".to_string(),
        ];
        let config = parse_command_line(&argv, PathBuf::from("pgguard")).unwrap();
        assert_eq!(config.socket_dir, PathBuf::from("/tmp/sock2"));
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/logs")));
        assert_eq!(config.postgres_argv, argv);
    }

    #[test]
    fn pgdata_env_overrides_dash_d() {
        std::env::set_var("PGDATA", "/tmp/from-env");
        let argv = vec!["-D".to_string(), "/tmp/from-argv".to_string()];
        let config = parse_command_line(&argv, PathBuf::from("pgguard")).unwrap();
        std::env::remove_var("PGDATA");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/from-env"));
    }

    #[test]
    fn the_default_socket_directory_is_used_when_dash_k_is_absent() {
        let argv = vec!["-D".to_string(), "/tmp/data".to_string()];
        let config = parse_command_line(&argv, PathBuf::from("pgguard")).unwrap();
        assert_eq!(config.socket_dir, PathBuf::from(DEFAULT_SOCKET_DIR));
    }
}
