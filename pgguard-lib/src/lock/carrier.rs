//! The `INHERITABLE_LOCK` environment carrier: a JSON object mapping
//! absolute lock-file paths to decimal PID strings, advertising which
//! locks the current process is offering to bequeath to a child it is
//! about to spawn (or has just been spawned to inherit).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

pub const ENV_VAR: &str = "INHERITABLE_LOCK";

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CarrierError {
    #[error("could not canonicalize {0:?}: {1}")]
    Canonicalize(PathBuf, #[source] std::io::Error),
    #[error("{ENV_VAR} is not valid JSON: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error("could not serialize {ENV_VAR}: {0}")]
    Serialize(#[source] serde_json::Error),
}

fn load() -> Result<HashMap<PathBuf, String>, CarrierError> {
    match std::env::var(ENV_VAR) {
        Ok(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(&raw).map_err(CarrierError::Deserialize)
        }
        _ => Ok(HashMap::new()),
    }
}

fn store(map: &HashMap<PathBuf, String>) -> Result<(), CarrierError> {
    if map.is_empty() {
        std::env::remove_var(ENV_VAR);
        return Ok(());
    }
    let raw = serde_json::to_string(map).map_err(CarrierError::Serialize)?;
    std::env::set_var(ENV_VAR, raw);
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf, CarrierError> {
    path.canonicalize()
        .or_else(|_| {
            // The lock file may not exist yet (it hasn't been created as a
            // symlink by us or anyone else); canonicalize what we can and
            // join the file name back on.
            let parent = path.parent().unwrap_or(Path::new("/"));
            let name = path.file_name();
            parent
                .canonicalize()
                .map(|dir| match name {
                    Some(name) => dir.join(name),
                    None => dir,
                })
        })
        .map_err(|err| CarrierError::Canonicalize(path.to_owned(), err))
}

/// Look up, and remove, the carrier entry for `path`, if present.
pub fn take(path: &Path) -> Result<Option<Pid>, CarrierError> {
    let key = absolute(path)?;
    let mut map = load()?;
    let value = map.remove(&key);
    store(&map)?;
    Ok(value.and_then(|text| text.parse::<i32>().ok()).map(Pid::from_raw))
}

/// Insert (or overwrite) the carrier entry for `path`.
pub fn put(path: &Path, pid: &Pid) -> Result<(), CarrierError> {
    let key = absolute(path)?;
    let mut map = load()?;
    map.insert(key, pid.to_string());
    store(&map)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::ENV_VAR;

    // The carrier lives in process environment, which is global; serialize
    // access across tests in this module to avoid cross-talk.
    static GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn put_then_take_round_trips_the_pid() {
        let _guard = GUARD.lock().unwrap();
        std::env::remove_var(ENV_VAR);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, b"").unwrap();
        let pid = nix::unistd::Pid::from_raw(4242);
        super::put(&path, &pid).unwrap();
        let taken = super::take(&path).unwrap();
        assert_eq!(taken, Some(pid));
        // Consumed: a second take sees nothing.
        assert_eq!(super::take(&path).unwrap(), None);
    }

    #[test]
    fn take_on_an_absent_entry_returns_none() {
        let _guard = GUARD.lock().unwrap();
        std::env::remove_var(ENV_VAR);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent-lock");
        assert_eq!(super::take(&path).unwrap(), None);
    }

    #[test]
    fn store_removes_the_env_var_once_the_map_is_empty() {
        let _guard = GUARD.lock().unwrap();
        std::env::remove_var(ENV_VAR);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, b"").unwrap();
        super::put(&path, &nix::unistd::Pid::from_raw(1)).unwrap();
        assert!(std::env::var(ENV_VAR).is_ok());
        super::take(&path).unwrap();
        assert!(std::env::var(ENV_VAR).is_err());
    }
}
