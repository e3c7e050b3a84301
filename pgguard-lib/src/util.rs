use thiserror::Error;

#[derive(Error, Debug)]
pub enum CurrentUserError {
    #[error("user name in {0:?} environment variable cannot be decoded: {1:?}")]
    NotUnicode(&'static str, std::ffi::OsString),
    #[error("system error: {0}")]
    System(#[from] nix::Error),
    #[error("user unknown")]
    Unknown,
}

/// Determine the current user name to use.
///
/// Checks the `PGUSER` then `USER` environment variables first, which allows
/// the invoking user to override the current user name. If those are not set,
/// it obtains the user name from the OS.
pub fn current_user() -> Result<String, CurrentUserError> {
    use nix::unistd::{getuid, User};
    use std::env::{var, VarError::*};
    match var("PGUSER") {
        Ok(user) if !user.trim().is_empty() => Ok(user),
        Err(NotUnicode(value)) => Err(CurrentUserError::NotUnicode("PGUSER", value)),
        Ok(_) | Err(NotPresent) => match var("USER") {
            Ok(user) if !user.trim().is_empty() => Ok(user),
            Err(NotUnicode(value)) => Err(CurrentUserError::NotUnicode("USER", value)),
            Ok(_) | Err(NotPresent) => User::from_uid(getuid())?
                .map(|user| user.name)
                .ok_or(CurrentUserError::Unknown),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    // PGUSER/USER live in process environment, which is global; serialize
    // access across tests in this module to avoid cross-talk.
    static GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn current_user_prefers_pguser_over_user() {
        let _guard = GUARD.lock().unwrap();
        std::env::set_var("PGUSER", "alice");
        std::env::set_var("USER", "bob");
        assert_eq!(super::current_user().unwrap(), "alice");
        std::env::remove_var("PGUSER");
        std::env::remove_var("USER");
    }

    #[test]
    fn current_user_falls_back_to_user_when_pguser_is_absent() {
        let _guard = GUARD.lock().unwrap();
        std::env::remove_var("PGUSER");
        std::env::set_var("USER", "bob");
        assert_eq!(super::current_user().unwrap(), "bob");
        std::env::remove_var("USER");
    }
}
