//! Personality dispatch: the same binary behaves as the Server, the
//! Controller, or the Archiver, chosen by how it was invoked — mirroring
//! `postgres`/`pg_ctl`, which are traditionally the same program under
//! different names.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    /// Invoked under a name containing `_ctl`, or with `XPG_CTL` set.
    Controller,
    /// Invoked as `pgguard archive <source> <destination>`.
    Archiver,
    /// Invoked any other way — with raw PostgreSQL server flags.
    Server,
}

impl Personality {
    /// Decide which personality to run, from `argv[0]` and the rest of the
    /// command line. `ctl_override` stands in for the `XPG_CTL` environment
    /// variable, consumed (not merely read) the way the original consumes
    /// `BEHAVE_AS_XPG_CTL`, so it cannot leak into a spawned child's env.
    #[must_use]
    pub fn detect(argv0: &str, argv: &[String], ctl_override: bool) -> Self {
        if argv0.contains("_ctl") || ctl_override {
            Personality::Controller
        } else if argv.first().map(String::as_str) == Some("archive") {
            Personality::Archiver
        } else {
            Personality::Server
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Personality;

    #[test]
    fn a_ctl_suffixed_name_is_the_controller() {
        assert_eq!(
            Personality::detect("pgguard_ctl", &[], false),
            Personality::Controller
        );
    }

    #[test]
    fn the_override_forces_the_controller_regardless_of_name() {
        assert_eq!(
            Personality::detect("pgguard", &["start".to_string()], true),
            Personality::Controller
        );
    }

    #[test]
    fn an_archive_first_argument_is_the_archiver() {
        assert_eq!(
            Personality::detect("pgguard", &["archive".to_string()], false),
            Personality::Archiver
        );
    }

    #[test]
    fn anything_else_is_the_server() {
        assert_eq!(
            Personality::detect("pgguard", &["-D".to_string(), "/data".to_string()], false),
            Personality::Server
        );
    }
}
