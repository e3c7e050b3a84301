//! Idempotent, comment-aware rewriting of `postgresql.conf` and
//! `pg_hba.conf`.
//!
//! Both files are rewritten by whole-content read, regex substitution, and
//! whole-content write. Enabling uncomments five settings in
//! `postgresql.conf` and appends a trust line to `pg_hba.conf`; disabling
//! reverses exactly those substitutions so that enable, disable, enable is
//! the same text as enable alone (the round-trip law in the testable
//! properties).

use std::path::Path;

use regex::{Captures, Regex};

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ConfigError {
    #[error("input/output error reading/writing {1:?}: {0}")]
    IoError(#[source] std::io::Error, std::path::PathBuf),
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|err| ConfigError::IoError(err, path.to_owned()))
}

fn write(path: &Path, contents: &str) -> Result<(), ConfigError> {
    std::fs::write(path, contents).map_err(|err| ConfigError::IoError(err, path.to_owned()))
}

struct Setting {
    key: &'static str,
    default: &'static str,
}

const ARCHIVE_TIMEOUT: Setting = Setting { key: "archive_timeout", default: "0" };
const MAX_WAL_SENDERS: Setting = Setting { key: "max_wal_senders", default: "0" };
const WAL_LEVEL: Setting = Setting { key: "wal_level", default: "minimal" };
const ARCHIVE_MODE: Setting = Setting { key: "archive_mode", default: "off" };

lazy_static! {
    static ref SIMPLE_SETTINGS: [(Setting, &'static str); 4] = [
        (ARCHIVE_MODE, "on"),
        (ARCHIVE_TIMEOUT, "0"),
        (MAX_WAL_SENDERS, "2"),
        (WAL_LEVEL, "hot_standby"),
    ];
    static ref ARCHIVE_COMMAND_COMMENTED: Regex =
        Regex::new(r"(?m)^#\s*archive_command\s*=\s*'[^']*'(.*)$").unwrap();
    static ref ARCHIVE_COMMAND_ENABLED: Regex =
        Regex::new(r"(?m)^\s*archive_command\s*=\s*'[^']*'(.*)$").unwrap();
    static ref REPLICATION_TRUST_LINE: Regex =
        Regex::new(r"(?m)^\s*local\s+replication\s+all\s+trust\s*$").unwrap();
}

fn commented_pattern(key: &str) -> Regex {
    Regex::new(&format!(r"(?m)^#\s*{key}\s*=\s*\S+(.*)$")).expect("valid generated pattern")
}

fn enabled_pattern(key: &str) -> Regex {
    Regex::new(&format!(r"(?m)^\s*{key}\s*=\s*\S+(.*)$")).expect("valid generated pattern")
}

/// The literal `archive_command` installed by [`enable`]. `binary` should be
/// the absolute path of the currently running binary; this crate's own
/// `archive` personality (§4.5, "Archiver personality") is what gets
/// invoked with `%p` (source) and the destination in the archive directory.
#[must_use]
pub fn archive_command(binary: &Path) -> String {
    format!("{} archive %p ../backup/%f", binary.display())
}

/// Enable continuous archiving in `postgresql.conf` and grant local
/// replication trust in `pg_hba.conf`. Returns whether either file was
/// actually modified.
pub fn enable(
    postgresql_conf: &Path,
    pg_hba_conf: &Path,
    binary: &Path,
) -> Result<bool, ConfigError> {
    let mut changed = false;

    let contents = read(postgresql_conf)?;
    let mut rewritten = contents.clone();
    for (setting, value) in SIMPLE_SETTINGS.iter() {
        rewritten = commented_pattern(setting.key)
            .replace(&rewritten, |caps: &Captures| {
                format!("{} = {value}{}", setting.key, &caps[1])
            })
            .into_owned();
    }
    let command = archive_command(binary);
    rewritten = ARCHIVE_COMMAND_COMMENTED
        .replace(&rewritten, |caps: &Captures| {
            format!("archive_command = '{command}'{}", &caps[1])
        })
        .into_owned();
    if rewritten != contents {
        write(postgresql_conf, &rewritten)?;
        changed = true;
    }

    let hba = read(pg_hba_conf)?;
    if !REPLICATION_TRUST_LINE.is_match(&hba) {
        let mut hba = hba;
        if !hba.ends_with('\n') {
            hba.push('\n');
        }
        hba.push_str("local   replication     all                                     trust\n");
        write(pg_hba_conf, &hba)?;
        changed = true;
    }

    Ok(changed)
}

/// Reverse [`enable`]'s five `postgresql.conf` substitutions, re-inserting
/// the comment prefix and each setting's default value. Used prior to
/// restore. Does not touch `pg_hba.conf` — the trust line is left in place.
pub fn disable(postgresql_conf: &Path) -> Result<bool, ConfigError> {
    let contents = read(postgresql_conf)?;
    let mut rewritten = contents.clone();
    for (setting, _) in SIMPLE_SETTINGS.iter() {
        rewritten = enabled_pattern(setting.key)
            .replace(&rewritten, |caps: &Captures| {
                format!("#{} = {}{}", setting.key, setting.default, &caps[1])
            })
            .into_owned();
    }
    rewritten = ARCHIVE_COMMAND_ENABLED
        .replace(&rewritten, |caps: &Captures| {
            format!("#archive_command = ''{}", &caps[1])
        })
        .into_owned();
    let changed = rewritten != contents;
    if changed {
        write(postgresql_conf, &rewritten)?;
    }
    Ok(changed)
}

/// True iff none of the five settings still has its commented-out form in
/// `postgresql.conf` — i.e. all five have been uncommented.
pub fn wal_archiving_is_enabled(postgresql_conf: &Path) -> Result<bool, ConfigError> {
    let contents = read(postgresql_conf)?;
    let all_simple_uncommented = SIMPLE_SETTINGS
        .iter()
        .all(|(setting, _)| !commented_pattern(setting.key).is_match(&contents));
    Ok(all_simple_uncommented && !ARCHIVE_COMMAND_COMMENTED.is_match(&contents))
}

/// Disable local connections in `pg_hba.conf` by commenting out every
/// non-comment, non-blank line and appending a marker, so [`restrict_connections`]
/// is reversible by [`allow_connections`].
const RESTRICTION_MARKER: &str = "# disabled by pgguard";

pub fn restrict_connections(pg_hba_conf: &Path) -> Result<bool, ConfigError> {
    let contents = read(pg_hba_conf)?;
    let mut changed = false;
    let rewritten: String = contents
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                line.to_owned()
            } else {
                changed = true;
                format!("#{line}    {RESTRICTION_MARKER}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    let rewritten = if contents.ends_with('\n') { rewritten + "\n" } else { rewritten };
    if changed {
        write(pg_hba_conf, &rewritten)?;
    }
    Ok(changed)
}

pub fn allow_connections(pg_hba_conf: &Path) -> Result<bool, ConfigError> {
    let contents = read(pg_hba_conf)?;
    let mut changed = false;
    let suffix = format!("    {RESTRICTION_MARKER}");
    let rewritten: String = contents
        .lines()
        .map(|line| {
            if let Some(rest) = line.strip_prefix('#') {
                if let Some(original) = rest.strip_suffix(&suffix) {
                    changed = true;
                    return original.to_owned();
                }
            }
            line.to_owned()
        })
        .collect::<Vec<_>>()
        .join("\n");
    let rewritten = if contents.ends_with('\n') { rewritten + "\n" } else { rewritten };
    if changed {
        write(pg_hba_conf, &rewritten)?;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    fn write_fixture(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    const POSTGRESQL_CONF: &str = "\
#archive_mode = off            # enables archiving; off, on, or always
#archive_timeout = 0           # force a logfile segment switch after this
#max_wal_senders = 0           # max number of walsender processes
#wal_level = minimal           # minimal, replica, or logical
#archive_command = ''          # command to use to archive a logfile segment
shared_buffers = 128MB
";

    const PG_HBA_CONF: &str = "\
# TYPE  DATABASE        USER            ADDRESS                 METHOD
local   all             all                                     trust
";

    #[test]
    fn enable_uncomments_all_five_settings_and_preserves_trailing_comments() {
        let dir = tempfile::tempdir().unwrap();
        let conf = write_fixture(dir.path(), "postgresql.conf", POSTGRESQL_CONF);
        let hba = write_fixture(dir.path(), "pg_hba.conf", PG_HBA_CONF);
        let binary = Path::new("/usr/local/bin/pgguard");

        let changed = super::enable(&conf, &hba, binary).unwrap();
        assert!(changed);

        let rewritten = std::fs::read_to_string(&conf).unwrap();
        assert!(rewritten.contains("archive_mode = on            # enables archiving"));
        assert!(rewritten.contains("wal_level = hot_standby           # minimal, replica"));
        assert!(rewritten
            .contains("archive_command = '/usr/local/bin/pgguard archive %p ../backup/%f'"));
        assert!(super::wal_archiving_is_enabled(&conf).unwrap());

        let rewritten_hba = std::fs::read_to_string(&hba).unwrap();
        assert!(rewritten_hba.contains("local   replication     all"));
    }

    #[test]
    fn enable_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let conf = write_fixture(dir.path(), "postgresql.conf", POSTGRESQL_CONF);
        let hba = write_fixture(dir.path(), "pg_hba.conf", PG_HBA_CONF);
        let binary = Path::new("/usr/local/bin/pgguard");

        super::enable(&conf, &hba, binary).unwrap();
        let once = std::fs::read_to_string(&conf).unwrap();
        let changed_again = super::enable(&conf, &hba, binary).unwrap();
        let twice = std::fs::read_to_string(&conf).unwrap();
        assert!(!changed_again);
        assert_eq!(once, twice);
    }

    #[test]
    fn enable_then_disable_then_enable_matches_first_enable() {
        let dir = tempfile::tempdir().unwrap();
        let conf = write_fixture(dir.path(), "postgresql.conf", POSTGRESQL_CONF);
        let hba = write_fixture(dir.path(), "pg_hba.conf", PG_HBA_CONF);
        let binary = Path::new("/usr/local/bin/pgguard");

        super::enable(&conf, &hba, binary).unwrap();
        let first_enable = std::fs::read_to_string(&conf).unwrap();

        super::disable(&conf).unwrap();
        assert!(!super::wal_archiving_is_enabled(&conf).unwrap());

        super::enable(&conf, &hba, binary).unwrap();
        let second_enable = std::fs::read_to_string(&conf).unwrap();

        assert_eq!(first_enable, second_enable);
    }

    #[test]
    fn wal_archiving_is_enabled_is_false_on_a_fresh_conf() {
        let dir = tempfile::tempdir().unwrap();
        let conf = write_fixture(dir.path(), "postgresql.conf", POSTGRESQL_CONF);
        assert!(!super::wal_archiving_is_enabled(&conf).unwrap());
    }

    #[test]
    fn restrict_then_allow_connections_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let hba = write_fixture(dir.path(), "pg_hba.conf", PG_HBA_CONF);
        let original = std::fs::read_to_string(&hba).unwrap();

        assert!(super::restrict_connections(&hba).unwrap());
        let restricted = std::fs::read_to_string(&hba).unwrap();
        assert!(restricted.contains("#local   all             all"));
        assert!(restricted.contains("disabled by pgguard"));

        assert!(super::allow_connections(&hba).unwrap());
        let restored = std::fs::read_to_string(&hba).unwrap();
        assert_eq!(original, restored);
    }
}
