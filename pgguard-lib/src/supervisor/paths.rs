//! Resolve the external binaries the supervisor shells out to.
//!
//! Every one of these is an opaque collaborator out of scope for this crate
//! (§1): the PostgreSQL server itself, its streaming-replication receiver,
//! the base-backup tool, `psql`, `tar`, and the vendor `pg_ctl`. Each has an
//! `XPG_*` environment override for testing, falling back to `$PATH`.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum PathsError {
    #[error("could not find {0} on PATH (set {1} to override)")]
    NotFound(&'static str, &'static str),
}

#[derive(Debug, Clone)]
pub struct Paths {
    pub postgres: PathBuf,
    pub psql: PathBuf,
    pub pg_receivexlog: PathBuf,
    pub pg_basebackup: PathBuf,
    pub pg_ctl: PathBuf,
    pub tar: PathBuf,
}

fn resolve(program: &'static str, env_override: &'static str) -> Result<PathBuf, PathsError> {
    if let Ok(value) = std::env::var(env_override) {
        if !value.trim().is_empty() {
            return Ok(PathBuf::from(value));
        }
    }
    which::which(program).map_err(|_| PathsError::NotFound(program, env_override))
}

/// Resolve a binary that is not part of the core toolchain and may
/// legitimately be absent (e.g. a host backup-exclusion utility), honouring
/// the same `XPG_*`-style override convention as [`Paths::discover`].
pub fn resolve_optional(
    program: &'static str,
    env_override: &'static str,
) -> Result<PathBuf, PathsError> {
    resolve(program, env_override)
}

impl Paths {
    /// Resolve every binary from `PATH`, honouring the `XPG_*` test
    /// overrides named in §6.
    pub fn discover() -> Result<Self, PathsError> {
        Ok(Self {
            postgres: resolve("postgres", "XPG_POSTGRES")?,
            psql: resolve("psql", "XPG_PSQL")?,
            pg_receivexlog: resolve("pg_receivexlog", "XPG_RECEIVEXLOG")?,
            pg_basebackup: resolve("pg_basebackup", "XPG_PG_BASEBACKUP")?,
            pg_ctl: resolve("pg_ctl", "XPG_PG_CTL")?,
            tar: resolve("tar", "XPG_TAR")?,
        })
    }
}
