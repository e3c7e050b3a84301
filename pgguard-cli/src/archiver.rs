//! The Archiver personality: installed as PostgreSQL's `archive_command`,
//! invoked once per completed WAL segment as `pgguard archive %p %f`-style
//! source/destination paths.

use std::path::PathBuf;

use pgguard::archive::{self, ArchiveError};

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ArchiverError {
    #[error("usage: pgguard archive <source> <destination>")]
    Usage,
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

pub fn run(argv: &[String]) -> Result<(), ArchiverError> {
    let [source, destination] = argv else {
        return Err(ArchiverError::Usage);
    };
    archive::archive_segment(&PathBuf::from(source), &PathBuf::from(destination))?;
    Ok(())
}
