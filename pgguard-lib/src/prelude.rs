//! Prelude for `pgguard`.

pub use crate::{
    archive::{self, Archive, ArchiveError},
    config::{self, ConfigError},
    control::{self, ControlError},
    lock::{self, InheritableLock, LockedFile, Offered, UnlockedFile},
    pathwait, process,
    restore::{self, RestoreError, RestorePlan},
    supervisor::{self, Paths, PathsError, ServerConfig, Supervisor, SupervisorError},
    util,
};
