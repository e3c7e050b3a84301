//! Supervise a PostgreSQL cluster: continuous WAL archiving, sized base
//! backups, restore-on-boot, and reference-counted shared use across local
//! clients.
//!
//! Three personalities are built from the pieces in this crate: a long-lived
//! `Server` that owns the PostgreSQL child, the WAL receiver, and a control
//! socket; a short-lived `Controller` that reference-counts use of a running
//! `Server` (or starts one); and a one-shot `Archiver` invoked by PostgreSQL
//! itself as its `archive_command`.
#![warn(clippy::pedantic)]
#![allow(clippy::enum_glob_use)]
#![allow(clippy::many_single_char_names)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate lazy_static;

pub mod archive;
pub mod config;
pub mod control;
pub mod lock;
pub mod pathwait;
pub mod prelude;
pub mod process;
pub mod restore;
pub mod supervisor;
pub mod util;
